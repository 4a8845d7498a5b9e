//! Request dispatch: resolve, run, report, count.

use std::fmt;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use mlua::Lua;

use crate::cache::ScriptCache;
use crate::compiler::LuaCompiler;
use crate::counters::ServerCounters;
use crate::error::{Error, ResolveError};
use crate::response::{self, Status};
use crate::sandbox::Sandbox;

/// Configuration for a [`ScriptHost`].
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// Maximum number of cached scripts. `None` keeps every script that was
    /// ever resolved.
    pub max_cache_entries: Option<NonZeroUsize>,

    /// Interpreter memory limit in bytes.
    pub memory_limit: Option<usize>,

    /// Expose the process environment to scripts as the global table `env`.
    pub expose_env: bool,
}

impl HostConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the script cache, evicting the least recently used script.
    #[must_use]
    pub const fn with_max_cache_entries(mut self, max: NonZeroUsize) -> Self {
        self.max_cache_entries = Some(max);
        self
    }

    /// Limit interpreter memory.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Expose (or hide) the process environment as `env`.
    #[must_use]
    pub const fn with_expose_env(mut self, expose: bool) -> Self {
        self.expose_env = expose;
        self
    }
}

/// How a single request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No script ran; a status response (or compile diagnostic) was written.
    ResolutionFailed(Status),
    /// The script ran to completion.
    Succeeded,
    /// The script raised; the error text was appended to its output.
    RuntimeFailed,
}

/// Serves script requests one at a time.
///
/// Owns the interpreter, the script cache, the sandbox and the counters.
/// Hosts are independent of each other; nothing is process-global.
pub struct ScriptHost {
    cache: ScriptCache<LuaCompiler>,
    sandbox: Sandbox,
    counters: ServerCounters,
}

impl fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHost")
            .field("cache", &self.cache)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl ScriptHost {
    /// Create a host with a fresh interpreter.
    ///
    /// # Errors
    ///
    /// Returns an error if the interpreter cannot be configured.
    pub fn new(config: HostConfig) -> Result<Self, Error> {
        let lua = Lua::new();

        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit)?;
        }
        if config.expose_env {
            install_env_table(&lua)?;
        }

        let compiler = LuaCompiler::new(lua.clone());
        let cache = match config.max_cache_entries {
            Some(max) => ScriptCache::with_capacity(compiler, max),
            None => ScriptCache::new(compiler),
        };
        let sandbox = Sandbox::new(&lua)?;

        tracing::info!(
            max_cache_entries = ?config.max_cache_entries,
            memory_limit = ?config.memory_limit,
            expose_env = config.expose_env,
            "script host ready"
        );

        Ok(Self {
            cache,
            sandbox,
            counters: ServerCounters::new(),
        })
    }

    /// Serve one request for the script at `path`, writing the response to `out`.
    ///
    /// Resolution failures produce a status-only response, compile failures
    /// a 200 page with the diagnostic. A script that raises has its error
    /// text appended to whatever it already printed.
    ///
    /// # Errors
    ///
    /// Only I/O errors on `out` are returned; script failures are reported
    /// through the response and the [`Outcome`].
    pub fn serve(&mut self, path: Option<&str>, out: &mut dyn Write) -> io::Result<Outcome> {
        let artifact = match self.cache.resolve(path) {
            Ok(artifact) => artifact,
            Err(err) => {
                self.counters.resolution_failures += 1;
                let status = err.status();
                tracing::info!(path = ?path, %status, error = %err, "script not resolved");

                match &err {
                    ResolveError::Compile(diagnostic) => {
                        response::write_compile_error(out, diagnostic)?;
                    }
                    _ => response::write_status(out, status)?,
                }
                return Ok(Outcome::ResolutionFailed(status));
            }
        };

        let result = self.sandbox.run(&artifact, out);

        self.counters.total_served += 1;
        metrics::counter!("magnet_requests_total").increment(1);
        if let Some(path) = path {
            self.cache.record_execution(Path::new(path));
        }

        match result {
            Ok(()) => {
                tracing::debug!(path = ?path, "script succeeded");
                Ok(Outcome::Succeeded)
            }
            Err(err) => {
                self.counters.runtime_failures += 1;
                metrics::counter!("magnet_runtime_errors_total").increment(1);
                tracing::warn!(path = ?path, error = %err, "script raised");

                // Headers may already be out; the error goes in-place.
                out.write_all(err.message().as_bytes())?;
                Ok(Outcome::RuntimeFailed)
            }
        }
    }

    /// Request counters since the host was created.
    #[must_use]
    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    /// The script cache.
    #[must_use]
    pub fn cache(&self) -> &ScriptCache<LuaCompiler> {
        &self.cache
    }

    /// The sandbox scripts run in.
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }
}

/// Publish the process environment as the global table `env`.
fn install_env_table(lua: &Lua) -> mlua::Result<()> {
    let env = lua.create_table()?;
    for (key, value) in std::env::vars_os() {
        env.set(
            key.to_string_lossy().into_owned(),
            lua.create_string(value.as_encoded_bytes())?,
        )?;
    }
    lua.globals().set("env", env)
}
