//! Request loop for the magnet Lua script host.
//!
//! Serves a single CGI-style request from `SCRIPT_FILENAME`, or, with
//! `--stdin`, one request per line of standard input. Responses go to
//! standard output; logs go to standard error.
//!
//! # Examples
//!
//! ```bash
//! # One request, CGI style
//! SCRIPT_FILENAME=/srv/www/index.lua magnet
//!
//! # Many requests against the same cache
//! printf '/srv/www/index.lua\n/srv/www/about.lua\n' | magnet --stdin -v
//!
//! # Bounded cache and a 64 MiB interpreter limit
//! magnet --stdin --max-cache-entries 256 --memory-limit 67108864
//! ```

use std::io::{self, BufRead, Write};
use std::num::NonZeroUsize;

use anyhow::{Context, Result};
use clap::Parser;
use magnet::{HostConfig, Outcome, ScriptHost};
use tracing_subscriber::EnvFilter;

/// Run Lua scripts for incoming requests.
#[derive(Parser, Debug)]
#[command(name = "magnet")]
#[command(version, about, long_about = None)]
struct Args {
    /// Script to serve when not reading requests from stdin
    #[arg(long, env = "SCRIPT_FILENAME")]
    script_filename: Option<String>,

    /// Read one script path per line from stdin and serve each in turn
    /// (`--script-filename` is ignored)
    #[arg(long)]
    stdin: bool,

    /// Maximum number of compiled scripts to keep (default: unbounded)
    #[arg(long, env = "MAGNET_MAX_CACHE_ENTRIES")]
    max_cache_entries: Option<NonZeroUsize>,

    /// Interpreter memory limit in bytes
    #[arg(long, env = "MAGNET_MEMORY_LIMIT")]
    memory_limit: Option<usize>,

    /// Expose the process environment to scripts as the `env` table
    #[arg(long, env = "MAGNET_EXPOSE_ENV")]
    expose_env: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn host_config(&self) -> HostConfig {
        let mut config = HostConfig::new().with_expose_env(self.expose_env);
        if let Some(max) = self.max_cache_entries {
            config = config.with_max_cache_entries(max);
        }
        if let Some(limit) = self.memory_limit {
            config = config.with_memory_limit(limit);
        }
        config
    }

    fn build_host(&self) -> Result<ScriptHost> {
        ScriptHost::new(self.host_config()).context("Failed to initialise the Lua interpreter")
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "magnet=debug,magnet_host=debug"
    } else {
        "magnet=warn,magnet_host=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut host = args.build_host()?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.stdin {
        for line in io::stdin().lock().lines() {
            let line = line.context("Failed to read request from stdin")?;
            serve(&mut host, Some(line.trim_end_matches('\r')), &mut out)?;
        }
    } else {
        serve(&mut host, args.script_filename.as_deref(), &mut out)?;
    }

    let counters = host.counters();
    tracing::info!(
        served = counters.total_served,
        runtime_failures = counters.runtime_failures,
        resolution_failures = counters.resolution_failures,
        cached_scripts = host.cache().len(),
        "shutting down"
    );

    Ok(())
}

fn serve(host: &mut ScriptHost, path: Option<&str>, out: &mut dyn Write) -> Result<()> {
    let outcome = host
        .serve(path, out)
        .context("Failed to write response")?;
    out.flush().context("Failed to flush response")?;

    if let Outcome::ResolutionFailed(status) = outcome {
        tracing::debug!(path = ?path, %status, "request not served");
    }
    Ok(())
}
