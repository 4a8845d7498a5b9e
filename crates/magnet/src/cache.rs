//! Compiled-script caching with modification-time invalidation.
//!
//! Every request stats its script. If the cached entry for the path was
//! compiled from a file with the same mtime (whole seconds), the artifact is
//! reused; otherwise the script is recompiled and the entry replaced.
//!
//! # Freshness
//!
//! Two edits within the same second are invisible to the check. The stat
//! and the subsequent compile are not atomic either: a file replaced in
//! between is compiled from its new contents but recorded under the mtime
//! seen by the stat, which at worst causes one extra recompile later.
//!
//! # Example
//!
//! ```rust,ignore
//! use magnet::{LuaCompiler, ScriptCache};
//!
//! let lua = mlua::Lua::new();
//! let mut cache = ScriptCache::new(LuaCompiler::new(lua));
//!
//! // First call compiles, later calls reuse the artifact until the file changes.
//! let artifact = cache.resolve(Some("/srv/www/index.lua"))?;
//! ```

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

use crate::compiler::{ArtifactCompiler, CompileFailure};
use crate::error::ResolveError;
use crate::freshness::{FreshnessOracle, FsOracle};

/// A compiled script together with the mtime it was compiled from.
///
/// The artifact and mtime are only ever replaced together.
#[derive(Debug)]
struct CacheEntry<A> {
    artifact: A,
    mtime: i64,
    hit_count: u64,
    executions: u64,
}

impl<A> CacheEntry<A> {
    fn new(artifact: A, mtime: i64) -> Self {
        Self {
            artifact,
            mtime,
            hit_count: 0,
            executions: 0,
        }
    }
}

/// Read-only view of a cache entry's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    /// Mtime (seconds) the artifact was compiled from.
    pub mtime: i64,
    /// Times the artifact was reused since it was compiled.
    pub hit_count: u64,
    /// Attempted executions since it was compiled.
    pub executions: u64,
}

/// Maps script paths to compiled artifacts.
///
/// Unbounded by default: an entry per distinct path lives as long as the
/// cache. Use [`ScriptCache::with_capacity`] to evict the least recently
/// resolved script instead.
pub struct ScriptCache<C: ArtifactCompiler, O = FsOracle> {
    compiler: C,
    oracle: O,
    entries: LruCache<PathBuf, CacheEntry<C::Artifact>>,
}

impl<C: ArtifactCompiler, O> fmt::Debug for ScriptCache<C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptCache")
            .field("entries", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .finish_non_exhaustive()
    }
}

impl<C: ArtifactCompiler> ScriptCache<C, FsOracle> {
    /// Create an unbounded cache that stats the real filesystem.
    #[must_use]
    pub fn new(compiler: C) -> Self {
        Self::with_oracle(compiler, FsOracle, None)
    }

    /// Create a cache holding at most `max_entries` scripts.
    #[must_use]
    pub fn with_capacity(compiler: C, max_entries: NonZeroUsize) -> Self {
        Self::with_oracle(compiler, FsOracle, Some(max_entries))
    }
}

impl<C: ArtifactCompiler, O: FreshnessOracle> ScriptCache<C, O> {
    /// Create a cache with a custom freshness oracle.
    ///
    /// `max_entries` of `None` keeps every script for the cache's lifetime.
    #[must_use]
    pub fn with_oracle(compiler: C, oracle: O, max_entries: Option<NonZeroUsize>) -> Self {
        let entries = match max_entries {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };

        Self {
            compiler,
            oracle,
            entries,
        }
    }

    /// Resolve a request path to a runnable artifact.
    ///
    /// Compiles on a miss or when the file's mtime differs from the cached
    /// one; otherwise reuses the cached artifact and bumps its hit count.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::BadRequest`] if `path` is missing, empty, or a directory
    /// - [`ResolveError::NotFound`], [`ResolveError::Forbidden`] or
    ///   [`ResolveError::Unavailable`] if the stat fails
    /// - [`ResolveError::Compile`] if the source does not compile; nothing
    ///   is cached in that case
    pub fn resolve(&mut self, path: Option<&str>) -> Result<C::Artifact, ResolveError> {
        let path = match path {
            Some(p) if !p.is_empty() => Path::new(p),
            _ => return Err(ResolveError::BadRequest("missing script path".into())),
        };

        let stat = self
            .oracle
            .stat(path)
            .map_err(|e| ResolveError::from_stat(path.to_path_buf(), e))?;

        if stat.is_dir() {
            return Err(ResolveError::BadRequest(format!(
                "{} is a directory",
                path.display()
            )));
        }

        if let Some(entry) = self.entries.get_mut(path) {
            if entry.mtime == stat.mtime {
                entry.hit_count += 1;
                tracing::debug!(path = %path.display(), hits = entry.hit_count, "script cache hit");
                metrics::counter!("magnet_cache_hits_total").increment(1);
                return Ok(entry.artifact.clone());
            }

            tracing::debug!(
                path = %path.display(),
                cached_mtime = entry.mtime,
                mtime = stat.mtime,
                "script changed on disk, recompiling"
            );
        }

        let artifact = self.compile(path)?;
        let evicted = self.entries.push(
            path.to_path_buf(),
            CacheEntry::new(artifact.clone(), stat.mtime),
        );
        if let Some((old, _)) = evicted.filter(|(old, _)| old != path) {
            tracing::debug!(path = %old.display(), "evicted script from cache");
        }

        Ok(artifact)
    }

    fn compile(&self, path: &Path) -> Result<C::Artifact, ResolveError> {
        tracing::debug!(path = %path.display(), "compiling script");
        metrics::counter!("magnet_compiles_total").increment(1);

        self.compiler.compile(path).map_err(|failure| match failure {
            CompileFailure::Diagnostic(message) => ResolveError::Compile(message),
            CompileFailure::Io(source) => ResolveError::Forbidden {
                path: path.to_path_buf(),
                source,
            },
            CompileFailure::Resource(reason) => ResolveError::Unavailable {
                path: path.to_path_buf(),
                reason,
            },
        })
    }
}

impl<C: ArtifactCompiler, O> ScriptCache<C, O> {
    /// Count an attempted execution of the script cached under `path`.
    ///
    /// Returns the entry's new execution count, or `None` if nothing is
    /// cached for the path.
    pub fn record_execution(&mut self, path: &Path) -> Option<u64> {
        let entry = self.entries.peek_mut(path)?;
        entry.executions += 1;
        Some(entry.executions)
    }

    /// Bookkeeping for the entry cached under `path`, without touching its
    /// recency.
    #[must_use]
    pub fn entry(&self, path: impl AsRef<Path>) -> Option<EntryStats> {
        self.entries.peek(path.as_ref()).map(|entry| EntryStats {
            mtime: entry.mtime,
            hit_count: entry.hit_count,
            executions: entry.executions,
        })
    }

    /// Number of cached scripts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The compiler this cache uses.
    #[must_use]
    pub fn compiler(&self) -> &C {
        &self.compiler
    }
}
