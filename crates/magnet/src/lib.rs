//! # Magnet
//!
//! A request-time Lua script host.
//!
//! For every request magnet resolves a script path to a compiled chunk,
//! runs it in a throwaway environment and reports failures as status
//! responses:
//!
//! - **Artifact cache** - scripts are compiled once and reused until the
//!   file's modification time (in whole seconds) changes
//! - **Sandboxed runs** - each run sees its own globals table with `print`
//!   redirected to the response; every other name is read through to the
//!   shared standard library
//! - **Recoverable failures** - bad paths, compile errors and script errors
//!   are reported in the response and never stop the host
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use magnet::{HostConfig, ScriptHost};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut host = ScriptHost::new(HostConfig::default())?;
//!
//!     let mut stdout = std::io::stdout().lock();
//!     host.serve(Some("/srv/www/index.lua"), &mut stdout)?;
//!     Ok(())
//! }
//! ```
//!
//! The host is single-threaded: one request is resolved, run and counted
//! before the next is accepted.

pub mod cache;
mod compiler;
mod counters;
mod error;
pub mod freshness;
mod host;
pub mod response;
mod sandbox;

pub use cache::{EntryStats, ScriptCache};
pub use compiler::{ArtifactCompiler, CompileFailure, LuaCompiler};
pub use counters::ServerCounters;
pub use error::{Error, ResolveError, RuntimeError};
pub use freshness::{FileKind, FileStat, FreshnessOracle, FsOracle};
pub use host::{HostConfig, Outcome, ScriptHost};
pub use response::Status;
pub use sandbox::Sandbox;

// Re-export the interpreter crate so callers can name artifact types.
pub use mlua;
