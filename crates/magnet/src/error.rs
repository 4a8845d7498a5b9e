//! Error types for script resolution and execution.

use std::io;
use std::path::PathBuf;

use crate::response::Status;

/// Errors that can occur while building a [`ScriptHost`](crate::ScriptHost).
///
/// Request-level failures never surface here; they are [`ResolveError`]s
/// and [`RuntimeError`]s, both recovered inside a single request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The Lua interpreter could not be initialised or configured.
    ///
    /// Holds the rendered message so the error stays `Send + Sync`.
    #[error("Lua interpreter error: {0}")]
    Lua(String),

    /// I/O error during host setup.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<mlua::Error> for Error {
    fn from(err: mlua::Error) -> Self {
        Self::Lua(err.to_string())
    }
}

/// Failure to turn a request path into a runnable artifact.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The path was missing, empty, or named a directory.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The script exists but cannot be read.
    #[error("forbidden: {}", path.display())]
    Forbidden {
        /// Path that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// No script exists at the path.
    #[error("not found: {}", path.display())]
    NotFound {
        /// Path that was requested.
        path: PathBuf,
    },

    /// A transient filesystem or resource failure.
    #[error("unavailable: {}: {reason}", path.display())]
    Unavailable {
        /// Path that was requested.
        path: PathBuf,
        /// Human readable cause.
        reason: String,
    },

    /// The source failed to compile. The diagnostic is page content, not
    /// a server failure.
    #[error("compile error: {0}")]
    Compile(String),
}

impl ResolveError {
    /// Status the dispatcher reports for this failure.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::BadRequest(_) => Status::BadRequest,
            Self::Forbidden { .. } => Status::Forbidden,
            Self::NotFound { .. } => Status::NotFound,
            Self::Unavailable { .. } => Status::ServiceUnavailable,
            Self::Compile(_) => Status::Ok,
        }
    }

    /// Map a failed stat of `path` onto the resolution taxonomy.
    pub(crate) fn from_stat(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::Forbidden { path, source: err },
            _ => Self::Unavailable {
                path,
                reason: err.to_string(),
            },
        }
    }
}

/// A script raised while it was running.
///
/// The message carries the interpreter's traceback when one was available.
/// Output the script produced before failing has already been written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    message: String,
}

impl RuntimeError {
    /// Create a runtime error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error text, as it is written to the response stream.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<mlua::Error> for RuntimeError {
    fn from(err: mlua::Error) -> Self {
        Self::new(script_message(&err))
    }
}

/// The text a script error carries, without mlua's variant prefix.
fn script_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::CallbackError { cause, traceback } => {
            format!("{}\n{traceback}", script_message(cause))
        }
        other => other.to_string(),
    }
}
