//! Turning script source into runnable artifacts.

use std::fs;
use std::io;
use std::path::Path;

use mlua::{Function, Lua};

/// Why a script could not be compiled.
#[derive(Debug, thiserror::Error)]
pub enum CompileFailure {
    /// The source has a syntax or semantic error.
    #[error("{0}")]
    Diagnostic(String),

    /// The source could not be read, e.g. it vanished after the stat.
    #[error("cannot read script: {0}")]
    Io(#[source] io::Error),

    /// The interpreter ran out of memory while compiling.
    #[error("out of memory: {0}")]
    Resource(String),
}

impl From<mlua::Error> for CompileFailure {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => Self::Diagnostic(message),
            mlua::Error::MemoryError(message) => Self::Resource(message),
            other => Self::Diagnostic(other.to_string()),
        }
    }
}

/// Compiles the script at a path into an artifact.
///
/// Implementations are called by [`ScriptCache`](crate::ScriptCache) only on
/// a miss or after the file's mtime changed.
pub trait ArtifactCompiler {
    /// The compiled, callable unit. Cloning must be cheap: the cache hands a
    /// clone to every caller.
    type Artifact: Clone;

    /// Compile the script at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileFailure`] describing why no artifact was produced.
    fn compile(&self, path: &Path) -> Result<Self::Artifact, CompileFailure>;
}

/// Loads Lua chunks into the host's interpreter state.
#[derive(Debug, Clone)]
pub struct LuaCompiler {
    lua: Lua,
}

impl LuaCompiler {
    /// Create a compiler that loads chunks into `lua`.
    #[must_use]
    pub fn new(lua: Lua) -> Self {
        Self { lua }
    }
}

impl ArtifactCompiler for LuaCompiler {
    type Artifact = Function;

    fn compile(&self, path: &Path) -> Result<Function, CompileFailure> {
        let source = fs::read(path).map_err(CompileFailure::Io)?;

        let function = self
            .lua
            .load(skip_shebang(source))
            .set_name(format!("@{}", path.display()))
            .into_function()?;

        Ok(function)
    }
}

/// Turn a leading `#` line into a comment, keeping line numbers intact.
fn skip_shebang(source: Vec<u8>) -> Vec<u8> {
    if source.first() == Some(&b'#') {
        let mut commented = Vec::with_capacity(source.len() + 2);
        commented.extend_from_slice(b"--");
        commented.extend_from_slice(&source);
        commented
    } else {
        source
    }
}
