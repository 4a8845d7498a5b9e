//! Per-invocation execution environments for compiled scripts.
//!
//! Each run gets a fresh table whose only own entries are the `print`
//! override and `_G` (pointing back at the table itself). Everything else is
//! read through a shared metatable from the interpreter's globals, so the
//! base environment is never copied and never written by a script.
//!
//! Creating a [`Sandbox`] seals the globals table: its contents move to a
//! hidden backing table and every assignment through it raises. That covers
//! the routes that reach the real globals without going through `_ENV`,
//! such as chunks built by `load` and `package.loaded._G`. Finish any host
//! setup that writes globals before creating the sandbox.

use std::fmt;
use std::io::Write;

use mlua::{Function, Lua, MultiValue, Table, Value};

use crate::error::RuntimeError;

/// Runs artifacts inside throwaway environments layered over a shared base.
pub struct Sandbox {
    lua: Lua,
    /// Globals every script can read.
    base: Table,
    /// `{ __index = base }`, shared by every per-run environment.
    fallback: Table,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox").finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox whose base environment is `lua`'s globals table.
    ///
    /// The globals become read-only from here on.
    ///
    /// # Errors
    ///
    /// Returns an error if the globals cannot be sealed or the fallback
    /// metatable cannot be allocated.
    pub fn new(lua: &Lua) -> mlua::Result<Self> {
        let base = lua.globals();
        seal(lua, &base)?;

        let fallback = lua.create_table()?;
        fallback.set("__index", base.clone())?;
        // Hide the metatable so `setmetatable(_ENV, ...)` can't re-point it.
        fallback.set("__metatable", false)?;

        Ok(Self {
            lua: lua.clone(),
            base,
            fallback,
        })
    }

    /// The shared base environment.
    #[must_use]
    pub fn base(&self) -> &Table {
        &self.base
    }

    /// Run `artifact` with no arguments, sending everything it prints to `out`.
    ///
    /// Output is written as the script produces it, so on failure `out`
    /// already holds whatever was printed before the error.
    ///
    /// # Errors
    ///
    /// Returns a [`RuntimeError`] carrying the script's error message and
    /// traceback if the script raised.
    pub fn run(&self, artifact: &Function, out: &mut dyn Write) -> Result<(), RuntimeError> {
        let result = self.lua.scope(|scope| {
            let env = self.lua.create_table()?;
            let print = scope
                .create_function_mut(move |lua, args: MultiValue| write_args(lua, args, &mut *out))?;
            env.set("print", print)?;
            env.set("_G", env.clone())?;
            env.set_metatable(Some(self.fallback.clone()));

            artifact.set_environment(env)?;
            artifact.call::<()>(())
        });

        // The scoped `print` is dead now; don't keep this run's table reachable.
        if let Err(err) = artifact.set_environment(self.base.clone()) {
            tracing::warn!(error = %err, "failed to detach script environment");
        }

        result.map_err(RuntimeError::from)
    }
}

/// Move every entry of `globals` into a backing table reached through
/// `__index`, and reject assignments with `__newindex`.
fn seal(lua: &Lua, globals: &Table) -> mlua::Result<()> {
    // Already sealed by an earlier sandbox on the same interpreter.
    if globals.metatable().is_some() {
        return Ok(());
    }

    let backing = lua.create_table()?;
    let entries = globals
        .pairs::<Value, Value>()
        .collect::<mlua::Result<Vec<_>>>()?;
    for (key, value) in entries {
        globals.raw_set(key.clone(), Value::Nil)?;
        backing.raw_set(key, value)?;
    }

    let guard = lua.create_table()?;
    guard.set("__index", backing)?;
    guard.set(
        "__newindex",
        lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(
                "attempt to modify the read-only base environment".into(),
            ))
        })?,
    )?;
    guard.set("__metatable", false)?;
    globals.set_metatable(Some(guard));

    Ok(())
}

/// `print` replacement: `tostring` each argument and write the bytes with no
/// separators or trailing newline.
fn write_args(lua: &Lua, args: MultiValue, out: &mut dyn Write) -> mlua::Result<()> {
    let tostring: Function = lua.globals().get("tostring")?;

    for value in args {
        match tostring.call::<Value>(value)? {
            Value::String(s) => out.write_all(&s.as_bytes()).map_err(mlua::Error::external)?,
            _ => {
                return Err(mlua::Error::RuntimeError(
                    "'tostring' must return a string to 'print'".into(),
                ));
            }
        }
    }

    Ok(())
}
