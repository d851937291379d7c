//! Metatable/Operator Bridge
//!
//! Installs a metatable built from [`MetatableEntry`] values on a global
//! table. Function entries dispatch to host callables stored under private
//! names; the interpreter's own operator rules decide when they run.

use std::rc::Rc;

use mlua::{Lua, RegistryKey, Value};
use tracing::debug;

use crate::error::{BridgeError, Result};

use super::convert::Converter;
use super::state::BridgeState;
use super::trampoline::host_function;
use super::value::ScriptValue;

/// One slot of a metatable
#[derive(Debug, PartialEq)]
pub enum MetatableEntry {
    /// `key` dispatches to the stored host function `function_name`
    Function { key: String, function_name: String },

    /// `key` holds a literal value, e.g. an `__index` table
    Value { key: String, value: ScriptValue },
}

impl MetatableEntry {
    pub fn function(key: impl Into<String>, function_name: impl Into<String>) -> Self {
        MetatableEntry::Function { key: key.into(), function_name: function_name.into() }
    }

    pub fn value(key: impl Into<String>, value: impl Into<ScriptValue>) -> Self {
        MetatableEntry::Value { key: key.into(), value: value.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            MetatableEntry::Function { key, .. } | MetatableEntry::Value { key, .. } => key,
        }
    }
}

/// Build a fresh metatable from `entries` and install it on the global
/// table `target`, replacing any previous metatable.
///
/// Nothing is changed if the target is missing, is not a table, or an entry
/// cannot be built.
pub(crate) fn set_metatable(
    lua: &Lua,
    state: &Rc<BridgeState>,
    shim: &RegistryKey,
    target: &str,
    entries: &[MetatableEntry],
) -> Result<()> {
    let table = match lua.globals().get::<_, Value>(target)? {
        Value::Table(table) => table,
        Value::Nil => return Err(BridgeError::GlobalNotFound(target.to_string())),
        other => {
            return Err(BridgeError::NotATable {
                name: target.to_string(),
                type_name: other.type_name().to_string(),
            })
        }
    };

    let converter = Converter::new(lua, state);
    let metatable = lua.create_table()?;
    for entry in entries {
        match entry {
            MetatableEntry::Function { key, function_name } => {
                metatable.raw_set(key.as_str(), host_function(lua, state, shim, function_name)?)?;
            }
            MetatableEntry::Value { key, value } => {
                metatable.raw_set(key.as_str(), converter.lower(value)?)?;
            }
        }
    }

    table.set_metatable(Some(metatable));
    debug!(target, entries = entries.len(), "metatable installed");
    Ok(())
}
