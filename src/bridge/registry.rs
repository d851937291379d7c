//! Registry Reference Manager
//!
//! Pins interpreter-heap objects in the registry so they survive collection
//! while the host holds them. Release consumes the owning [`RegistryRef`], so
//! a pin can never be released twice.

use mlua::{Lua, Value};

use crate::error::Result;

use super::state::BridgeState;
use super::value::{CoroutineRef, FunctionRef, OpaqueRef, RefView, RegistryRef, ScriptValue, TableRef};

/// Pin a value in the registry
pub(crate) fn pin<'lua>(lua: &'lua Lua, state: &BridgeState, value: Value<'lua>) -> Result<RegistryRef> {
    let key = lua.create_registry_value(value)?;
    Ok(RegistryRef::new(state.next_ref_id(), key))
}

/// Fetch the pinned value
pub(crate) fn resolve<'lua>(lua: &'lua Lua, view: RefView<'_>) -> Result<Value<'lua>> {
    Ok(lua.registry_value::<Value>(view.key())?)
}

/// Drop the pin immediately instead of waiting for the registry to expire it
pub(crate) fn release(lua: &Lua, pin: RegistryRef) -> Result<()> {
    lua.remove_registry_value(pin.into_key())?;
    Ok(())
}

/// Pin the same object again under a new key
pub(crate) fn repin(lua: &Lua, state: &BridgeState, view: RefView<'_>) -> Result<RegistryRef> {
    let value = resolve(lua, view)?;
    pin(lua, state, value)
}

/// Deep copy of a value; every reference inside gets its own pin
pub(crate) fn clone_value(lua: &Lua, state: &BridgeState, value: &ScriptValue) -> Result<ScriptValue> {
    Ok(match value {
        ScriptValue::Nil => ScriptValue::Nil,
        ScriptValue::Bool(b) => ScriptValue::Bool(*b),
        ScriptValue::Int(i) => ScriptValue::Int(*i),
        ScriptValue::Float(f) => ScriptValue::Float(*f),
        ScriptValue::Bytes(bytes) => ScriptValue::Bytes(bytes.clone()),
        ScriptValue::List(items) => ScriptValue::List(
            items.iter().map(|item| clone_value(lua, state, item)).collect::<Result<_>>()?,
        ),
        ScriptValue::Map(entries) => ScriptValue::Map(
            entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), clone_value(lua, state, item)?)))
                .collect::<Result<_>>()?,
        ),
        ScriptValue::FunctionRef(function) => {
            ScriptValue::FunctionRef(FunctionRef::new(repin(lua, state, function.view())?))
        }
        ScriptValue::CoroutineRef(coroutine) => {
            ScriptValue::CoroutineRef(CoroutineRef::new(repin(lua, state, coroutine.view())?))
        }
        ScriptValue::TableRef(table) => ScriptValue::TableRef(TableRef::new(repin(lua, state, table.view())?)),
        ScriptValue::OpaqueRef(opaque) => match opaque.foreign_pin() {
            Some(foreign) => ScriptValue::OpaqueRef(OpaqueRef::foreign(repin(lua, state, foreign.view())?)),
            None if opaque.is_proxy() => ScriptValue::OpaqueRef(OpaqueRef::proxy(opaque.handle_id())),
            None => ScriptValue::OpaqueRef(OpaqueRef::host(opaque.handle_id())),
        },
    })
}

/// Release every pin held by a value.
///
/// All pins are released even if one of them fails; the first failure is
/// reported.
pub(crate) fn release_value(lua: &Lua, value: ScriptValue) -> Result<()> {
    let mut first_error = None;
    release_into(lua, value, &mut first_error);
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn release_into(lua: &Lua, value: ScriptValue, first_error: &mut Option<crate::error::BridgeError>) {
    let outcome = match value {
        ScriptValue::List(items) => {
            for item in items {
                release_into(lua, item, first_error);
            }
            Ok(())
        }
        ScriptValue::Map(entries) => {
            for (_, item) in entries {
                release_into(lua, item, first_error);
            }
            Ok(())
        }
        ScriptValue::FunctionRef(function) => release(lua, function.into_pin()),
        ScriptValue::CoroutineRef(coroutine) => release(lua, coroutine.into_pin()),
        ScriptValue::TableRef(table) => release(lua, table.into_pin()),
        ScriptValue::OpaqueRef(opaque) => match opaque.into_foreign_pin() {
            Some(foreign) => release(lua, foreign),
            None => Ok(()),
        },
        _ => Ok(()),
    };

    if let Err(err) = outcome {
        first_error.get_or_insert(err);
    }
}
