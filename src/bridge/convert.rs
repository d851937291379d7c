//! Value Conversion Engine
//!
//! Converts between interpreter values and [`ScriptValue`] in both
//! directions. Both directions count one level per nested aggregate and fail
//! the whole conversion once the configured maximum is exceeded, so hostile
//! or accidental deep nesting cannot exhaust the native stack.

use std::collections::HashMap;
use std::rc::Rc;

use mlua::{Lua, Table, Value};
use tracing::trace;

use crate::error::{BridgeError, Result};

use super::handles::{create_marker, HostMarker, ProxyMarker};
use super::registry;
use super::state::BridgeState;
use super::value::{CoroutineRef, FunctionRef, OpaqueRef, ScriptValue, TableRef};

/// Converter bound to one interpreter instance and its bridge state
pub(crate) struct Converter<'s, 'lua> {
    lua: &'lua Lua,
    state: &'s Rc<BridgeState>,
}

impl<'s, 'lua> Converter<'s, 'lua> {
    pub(crate) fn new(lua: &'lua Lua, state: &'s Rc<BridgeState>) -> Self {
        Converter { lua, state }
    }

    /// Host value to interpreter value
    pub(crate) fn lower(&self, value: &ScriptValue) -> Result<Value<'lua>> {
        self.lower_at(value, 0)
    }

    /// Interpreter value to host value
    pub(crate) fn lift(&self, value: Value<'lua>) -> Result<ScriptValue> {
        self.lift_at(value, 0)
    }

    /// Lower a list of values, e.g. call arguments
    pub(crate) fn lower_all(&self, values: &[ScriptValue]) -> Result<Vec<Value<'lua>>> {
        values.iter().map(|value| self.lower(value)).collect()
    }

    /// Lift a list of values, e.g. call results; any failure discards all of them
    pub(crate) fn lift_all<I>(&self, values: I) -> Result<Vec<ScriptValue>>
    where
        I: IntoIterator<Item = Value<'lua>>,
    {
        values.into_iter().map(|value| self.lift(value)).collect()
    }

    /// Level of an aggregate nested inside a value at `depth`
    fn enter(&self, depth: usize) -> Result<usize> {
        let level = depth + 1;
        if level > self.state.max_depth {
            return Err(BridgeError::DepthExceeded { max: self.state.max_depth });
        }
        Ok(level)
    }

    fn lower_at(&self, value: &ScriptValue, depth: usize) -> Result<Value<'lua>> {
        Ok(match value {
            ScriptValue::Nil => Value::Nil,
            ScriptValue::Bool(b) => Value::Boolean(*b),
            ScriptValue::Int(i) => Value::Integer(*i),
            ScriptValue::Float(f) => Value::Number(*f),
            ScriptValue::Bytes(bytes) => Value::String(self.lua.create_string(bytes)?),
            ScriptValue::List(items) => {
                let level = self.enter(depth)?;
                let table = self.lua.create_table()?;
                for (index, item) in items.iter().enumerate() {
                    table.raw_set(index + 1, self.lower_at(item, level)?)?;
                }
                Value::Table(table)
            }
            ScriptValue::Map(entries) => {
                let level = self.enter(depth)?;
                let table = self.lua.create_table()?;
                for (key, item) in entries {
                    table.raw_set(key.as_str(), self.lower_at(item, level)?)?;
                }
                Value::Table(table)
            }
            ScriptValue::FunctionRef(function) => registry::resolve(self.lua, function.view())?,
            ScriptValue::CoroutineRef(coroutine) => registry::resolve(self.lua, coroutine.view())?,
            ScriptValue::TableRef(table) => registry::resolve(self.lua, table.view())?,
            ScriptValue::OpaqueRef(opaque) => match opaque.foreign_pin() {
                // Same object as before, identity preserved
                Some(foreign) => registry::resolve(self.lua, foreign.view())?,
                None => {
                    trace!(handle_id = opaque.handle_id(), proxy = opaque.is_proxy(), "materializing handle marker");
                    Value::UserData(create_marker(self.lua, self.state, opaque.handle_id(), opaque.is_proxy())?)
                }
            },
        })
    }

    fn lift_at(&self, value: Value<'lua>, depth: usize) -> Result<ScriptValue> {
        Ok(match value {
            Value::Nil => ScriptValue::Nil,
            Value::Boolean(b) => ScriptValue::Bool(b),
            Value::Integer(i) => ScriptValue::Int(i),
            Value::Number(n) => ScriptValue::Float(n),
            Value::String(s) => ScriptValue::Bytes(s.as_bytes().to_vec()),
            Value::Table(table) => {
                if table.get_metatable().is_some() {
                    let pin = registry::pin(self.lua, self.state, Value::Table(table))?;
                    return Ok(ScriptValue::TableRef(TableRef::new(pin)));
                }
                let level = self.enter(depth)?;
                self.lift_table(table, level)?
            }
            Value::Function(function) => {
                let pin = registry::pin(self.lua, self.state, Value::Function(function))?;
                ScriptValue::FunctionRef(FunctionRef::new(pin))
            }
            Value::Thread(thread) => {
                let pin = registry::pin(self.lua, self.state, Value::Thread(thread))?;
                ScriptValue::CoroutineRef(CoroutineRef::new(pin))
            }
            Value::UserData(userdata) => {
                if userdata.is::<HostMarker>() {
                    let handle_id = userdata.borrow::<HostMarker>()?.handle_id();
                    ScriptValue::OpaqueRef(OpaqueRef::host(handle_id))
                } else if userdata.is::<ProxyMarker>() {
                    let handle_id = userdata.borrow::<ProxyMarker>()?.handle_id();
                    ScriptValue::OpaqueRef(OpaqueRef::proxy(handle_id))
                } else {
                    let pin = registry::pin(self.lua, self.state, Value::UserData(userdata))?;
                    ScriptValue::OpaqueRef(OpaqueRef::foreign(pin))
                }
            }
            Value::Error(err) => ScriptValue::Bytes(err.to_string().into_bytes()),
            // Light userdata and anything else the bridge cannot look into
            other => {
                let pin = registry::pin(self.lua, self.state, other)?;
                ScriptValue::OpaqueRef(OpaqueRef::foreign(pin))
            }
        })
    }

    /// Lift a table without a metatable; `level` is the table's own level
    fn lift_table(&self, table: Table<'lua>, level: usize) -> Result<ScriptValue> {
        let entries = table
            .pairs::<Value, Value>()
            .collect::<mlua::Result<Vec<_>>>()?;

        if is_dense_sequence(entries.iter().map(|(key, _)| key)) {
            let mut slots: Vec<Option<Value<'lua>>> = (0..entries.len()).map(|_| None).collect();
            for (key, item) in entries {
                if let Some(index) = sequence_index(&key, slots.len()) {
                    slots[index] = Some(item);
                }
            }
            let items = slots
                .into_iter()
                .flatten()
                .map(|item| self.lift_at(item, level))
                .collect::<Result<Vec<_>>>()?;
            return Ok(ScriptValue::List(items));
        }

        let mut map = HashMap::with_capacity(entries.len());
        for (key, item) in entries {
            // Keys that are neither strings nor numbers cannot be represented
            if let Some(key) = key_to_string(self.lua, key)? {
                map.insert(key, self.lift_at(item, level)?);
            }
        }
        Ok(ScriptValue::Map(map))
    }
}

/// Zero-based slot for `key` in a sequence of `len` elements
fn sequence_index(key: &Value, len: usize) -> Option<usize> {
    match key {
        Value::Integer(i) if *i >= 1 && (*i as u64) <= len as u64 => Some((*i - 1) as usize),
        _ => None,
    }
}

/// A set of distinct table keys is a dense sequence iff every key is an
/// integer in `1..=N`, where `N` is the number of keys.
fn is_dense_sequence<'a, 'lua: 'a, I>(keys: I) -> bool
where
    I: ExactSizeIterator<Item = &'a Value<'lua>>,
{
    let len = keys.len();
    let mut keys = keys;
    keys.all(|key| sequence_index(key, len).is_some())
}

/// Textual form of a string or numeric key, as the interpreter's `tostring`
/// would produce it; `None` for every other key type.
pub(crate) fn key_to_string<'lua>(lua: &'lua Lua, key: Value<'lua>) -> mlua::Result<Option<String>> {
    match key {
        Value::String(s) => Ok(Some(s.to_string_lossy().into_owned())),
        Value::Integer(_) | Value::Number(_) => {
            Ok(lua.coerce_string(key)?.map(|s| s.to_string_lossy().into_owned()))
        }
        _ => Ok(None),
    }
}
