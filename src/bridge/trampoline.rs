//! Host-function trampoline
//!
//! Host callables live in a name-keyed [`FunctionTable`]. The interpreter
//! sees a native function bound to the name; on every call it looks the
//! callable up, lifts the arguments, invokes it and lowers the result.
//!
//! The native half never raises. It returns `(ok, value_or_message)` and a
//! small script-side shim raises the message with `error(message, 2)`, so a
//! failing host function produces a plain string error that protected calls
//! observe exactly like any other script error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use mlua::{FromLuaMulti, Function, Lua, MultiValue, RegistryKey, Value};
use tracing::debug;

use crate::error::HostResult;

use super::convert::Converter;
use super::state::BridgeState;
use super::value::ScriptValue;

/// Host callable invoked from scripts
pub type HostFunction = Rc<dyn Fn(Vec<ScriptValue>) -> HostResult<ScriptValue>>;

/// Turns the `(ok, value)` native half into a function that raises on failure
const RAISE_SHIM: &str = r#"
local native = ...
return function(...)
    local ok, value = native(...)
    if not ok then
        error(value, 2)
    end
    return value
end
"#;

/// Host callables by name
pub(crate) struct FunctionTable {
    functions: RefCell<HashMap<String, HostFunction>>,
}

impl FunctionTable {
    pub(crate) fn new() -> Self {
        FunctionTable { functions: RefCell::new(HashMap::new()) }
    }

    /// Store a callable, replacing any previous one with the same name
    pub(crate) fn insert(&self, name: &str, function: HostFunction) -> bool {
        self.functions.borrow_mut().insert(name.to_string(), function).is_some()
    }

    pub(crate) fn get(&self, name: &str) -> Option<HostFunction> {
        self.functions.borrow().get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.functions.borrow().contains_key(name)
    }
}

/// Build the script-visible function for the host callable `name`.
///
/// The callable is resolved at call time, so re-registering a name takes
/// effect for functions built earlier.
pub(crate) fn host_function<'lua>(
    lua: &'lua Lua,
    state: &Rc<BridgeState>,
    shim: &RegistryKey,
    name: &str,
) -> mlua::Result<Function<'lua>> {
    let weak = Rc::downgrade(state);
    let function_name = name.to_string();
    let factory: Function = lua.registry_value(shim)?;
    raising_function(lua, factory, move |lua, args: MultiValue| call_host(lua, &weak, &function_name, args))
}

/// Compile a fresh copy of the raise shim factory
pub(crate) fn load_raise_shim(lua: &Lua) -> mlua::Result<Function<'_>> {
    lua.load(RAISE_SHIM).set_name("=raise_shim").into_function()
}

/// Wrap `native` so that an `Err(message)` is raised in the calling script
/// as a plain string error.
pub(crate) fn raising_function<'lua, A, F>(
    lua: &'lua Lua,
    factory: Function<'lua>,
    native: F,
) -> mlua::Result<Function<'lua>>
where
    A: FromLuaMulti<'lua>,
    F: Fn(&'lua Lua, A) -> Result<Value<'lua>, String> + 'static,
{
    let native = lua.create_function(move |lua, args: A| {
        Ok(match native(lua, args) {
            Ok(value) => (true, value),
            Err(message) => (false, Value::String(lua.create_string(&message)?)),
        })
    })?;
    factory.call::<_, Function>(native)
}

fn call_host<'lua>(
    lua: &'lua Lua,
    state: &Weak<BridgeState>,
    name: &str,
    args: MultiValue<'lua>,
) -> Result<Value<'lua>, String> {
    let state = state
        .upgrade()
        .ok_or_else(|| format!("host function '{name}' called after the runtime was closed"))?;

    if state.is_restricted() {
        return Err(format!("host function '{name}' cannot be called in restricted mode"));
    }

    let function = state
        .functions
        .get(name)
        .ok_or_else(|| format!("host function '{name}' is not registered"))?;

    let converter = Converter::new(lua, &state);
    let args = converter
        .lift_all(args)
        .map_err(|err| format!("host function '{name}' received an unconvertible argument: {err}"))?;

    debug!(function = name, argc = args.len(), "calling host function");
    let result = match catch_unwind(AssertUnwindSafe(|| function(args))) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(format!("host function '{name}' failed: {err}")),
        Err(_) => return Err(format!("host function '{name}' panicked")),
    };

    converter
        .lower(&result)
        .map_err(|err| format!("host function '{name}' returned an unconvertible value: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_table_replaces() {
        let table = FunctionTable::new();
        let first: HostFunction = Rc::new(|_| Ok(ScriptValue::Int(1)));
        let second: HostFunction = Rc::new(|_| Ok(ScriptValue::Int(2)));

        assert!(!table.insert("f", first));
        assert!(table.insert("f", second));
        assert!(table.contains("f"));

        let f = table.get("f").unwrap();
        assert_eq!(f(Vec::new()).unwrap(), ScriptValue::Int(2));
        assert!(table.get("g").is_none());
    }
}
