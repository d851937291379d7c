//! Runtime façade
//!
//! [`LuaRuntime`] owns one interpreter instance together with its bridge
//! state. All operations are synchronous and run on the caller's thread; the
//! runtime is neither `Send` nor `Sync`.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use mlua::{ChunkMode, Function, Lua, LuaOptions, MultiValue, RegistryKey, Table, Value};
use tracing::debug;

use crate::config::{resolve_libraries, BridgeConfig};
use crate::error::{BridgeError, HostResult, Result};

use super::convert::{key_to_string, Converter};
use super::coroutine::{self, CoroutineStatus, ResumeResult};
use super::handles::{PropertyAccess, PropertyGetter, PropertySetter};
use super::metatable::{self, MetatableEntry};
use super::registry;
use super::script_cache::ScriptCache;
use super::state::BridgeState;
use super::trampoline::{host_function, load_raise_shim, HostFunction};
use super::value::{CoroutineRef, FunctionRef, OpaqueRef, ScriptValue, TableRef};

/// Collects keys through the script-level `pairs`, so `__pairs` is honored
const COLLECT_KEYS: &str = r#"
local t = ...
local keys = {}
for k in pairs(t) do
    keys[#keys + 1] = k
end
return keys
"#;

/// Signature of precompiled Lua chunks
const BYTECODE_SIGNATURE: &[u8] = b"\x1bLua";

/// Embedded interpreter with a value and lifetime bridge to the host
pub struct LuaRuntime {
    // Pins are dropped before the interpreter closes
    scripts: ScriptCache,
    raise_shim: RegistryKey,
    collect_keys: RegistryKey,

    // Closing the interpreter finalizes every remaining marker, which still
    // reaches the state and its installed finalizer
    lua: Lua,
    state: Rc<BridgeState>,

    allow_bytecode: bool,
}

impl LuaRuntime {
    /// Runtime with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(BridgeConfig::default())
    }

    /// Runtime with an explicit configuration.
    ///
    /// Unknown library names fail here, before an instance exists.
    pub fn with_config(config: BridgeConfig) -> Result<Self> {
        let selection = resolve_libraries(&config.libraries)?;

        let lua = if selection.requires_unsafe || config.allow_bytecode {
            // SAFETY: the debug library and binary chunks can break interpreter
            // invariants; callers opt in through the configuration.
            unsafe { Lua::unsafe_new_with(selection.libs, LuaOptions::new()) }
        } else {
            Lua::new_with(selection.libs, LuaOptions::new())?
        };

        if config.memory_limit > 0 {
            lua.set_memory_limit(config.memory_limit)?;
        }

        let raise_shim = {
            let factory = load_raise_shim(&lua)?;
            lua.create_registry_value(factory)?
        };
        let collect_keys = {
            let collector = lua.load(COLLECT_KEYS).set_name("=collect_keys").into_function()?;
            lua.create_registry_value(collector)?
        };

        debug!(
            libraries = ?config.libraries,
            max_depth = config.max_depth,
            memory_limit = config.memory_limit,
            restricted = config.restricted,
            "lua runtime created"
        );

        Ok(LuaRuntime {
            scripts: ScriptCache::default(),
            raise_shim,
            collect_keys,
            lua,
            state: Rc::new(BridgeState::new(config.max_depth, config.restricted)),
            allow_bytecode: config.allow_bytecode,
        })
    }

    /// Underlying interpreter, for collaborators that need raw access
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn converter(&self) -> Converter<'_, '_> {
        Converter::new(&self.lua, &self.state)
    }

    // ---- execution ----

    /// Compile and run a script, returning every value it returns
    pub fn execute(&self, script: &str) -> Result<Vec<ScriptValue>> {
        self.execute_named(script, "=script")
    }

    /// Like [`execute`](Self::execute) with an explicit chunk name for error messages
    pub fn execute_named(&self, script: &str, chunk_name: &str) -> Result<Vec<ScriptValue>> {
        debug!(chunk = chunk_name, len = script.len(), "executing script");
        let values = self
            .lua
            .load(script)
            .set_name(chunk_name)
            .set_mode(ChunkMode::Text)
            .eval::<MultiValue>()?;
        self.converter().lift_all(values)
    }

    /// Run a script file; precompiled files need bytecode to be enabled
    pub fn execute_file(&self, path: impl AsRef<Path>) -> Result<Vec<ScriptValue>> {
        let path = path.as_ref();
        let source = fs::read(path)?;
        if source.starts_with(BYTECODE_SIGNATURE) {
            return self.execute_bytecode(&source);
        }

        let chunk_name = format!("@{}", path.display());
        debug!(chunk = %chunk_name, "executing script file");
        let values = self
            .lua
            .load(&source)
            .set_name(chunk_name)
            .set_mode(ChunkMode::Text)
            .eval::<MultiValue>()?;
        self.converter().lift_all(values)
    }

    /// Compile a script to stripped bytecode without running it
    pub fn compile(&self, script: &str) -> Result<Vec<u8>> {
        let function = self.lua.load(script).set_mode(ChunkMode::Text).into_function()?;
        Ok(function.dump(true))
    }

    /// Run a precompiled chunk
    pub fn execute_bytecode(&self, bytecode: &[u8]) -> Result<Vec<ScriptValue>> {
        if !self.allow_bytecode {
            return Err(BridgeError::BytecodeDisabled);
        }
        debug!(len = bytecode.len(), "executing bytecode");
        let values = self
            .lua
            .load(bytecode)
            .set_name("=bytecode")
            .set_mode(ChunkMode::Binary)
            .eval::<MultiValue>()?;
        self.converter().lift_all(values)
    }

    /// Run a script with host-function calls rejected, restoring the previous
    /// mode afterwards
    pub fn execute_restricted(&self, script: &str) -> Result<Vec<ScriptValue>> {
        let previous = self.state.set_restricted(true);
        let result = self.execute(script);
        self.state.set_restricted(previous);
        result
    }

    /// Reject (or allow again) every host-function call from scripts
    pub fn set_restricted(&self, restricted: bool) {
        self.state.set_restricted(restricted);
    }

    pub fn is_restricted(&self) -> bool {
        self.state.is_restricted()
    }

    /// Call a pinned function
    pub fn call_function(&self, function: &FunctionRef, args: &[ScriptValue]) -> Result<Vec<ScriptValue>> {
        let converter = self.converter();
        let callee: Function = self.lua.registry_value(function.view().key())?;
        let args = MultiValue::from_vec(converter.lower_all(args)?);
        let values = callee.call::<_, MultiValue>(args)?;
        converter.lift_all(values)
    }

    // ---- script cache ----

    /// Compile and cache a script, returning its SHA1
    pub fn load_script(&mut self, script: &str) -> Result<String> {
        self.scripts.load(&self.lua, script)
    }

    /// Run a cached script by SHA1
    pub fn execute_cached(&self, sha1: &str) -> Result<Vec<ScriptValue>> {
        let function = self.scripts.get(&self.lua, sha1)?;
        debug!(sha1, "executing cached script");
        let values = function.call::<_, MultiValue>(())?;
        self.converter().lift_all(values)
    }

    pub fn script_exists(&self, sha1s: &[&str]) -> Vec<bool> {
        self.scripts.exists(sha1s)
    }

    pub fn flush_scripts(&mut self) -> Result<()> {
        self.scripts.flush(&self.lua)
    }

    // ---- globals and host functions ----

    pub fn set_global(&self, name: &str, value: &ScriptValue) -> Result<()> {
        let value = self.converter().lower(value)?;
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    /// Value of a global; `Nil` if unset
    pub fn get_global(&self, name: &str) -> Result<ScriptValue> {
        let value: Value = self.lua.globals().get(name)?;
        self.converter().lift(value)
    }

    /// Expose a host function as the global `name`, replacing any previous one
    pub fn register_function<F>(&self, name: &str, function: F) -> Result<()>
    where
        F: Fn(Vec<ScriptValue>) -> HostResult<ScriptValue> + 'static,
    {
        let replaced = self.state.functions.insert(name, Rc::new(function) as HostFunction);
        let callable = host_function(&self.lua, &self.state, &self.raise_shim, name)?;
        self.lua.globals().set(name, callable)?;
        debug!(function = name, replaced, "host function registered");
        Ok(())
    }

    /// Store a host function under a private name for metatable entries,
    /// without creating a global
    pub fn store_host_function<F>(&self, name: &str, function: F)
    where
        F: Fn(Vec<ScriptValue>) -> HostResult<ScriptValue> + 'static,
    {
        let replaced = self.state.functions.insert(name, Rc::new(function) as HostFunction);
        debug!(function = name, replaced, "host function stored");
    }

    /// Install a metatable on the global table `target`
    pub fn set_metatable(&self, target: &str, entries: &[MetatableEntry]) -> Result<()> {
        metatable::set_metatable(&self.lua, &self.state, &self.raise_shim, target, entries)
    }

    // ---- opaque handles ----

    /// Bind the global `name` to an opaque marker for `handle_id`
    pub fn create_handle_global(&self, name: &str, handle_id: i32) -> Result<()> {
        self.set_global(name, &ScriptValue::OpaqueRef(OpaqueRef::host(handle_id)))
    }

    /// Bind the global `name` to a property proxy for `handle_id`
    pub fn create_proxy_handle_global(&self, name: &str, handle_id: i32) -> Result<()> {
        self.set_global(name, &ScriptValue::OpaqueRef(OpaqueRef::proxy(handle_id)))
    }

    /// Proxy global whose properties are limited by `access`
    pub fn create_proxy_handle_global_with_access(
        &self,
        name: &str,
        handle_id: i32,
        access: PropertyAccess,
    ) -> Result<()> {
        self.create_proxy_handle_global(name, handle_id)?;
        self.state.handles.set_access(handle_id, access);
        Ok(())
    }

    /// Change the property permissions of a live proxy handle
    pub fn set_property_access(&self, handle_id: i32, access: PropertyAccess) {
        self.state.handles.set_access(handle_id, access);
    }

    pub fn increment_ref_count(&self, handle_id: i32) -> u32 {
        self.state.handles.increment(handle_id)
    }

    /// Drop one reference; the zero crossing runs the finalizer
    pub fn decrement_ref_count(&self, handle_id: i32) {
        self.state.handles.decrement(handle_id)
    }

    /// Current count, or `None` for handles with no live references
    pub fn ref_count(&self, handle_id: i32) -> Option<u32> {
        self.state.handles.count(handle_id)
    }

    pub fn set_handle_finalizer<F>(&self, finalizer: F)
    where
        F: Fn(i32) + 'static,
    {
        self.state.handles.set_finalizer(Some(Rc::new(finalizer)));
    }

    pub fn clear_handle_finalizer(&self) {
        self.state.handles.set_finalizer(None);
    }

    /// Install the property callbacks used by proxy handles
    pub fn set_property_handlers<G, S>(&self, getter: G, setter: S)
    where
        G: Fn(i32, &str) -> HostResult<ScriptValue> + 'static,
        S: Fn(i32, &str, ScriptValue) -> HostResult<()> + 'static,
    {
        self.set_property_getter(getter);
        self.set_property_setter(setter);
    }

    pub fn set_property_getter<G>(&self, getter: G)
    where
        G: Fn(i32, &str) -> HostResult<ScriptValue> + 'static,
    {
        self.state.handles.set_getter(Some(Rc::new(getter) as PropertyGetter));
    }

    pub fn set_property_setter<S>(&self, setter: S)
    where
        S: Fn(i32, &str, ScriptValue) -> HostResult<()> + 'static,
    {
        self.state.handles.set_setter(Some(Rc::new(setter) as PropertySetter));
    }

    // ---- coroutines ----

    /// New suspended coroutine running `function`
    pub fn create_coroutine(&self, function: &FunctionRef) -> Result<CoroutineRef> {
        coroutine::create(&self.lua, &self.state, function)
    }

    pub fn resume(&self, coroutine: &CoroutineRef, args: &[ScriptValue]) -> Result<ResumeResult> {
        coroutine::resume(&self.lua, &self.state, coroutine, args)
    }

    pub fn coroutine_status(&self, coroutine: &CoroutineRef) -> Result<CoroutineStatus> {
        coroutine::status(&self.lua, coroutine)
    }

    // ---- live tables ----

    fn table(&self, table: &TableRef) -> Result<Table<'_>> {
        match registry::resolve(&self.lua, table.view())? {
            Value::Table(table) => Ok(table),
            other => Err(BridgeError::Runtime(format!("pinned value is a {}, not a table", other.type_name()))),
        }
    }

    /// `table[key]`, honoring `__index`
    pub fn get_field(&self, table: &TableRef, key: impl Into<ScriptValue>) -> Result<ScriptValue> {
        let converter = self.converter();
        let key = converter.lower(&key.into())?;
        let value: Value = self.table(table)?.get(key)?;
        converter.lift(value)
    }

    /// `table[key] = value`, honoring `__newindex`
    pub fn set_field(&self, table: &TableRef, key: impl Into<ScriptValue>, value: &ScriptValue) -> Result<()> {
        let converter = self.converter();
        let key = converter.lower(&key.into())?;
        let value = converter.lower(value)?;
        self.table(table)?.set(key, value)?;
        Ok(())
    }

    /// `table[key] ~= nil`, honoring `__index`
    pub fn has_field(&self, table: &TableRef, key: impl Into<ScriptValue>) -> Result<bool> {
        let key = self.converter().lower(&key.into())?;
        let value: Value = self.table(table)?.get(key)?;
        Ok(!matches!(value, Value::Nil))
    }

    /// Keys visited by `pairs(table)`; keys that are neither strings nor
    /// numbers are skipped
    pub fn keys(&self, table: &TableRef) -> Result<Vec<String>> {
        let collector: Function = self.lua.registry_value(&self.collect_keys)?;
        let keys: Table = collector.call(self.table(table)?)?;

        let mut names = Vec::new();
        for key in keys.sequence_values::<Value>() {
            if let Some(name) = key_to_string(&self.lua, key?)? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// `#table`, honoring `__len`
    pub fn length(&self, table: &TableRef) -> Result<i64> {
        Ok(self.table(table)?.len()?)
    }

    // ---- reference management ----

    /// Copy of `value` with an independent pin for every reference inside
    pub fn clone_value(&self, value: &ScriptValue) -> Result<ScriptValue> {
        registry::clone_value(&self.lua, &self.state, value)
    }

    /// Release every pin held by `value` now
    pub fn release(&self, value: ScriptValue) -> Result<()> {
        registry::release_value(&self.lua, value)
    }

    /// Run a full collection cycle, finalizing unreachable handle markers
    pub fn collect_garbage(&self) -> Result<()> {
        self.lua.gc_collect()?;
        // Objects with finalizers are only freed by the following cycle
        self.lua.gc_collect()?;
        Ok(())
    }
}
