//! Opaque Handle & Lifecycle Bridge
//!
//! Host objects are exposed to scripts as small marker userdata carrying an
//! integer handle id. Each live marker holds one count in the
//! [`HandleTable`]; the interpreter's collector drops markers, which gives
//! the count back, and the zero crossing notifies the host once through the
//! installed finalizer.
//!
//! Proxy markers additionally route indexing to the host's property getter
//! and setter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use mlua::{AnyUserData, Lua, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};
use tracing::{trace, warn};

use crate::error::HostResult;

use super::convert::{key_to_string, Converter};
use super::state::BridgeState;
use super::trampoline::{load_raise_shim, raising_function};
use super::value::ScriptValue;

/// Called once when a handle's count drops to zero
pub type HandleFinalizer = Rc<dyn Fn(i32)>;

/// Reads property `key` of handle `id`; `Ok(Nil)` for unknown keys
pub type PropertyGetter = Rc<dyn Fn(i32, &str) -> HostResult<ScriptValue>>;

/// Writes property `key` of handle `id`
pub type PropertySetter = Rc<dyn Fn(i32, &str, ScriptValue) -> HostResult<()>>;

/// Per-handle property permissions for proxy handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyAccess {
    pub readable: bool,
    pub writable: bool,
}

impl PropertyAccess {
    pub const READ_WRITE: PropertyAccess = PropertyAccess { readable: true, writable: true };
    pub const READ_ONLY: PropertyAccess = PropertyAccess { readable: true, writable: false };
    pub const WRITE_ONLY: PropertyAccess = PropertyAccess { readable: false, writable: true };
    pub const NONE: PropertyAccess = PropertyAccess { readable: false, writable: false };
}

impl Default for PropertyAccess {
    fn default() -> Self {
        PropertyAccess::READ_WRITE
    }
}

/// Ref counts and host callbacks for opaque handles
pub(crate) struct HandleTable {
    counts: RefCell<HashMap<i32, u32>>,
    access: RefCell<HashMap<i32, PropertyAccess>>,
    finalizer: RefCell<Option<HandleFinalizer>>,
    getter: RefCell<Option<PropertyGetter>>,
    setter: RefCell<Option<PropertySetter>>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        HandleTable {
            counts: RefCell::new(HashMap::new()),
            access: RefCell::new(HashMap::new()),
            finalizer: RefCell::new(None),
            getter: RefCell::new(None),
            setter: RefCell::new(None),
        }
    }

    /// Add one reference, returning the new count
    pub(crate) fn increment(&self, handle_id: i32) -> u32 {
        let mut counts = self.counts.borrow_mut();
        let count = counts.entry(handle_id).or_insert(0);
        *count += 1;
        trace!(handle_id, count = *count, "handle ref count incremented");
        *count
    }

    /// Drop one reference. Unknown handles are ignored.
    pub(crate) fn decrement(&self, handle_id: i32) {
        let remaining = {
            let mut counts = self.counts.borrow_mut();
            let remaining = match counts.get_mut(&handle_id) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => return,
            };
            if remaining == 0 {
                counts.remove(&handle_id);
            }
            remaining
        };

        trace!(handle_id, count = remaining, "handle ref count decremented");
        if remaining == 0 {
            self.finalize(handle_id);
        }
    }

    pub(crate) fn count(&self, handle_id: i32) -> Option<u32> {
        self.counts.borrow().get(&handle_id).copied()
    }

    fn finalize(&self, handle_id: i32) {
        self.access.borrow_mut().remove(&handle_id);

        // No borrow may be held here: the callback can re-enter the table
        let finalizer = self.finalizer.borrow().clone();
        if let Some(finalizer) = finalizer {
            if catch_unwind(AssertUnwindSafe(|| finalizer(handle_id))).is_err() {
                warn!(handle_id, "handle finalizer panicked");
            }
        }
    }

    pub(crate) fn set_finalizer(&self, finalizer: Option<HandleFinalizer>) {
        *self.finalizer.borrow_mut() = finalizer;
    }

    pub(crate) fn set_getter(&self, getter: Option<PropertyGetter>) {
        *self.getter.borrow_mut() = getter;
    }

    pub(crate) fn set_setter(&self, setter: Option<PropertySetter>) {
        *self.setter.borrow_mut() = setter;
    }

    fn getter(&self) -> Option<PropertyGetter> {
        self.getter.borrow().clone()
    }

    fn setter(&self) -> Option<PropertySetter> {
        self.setter.borrow().clone()
    }

    pub(crate) fn access(&self, handle_id: i32) -> PropertyAccess {
        self.access.borrow().get(&handle_id).copied().unwrap_or_default()
    }

    pub(crate) fn set_access(&self, handle_id: i32, access: PropertyAccess) {
        self.access.borrow_mut().insert(handle_id, access);
    }
}

/// Handle id plus the count it holds; dropping it gives the count back.
///
/// A core starts unarmed and only owns a count once [`MarkerCore::arm`] has
/// run, so a marker that never reached the interpreter releases nothing.
struct MarkerCore {
    handle_id: i32,
    state: Weak<BridgeState>,
}

impl MarkerCore {
    fn unarmed(handle_id: i32) -> Self {
        MarkerCore { handle_id, state: Weak::new() }
    }

    fn arm(&mut self, state: &Rc<BridgeState>) {
        self.state = Rc::downgrade(state);
        state.handles.increment(self.handle_id);
    }
}

impl Drop for MarkerCore {
    fn drop(&mut self) {
        // Unarmed, or the state is already gone during teardown
        if let Some(state) = self.state.upgrade() {
            state.handles.decrement(self.handle_id);
        }
    }
}

trait Marker: UserData + 'static {
    fn core(&self) -> &MarkerCore;
    fn core_mut(&mut self) -> &mut MarkerCore;
}

/// Marker for host objects without property access
pub(crate) struct HostMarker(MarkerCore);

/// Marker for host objects whose properties go through the getter/setter
pub(crate) struct ProxyMarker(MarkerCore);

impl Marker for HostMarker {
    fn core(&self) -> &MarkerCore {
        &self.0
    }

    fn core_mut(&mut self) -> &mut MarkerCore {
        &mut self.0
    }
}

impl Marker for ProxyMarker {
    fn core(&self) -> &MarkerCore {
        &self.0
    }

    fn core_mut(&mut self) -> &mut MarkerCore {
        &mut self.0
    }
}

impl HostMarker {
    pub(crate) fn handle_id(&self) -> i32 {
        self.0.handle_id
    }
}

impl ProxyMarker {
    pub(crate) fn handle_id(&self) -> i32 {
        self.0.handle_id
    }
}

/// Materialize a marker for `handle_id` and count it.
///
/// The count is taken only once the userdata exists. A failed allocation
/// leaves the count table untouched and never reaches the finalizer.
pub(crate) fn create_marker<'lua>(
    lua: &'lua Lua,
    state: &Rc<BridgeState>,
    handle_id: i32,
    proxy: bool,
) -> mlua::Result<AnyUserData<'lua>> {
    if proxy {
        arm_marker::<ProxyMarker>(lua.create_userdata(ProxyMarker(MarkerCore::unarmed(handle_id)))?, state)
    } else {
        arm_marker::<HostMarker>(lua.create_userdata(HostMarker(MarkerCore::unarmed(handle_id)))?, state)
    }
}

fn arm_marker<'lua, T: Marker>(userdata: AnyUserData<'lua>, state: &Rc<BridgeState>) -> mlua::Result<AnyUserData<'lua>> {
    userdata.borrow_mut::<T>()?.core_mut().arm(state);
    Ok(userdata)
}

/// Handle id and state of the marker behind `userdata`
fn marker_parts<T: Marker>(userdata: &AnyUserData) -> Result<(i32, Weak<BridgeState>), String> {
    let marker = userdata.borrow::<T>().map_err(|err| err.to_string())?;
    Ok((marker.core().handle_id, marker.core().state.clone()))
}

// Indexing metamethods are script functions built on the raise shim, so a
// rejected or failed access raises a plain string like any script error.

impl UserData for HostMarker {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_meta_field_with(MetaMethod::Index.name(), |lua| {
            raising_function(lua, load_raise_shim(lua)?, |_, (marker, key): (AnyUserData, Value)| {
                let (handle_id, _) = marker_parts::<HostMarker>(&marker)?;
                Err(opaque_access_message(handle_id, &key))
            })
        });
        fields.add_meta_field_with(MetaMethod::NewIndex.name(), |lua| {
            raising_function(lua, load_raise_shim(lua)?, |_, (marker, key, _value): (AnyUserData, Value, Value)| {
                let (handle_id, _) = marker_parts::<HostMarker>(&marker)?;
                Err(opaque_access_message(handle_id, &key))
            })
        });
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("handle: {}", this.handle_id())));
    }
}

impl UserData for ProxyMarker {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_meta_field_with(MetaMethod::Index.name(), |lua| {
            raising_function(lua, load_raise_shim(lua)?, |lua, (marker, key): (AnyUserData, Value)| {
                let (handle_id, state) = marker_parts::<ProxyMarker>(&marker)?;
                read_property(lua, handle_id, &state, key)
            })
        });
        fields.add_meta_field_with(MetaMethod::NewIndex.name(), |lua| {
            raising_function(lua, load_raise_shim(lua)?, |lua, (marker, key, value): (AnyUserData, Value, Value)| {
                let (handle_id, state) = marker_parts::<ProxyMarker>(&marker)?;
                write_property(lua, handle_id, &state, key, value)?;
                Ok(Value::Nil)
            })
        });
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("proxy handle: {}", this.handle_id())));
    }
}

fn opaque_access_message(handle_id: i32, key: &Value) -> String {
    let key = match key {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.type_name().to_string(),
    };
    format!("opaque handle {handle_id} does not support property access (key '{key}')")
}

fn read_property<'lua>(
    lua: &'lua Lua,
    handle_id: i32,
    state: &Weak<BridgeState>,
    key: Value<'lua>,
) -> Result<Value<'lua>, String> {
    let Some(state) = state.upgrade() else {
        return Ok(Value::Nil);
    };
    let Some(key) = key_to_string(lua, key).map_err(|err| err.to_string())? else {
        return Ok(Value::Nil);
    };

    let getter = match state.handles.getter() {
        Some(getter) if state.handles.access(handle_id).readable => getter,
        _ => return Err(format!("property '{key}' of handle {handle_id} is not readable")),
    };

    let fail = |message: String| format!("error reading property '{key}' of handle {handle_id}: {message}");

    let value = match catch_unwind(AssertUnwindSafe(|| getter(handle_id, &key))) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => return Err(fail(err.to_string())),
        Err(_) => return Err(fail("getter panicked".to_string())),
    };

    Converter::new(lua, &state).lower(&value).map_err(|err| fail(err.to_string()))
}

fn write_property<'lua>(
    lua: &'lua Lua,
    handle_id: i32,
    state: &Weak<BridgeState>,
    key: Value<'lua>,
    value: Value<'lua>,
) -> Result<(), String> {
    let Some(state) = state.upgrade() else {
        return Ok(());
    };
    let type_name = key.type_name();
    let Some(key) = key_to_string(lua, key).map_err(|err| err.to_string())? else {
        return Err(format!("handle {handle_id} does not accept {type_name} property keys"));
    };

    let setter = match state.handles.setter() {
        Some(setter) if state.handles.access(handle_id).writable => setter,
        _ => return Err(format!("property '{key}' of handle {handle_id} is not writable")),
    };

    let fail = |message: String| format!("error writing property '{key}' of handle {handle_id}: {message}");

    let value = Converter::new(lua, &state).lift(value).map_err(|err| fail(err.to_string()))?;
    match catch_unwind(AssertUnwindSafe(|| setter(handle_id, &key, value))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(fail(err.to_string())),
        Err(_) => Err(fail("setter panicked".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting_table() -> (HandleTable, Rc<RefCell<Vec<i32>>>) {
        let table = HandleTable::new();
        let finalized = Rc::new(RefCell::new(Vec::new()));
        let sink = finalized.clone();
        table.set_finalizer(Some(Rc::new(move |id| sink.borrow_mut().push(id))));
        (table, finalized)
    }

    #[test]
    fn test_zero_crossing_finalizes_once() {
        let (table, finalized) = counting_table();

        table.increment(7);
        table.increment(7);
        table.decrement(7);
        assert!(finalized.borrow().is_empty());
        assert_eq!(table.count(7), Some(1));

        table.decrement(7);
        assert_eq!(*finalized.borrow(), vec![7]);
        assert_eq!(table.count(7), None);

        table.decrement(7);
        assert_eq!(*finalized.borrow(), vec![7]);
    }

    #[test]
    fn test_unknown_handle_is_ignored() {
        let (table, finalized) = counting_table();
        table.decrement(42);
        assert!(finalized.borrow().is_empty());
        assert_eq!(table.count(42), None);
    }

    #[test]
    fn test_no_finalizer_is_noop() {
        let table = HandleTable::new();
        table.increment(1);
        table.decrement(1);
        assert_eq!(table.count(1), None);
    }

    #[test]
    fn test_panicking_finalizer_is_contained() {
        let table = HandleTable::new();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        table.set_finalizer(Some(Rc::new(move |_| {
            counter.set(counter.get() + 1);
            panic!("finalizer failure");
        })));

        table.increment(3);
        table.decrement(3);
        assert_eq!(calls.get(), 1);
        assert_eq!(table.count(3), None);
    }

    #[test]
    fn test_access_resets_on_finalize() {
        let table = HandleTable::new();
        table.increment(9);
        table.set_access(9, PropertyAccess::READ_ONLY);
        assert_eq!(table.access(9), PropertyAccess::READ_ONLY);

        table.decrement(9);
        assert_eq!(table.access(9), PropertyAccess::READ_WRITE);
    }
}
