//! Per-instance bridge state
//!
//! Everything the bridge shares between the runtime façade and the callbacks
//! it installs in the interpreter lives here. The state is owned by one
//! `LuaRuntime` through an `Rc`; callbacks and marker userdata hold weak
//! references so they become no-ops once the runtime is gone.

use std::cell::Cell;

use super::handles::HandleTable;
use super::trampoline::FunctionTable;

pub(crate) struct BridgeState {
    /// Opaque handle ref counts, finalizer and property handlers
    pub(crate) handles: HandleTable,

    /// Host callables by name
    pub(crate) functions: FunctionTable,

    /// Maximum aggregate nesting depth for conversion
    pub(crate) max_depth: usize,

    restricted: Cell<bool>,
    next_ref_id: Cell<u64>,
}

impl BridgeState {
    pub(crate) fn new(max_depth: usize, restricted: bool) -> Self {
        BridgeState {
            handles: HandleTable::new(),
            functions: FunctionTable::new(),
            max_depth,
            restricted: Cell::new(restricted),
            next_ref_id: Cell::new(1),
        }
    }

    pub(crate) fn is_restricted(&self) -> bool {
        self.restricted.get()
    }

    /// Set the restricted flag, returning the previous value
    pub(crate) fn set_restricted(&self, restricted: bool) -> bool {
        self.restricted.replace(restricted)
    }

    pub(crate) fn next_ref_id(&self) -> u64 {
        let id = self.next_ref_id.get();
        self.next_ref_id.set(id + 1);
        id
    }
}
