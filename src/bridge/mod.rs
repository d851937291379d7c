//! Value marshaling and lifetime bridge
//!
//! The bridge converts values between the interpreter and the host, pins
//! interpreter objects the host holds on to, keeps opaque host handles alive
//! exactly as long as scripts can reach them, and routes script calls,
//! operators and property access back into host callbacks.

mod convert;
mod coroutine;
mod handles;
mod metatable;
mod registry;
mod runtime;
mod script_cache;
mod state;
mod trampoline;
mod value;

pub use coroutine::{CoroutineStatus, ResumeResult};
pub use handles::{HandleFinalizer, PropertyAccess, PropertyGetter, PropertySetter};
pub use metatable::MetatableEntry;
pub use runtime::LuaRuntime;
pub use script_cache::script_sha1;
pub use trampoline::HostFunction;
pub use value::{CoroutineRef, FunctionRef, OpaqueRef, RefView, RegistryRef, ScriptValue, TableRef};
