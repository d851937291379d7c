//! luabridge library
//!
//! Embeds a Lua 5.4 interpreter and exposes a bidirectional value bridge:
//! scripts call host functions, the host calls script functions, and both
//! sides hold references to each other's values with well-defined lifetimes.
//!
//! ```no_run
//! use luabridge::{LuaRuntime, ScriptValue};
//!
//! let runtime = LuaRuntime::new()?;
//! runtime.register_function("double", |args| {
//!     let n = args.first().and_then(ScriptValue::as_int).unwrap_or(0);
//!     Ok(ScriptValue::Int(n * 2))
//! })?;
//! let values = runtime.execute("return double(21)")?;
//! assert_eq!(values, vec![ScriptValue::Int(42)]);
//! # Ok::<(), luabridge::BridgeError>(())
//! ```

pub mod bridge;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use bridge::{
    CoroutineRef, CoroutineStatus, FunctionRef, LuaRuntime, MetatableEntry, OpaqueRef, PropertyAccess,
    ResumeResult, ScriptValue, TableRef,
};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, HostError, HostResult, Result};
