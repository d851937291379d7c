//! Script Value Model
//!
//! [`ScriptValue`] is the closed set of values that cross the boundary between
//! the host and the interpreter. Reference variants own a registry pin and are
//! therefore move-only: duplicating one is an explicit operation on the
//! runtime (`LuaRuntime::clone_value`).

use std::collections::HashMap;
use std::fmt;

use mlua::RegistryKey;

/// A value exchanged between the host and the interpreter
#[derive(Debug, PartialEq)]
pub enum ScriptValue {
    Nil,

    Bool(bool),

    Int(i64),

    Float(f64),

    /// Byte string; interpreter strings are not required to be UTF-8
    Bytes(Vec<u8>),

    /// Dense 1-based sequence
    List(Vec<ScriptValue>),

    /// String-keyed aggregate
    Map(HashMap<String, ScriptValue>),

    FunctionRef(FunctionRef),

    CoroutineRef(CoroutineRef),

    OpaqueRef(OpaqueRef),

    /// Live table carrying a metatable, kept by reference instead of copied
    TableRef(TableRef),
}

impl ScriptValue {
    /// Interpreter-facing name of the variant
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Int(_) => "integer",
            ScriptValue::Float(_) => "number",
            ScriptValue::Bytes(_) => "string",
            ScriptValue::List(_) => "list",
            ScriptValue::Map(_) => "map",
            ScriptValue::FunctionRef(_) => "function",
            ScriptValue::CoroutineRef(_) => "thread",
            ScriptValue::OpaqueRef(_) => "userdata",
            ScriptValue::TableRef(_) => "table",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value of either number subtype
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(i) => Some(*i as f64),
            ScriptValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ScriptValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Byte string as UTF-8, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn as_list(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, ScriptValue>> {
        match self {
            ScriptValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            ScriptValue::FunctionRef(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_coroutine(&self) -> Option<&CoroutineRef> {
        match self {
            ScriptValue::CoroutineRef(coroutine) => Some(coroutine),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&OpaqueRef> {
        match self {
            ScriptValue::OpaqueRef(opaque) => Some(opaque),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            ScriptValue::TableRef(table) => Some(table),
            _ => None,
        }
    }

    /// Build a `Map` from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ScriptValue)>,
    {
        ScriptValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Int(value)
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        ScriptValue::Int(i64::from(value))
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Float(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for ScriptValue {
    fn from(value: Vec<u8>) -> Self {
        ScriptValue::Bytes(value)
    }
}

impl From<Vec<ScriptValue>> for ScriptValue {
    fn from(value: Vec<ScriptValue>) -> Self {
        ScriptValue::List(value)
    }
}

impl From<HashMap<String, ScriptValue>> for ScriptValue {
    fn from(value: HashMap<String, ScriptValue>) -> Self {
        ScriptValue::Map(value)
    }
}

impl<T: Into<ScriptValue>> From<Option<T>> for ScriptValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ScriptValue::Nil, Into::into)
    }
}

/// Owning pin of an interpreter-heap object in the registry.
///
/// The `id` is unique per runtime instance and identifies the pin for
/// equality. Dropping the ref lets the interpreter reclaim the slot lazily;
/// `LuaRuntime::release` frees it immediately.
pub struct RegistryRef {
    id: u64,
    key: RegistryKey,
}

impl RegistryRef {
    pub(crate) fn new(id: u64, key: RegistryKey) -> Self {
        RegistryRef { id, key }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Non-owning view of this pin
    pub fn view(&self) -> RefView<'_> {
        RefView { id: self.id, key: &self.key }
    }

    pub(crate) fn into_key(self) -> RegistryKey {
        self.key
    }
}

impl PartialEq for RegistryRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for RegistryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistryRef({})", self.id)
    }
}

/// Borrowed view of a [`RegistryRef`]; it can read the pinned value but
/// can neither release it nor outlive it.
#[derive(Clone, Copy)]
pub struct RefView<'a> {
    id: u64,
    key: &'a RegistryKey,
}

impl<'a> RefView<'a> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &'a RegistryKey {
        self.key
    }
}

impl fmt::Debug for RefView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefView({})", self.id)
    }
}

macro_rules! registry_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq)]
        pub struct $name(RegistryRef);

        impl $name {
            pub(crate) fn new(pin: RegistryRef) -> Self {
                $name(pin)
            }

            pub fn id(&self) -> u64 {
                self.0.id()
            }

            pub fn view(&self) -> RefView<'_> {
                self.0.view()
            }

            pub(crate) fn into_pin(self) -> RegistryRef {
                self.0
            }
        }
    };
}

registry_newtype!(
    /// Pinned interpreter function
    FunctionRef
);

registry_newtype!(
    /// Pinned interpreter coroutine (execution thread)
    CoroutineRef
);

registry_newtype!(
    /// Pinned table that carries a metatable
    TableRef
);

/// Opaque object crossing the boundary.
///
/// Host-created refs carry a host handle id and are materialized in the
/// interpreter as marker userdata. Foreign refs wrap an interpreter value the
/// bridge cannot introspect; they have no handle id and are never proxies.
#[derive(Debug, PartialEq)]
pub struct OpaqueRef {
    handle_id: i32,
    proxy: bool,
    foreign: Option<RegistryRef>,
}

impl OpaqueRef {
    /// Handle id carried by foreign refs
    pub const FOREIGN_HANDLE: i32 = -1;

    /// Host object exposed as an opaque value
    pub fn host(handle_id: i32) -> Self {
        OpaqueRef { handle_id, proxy: false, foreign: None }
    }

    /// Host object exposed with property access through the installed getter/setter
    pub fn proxy(handle_id: i32) -> Self {
        OpaqueRef { handle_id, proxy: true, foreign: None }
    }

    pub(crate) fn foreign(pin: RegistryRef) -> Self {
        OpaqueRef { handle_id: Self::FOREIGN_HANDLE, proxy: false, foreign: Some(pin) }
    }

    pub fn handle_id(&self) -> i32 {
        self.handle_id
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    pub fn is_foreign(&self) -> bool {
        self.foreign.is_some()
    }

    pub(crate) fn foreign_pin(&self) -> Option<&RegistryRef> {
        self.foreign.as_ref()
    }

    pub(crate) fn into_foreign_pin(self) -> Option<RegistryRef> {
        self.foreign
    }
}
