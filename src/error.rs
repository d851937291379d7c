//! Error types for luabridge
//!
//! Every fallible bridge operation reports a [`BridgeError`]. Host callbacks
//! report failures with [`HostError`], which the trampoline turns into a
//! script-level error naming the failing callback.

use std::fmt;
use std::io;

use crate::config::ConfigError;

/// Main error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Invalid configuration, raised before an interpreter exists
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed script source
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Script-raised or interpreter-raised fault during execution
    #[error("{0}")]
    Runtime(String),

    /// The configured memory limit was hit
    #[error("memory error: {0}")]
    Memory(String),

    /// Nested aggregate conversion went deeper than the configured maximum
    #[error("maximum nesting depth of {max} exceeded during value conversion")]
    DepthExceeded { max: usize },

    /// Named top-level binding does not exist
    #[error("global '{0}' does not exist")]
    GlobalNotFound(String),

    /// Named top-level binding exists but is not a table
    #[error("global '{name}' is a {type_name}, not a table")]
    NotATable { name: String, type_name: String },

    /// No cached script under this SHA1
    #[error("no cached script with sha1 {0}")]
    NoScript(String),

    /// Precompiled chunks were passed to an instance that does not accept them
    #[error("loading precompiled bytecode is disabled for this runtime")]
    BytecodeDisabled,

    /// Reading a script file failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<mlua::Error> for BridgeError {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => BridgeError::Syntax(message),
            mlua::Error::RuntimeError(message) => BridgeError::Runtime(message),
            mlua::Error::MemoryError(message) => BridgeError::Memory(message),
            other => BridgeError::Runtime(other.to_string()),
        }
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by a host callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HostError {}

impl From<String> for HostError {
    fn from(message: String) -> Self {
        HostError { message }
    }
}

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        HostError { message: message.to_string() }
    }
}

impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        HostError { message: err.to_string() }
    }
}

/// Result type returned by host callbacks
pub type HostResult<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lua_error_mapping() {
        let err: BridgeError = mlua::Error::RuntimeError("boom".to_string()).into();
        assert!(matches!(err, BridgeError::Runtime(ref m) if m == "boom"));

        let err: BridgeError = mlua::Error::SyntaxError {
            message: "unexpected symbol".to_string(),
            incomplete_input: false,
        }
        .into();
        assert!(matches!(err, BridgeError::Syntax(ref m) if m == "unexpected symbol"));

        let err: BridgeError = mlua::Error::MemoryError("not enough memory".to_string()).into();
        assert!(matches!(err, BridgeError::Memory(_)));
    }

    #[test]
    fn test_host_error_conversions() {
        assert_eq!(HostError::from("bad").message(), "bad");
        assert_eq!(HostError::from(String::from("worse")).to_string(), "worse");

        let depth = HostError::from(BridgeError::DepthExceeded { max: 3 });
        assert!(depth.message().contains("depth of 3"));
    }

    #[test]
    fn test_display_messages() {
        let err = BridgeError::NotATable { name: "v".to_string(), type_name: "number".to_string() };
        assert_eq!(err.to_string(), "global 'v' is a number, not a table");
        assert_eq!(BridgeError::GlobalNotFound("x".into()).to_string(), "global 'x' does not exist");
    }
}
