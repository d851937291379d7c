//! Configuration module for luabridge
//!
//! A runtime is configured either programmatically through [`BridgeConfig`]
//! or from a line-based configuration file (see [`parse_config_file`]).

mod parser;

pub use parser::{parse_config_file, ConfigParseError};

use std::io;
use std::path::Path;

use mlua::StdLib;

/// Default maximum nesting depth for aggregate conversion
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Standard library modules opened when no explicit list is given
pub const DEFAULT_LIBRARIES: &[&str] = &["base", "coroutine", "table", "string", "utf8", "math"];

/// Error type for runtime configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Library name that the interpreter does not provide
    #[error("unknown library '{0}'")]
    UnknownLibrary(String),

    /// Malformed configuration file
    #[error(transparent)]
    Parse(#[from] ConfigParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Standard library modules to open at startup
    pub libraries: Vec<String>,

    /// Maximum aggregate nesting depth accepted by value conversion
    pub max_depth: usize,

    /// Interpreter memory limit in bytes (0 = unlimited)
    pub memory_limit: usize,

    /// Start with host-function calls rejected
    pub restricted: bool,

    /// Accept precompiled bytecode chunks
    pub allow_bytecode: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            libraries: DEFAULT_LIBRARIES.iter().map(|name| name.to_string()).collect(),
            max_depth: DEFAULT_MAX_DEPTH,
            memory_limit: 0,
            restricted: false,
            allow_bytecode: false,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a file, starting from the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(parse_config_file(path.as_ref())?)
    }

    /// Replace the library list
    pub fn with_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.libraries = libraries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn with_restricted(mut self, restricted: bool) -> Self {
        self.restricted = restricted;
        self
    }

    pub fn with_bytecode(mut self, allow_bytecode: bool) -> Self {
        self.allow_bytecode = allow_bytecode;
        self
    }
}

/// Resolved set of standard library modules
#[derive(Debug, Clone, Copy)]
pub(crate) struct LibrarySelection {
    pub(crate) libs: StdLib,

    /// Some modules can only be opened with the interpreter's safety checks off
    pub(crate) requires_unsafe: bool,
}

/// Map library names onto interpreter flags.
///
/// The base library is always opened by the interpreter, so `base` is
/// accepted but contributes no flag.
pub(crate) fn resolve_libraries(names: &[String]) -> Result<LibrarySelection, ConfigError> {
    let mut libs = StdLib::NONE;
    let mut requires_unsafe = false;

    for name in names {
        libs = libs
            | match name.trim().to_lowercase().as_str() {
                "base" => StdLib::NONE,
                "coroutine" => StdLib::COROUTINE,
                "table" => StdLib::TABLE,
                "io" => StdLib::IO,
                "os" => StdLib::OS,
                "string" => StdLib::STRING,
                "utf8" => StdLib::UTF8,
                "math" => StdLib::MATH,
                "package" => StdLib::PACKAGE,
                "debug" => {
                    requires_unsafe = true;
                    StdLib::DEBUG
                }
                _ => return Err(ConfigError::UnknownLibrary(name.clone())),
            };
    }

    Ok(LibrarySelection { libs, requires_unsafe })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_depth, 100);
        assert_eq!(config.memory_limit, 0);
        assert!(!config.restricted);
        assert!(config.libraries.iter().any(|l| l == "coroutine"));
    }

    #[test]
    fn test_resolve_libraries() {
        let selection = resolve_libraries(&["base".to_string(), "math".to_string()]).unwrap();
        assert!(selection.libs.contains(StdLib::MATH));
        assert!(!selection.libs.contains(StdLib::STRING));
        assert!(!selection.requires_unsafe);

        let selection = resolve_libraries(&["debug".to_string()]).unwrap();
        assert!(selection.requires_unsafe);
    }

    #[test]
    fn test_unknown_library() {
        let err = resolve_libraries(&["math".to_string(), "sockets".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLibrary(ref name) if name == "sockets"));
    }
}
