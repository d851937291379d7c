//! Compiled script cache
//!
//! Scripts are compiled once and kept as pinned functions, keyed by the
//! lowercase hex SHA1 of their source.

use std::collections::HashMap;

use mlua::{Function, Lua, RegistryKey};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{BridgeError, Result};

#[derive(Default)]
pub(crate) struct ScriptCache {
    scripts: HashMap<String, RegistryKey>,
}

impl ScriptCache {
    /// Compile `source` and cache it, returning its SHA1.
    ///
    /// Loading the same source twice keeps the first compilation.
    pub(crate) fn load(&mut self, lua: &Lua, source: &str) -> Result<String> {
        let sha1 = script_sha1(source);
        if self.scripts.contains_key(&sha1) {
            return Ok(sha1);
        }

        let function = lua.load(source).set_name(format!("=script:{}", &sha1[..12])).into_function()?;
        self.scripts.insert(sha1.clone(), lua.create_registry_value(function)?);
        debug!(sha1 = %sha1, "script cached");
        Ok(sha1)
    }

    pub(crate) fn get<'lua>(&self, lua: &'lua Lua, sha1: &str) -> Result<Function<'lua>> {
        let key = self
            .scripts
            .get(&sha1.to_lowercase())
            .ok_or_else(|| BridgeError::NoScript(sha1.to_string()))?;
        Ok(lua.registry_value(key)?)
    }

    pub(crate) fn exists(&self, sha1s: &[&str]) -> Vec<bool> {
        sha1s.iter().map(|sha1| self.scripts.contains_key(&sha1.to_lowercase())).collect()
    }

    /// Forget every cached script
    pub(crate) fn flush(&mut self, lua: &Lua) -> Result<()> {
        for (_, key) in self.scripts.drain() {
            lua.remove_registry_value(key)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.scripts.len()
    }
}

/// Lowercase hex SHA1 of a script source
pub fn script_sha1(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_sha1() {
        // Well-known digest of the empty string
        assert_eq!(script_sha1(""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(script_sha1("return 1").len(), 40);
        assert_ne!(script_sha1("return 1"), script_sha1("return 2"));
    }

    #[test]
    fn test_load_and_flush() {
        let lua = Lua::new();
        let mut cache = ScriptCache::default();

        let sha1 = cache.load(&lua, "return 40 + 2").unwrap();
        assert_eq!(cache.load(&lua, "return 40 + 2").unwrap(), sha1);
        assert_eq!(cache.len(), 1);

        let answer: i64 = cache.get(&lua, &sha1).unwrap().call(()).unwrap();
        assert_eq!(answer, 42);
        assert_eq!(cache.exists(&[sha1.as_str(), "missing"]), vec![true, false]);

        cache.flush(&lua).unwrap();
        assert_eq!(cache.len(), 0);
        assert!(matches!(cache.get(&lua, &sha1), Err(BridgeError::NoScript(_))));
    }

    #[test]
    fn test_syntax_errors_are_not_cached() {
        let lua = Lua::new();
        let mut cache = ScriptCache::default();
        assert!(matches!(cache.load(&lua, "return +"), Err(BridgeError::Syntax(_))));
        assert_eq!(cache.len(), 0);
    }
}
