//! Configuration file parser
//!
//! One `directive value` pair per line, `#` starts a comment:
//!
//! ```text
//! libraries base table string math
//! max-depth 64
//! memory-limit 16mb
//! restricted no
//! allow-bytecode yes
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use super::BridgeConfig;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid line format
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Invalid parameter value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),
}

/// Parse a configuration file on top of the default configuration
pub fn parse_config_file(path: &Path) -> Result<BridgeConfig, ConfigParseError> {
    let file = File::open(path)?;
    parse_config(BufReader::new(file))
}

pub(crate) fn parse_config<R: BufRead>(reader: R) -> Result<BridgeConfig, ConfigParseError> {
    let mut config = BridgeConfig::default();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
        if parts.len() != 2 {
            return Err(ConfigParseError::Format(line_num + 1, line.to_string()));
        }

        let param = parts[0].trim().to_lowercase();
        let value = parts[1].trim();

        apply_config_param(&mut config, &param, value, line_num + 1)?;
    }

    Ok(config)
}

fn apply_config_param(config: &mut BridgeConfig, param: &str, value: &str, line_num: usize) -> Result<(), ConfigParseError> {
    match param {
        "libraries" => {
            // Library names are validated when the runtime is built
            config.libraries = value.split_whitespace().map(str::to_string).collect();
        }
        "max-depth" => {
            config.max_depth = parse_value(param, value, line_num)?;
        }
        "memory-limit" => {
            let limit = parse_size(param, value, line_num)?;
            config.memory_limit = usize::try_from(limit)
                .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))?;
        }
        "restricted" => {
            config.restricted = parse_yes_no(param, value, line_num)?;
        }
        "allow-bytecode" => {
            config.allow_bytecode = parse_yes_no(param, value, line_num)?;
        }
        _ => {
            warn!(param, line = line_num, "unknown configuration parameter, skipping");
        }
    }

    Ok(())
}

/// Parse a value that implements FromStr
fn parse_value<T: FromStr>(param: &str, value: &str, line_num: usize) -> Result<T, ConfigParseError> {
    value.parse::<T>()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a yes/no value
fn parse_yes_no(param: &str, value: &str, line_num: usize) -> Result<bool, ConfigParseError> {
    match value.to_lowercase().as_str() {
        "yes" | "1" => Ok(true),
        "no" | "0" => Ok(false),
        _ => Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string())),
    }
}

/// Parse a size value (e.g., 64mb, 2gb)
fn parse_size(param: &str, value: &str, line_num: usize) -> Result<u64, ConfigParseError> {
    let value = value.trim().to_lowercase();
    let invalid = || ConfigParseError::Value(param.to_string(), line_num, value.clone());

    let idx = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    if idx == 0 {
        return Err(invalid());
    }
    let num: u64 = value[..idx].parse().map_err(|_| invalid())?;

    let multiplier: u64 = match &value[idx..] {
        "" | "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    num.checked_mul(multiplier).ok_or_else(invalid)
}
