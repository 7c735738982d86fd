//! Environment-variable helpers for the `from_env` constructors.
//!
//! Missing optional variables fall back to defaults; present but
//! unparseable values are validation errors rather than silent defaults.

use std::str::FromStr;

use crate::error::CoreError;

/// Read a required variable.
pub fn require(name: &str) -> Result<String, CoreError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(CoreError::Config(format!(
            "{name} environment variable is required"
        ))),
    }
}

/// Read an optional variable, treating blank as unset.
pub fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Parse an optional variable, falling back to `default` when unset.
pub fn parse_or<T>(name: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        None => Ok(default),
        Some(raw) => parse_value(name, &raw),
    }
}

/// Parse a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub fn flag_or(name: &str, default: bool) -> Result<bool, CoreError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => parse_flag(name, &raw),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CoreError::Config(format!("{name} has invalid value '{raw}': {e}")))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, CoreError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::Config(format!(
            "{name} must be a boolean, got '{raw}'"
        ))),
    }
}
