//! Typed change-spec builders.
//!
//! Every builder validates its request up front and fails with
//! `InvalidArgument` before anything is sent to the server.

pub mod cluster;
pub mod datastore;
pub mod host;
pub mod permission;
pub mod storage_policy;
pub mod tagging;
pub mod vm_devices;

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::value::{ValueExt, any_string, typed};

/// A nullable field that may also be left alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Setting<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl Setting<String> {
    /// Absent keeps, empty clears, anything else sets.
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            None => Setting::Keep,
            Some("") => Setting::Clear,
            Some(v) => Setting::Set(v.to_string()),
        }
    }
}

impl<T: Clone + Into<Value>> Setting<T> {
    /// The value to compare against, `None` when the field is kept.
    pub fn desired(&self) -> Option<Value> {
        match self {
            Setting::Keep => None,
            Setting::Clear => Some(Value::String(String::new())),
            Setting::Set(v) => Some(v.clone().into()),
        }
    }
}

/// `OptionValue` entries for advanced settings.
pub fn option_values(options: &Map<String, Value>) -> Vec<Value> {
    options
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            typed("OptionValue", json!({ "key": key, "value": any_string(&text) }))
        })
        .collect()
}

/// Advanced settings as a plain `key -> string` map.
pub fn options_map(observed: &[&Value]) -> Map<String, Value> {
    observed
        .iter()
        .filter_map(|o| {
            let key = o.str_at("key")?;
            let value = match o.at("value") {
                Some(Value::Object(wrapped)) => wrapped.get("_value").cloned().unwrap_or(Value::Null),
                Some(other) => other.clone(),
                None => Value::Null,
            };
            let text = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            Some((key.to_string(), Value::String(text)))
        })
        .collect()
}

/// Parse one of a closed set of words.
pub(crate) fn one_of<T: Copy>(field: &str, value: &str, table: &[(&str, T)]) -> Result<T> {
    table
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            let names: Vec<&str> = table.iter().map(|(n, _)| *n).collect();
            Error::InvalidArgument(format!(
                "{field} must be one of {}, got '{value}'",
                names.join(", ")
            ))
        })
}
