//! Normalisation of server objects and before/after diffs.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::compat;
use crate::value::{MOREF_TYPE, TYPE_KEY, ValueExt, as_list, scalar_bool, scalar_i64};

/// Field-level comparison rules for one resource.
#[derive(Debug, Clone, Default)]
pub struct CompareRules {
    /// Paths whose arrays are compared as sets.
    pub unordered: BTreeSet<String>,
    /// Paths whose strings compare without regard to case.
    pub case_insensitive: BTreeSet<String>,
}

impl CompareRules {
    pub fn unordered(mut self, path: &str) -> Self {
        self.unordered.insert(path.to_string());
        self
    }

    pub fn case_insensitive(mut self, path: &str) -> Self {
        self.case_insensitive.insert(path.to_string());
        self
    }
}

/// Dotted paths of `desired` whose leaf differs from `observed`.
///
/// Only fields present in `desired` are compared; anything the caller
/// left unset is outside the comparison.
pub fn changed_fields(observed: &Value, desired: &Value, rules: &CompareRules) -> Vec<String> {
    let mut leaves = Vec::new();
    flatten("", desired, &mut leaves);
    leaves
        .into_iter()
        .filter(|(path, want)| !leaf_equal(observed.at(path), want, path, rules))
        .map(|(path, _)| path)
        .collect()
}

fn flatten(prefix: &str, v: &Value, out: &mut Vec<(String, Value)>) {
    match v {
        Value::Object(map) if !map.is_empty() => {
            for (k, child) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(&path, child, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

fn leaf_equal(observed: Option<&Value>, desired: &Value, path: &str, rules: &CompareRules) -> bool {
    match desired {
        Value::Null => observed.is_none(),
        Value::Bool(b) => observed.and_then(scalar_bool) == Some(*b),
        Value::Number(n) => match (n.as_i64(), observed) {
            (Some(want), Some(have)) => scalar_i64(have) == Some(want),
            (None, Some(have)) => canonical(have) == n.to_string(),
            (_, None) => false,
        },
        Value::String(want) => match observed {
            Some(have) => {
                let have = canonical(have);
                if rules.case_insensitive.contains(path) {
                    have.eq_ignore_ascii_case(want)
                } else {
                    have == *want
                }
            }
            None => false,
        },
        Value::Array(items) => {
            let have = as_list(observed);
            if have.len() != items.len() {
                return false;
            }
            let mut have: Vec<String> = have.into_iter().map(canonical).collect();
            let mut want: Vec<String> = items.iter().map(canonical).collect();
            if rules.unordered.contains(path) {
                have.sort();
                want.sort();
            }
            if rules.case_insensitive.contains(path) {
                have.iter().zip(&want).all(|(a, b)| a.eq_ignore_ascii_case(b))
            } else {
                have == want
            }
        }
        Value::Object(_) => observed.is_some_and(|o| normalize(o) == normalize(desired)),
    }
}

/// A comparable string for a scalar or a normalised composite.
fn canonical(v: &Value) -> String {
    match normalize(v) {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert a decoded server object into plain JSON.
///
/// References become their moid, `xsd:anyType` wrappers their value,
/// byte arrays base64, timestamps RFC 3339 in UTC, and lists of keyed
/// records are sorted by key. Type tags are dropped.
pub fn normalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            if map.get(TYPE_KEY).and_then(Value::as_str) == Some(MOREF_TYPE)
                && let Some(moid) = map.get("value")
            {
                return moid.clone();
            }
            if let Some(inner) = map.get("_value") {
                return normalize(inner);
            }
            if map.get(TYPE_KEY).and_then(Value::as_str) == Some("ArrayOfByte") {
                return Value::String(encode_bytes(map.get("byte")));
            }
            let mut out = Map::new();
            for (k, child) in map {
                if k == TYPE_KEY {
                    continue;
                }
                out.insert(k.clone(), normalize(child));
            }
            compat::apply(&mut out);
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(normalize).collect();
            if !items.is_empty() && items.iter().all(|i| i.get("key").is_some()) {
                items.sort_by_key(|i| i.get("key").map(canonical).unwrap_or_default());
            }
            Value::Array(items)
        }
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => Value::String(
                ts.with_timezone(&chrono::Utc)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Err(_) => v.clone(),
        },
        other => other.clone(),
    }
}

/// Signed `xsd:byte` items as base64 of their two's-complement octets.
fn encode_bytes(items: Option<&Value>) -> String {
    let bytes: Vec<u8> = as_list(items)
        .into_iter()
        .filter_map(scalar_i64)
        .map(|b| b as i8 as u8)
        .collect();
    BASE64.encode(bytes)
}

/// Restrict a normalised object to the given dotted paths.
pub fn project(v: &Value, properties: &[String]) -> Value {
    if properties.is_empty() {
        return v.clone();
    }
    let mut out = Value::Object(Map::new());
    for path in properties {
        if let Some(found) = v.at(path) {
            insert_path(&mut out, path, found.clone());
        }
    }
    out
}

/// Set `value` at a dotted path, creating intermediate objects.
pub fn insert_path(root: &mut Value, path: &str, value: Value) {
    let mut cur = root;
    let mut segments = path.split('.').peekable();
    while let Some(seg) = segments.next() {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Value::Object(map) = cur else { return };
        if segments.peek().is_none() {
            map.insert(seg.to_string(), value);
            return;
        }
        cur = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Before/after view of the fields a reconcile changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    pub before: Value,
    pub after: Value,
}

impl Diff {
    pub fn empty() -> Self {
        Self {
            before: Value::Object(Map::new()),
            after: Value::Object(Map::new()),
        }
    }

    /// Only `fields` appear, on both sides.
    pub fn from_changes(observed: &Value, desired: &Value, fields: &[String]) -> Self {
        let mut diff = Self::empty();
        for path in fields {
            let before = observed.at(path).map(normalize).unwrap_or(Value::Null);
            let after = desired.at(path).map(normalize).unwrap_or(Value::Null);
            insert_path(&mut diff.before, path, before);
            insert_path(&mut diff.after, path, after);
        }
        diff
    }

    pub fn created(after: &Value) -> Self {
        Self {
            before: Value::Object(Map::new()),
            after: normalize(after),
        }
    }

    pub fn deleted(before: &Value) -> Self {
        Self {
            before: normalize(before),
            after: Value::Object(Map::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.before == self.after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_aware_comparison() {
        let observed = json!({
            "drs": { "enabled": "true", "rate": "3", "behavior": "fullyAutomated" },
            "hosts": ["b", "a"]
        });
        let desired = json!({
            "drs": { "enabled": true, "rate": 3, "behavior": "partiallyAutomated" },
            "hosts": ["a", "b"]
        });
        let rules = CompareRules::default().unordered("hosts");
        assert_eq!(changed_fields(&observed, &desired, &rules), vec!["drs.behavior"]);

        let ordered = CompareRules::default();
        assert_eq!(
            changed_fields(&observed, &desired, &ordered),
            vec!["drs.behavior", "hosts"]
        );
    }

    #[test]
    fn test_case_sensitivity_is_per_field() {
        let observed = json!({ "policy": "On", "name": "Web" });
        let desired = json!({ "policy": "on", "name": "web" });
        let rules = CompareRules::default().case_insensitive("policy");
        assert_eq!(changed_fields(&observed, &desired, &rules), vec!["name"]);
    }

    #[test]
    fn test_missing_observed_field_differs() {
        let changed = changed_fields(&json!({}), &json!({ "a": { "b": 1 } }), &CompareRules::default());
        assert_eq!(changed, vec!["a.b"]);
        let unchanged = changed_fields(&json!({}), &json!({ "a": null }), &CompareRules::default());
        assert!(unchanged.is_empty());
    }

    #[test]
    fn test_normalize_server_object() {
        let v = json!({
            "_type": "HostRuntimeInfo",
            "host": { "_type": "ManagedObjectReference", "type": "HostSystem", "value": "host-7" },
            "bootTime": "2024-03-01T10:00:00.000+01:00",
            "opt": { "_type": "xsd:string", "_value": "x" },
            "capability": { "smpFtSupported": "true" },
            "devices": [{ "key": 2000, "label": "b" }, { "key": 1000, "label": "a" }],
            "thumbprint": { "_type": "ArrayOfByte", "byte": ["-1", "0", "77"] }
        });
        let n = normalize(&v);
        assert!(n.get("_type").is_none());
        assert_eq!(n["host"], "host-7");
        assert_eq!(n["bootTime"], "2024-03-01T09:00:00Z");
        assert_eq!(n["opt"], "x");
        assert_eq!(n["capability"]["checkpointFtSupported"], "true");
        assert_eq!(n["devices"][0]["label"], "a");
        assert_eq!(n["thumbprint"], "/wBN");
    }

    #[test]
    fn test_diff_carries_only_changed_fields() {
        let observed = json!({ "name": "old", "cpu": 2, "mem": 4096 });
        let desired = json!({ "name": "new", "cpu": 2 });
        let fields = changed_fields(&observed, &desired, &CompareRules::default());
        let diff = Diff::from_changes(&observed, &desired, &fields);
        assert_eq!(diff.before, json!({ "name": "old" }));
        assert_eq!(diff.after, json!({ "name": "new" }));
    }

    #[test]
    fn test_project_properties() {
        let v = json!({ "config": { "name": "vm1", "uuid": "u" }, "runtime": { "powerState": "poweredOn" } });
        let p = project(&v, &["config.name".to_string(), "runtime.powerState".to_string(), "nope".to_string()]);
        assert_eq!(p, json!({ "config": { "name": "vm1" }, "runtime": { "powerState": "poweredOn" } }));
    }
}
