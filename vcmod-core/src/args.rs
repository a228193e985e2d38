//! Argument envelope: schema, coercion and cross-field validation.
//!
//! Each module compiles one [`ArgumentSpec`]. The same object validates
//! the incoming parameters and is printed as the module's schema.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Declared parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    Str,
    Int,
    Bool,
    List,
    Dict,
    Path,
}

impl ArgType {
    fn as_str(&self) -> &'static str {
        match self {
            ArgType::Str => "str",
            ArgType::Int => "int",
            ArgType::Bool => "bool",
            ArgType::List => "list",
            ArgType::Dict => "dict",
            ArgType::Path => "path",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, Serialize)]
pub struct Param {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: ArgType,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_log: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<ArgType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Param>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'static str>,
}

impl Param {
    pub fn new(name: &'static str, kind: ArgType) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            choices: Vec::new(),
            aliases: Vec::new(),
            no_log: false,
            elements: None,
            options: None,
            description: None,
        }
    }

    pub fn str(name: &'static str) -> Self {
        Self::new(name, ArgType::Str)
    }

    pub fn int(name: &'static str) -> Self {
        Self::new(name, ArgType::Int)
    }

    pub fn bool(name: &'static str) -> Self {
        Self::new(name, ArgType::Bool)
    }

    pub fn list(name: &'static str, elements: ArgType) -> Self {
        let mut p = Self::new(name, ArgType::List);
        p.elements = Some(elements);
        p
    }

    pub fn dict(name: &'static str) -> Self {
        Self::new(name, ArgType::Dict)
    }

    pub fn path(name: &'static str) -> Self {
        Self::new(name, ArgType::Path)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn choices<V: Into<Value> + Clone>(mut self, choices: &[V]) -> Self {
        self.choices = choices.iter().cloned().map(Into::into).collect();
        self
    }

    pub fn aliases(mut self, aliases: &[&'static str]) -> Self {
        self.aliases = aliases.to_vec();
        self
    }

    pub fn no_log(mut self) -> Self {
        self.no_log = true;
        self
    }

    /// Sub-options of a dict, or of each dict element of a list.
    pub fn options(mut self, options: Vec<Param>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn doc(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }
}

/// `required_if`: when `key == value`, every `requires` key must be set.
#[derive(Debug, Clone, Serialize)]
pub struct RequiredIf {
    pub key: &'static str,
    pub value: Value,
    pub requires: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArgumentSpec {
    pub params: Vec<Param>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_one_of: Vec<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mutually_exclusive: Vec<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_together: Vec<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_if: Vec<RequiredIf>,
}

/// Parameters every module accepts.
pub fn connection_params() -> Vec<Param> {
    vec![
        Param::str("hostname").doc("vCenter or ESXi endpoint; VMWARE_HOST"),
        Param::str("username")
            .aliases(&["admin", "user"])
            .doc("VMWARE_USER"),
        Param::str("password")
            .aliases(&["pass", "pwd"])
            .no_log()
            .doc("VMWARE_PASSWORD"),
        Param::int("port").doc("default 443; VMWARE_PORT"),
        Param::bool("validate_certs").doc("default true; VMWARE_VALIDATE_CERTS"),
        Param::str("proxy_host").doc("HTTP CONNECT proxy; VMWARE_PROXY_HOST"),
        Param::int("proxy_port").doc("VMWARE_PROXY_PORT"),
    ]
}

impl ArgumentSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, p: Param) -> Self {
        self.params.push(p);
        self
    }

    pub fn required_one_of(mut self, keys: &[&'static str]) -> Self {
        self.required_one_of.push(keys.to_vec());
        self
    }

    pub fn mutually_exclusive(mut self, keys: &[&'static str]) -> Self {
        self.mutually_exclusive.push(keys.to_vec());
        self
    }

    pub fn required_together(mut self, keys: &[&'static str]) -> Self {
        self.required_together.push(keys.to_vec());
        self
    }

    pub fn required_if(mut self, key: &'static str, value: impl Into<Value>, requires: &[&'static str]) -> Self {
        self.required_if.push(RequiredIf {
            key,
            value: value.into(),
            requires: requires.to_vec(),
        });
        self
    }

    /// Add the connection parameters shared by every module.
    pub fn with_common(mut self) -> Self {
        let own: BTreeSet<&str> = self.params.iter().map(|p| p.name).collect();
        for p in connection_params() {
            if !own.contains(p.name) {
                self.params.push(p);
            }
        }
        self
    }

    /// Names of `no_log` parameters (including sub-options) and their
    /// aliases.
    pub fn no_log_keys(&self) -> BTreeSet<&'static str> {
        fn walk(params: &[Param], out: &mut BTreeSet<&'static str>) {
            for p in params {
                if p.no_log {
                    out.insert(p.name);
                    out.extend(p.aliases.iter().copied());
                }
                if let Some(opts) = &p.options {
                    walk(opts, out);
                }
            }
        }
        let mut out = BTreeSet::new();
        walk(&self.params, &mut out);
        out
    }

    /// Values of `no_log` parameters in unvalidated input.
    pub fn secrets_in(&self, raw: &Map<String, Value>) -> Vec<String> {
        let mut out = Vec::new();
        collect_secrets(&self.params, raw, &mut out);
        out
    }

    /// Validate raw input for `module`.
    pub fn validate(&self, module: &str, raw: &Map<String, Value>) -> Result<Params> {
        let mut check_mode = false;
        let mut diff_mode = false;
        let mut input = Map::new();
        for (k, v) in raw {
            match k.as_str() {
                "_check_mode" | "_ansible_check_mode" => check_mode = coerce_flag(k, v)?,
                "_diff" | "_ansible_diff" => diff_mode = coerce_flag(k, v)?,
                _ if k.starts_with('_') => {}
                _ => {
                    input.insert(k.clone(), v.clone());
                }
            }
        }

        let mut secrets = Vec::new();
        collect_secrets(&self.params, &input, &mut secrets);

        let values = validate_level(&self.params, input, &format!("module {module}"))?;
        self.check_cross_field(&values)?;
        Ok(Params {
            values,
            check_mode,
            diff_mode,
            secrets,
        })
    }

    fn check_cross_field(&self, values: &Map<String, Value>) -> Result<()> {
        let set = |k: &str| values.get(k).is_some_and(|v| !v.is_null());

        for group in &self.mutually_exclusive {
            let present: Vec<&str> = group.iter().copied().filter(|k| set(k)).collect();
            if present.len() > 1 {
                return Err(Error::InvalidArgument(format!(
                    "parameters are mutually exclusive: {}",
                    present.join("|")
                )));
            }
        }
        for group in &self.required_one_of {
            if !group.iter().any(|k| set(k)) {
                return Err(Error::InvalidArgument(format!(
                    "one of the following is required: {}",
                    group.join(", ")
                )));
            }
        }
        for group in &self.required_together {
            let present = group.iter().filter(|k| set(k)).count();
            if present > 0 && present < group.len() {
                return Err(Error::InvalidArgument(format!(
                    "parameters are required together: {}",
                    group.join(", ")
                )));
            }
        }
        for rule in &self.required_if {
            if values.get(rule.key) != Some(&rule.value) {
                continue;
            }
            let missing: Vec<&str> = rule.requires.iter().copied().filter(|k| !set(k)).collect();
            if !missing.is_empty() {
                let shown = match &rule.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return Err(Error::InvalidArgument(format!(
                    "{} is {} but all of the following are missing: {}",
                    rule.key,
                    shown,
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }
}

fn coerce_flag(key: &str, v: &Value) -> Result<bool> {
    coerce(key, v, ArgType::Bool).and_then(|v| {
        v.as_bool()
            .ok_or_else(|| Error::InvalidArgument(format!("{key} must be a boolean")))
    })
}

fn collect_secrets(params: &[Param], input: &Map<String, Value>, out: &mut Vec<String>) {
    for p in params {
        let names = std::iter::once(p.name).chain(p.aliases.iter().copied());
        for name in names {
            let Some(v) = input.get(name) else { continue };
            if p.no_log {
                push_secret_strings(v, out);
            }
            if let Some(opts) = &p.options {
                for item in crate::value::as_list(Some(v)) {
                    if let Some(map) = item.as_object() {
                        collect_secrets(opts, map, out);
                    }
                }
            }
        }
    }
}

fn push_secret_strings(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::Null => {}
        Value::String(s) if !s.is_empty() => out.push(s.clone()),
        Value::String(_) => {}
        Value::Array(items) => items.iter().for_each(|i| push_secret_strings(i, out)),
        Value::Object(map) => map.values().for_each(|i| push_secret_strings(i, out)),
        other => out.push(other.to_string()),
    }
}

fn validate_level(params: &[Param], mut input: Map<String, Value>, context: &str) -> Result<Map<String, Value>> {
    // Fold aliases onto canonical names.
    for p in params {
        for alias in &p.aliases {
            if let Some(v) = input.remove(*alias) {
                if input.contains_key(p.name) {
                    return Err(Error::InvalidArgument(format!(
                        "both '{}' and its alias '{alias}' were supplied",
                        p.name
                    )));
                }
                input.insert(p.name.to_string(), v);
            }
        }
    }

    let known: BTreeSet<&str> = params.iter().map(|p| p.name).collect();
    let unknown: Vec<&str> = input
        .keys()
        .map(String::as_str)
        .filter(|k| !known.contains(k))
        .collect();
    if !unknown.is_empty() {
        let mut supported: Vec<&str> = params
            .iter()
            .flat_map(|p| std::iter::once(p.name).chain(p.aliases.iter().copied()))
            .collect();
        supported.sort_unstable();
        return Err(Error::InvalidArgument(format!(
            "Unsupported parameters for ({context}): {}. Supported parameters include: {}",
            unknown.join(", "),
            supported.join(", ")
        )));
    }

    let mut out = Map::new();
    let mut missing = Vec::new();
    for p in params {
        let supplied = input.remove(p.name).filter(|v| !v.is_null());
        let value = match supplied {
            Some(v) => {
                let v = coerce(p.name, &v, p.kind)?;
                let v = coerce_elements(p, v)?;
                check_choices(p, &v)?;
                match &p.options {
                    Some(opts) => validate_suboptions(p, opts, v, context)?,
                    None => v,
                }
            }
            None => match &p.default {
                Some(d) => d.clone(),
                None => {
                    if p.required {
                        missing.push(p.name);
                    }
                    Value::Null
                }
            },
        };
        out.insert(p.name.to_string(), value);
    }
    if !missing.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "missing required arguments: {}",
            missing.join(", ")
        )));
    }
    Ok(out)
}

fn validate_suboptions(p: &Param, opts: &[Param], v: Value, context: &str) -> Result<Value> {
    let sub_context = format!("{context} -> {}", p.name);
    match v {
        Value::Object(map) => Ok(Value::Object(validate_level(opts, map, &sub_context)?)),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(Value::Object(validate_level(opts, map, &sub_context)?)),
                other => Err(Error::InvalidArgument(format!(
                    "elements of '{}' must be dicts, got {}",
                    p.name,
                    type_label(&other)
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn coerce_elements(p: &Param, v: Value) -> Result<Value> {
    match (p.elements, v) {
        (Some(kind), Value::Array(items)) => items
            .iter()
            .map(|item| coerce(p.name, item, kind))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        (_, v) => Ok(v),
    }
}

fn check_choices(p: &Param, v: &Value) -> Result<()> {
    if p.choices.is_empty() {
        return Ok(());
    }
    let values: Vec<&Value> = match v {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for value in values {
        if !p.choices.contains(value) {
            let choices: Vec<String> = p
                .choices
                .iter()
                .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
                .collect();
            let got = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            return Err(Error::InvalidArgument(format!(
                "value of {} must be one of: {}, got: {}",
                p.name,
                choices.join(", "),
                got
            )));
        }
    }
    Ok(())
}

fn type_label(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Parse the boolean spellings accepted on input.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "yes" | "on" | "1" | "true" | "y" | "t" => Some(true),
        "no" | "off" | "0" | "false" | "n" | "f" => Some(false),
        _ => None,
    }
}

fn coerce(name: &str, v: &Value, kind: ArgType) -> Result<Value> {
    let fail = || {
        Error::InvalidArgument(format!(
            "argument '{name}' is of type {} and we were unable to convert to {}",
            type_label(v),
            kind.as_str()
        ))
    };
    match kind {
        ArgType::Str => match v {
            Value::String(_) => Ok(v.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(fail()),
        },
        ArgType::Path => match v {
            Value::String(s) => Ok(Value::String(expand_home(s))),
            _ => Err(fail()),
        },
        ArgType::Int => match v {
            Value::Number(n) => n.as_i64().map(Value::from).ok_or_else(fail),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ArgType::Bool => match v {
            Value::Bool(_) => Ok(v.clone()),
            Value::String(s) => parse_bool(s).map(Value::Bool).ok_or_else(fail),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        ArgType::List => match v {
            Value::Array(_) => Ok(v.clone()),
            Value::String(s) => Ok(Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )),
            Value::Number(_) | Value::Bool(_) => Ok(Value::Array(vec![v.clone()])),
            _ => Err(fail()),
        },
        ArgType::Dict => match v {
            Value::Object(_) => Ok(v.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest).display().to_string();
    }
    path.to_string()
}

/// Validated parameters of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: Map<String, Value>,
    pub check_mode: bool,
    pub diff_mode: bool,
    secrets: Vec<String>,
}

impl Params {
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.str(key).map(str::to_string)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(Value::as_i64)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    /// A boolean that defaults to false when unset.
    pub fn flag(&self, key: &str) -> bool {
        self.bool(key).unwrap_or(false)
    }

    pub fn list(&self, key: &str) -> Vec<Value> {
        match self.value(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn str_list(&self, key: &str) -> Vec<String> {
        self.list(key)
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn dict(&self, key: &str) -> Option<&Map<String, Value>> {
        self.value(key).and_then(Value::as_object)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str(key)
            .ok_or_else(|| Error::InvalidArgument(format!("missing required argument: {key}")))
    }

    /// Values of `no_log` parameters, for redaction.
    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn spec() -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("name").aliases(&["cluster_name"]))
            .param(Param::str("state").choices(&["present", "absent"]).default("present"))
            .param(Param::int("rate"))
            .param(Param::bool("enable"))
            .param(Param::str("secret").no_log())
            .param(Param::list("tags", ArgType::Str))
            .param(
                Param::list("rules", ArgType::Dict).options(vec![
                    Param::str("key").required(),
                    Param::str("token").no_log(),
                ]),
            )
            .mutually_exclusive(&["rate", "enable"])
            .required_if("state", "absent", &["name"])
    }

    fn validate(v: Value) -> Result<Params> {
        spec().validate("unit", v.as_object().unwrap())
    }

    #[test]
    fn test_defaults_aliases_and_coercion() {
        let p = validate(json!({ "cluster_name": "C0", "rate": "3", "_ansible_check_mode": true })).unwrap();
        assert_eq!(p.str("name"), Some("C0"));
        assert_eq!(p.str("state"), Some("present"));
        assert_eq!(p.int("rate"), Some(3));
        assert!(p.check_mode);
        assert!(!p.diff_mode);
    }

    #[test]
    fn test_bool_spellings() {
        let p = validate(json!({ "enable": "yes" })).unwrap();
        assert_eq!(p.bool("enable"), Some(true));
        let err = validate(json!({ "enable": "perhaps" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("enable"));
    }

    #[test]
    fn test_choices_rejected() {
        let err = validate(json!({ "state": "gone" })).unwrap_err();
        assert!(err.to_string().contains("must be one of: present, absent"));
    }

    #[test]
    fn test_unknown_parameter() {
        let err = validate(json!({ "nmae": "x" })).unwrap_err();
        assert!(err.to_string().starts_with("Unsupported parameters"));
        assert!(err.to_string().contains("nmae"));
    }

    #[test]
    fn test_cross_field_rules() {
        let err = validate(json!({ "rate": 1, "enable": true })).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive: rate|enable"));
        let err = validate(json!({ "state": "absent" })).unwrap_err();
        assert!(err.to_string().contains("state is absent"));
        assert!(validate(json!({ "state": "absent", "name": "x" })).is_ok());
    }

    #[test]
    fn test_suboptions_validated() {
        let err = validate(json!({ "rules": [{ "token": "t" }] })).unwrap_err();
        assert!(err.to_string().contains("missing required arguments: key"));
        let p = validate(json!({ "rules": [{ "key": "a", "token": "sekrit-token" }] })).unwrap();
        assert_eq!(p.list("rules").len(), 1);
        assert!(p.secrets().iter().any(|s| s == "sekrit-token"));
    }

    #[test]
    fn test_secrets_collected() {
        let p = validate(json!({ "secret": "hunter22" })).unwrap();
        assert_eq!(p.secrets().to_vec(), vec!["hunter22".to_string()]);
        let keys = spec().with_common().no_log_keys();
        assert!(keys.contains("secret"));
        assert!(keys.contains("password"));
        assert!(keys.contains("pwd"));
    }

    #[test]
    fn test_list_from_comma_string() {
        let p = validate(json!({ "tags": "a, b,,c" })).unwrap();
        assert_eq!(p.str_list("tags"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_common_params_present() {
        let spec = ArgumentSpec::new().with_common();
        let p = spec
            .validate("unit", json!({ "hostname": "vc", "port": "8443" }).as_object().unwrap())
            .unwrap();
        assert_eq!(p.int("port"), Some(8443));
        assert_eq!(p.bool("validate_certs"), None);
    }
}
