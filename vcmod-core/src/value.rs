//! Managed-object references, handles and accessors over decoded
//! server values.
//!
//! Server objects travel through the engine as `serde_json::Value` trees.
//! A typed data object carries its server type in the `_type` key; a
//! managed-object reference is `{"_type": "ManagedObjectReference",
//! "type": <kind>, "value": <moid>}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

pub const TYPE_KEY: &str = "_type";
pub const MOREF_TYPE: &str = "ManagedObjectReference";

/// Reference to a server-side managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ TYPE_KEY: MOREF_TYPE, "type": self.kind, "value": self.value })
    }

    /// Parse a reference out of a decoded value.
    pub fn from_value(v: &Value) -> Option<MoRef> {
        let obj = v.as_object()?;
        if let Some(t) = obj.get(TYPE_KEY).and_then(Value::as_str)
            && t != MOREF_TYPE
        {
            return None;
        }
        Some(MoRef {
            kind: obj.get("type")?.as_str()?.to_string(),
            value: obj.get("value")?.as_str()?.to_string(),
        })
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// The closed set of inventory kinds a handle can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    VirtualMachine,
    HostSystem,
    ClusterComputeResource,
    ComputeResource,
    Datacenter,
    Datastore,
    StoragePod,
    Folder,
    Network,
    DistributedVirtualSwitch,
    DistributedVirtualPortgroup,
    ResourcePool,
    VirtualApp,
}

impl Kind {
    pub const ALL: [Kind; 13] = [
        Kind::VirtualMachine,
        Kind::HostSystem,
        Kind::ClusterComputeResource,
        Kind::ComputeResource,
        Kind::Datacenter,
        Kind::Datastore,
        Kind::StoragePod,
        Kind::Folder,
        Kind::Network,
        Kind::DistributedVirtualSwitch,
        Kind::DistributedVirtualPortgroup,
        Kind::ResourcePool,
        Kind::VirtualApp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::VirtualMachine => "VirtualMachine",
            Kind::HostSystem => "HostSystem",
            Kind::ClusterComputeResource => "ClusterComputeResource",
            Kind::ComputeResource => "ComputeResource",
            Kind::Datacenter => "Datacenter",
            Kind::Datastore => "Datastore",
            Kind::StoragePod => "StoragePod",
            Kind::Folder => "Folder",
            Kind::Network => "Network",
            Kind::DistributedVirtualSwitch => "DistributedVirtualSwitch",
            Kind::DistributedVirtualPortgroup => "DistributedVirtualPortgroup",
            Kind::ResourcePool => "ResourcePool",
            Kind::VirtualApp => "VirtualApp",
        }
    }

    /// Whether a server type name denotes exactly this kind.
    ///
    /// The server reports VMware-flavoured switches under their concrete
    /// type; those satisfy a `DistributedVirtualSwitch` lookup. A cluster is
    /// never accepted for `ComputeResource` and vice versa.
    pub fn matches(&self, server_type: &str) -> bool {
        match self {
            Kind::DistributedVirtualSwitch => matches!(
                server_type,
                "DistributedVirtualSwitch" | "VmwareDistributedVirtualSwitch"
            ),
            other => other.as_str() == server_type,
        }
    }

    /// Type names to put into a container-view filter for this kind.
    pub fn view_types(&self) -> Vec<String> {
        match self {
            Kind::DistributedVirtualSwitch => vec![
                "DistributedVirtualSwitch".to_string(),
                "VmwareDistributedVirtualSwitch".to_string(),
            ],
            other => vec![other.as_str().to_string()],
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s || (*k == Kind::DistributedVirtualSwitch && k.matches(s)))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown object type '{s}'")))
    }
}

/// An opaque, typed reference produced by the inventory resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handle {
    pub kind: Kind,
    pub moid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Handle {
    pub fn moref(&self) -> MoRef {
        // Switches are addressed with their concrete server type.
        let kind = match self.kind {
            Kind::DistributedVirtualSwitch => "VmwareDistributedVirtualSwitch",
            other => other.as_str(),
        };
        MoRef::new(kind, &self.moid)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.moid)
    }
}

/// Accessors over decoded server values.
///
/// Decoded SOAP leaves are untyped text, so numeric and boolean accessors
/// accept both JSON scalars and their string spelling.
pub trait ValueExt {
    /// Follow a dotted path (`config.hardware.device`).
    fn at(&self, path: &str) -> Option<&Value>;
    /// Items at a path: an array yields its elements, a lone object yields
    /// itself, null or missing yields nothing.
    fn list_at(&self, path: &str) -> Vec<&Value>;
    fn str_at(&self, path: &str) -> Option<&str>;
    fn i64_at(&self, path: &str) -> Option<i64>;
    fn bool_at(&self, path: &str) -> Option<bool>;
    fn moref_at(&self, path: &str) -> Option<MoRef>;
    /// The server type carried in `_type`.
    fn type_name(&self) -> Option<&str>;
}

impl ValueExt for Value {
    fn at(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        let mut cur = self;
        for seg in path.split('.') {
            cur = cur.as_object()?.get(seg)?;
        }
        if cur.is_null() { None } else { Some(cur) }
    }

    fn list_at(&self, path: &str) -> Vec<&Value> {
        as_list(self.at(path))
    }

    fn str_at(&self, path: &str) -> Option<&str> {
        self.at(path).and_then(Value::as_str)
    }

    fn i64_at(&self, path: &str) -> Option<i64> {
        self.at(path).and_then(scalar_i64)
    }

    fn bool_at(&self, path: &str) -> Option<bool> {
        self.at(path).and_then(scalar_bool)
    }

    fn moref_at(&self, path: &str) -> Option<MoRef> {
        self.at(path).and_then(MoRef::from_value)
    }

    fn type_name(&self) -> Option<&str> {
        self.get(TYPE_KEY).and_then(Value::as_str)
    }
}

/// Treat a possibly-singular decoded value as a list.
pub fn as_list(v: Option<&Value>) -> Vec<&Value> {
    match v {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    }
}

pub fn scalar_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn scalar_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Build a typed data object: `{"_type": name, ...fields}`.
pub fn typed(name: &str, fields: Value) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_KEY.to_string(), Value::String(name.to_string()));
    if let Value::Object(rest) = fields {
        for (k, v) in rest {
            map.insert(k, v);
        }
    }
    Value::Object(map)
}

/// An `xsd:anyType` slot holding a string, e.g. `OptionValue.value`.
pub fn any_string(s: &str) -> Value {
    json!({ TYPE_KEY: "xsd:string", "_value": s })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_accessors_accept_decoded_text() {
        let v = json!({
            "config": {
                "drsConfig": { "enabled": "true", "vmotionRate": "3" },
                "host": { "_type": "ManagedObjectReference", "type": "HostSystem", "value": "host-9" }
            }
        });
        assert_eq!(v.bool_at("config.drsConfig.enabled"), Some(true));
        assert_eq!(v.i64_at("config.drsConfig.vmotionRate"), Some(3));
        assert_eq!(
            v.moref_at("config.host"),
            Some(MoRef::new("HostSystem", "host-9"))
        );
        assert!(v.at("config.missing").is_none());
    }

    #[test]
    fn test_list_at_wraps_single_element() {
        let v = json!({ "one": { "key": 1 }, "many": [1, 2], "none": null });
        assert_eq!(v.list_at("one").len(), 1);
        assert_eq!(v.list_at("many").len(), 2);
        assert!(v.list_at("none").is_empty());
        assert!(v.list_at("absent").is_empty());
    }

    #[test]
    fn test_kind_strictness() {
        assert!(Kind::VirtualMachine.matches("VirtualMachine"));
        assert!(!Kind::VirtualMachine.matches("Folder"));
        assert!(!Kind::ComputeResource.matches("ClusterComputeResource"));
        assert!(Kind::DistributedVirtualSwitch.matches("VmwareDistributedVirtualSwitch"));
        assert_eq!(
            "VmwareDistributedVirtualSwitch".parse::<Kind>().unwrap(),
            Kind::DistributedVirtualSwitch
        );
        assert!("Potato".parse::<Kind>().is_err());
    }
}
