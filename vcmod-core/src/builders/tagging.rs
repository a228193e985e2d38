//! Tag categories and tags on the REST surface.

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};

use super::{Setting, one_of};
use crate::error::{Error, Result};
use crate::value::ValueExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Multiple,
}

impl Cardinality {
    pub fn parse(s: &str) -> Result<Self> {
        one_of(
            "category_cardinality",
            s,
            &[("single", Cardinality::Single), ("multiple", Cardinality::Multiple)],
        )
    }

    pub fn server_name(&self) -> &'static str {
        match self {
            Cardinality::Single => "SINGLE",
            Cardinality::Multiple => "MULTIPLE",
        }
    }

    pub fn from_server(s: &str) -> Option<Self> {
        match s {
            "SINGLE" => Some(Cardinality::Single),
            "MULTIPLE" => Some(Cardinality::Multiple),
            _ => None,
        }
    }
}

/// User-facing associable type names and their server spelling.
const ASSOCIABLE_TYPES: &[(&str, &str)] = &[
    ("All objects", ""),
    ("Cluster", "ClusterComputeResource"),
    ("Content Library", "com.vmware.content.Library"),
    ("Datacenter", "Datacenter"),
    ("Datastore", "Datastore"),
    ("Datastore Cluster", "StoragePod"),
    ("Distributed Port Group", "DistributedVirtualPortgroup"),
    ("Distributed Switch", "VmwareDistributedVirtualSwitch"),
    ("Folder", "Folder"),
    ("Host", "HostSystem"),
    ("Library item", "com.vmware.content.library.Item"),
    ("Network", "Network"),
    ("Resource Pool", "ResourcePool"),
    ("vApp", "VirtualApp"),
    ("Virtual Machine", "VirtualMachine"),
];

/// Map user names (or server names) to the server's associable types.
/// "All objects" is the empty set.
pub fn associable_types(names: &[String]) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for name in names {
        let found = ASSOCIABLE_TYPES
            .iter()
            .find(|(user, server)| {
                user.eq_ignore_ascii_case(name) || (!server.is_empty() && *server == name.as_str())
            });
        match found {
            Some((_, "")) => return Ok(BTreeSet::new()),
            Some((_, server)) => {
                out.insert(server.to_string());
            }
            None => {
                return Err(Error::InvalidArgument(format!(
                    "'{name}' is not an associable object type"
                )));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySpec {
    pub name: String,
    pub description: Setting<String>,
    pub cardinality: Option<Cardinality>,
    pub associable_types: Option<BTreeSet<String>>,
}

impl CategorySpec {
    pub fn view(&self) -> Value {
        let mut v = json!({ "name": self.name });
        if let Some(d) = self.description.desired() {
            v["description"] = d;
        }
        if let Some(c) = self.cardinality {
            v["cardinality"] = json!(c.server_name());
        }
        if let Some(types) = &self.associable_types {
            v["associable_types"] = json!(types);
        }
        v
    }

    pub fn create_body(&self) -> Value {
        let description = match &self.description {
            Setting::Set(d) => d.clone(),
            _ => String::new(),
        };
        json!({
            "name": self.name,
            "description": description,
            "cardinality": self.cardinality.unwrap_or(Cardinality::Multiple).server_name(),
            "associable_types": self.associable_types.clone().unwrap_or_default(),
        })
    }

    /// Body for `PATCH /cis/tagging/category/{id}`.
    ///
    /// Cardinality can only widen and associable types can only grow; the
    /// server rejects anything else, so that is checked here first.
    pub fn update_body(&self, observed: &Value, fields: &[String]) -> Result<Value> {
        let mut body = Map::new();
        for field in fields {
            match field.as_str() {
                "name" => {
                    body.insert("name".into(), json!(self.name));
                }
                "description" => {
                    body.insert("description".into(), self.description.desired().unwrap_or(json!("")));
                }
                "cardinality" => {
                    if self.cardinality == Some(Cardinality::Single) {
                        return Err(Error::InvalidArgument(
                            "category cardinality cannot change from multiple to single".to_string(),
                        ));
                    }
                    body.insert("cardinality".into(), json!("MULTIPLE"));
                }
                "associable_types" => {
                    let current: BTreeSet<String> = observed
                        .list_at("associable_types")
                        .into_iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect();
                    let wanted = self.associable_types.clone().unwrap_or_default();
                    if !current.is_empty() && (wanted.is_empty() || !current.is_subset(&wanted)) {
                        return Err(Error::InvalidArgument(
                            "associable types of an existing category can only be added".to_string(),
                        ));
                    }
                    body.insert("associable_types".into(), json!(wanted));
                }
                _ => {}
            }
        }
        Ok(Value::Object(body))
    }
}

/// Comparable view of a REST category.
pub fn category_view(category: &Value) -> Value {
    let mut types: Vec<String> = category
        .list_at("associable_types")
        .into_iter()
        .filter_map(|t| t.as_str().map(str::to_string))
        .collect();
    types.sort();
    json!({
        "name": category.str_at("name").unwrap_or_default(),
        "description": category.str_at("description").unwrap_or_default(),
        "cardinality": category.str_at("cardinality").unwrap_or_default(),
        "associable_types": types,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpec {
    pub name: String,
    pub description: Setting<String>,
    pub category_id: String,
}

impl TagSpec {
    pub fn view(&self) -> Value {
        let mut v = json!({ "name": self.name });
        if let Some(d) = self.description.desired() {
            v["description"] = d;
        }
        v
    }

    pub fn create_body(&self) -> Value {
        let description = match &self.description {
            Setting::Set(d) => d.clone(),
            _ => String::new(),
        };
        json!({
            "name": self.name,
            "description": description,
            "category_id": self.category_id,
        })
    }

    pub fn update_body(&self, fields: &[String]) -> Value {
        let mut body = Map::new();
        for field in fields {
            match field.as_str() {
                "name" => {
                    body.insert("name".into(), json!(self.name));
                }
                "description" => {
                    body.insert("description".into(), self.description.desired().unwrap_or(json!("")));
                }
                _ => {}
            }
        }
        Value::Object(body)
    }
}

pub fn tag_view(tag: &Value) -> Value {
    json!({
        "name": tag.str_at("name").unwrap_or_default(),
        "description": tag.str_at("description").unwrap_or_default(),
    })
}
