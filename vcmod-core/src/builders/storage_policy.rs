//! Tag-based storage policies (SPBM capability profiles).

use serde_json::{Value, json};

use super::{Setting, one_of};
use crate::error::{Error, Result};
use crate::value::{ValueExt, typed};

pub const TAG_NAMESPACE: &str = "http://www.vmware.com/storage/tag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOperator {
    /// Datastores carrying the tag.
    Include,
    /// Datastores not carrying the tag.
    Exclude,
}

impl TagOperator {
    pub fn parse(s: &str) -> Result<Self> {
        one_of(
            "tag_affinity",
            s,
            &[("include", TagOperator::Include), ("exclude", TagOperator::Exclude)],
        )
    }

    pub fn server_name(&self) -> &'static str {
        match self {
            TagOperator::Include => "",
            TagOperator::Exclude => "NOT",
        }
    }
}

pub fn tag_property_id(category: &str) -> String {
    format!("com.vmware.storage.tag.{category}.property")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPolicy {
    pub name: String,
    pub description: Setting<String>,
    pub category: String,
    pub tag: String,
    pub operator: TagOperator,
}

impl TagPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.category.is_empty() || self.tag.is_empty() {
            return Err(Error::InvalidArgument(
                "tag_category and tag_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn view(&self) -> Value {
        let mut v = json!({
            "name": self.name,
            "tag_category": self.category,
            "tag_name": self.tag,
            "tag_affinity": self.operator == TagOperator::Include,
        });
        if let Some(d) = self.description.desired() {
            v["description"] = d;
        }
        v
    }

    fn constraints(&self) -> Value {
        let mut property = json!({ "id": tag_property_id(&self.category) });
        if self.operator == TagOperator::Exclude {
            property["operator"] = json!(self.operator.server_name());
        }
        property["value"] = typed("PbmCapabilityDiscreteSet", json!({ "values": [self.tag] }));
        typed(
            "PbmCapabilitySubProfileConstraints",
            json!({
                "subProfiles": [typed("PbmCapabilitySubProfile", json!({
                    "name": "Tag based placement",
                    "capability": [typed("PbmCapabilityInstance", json!({
                        "id": typed("PbmCapabilityMetadataUniqueId", json!({
                            "namespace": TAG_NAMESPACE,
                            "id": self.category,
                        })),
                        "constraint": [typed("PbmCapabilityConstraintInstance", json!({
                            "propertyInstance": [typed("PbmCapabilityPropertyInstance", property)]
                        }))]
                    }))]
                }))]
            }),
        )
    }

    pub fn create_spec(&self) -> Result<Value> {
        self.validate()?;
        let description = match &self.description {
            Setting::Set(d) => d.clone(),
            _ => String::new(),
        };
        Ok(typed(
            "PbmCapabilityProfileCreateSpec",
            json!({
                "name": self.name,
                "description": description,
                "category": "REQUIREMENT",
                "resourceType": typed("PbmProfileResourceType", json!({ "resourceType": "STORAGE" })),
                "constraints": self.constraints(),
            }),
        ))
    }

    pub fn update_spec(&self, fields: &[String]) -> Result<Value> {
        self.validate()?;
        let mut spec = json!({});
        if fields.iter().any(|f| f == "name") {
            spec["name"] = json!(self.name);
        }
        if fields.iter().any(|f| f == "description") {
            spec["description"] = self.description.desired().unwrap_or(json!(""));
        }
        if fields.iter().any(|f| f.starts_with("tag_")) {
            spec["constraints"] = self.constraints();
        }
        Ok(typed("PbmCapabilityProfileUpdateSpec", spec))
    }
}

/// Comparable view of an existing profile; `None` when it is not a
/// single-tag placement policy.
pub fn profile_view(profile: &Value) -> Option<Value> {
    let capability = profile
        .list_at("constraints.subProfiles")
        .into_iter()
        .flat_map(|s| s.list_at("capability"))
        .find(|c| c.str_at("id.namespace") == Some(TAG_NAMESPACE))?;
    let property = capability
        .list_at("constraint")
        .into_iter()
        .flat_map(|c| c.list_at("propertyInstance"))
        .next()?;
    let tag = property.list_at("value.values").into_iter().next()?.as_str()?;
    let exclude = property.str_at("operator") == Some("NOT");
    Some(json!({
        "name": profile.str_at("name").unwrap_or_default(),
        "description": profile.str_at("description").unwrap_or_default(),
        "tag_category": capability.str_at("id.id").unwrap_or_default(),
        "tag_name": tag,
        "tag_affinity": !exclude,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(operator: TagOperator) -> TagPolicy {
        TagPolicy {
            name: "gold".into(),
            description: Setting::Set("gold tier".into()),
            category: "tier".into(),
            tag: "gold".into(),
            operator,
        }
    }

    #[test]
    fn test_property_instance() {
        let spec = policy(TagOperator::Exclude).create_spec().unwrap();
        let property = spec
            .list_at("constraints.subProfiles")[0]
            .list_at("capability")[0]
            .list_at("constraint")[0]
            .list_at("propertyInstance")[0]
            .clone();
        assert_eq!(property.str_at("id"), Some("com.vmware.storage.tag.tier.property"));
        assert_eq!(property.str_at("operator"), Some("NOT"));
        assert_eq!(property.list_at("value.values")[0], "gold");
    }

    #[test]
    fn test_profile_view_reads_back() {
        for op in [TagOperator::Include, TagOperator::Exclude] {
            let p = policy(op);
            let view = profile_view(&p.create_spec().unwrap()).unwrap();
            assert_eq!(view, p.view());
        }
    }
}
