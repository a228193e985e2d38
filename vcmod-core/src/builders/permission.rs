//! Entity permissions.

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::value::{ValueExt, typed};

/// Role id for a role name from `AuthorizationManager.roleList`.
///
/// System roles are reported by their internal names (`Admin`,
/// `ReadOnly`, `NoAccess`); the labels shown in the client are accepted
/// too.
pub fn role_id(roles: &[&Value], name: &str) -> Result<i64> {
    let internal = match name {
        "Administrator" => "Admin",
        "Read-Only" | "Read-only" => "ReadOnly",
        "No access" | "No Access" => "NoAccess",
        other => other,
    };
    roles
        .iter()
        .find(|r| {
            let n = r.str_at("name");
            n == Some(internal) || n == Some(name) || r.str_at("info.label") == Some(name)
        })
        .and_then(|r| r.i64_at("roleId"))
        .ok_or_else(|| Error::NotFound(format!("role '{name}' does not exist")))
}

pub fn role_name(roles: &[&Value], id: i64) -> Option<String> {
    roles
        .iter()
        .find(|r| r.i64_at("roleId") == Some(id))
        .and_then(|r| r.str_at("name"))
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSpec {
    pub principal: String,
    pub group: bool,
    pub role_id: i64,
    pub propagate: bool,
}

impl PermissionSpec {
    pub fn validate(&self) -> Result<()> {
        if self.principal.trim().is_empty() {
            return Err(Error::InvalidArgument("principal must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn view(&self) -> Value {
        json!({ "role_id": self.role_id, "propagate": self.propagate })
    }

    pub fn to_value(&self) -> Value {
        typed(
            "Permission",
            json!({
                "principal": self.principal,
                "group": self.group,
                "roleId": self.role_id,
                "propagate": self.propagate,
            }),
        )
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            principal: v.str_at("principal")?.to_string(),
            group: v.bool_at("group").unwrap_or(false),
            role_id: v.i64_at("roleId")?,
            propagate: v.bool_at("propagate").unwrap_or(false),
        })
    }
}

/// The permission a principal holds directly on an entity.
pub fn find_permission(perms: &[&Value], principal: &str, group: bool) -> Option<PermissionSpec> {
    perms
        .iter()
        .filter_map(|p| PermissionSpec::from_value(p))
        .find(|p| p.principal.eq_ignore_ascii_case(principal) && p.group == group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> Vec<Value> {
        vec![
            json!({ "roleId": -1, "name": "Admin", "info": { "label": "Administrator" } }),
            json!({ "roleId": -2, "name": "ReadOnly", "info": { "label": "Read-only" } }),
            json!({ "roleId": 1001, "name": "NetworkOps", "info": { "label": "NetworkOps" } }),
        ]
    }

    #[test]
    fn test_role_lookup() {
        let all = roles();
        let refs: Vec<&Value> = all.iter().collect();
        assert_eq!(role_id(&refs, "Admin").unwrap(), -1);
        assert_eq!(role_id(&refs, "Administrator").unwrap(), -1);
        assert_eq!(role_id(&refs, "Read-Only").unwrap(), -2);
        assert_eq!(role_id(&refs, "NetworkOps").unwrap(), 1001);
        assert!(role_id(&refs, "Nope").unwrap_err().is_not_found());
        assert_eq!(role_name(&refs, 1001).as_deref(), Some("NetworkOps"));
    }

    #[test]
    fn test_permission_round_trip() {
        let spec = PermissionSpec {
            principal: "VSPHERE.LOCAL\\ops".into(),
            group: true,
            role_id: 1001,
            propagate: true,
        };
        let stored = spec.to_value();
        let refs = vec![&stored];
        assert_eq!(find_permission(&refs, "vsphere.local\\OPS", true), Some(spec));
        assert_eq!(find_permission(&refs, "vsphere.local\\ops", false), None);
    }
}
