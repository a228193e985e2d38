//! Role assignments on inventory objects.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::permission::{PermissionSpec, find_permission, role_id, role_name};
use vcmod_core::value::{Kind, MoRef, ValueExt};
use vcmod_core::{
    ArgumentSpec, By, Context, Decision, Module, Outcome, Param, Params, Resource, Result, Scope,
    args, reconcile,
};

use crate::common;

pub struct Permission;

const OBJECT_TYPES: &[&str] = &[
    "Folder",
    "VirtualMachine",
    "Datacenter",
    "ResourcePool",
    "Datastore",
    "Network",
    "HostSystem",
    "ComputeResource",
    "ClusterComputeResource",
    "DistributedVirtualSwitch",
    "DistributedVirtualPortgroup",
];

/// The root folder is addressed by this name.
const ROOT_FOLDER: &str = "rootFolder";

/// `AuthorizationManager.roleList`.
pub(crate) async fn roles(ctx: &Context) -> Result<Vec<Value>> {
    let manager = ctx.content().authorization_manager()?.clone();
    let props = ctx.properties(&manager, &["roleList"]).await?;
    Ok(props.list_at("roleList").into_iter().cloned().collect())
}

struct PermissionResource {
    manager: MoRef,
    entity: MoRef,
    entity_name: String,
    desired: PermissionSpec,
    role: String,
}

#[async_trait]
impl Resource for PermissionResource {
    type Observed = PermissionSpec;

    async fn observe(&self, ctx: &Context) -> Result<Option<PermissionSpec>> {
        let perms = ctx
            .call(
                &self.manager,
                "RetrieveEntityPermissions",
                args! { "entity" => self.entity.to_value(), "inherited" => false },
            )
            .await?;
        let refs: Vec<&Value> = perms.as_array().map(|a| a.iter().collect()).unwrap_or_default();
        Ok(find_permission(&refs, &self.desired.principal, self.desired.group))
    }

    fn observed_view(&self, observed: &PermissionSpec) -> Value {
        observed.view()
    }

    fn desired_view(&self, _observed: Option<&PermissionSpec>) -> Result<Value> {
        self.desired.validate()?;
        Ok(self.desired.view())
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        info!(entity = %self.entity, principal = %self.desired.principal, role = %self.role, "granting permission");
        self.set(ctx).await
    }

    async fn update(&self, ctx: &Context, _observed: &PermissionSpec, fields: &[String]) -> Result<()> {
        info!(entity = %self.entity, principal = %self.desired.principal, fields = ?fields, "updating permission");
        self.set(ctx).await
    }

    async fn delete(&self, ctx: &Context, observed: &PermissionSpec) -> Result<()> {
        info!(entity = %self.entity, principal = %observed.principal, "removing permission");
        ctx.mutate(
            &self.manager,
            "RemoveEntityPermission",
            args! {
                "entity" => self.entity.to_value(),
                "user" => observed.principal.as_str(),
                "isGroup" => observed.group,
            },
        )
        .await?;
        Ok(())
    }

    async fn result_of(&self, _ctx: &Context, decision: &Decision, observed: Option<&PermissionSpec>) -> Result<Value> {
        let present = match decision {
            Decision::Delete => false,
            Decision::Noop => observed.is_some(),
            _ => true,
        };
        Ok(json!({
            "principal": self.desired.principal,
            "group": self.desired.group,
            "role": self.role,
            "role_id": self.desired.role_id,
            "propagate": self.desired.propagate,
            "object": self.entity_name,
            "state": if present { "present" } else { "absent" },
        }))
    }
}

impl PermissionResource {
    async fn set(&self, ctx: &Context) -> Result<()> {
        ctx.mutate(
            &self.manager,
            "SetEntityPermissions",
            args! {
                "entity" => self.entity.to_value(),
                "permission" => vec![self.desired.to_value()],
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Module for Permission {
    fn name(&self) -> &'static str {
        "permission"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("role").required().doc("role name or label, e.g. Admin"))
            .param(Param::str("principal").doc("user, e.g. VSPHERE.LOCAL\\ops"))
            .param(Param::str("group"))
            .param(Param::str("object_name").required().doc("'rootFolder' for the inventory root"))
            .param(Param::str("object_type").choices(OBJECT_TYPES).default("Folder"))
            .param(Param::bool("recursive").default(true).doc("propagate to children"))
            .param(Param::str("datacenter"))
            .param(common::name_match_param())
            .param(common::state_param())
            .required_one_of(&["principal", "group"])
            .mutually_exclusive(&["principal", "group"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let object_type = params.str("object_type").unwrap_or("Folder");
        let object_name = params.require_str("object_name")?;
        let entity = if object_type == "Folder" && object_name == ROOT_FOLDER {
            ctx.content().root_folder.clone()
        } else {
            let kind: Kind = object_type.parse()?;
            let scope = Scope {
                datacenter: params.string("datacenter"),
                ..Scope::default()
            };
            ctx.resolver()
                .find(kind, &By::Name(object_name.to_string()), &scope, common::name_match(params)?)
                .await?
                .moref()
        };

        let role = params.require_str("role")?;
        let all_roles = roles(ctx).await?;
        let refs: Vec<&Value> = all_roles.iter().collect();
        let id = role_id(&refs, role)?;
        let (principal, group) = match params.string("group") {
            Some(g) => (g, true),
            None => (params.require_str("principal")?.to_string(), false),
        };

        let resource = PermissionResource {
            manager: ctx.content().authorization_manager()?.clone(),
            entity,
            entity_name: object_name.to_string(),
            desired: PermissionSpec {
                principal,
                group,
                role_id: id,
                propagate: params.bool("recursive").unwrap_or(true),
            },
            role: role_name(&refs, id).unwrap_or_else(|| role.to_string()),
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "changed_permission"))
    }
}
