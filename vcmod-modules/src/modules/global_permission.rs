//! vCenter global permissions, managed through the managed-object browser.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::permission::{role_id, role_name};
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, GlobalPermission, Module, Needs, Outcome, Param, Params,
    Resource, Result, reconcile,
};

use crate::common;
use crate::modules::permission::roles;

pub struct GlobalPermissionModule;

struct GlobalPermissionResource {
    desired: GlobalPermission,
    role: String,
}

fn view(p: &GlobalPermission) -> Value {
    json!({ "role_id": p.role_id, "propagate": p.propagate })
}

#[async_trait]
impl Resource for GlobalPermissionResource {
    type Observed = GlobalPermission;

    async fn observe(&self, ctx: &Context) -> Result<Option<GlobalPermission>> {
        let all = ctx.global_permissions()?.list().await?;
        Ok(all.into_iter().find(|p| {
            p.principal.eq_ignore_ascii_case(&self.desired.principal) && p.group == self.desired.group
        }))
    }

    fn observed_view(&self, observed: &GlobalPermission) -> Value {
        view(observed)
    }

    fn desired_view(&self, _observed: Option<&GlobalPermission>) -> Result<Value> {
        Ok(view(&self.desired))
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        info!(principal = %self.desired.principal, role = %self.role, "adding global permission");
        ctx.add_global_permission(&self.desired).await
    }

    /// The browser only offers add; adding again replaces the entry.
    async fn update(&self, ctx: &Context, _observed: &GlobalPermission, fields: &[String]) -> Result<()> {
        info!(principal = %self.desired.principal, fields = ?fields, "replacing global permission");
        ctx.add_global_permission(&self.desired).await
    }

    async fn delete(&self, ctx: &Context, observed: &GlobalPermission) -> Result<()> {
        info!(principal = %observed.principal, "removing global permission");
        ctx.remove_global_permission(&observed.principal, observed.group).await
    }

    async fn result_of(&self, _ctx: &Context, decision: &Decision, observed: Option<&GlobalPermission>) -> Result<Value> {
        let present = match decision {
            Decision::Delete => false,
            Decision::Noop => observed.is_some(),
            _ => true,
        };
        Ok(json!({
            "principal": self.desired.principal,
            "group": self.desired.group,
            "role": self.role,
            "propagate": self.desired.propagate,
            "state": if present { "present" } else { "absent" },
        }))
    }
}

#[async_trait]
impl Module for GlobalPermissionModule {
    fn name(&self) -> &'static str {
        "global_permission"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("principal").required().doc("user or group, e.g. VSPHERE.LOCAL\\admins"))
            .param(Param::bool("group").default(false))
            .param(Param::str("role").required())
            .param(Param::bool("propagate").default(true))
            .param(common::state_param())
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs {
            mob: true,
            ..Needs::SOAP
        }
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let principal = params.require_str("principal")?.trim().to_string();
        if principal.is_empty() {
            return Err(Error::InvalidArgument("principal must not be empty".to_string()));
        }
        let role = params.require_str("role")?;
        let all_roles = roles(ctx).await?;
        let refs: Vec<&Value> = all_roles.iter().collect();
        let id = role_id(&refs, role)?;

        let resource = GlobalPermissionResource {
            desired: GlobalPermission {
                principal,
                group: params.flag("group"),
                role_id: id,
                propagate: params.bool("propagate").unwrap_or(true),
            },
            role: role_name(&refs, id).unwrap_or_else(|| role.to_string()),
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "global_permission"))
    }
}
