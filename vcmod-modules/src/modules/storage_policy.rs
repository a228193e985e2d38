//! Tag-based VM storage policies on the SPBM endpoint.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::Setting;
use vcmod_core::builders::storage_policy::{TagOperator, TagPolicy, profile_view};
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, Fault, Module, Needs, Outcome, Param, Params, Resource,
    Result, State, Surface, args, reconcile,
};

use crate::common;
use crate::modules::category::category_id;
use crate::modules::tag::find_tag;

pub struct StoragePolicy;

async fn profile_manager(ctx: &Context) -> Result<MoRef> {
    let service = MoRef::new("PbmServiceInstance", "ServiceInstance");
    let content = ctx
        .call_on(Surface::Pbm, &service, "PbmRetrieveServiceContent", args!())
        .await?;
    content
        .moref_at("profileManager")
        .ok_or_else(|| Error::Unsupported("the storage policy service has no profile manager".to_string()))
}

/// Every storage requirement profile.
async fn profiles(ctx: &Context, manager: &MoRef) -> Result<Vec<Value>> {
    let ids = ctx
        .call_on(
            Surface::Pbm,
            manager,
            "PbmQueryProfile",
            args! {
                "resourceType" => json!({ "_type": "PbmProfileResourceType", "resourceType": "STORAGE" }),
                "profileCategory" => "REQUIREMENT",
            },
        )
        .await?;
    if ids.as_array().is_none_or(Vec::is_empty) {
        return Ok(Vec::new());
    }
    let content = ctx
        .call_on(Surface::Pbm, manager, "PbmRetrieveContent", args! { "profileIds" => ids })
        .await?;
    Ok(content.as_array().cloned().unwrap_or_default())
}

fn observed_policy_view(profile: &Value) -> Value {
    profile_view(profile).unwrap_or_else(|| {
        json!({
            "name": profile.str_at("name").unwrap_or_default(),
            "description": profile.str_at("description").unwrap_or_default(),
        })
    })
}

struct PolicyResource {
    manager: MoRef,
    policy: TagPolicy,
}

fn profile_id(profile: &Value) -> Result<Value> {
    profile
        .at("profileId")
        .cloned()
        .ok_or_else(|| Error::Internal("storage profile without an id".to_string()))
}

#[async_trait]
impl Resource for PolicyResource {
    type Observed = Value;

    async fn observe(&self, ctx: &Context) -> Result<Option<Value>> {
        Ok(profiles(ctx, &self.manager)
            .await?
            .into_iter()
            .find(|p| p.str_at("name") == Some(self.policy.name.as_str())))
    }

    fn observed_view(&self, observed: &Value) -> Value {
        observed_policy_view(observed)
    }

    fn desired_view(&self, _observed: Option<&Value>) -> Result<Value> {
        self.policy.validate()?;
        Ok(self.policy.view())
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        info!(policy = %self.policy.name, "creating storage policy");
        ctx.mutate_on(
            Surface::Pbm,
            &self.manager,
            "PbmCreate",
            args! { "createSpec" => self.policy.create_spec()? },
        )
        .await?;
        Ok(())
    }

    async fn update(&self, ctx: &Context, observed: &Value, fields: &[String]) -> Result<()> {
        info!(policy = %self.policy.name, fields = ?fields, "updating storage policy");
        ctx.mutate_on(
            Surface::Pbm,
            &self.manager,
            "PbmUpdate",
            args! {
                "profileId" => profile_id(observed)?,
                "updateSpec" => self.policy.update_spec(fields)?,
            },
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context, observed: &Value) -> Result<()> {
        info!(policy = %self.policy.name, "deleting storage policy");
        let outcomes = ctx
            .mutate_on(
                Surface::Pbm,
                &self.manager,
                "PbmDelete",
                args! { "profileId" => vec![profile_id(observed)?] },
            )
            .await?;
        // Failures come back per profile instead of as a fault.
        if let Some(failed) = outcomes.as_array().and_then(|o| o.iter().find(|x| x.at("fault").is_some())) {
            let name = failed.str_at("fault._type").unwrap_or("PbmFault");
            let message = failed.str_at("fault.localizedMessage").unwrap_or_default();
            return Err(Error::Remote(Fault::new(name, message)));
        }
        Ok(())
    }

    async fn result_of(&self, ctx: &Context, decision: &Decision, observed: Option<&Value>) -> Result<Value> {
        let profile = match decision {
            Decision::Delete => None,
            Decision::Create if ctx.check_mode() => None,
            Decision::Create | Decision::Update(_) if !ctx.check_mode() => self.observe(ctx).await?,
            _ => observed.cloned(),
        };
        let present = !matches!(decision, Decision::Delete) && (profile.is_some() || decision.is_change());
        let mut result = match &profile {
            Some(p) => observed_policy_view(p),
            None => json!({ "name": self.policy.name }),
        };
        result["id"] = json!(profile.as_ref().and_then(|p| p.str_at("profileId.uniqueId")));
        result["state"] = json!(if present { "present" } else { "absent" });
        Ok(result)
    }
}

#[async_trait]
impl Module for StoragePolicy {
    fn name(&self) -> &'static str {
        "storage_policy"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("name").required())
            .param(Param::str("description"))
            .param(Param::str("tag_category"))
            .param(Param::str("tag_name"))
            .param(Param::bool("tag_affinity").default(true).doc("false places on datastores without the tag"))
            .param(common::state_param())
            .required_if("state", "present", &["tag_category", "tag_name"])
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs {
            pbm: true,
            rest: true,
            ..Needs::SOAP
        }
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let state = common::state(params)?;
        let category = params.string("tag_category").unwrap_or_default();
        let tag = params.string("tag_name").unwrap_or_default();
        if state == State::Present {
            let id = category_id(ctx, &category).await?;
            if find_tag(ctx, &id, &tag).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "unable to find tag '{tag}' in category '{category}'"
                )));
            }
        }
        let operator = if params.bool("tag_affinity").unwrap_or(true) {
            TagOperator::Include
        } else {
            TagOperator::Exclude
        };
        let resource = PolicyResource {
            manager: profile_manager(ctx).await?,
            policy: TagPolicy {
                name: params.require_str("name")?.to_string(),
                description: Setting::from_param(params.str("description")),
                category,
                tag,
                operator,
            },
        };
        let r = reconcile(ctx, &resource, state).await?;
        Ok(Outcome::from_reconciled(r, "vmware_vm_storage_policy"))
    }
}
