//! Cluster lifecycle under a datacenter's host folder.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::cluster::config_spec_ex;
use vcmod_core::value::{Kind, ValueExt};
use vcmod_core::{
    ArgumentSpec, By, Context, Decision, Handle, Module, NameMatch, Outcome, Param, Params,
    Resource, Result, Scope, args, reconcile,
};

use crate::common;

pub struct Cluster;

/// `configurationEx` of a cluster.
pub(crate) async fn configuration(ctx: &Context, cluster: &Handle) -> Result<Value> {
    let props = ctx.properties(&cluster.moref(), &["configurationEx"]).await?;
    Ok(props.at("configurationEx").cloned().unwrap_or(Value::Null))
}

/// Apply a `ClusterConfigSpecEx` in modify mode.
pub(crate) async fn reconfigure(ctx: &Context, cluster: &Handle, spec: Value) -> Result<()> {
    ctx.mutate_task(
        &cluster.moref(),
        "ReconfigureComputeResource_Task",
        args! { "spec" => spec, "modify" => true },
    )
    .await?;
    Ok(())
}

struct ClusterResource {
    datacenter: String,
    name: String,
}

impl ClusterResource {
    async fn lookup(&self, ctx: &Context) -> Result<Option<Handle>> {
        ctx.resolver()
            .find_optional(
                Kind::ClusterComputeResource,
                &By::Name(self.name.clone()),
                &Scope::datacenter(&self.datacenter),
                NameMatch::Unique,
            )
            .await
    }
}

#[async_trait]
impl Resource for ClusterResource {
    type Observed = Handle;

    async fn observe(&self, ctx: &Context) -> Result<Option<Handle>> {
        // A missing datacenter is an error, not an absent cluster.
        ctx.resolver().datacenter(&self.datacenter).await?;
        self.lookup(ctx).await
    }

    fn observed_view(&self, observed: &Handle) -> Value {
        json!({ "name": observed.display_name(), "datacenter": self.datacenter })
    }

    fn desired_view(&self, _observed: Option<&Handle>) -> Result<Value> {
        Ok(json!({ "name": self.name, "datacenter": self.datacenter }))
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        let dc = ctx.resolver().datacenter(&self.datacenter).await?;
        let folder = common::datacenter_folder(ctx, &dc, "hostFolder").await?;
        info!(cluster = %self.name, datacenter = %self.datacenter, "creating cluster");
        ctx.mutate(
            &folder,
            "CreateClusterEx",
            args! { "name" => self.name.as_str(), "spec" => config_spec_ex(None, None, None) },
        )
        .await?;
        Ok(())
    }

    async fn update(&self, _ctx: &Context, _observed: &Handle, _fields: &[String]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, ctx: &Context, observed: &Handle) -> Result<()> {
        info!(cluster = %self.name, "destroying cluster");
        ctx.mutate_task(&observed.moref(), "Destroy_Task", args!()).await?;
        Ok(())
    }

    async fn result_of(&self, ctx: &Context, decision: &Decision, observed: Option<&Handle>) -> Result<Value> {
        let handle = match decision {
            Decision::Delete => return Ok(json!({ "name": self.name, "state": "absent" })),
            Decision::Create if ctx.check_mode() => None,
            Decision::Create => self.lookup(ctx).await?,
            _ => observed.cloned(),
        };
        Ok(match handle {
            Some(h) => json!({ "name": self.name, "moid": h.moid, "state": "present" }),
            None if *decision == Decision::Create => json!({ "name": self.name, "state": "present" }),
            None => json!({ "name": self.name, "state": "absent" }),
        })
    }
}

#[async_trait]
impl Module for Cluster {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("datacenter").required().aliases(&["datacenter_name"]))
            .param(Param::str("cluster_name").required().aliases(&["name"]))
            .param(common::state_param())
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let resource = ClusterResource {
            datacenter: params.require_str("datacenter")?.to_string(),
            name: params.require_str("cluster_name")?.to_string(),
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "result"))
    }
}
