//! vSAN on one cluster. The extended options live on the vSAN surface.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use vcmod_core::builders::cluster::VsanSettings;
use vcmod_core::task::LONG_TIMEOUT;
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{
    ArgumentSpec, CompareRules, Context, Error, Module, Needs, Outcome, Param, Params, Result,
    Surface, args, converge,
};

use super::cluster::configuration;
use crate::common;

pub struct ClusterVsan;

fn config_system() -> MoRef {
    MoRef::new("VsanVcClusterConfigSystem", "vsan-cluster-config-system")
}

fn advanced_options() -> Vec<Param> {
    vec![
        Param::int("object_repair_timer").doc("minutes before absent components are rebuilt"),
        Param::bool("disable_site_read_locality"),
        Param::bool("large_cluster_support"),
    ]
}

#[async_trait]
impl Module for ClusterVsan {
    fn name(&self) -> &'static str {
        "cluster_vsan"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("cluster_name").required())
            .param(Param::str("datacenter").aliases(&["datacenter_name"]))
            .param(Param::bool("enable").default(true))
            .param(Param::bool("vsan_auto_claim_storage"))
            .param(Param::dict("advanced_options").options(advanced_options()))
            .param(common::name_match_param())
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs {
            vsan: true,
            ..Needs::SOAP
        }
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let advanced = params.dict("advanced_options");
        let opt = |key: &str| advanced.and_then(|a| a.get(key));
        let desired = VsanSettings {
            enabled: params.bool("enable").unwrap_or(true),
            auto_claim_storage: params.bool("vsan_auto_claim_storage"),
            object_repair_timer: opt("object_repair_timer").and_then(Value::as_i64),
            disable_site_read_locality: opt("disable_site_read_locality").and_then(Value::as_bool),
            large_cluster_support: opt("large_cluster_support").and_then(Value::as_bool),
        };
        let spec = desired.reconfig_spec()?;

        let cluster = common::cluster(ctx, params).await?;
        let config = configuration(ctx, &cluster).await?;
        let extended = if desired.has_extended() {
            let current = ctx
                .call_on(
                    Surface::Vsan,
                    &config_system(),
                    "VsanClusterGetConfig",
                    args! { "cluster" => cluster.moref().to_value() },
                )
                .await?;
            current.at("extendedConfig").cloned()
        } else {
            None
        };
        let observed = VsanSettings::from_config(
            config.at("vsanConfigInfo").unwrap_or(&Value::Null),
            extended.as_ref(),
        );

        let r = converge(ctx, &observed.view(), &desired.view(), &CompareRules::default(), |fields| async move {
            info!(cluster = %cluster.display_name(), ?fields, "reconfiguring vSAN");
            let task = ctx
                .mutate_on(
                    Surface::Vsan,
                    &config_system(),
                    "VsanClusterReconfig",
                    args! { "cluster" => cluster.moref().to_value(), "vsanReconfigSpec" => spec },
                )
                .await?;
            let task = MoRef::from_value(&task)
                .ok_or_else(|| Error::Internal("VsanClusterReconfig did not return a task".to_string()))?;
            ctx.tasks().wait(&task, LONG_TIMEOUT).await?;
            Ok(())
        })
        .await?;
        Ok(Outcome::from_reconciled(r, "result").with("vsan", desired.view()))
    }
}
