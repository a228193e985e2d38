use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use vcmod_core::builders::cluster::{HaSettings, config_spec_ex};
use vcmod_core::value::ValueExt;
use vcmod_core::{ArgumentSpec, CompareRules, Context, Module, Outcome, Param, Params, Result, converge};

use super::cluster::{configuration, reconfigure};
use crate::common;

/// vSphere HA on one cluster.
pub struct ClusterHa;

#[async_trait]
impl Module for ClusterHa {
    fn name(&self) -> &'static str {
        "cluster_ha"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("cluster_name").required())
            .param(Param::str("datacenter").aliases(&["datacenter_name"]))
            .param(Param::bool("enable").default(true))
            .param(Param::bool("ha_host_monitoring").doc("heartbeat monitoring of hosts"))
            .param(Param::bool("admission_control_enabled"))
            .param(Param::int("failover_level").doc("host failures the cluster tolerates"))
            .param(
                Param::str("ha_vm_monitoring")
                    .choices(&["vmMonitoringDisabled", "vmMonitoringOnly", "vmAndAppMonitoring"]),
            )
            .param(
                Param::str("host_isolation_response")
                    .choices(&["none", "powerOff", "shutdown"]),
            )
            .param(Param::dict("advanced_settings"))
            .param(common::name_match_param())
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let desired = HaSettings {
            enabled: params.bool("enable").unwrap_or(true),
            host_monitoring: params.bool("ha_host_monitoring"),
            admission_control: params.bool("admission_control_enabled"),
            failover_level: params.int("failover_level"),
            vm_monitoring: params.string("ha_vm_monitoring"),
            isolation_response: params.string("host_isolation_response"),
            advanced: params.dict("advanced_settings").cloned().unwrap_or_default(),
        };
        let das_config = desired.das_config()?;

        let cluster = common::cluster(ctx, params).await?;
        let config = configuration(ctx, &cluster).await?;
        let observed = HaSettings::from_config(config.at("dasConfig").unwrap_or(&Value::Null));

        let r = converge(ctx, &observed.view(), &desired.view(), &CompareRules::default(), |fields| async move {
            info!(cluster = %cluster.display_name(), ?fields, "reconfiguring HA");
            reconfigure(ctx, &cluster, config_spec_ex(None, Some(das_config), None)).await
        })
        .await?;
        Ok(Outcome::from_reconciled(r, "result").with("ha", desired.view()))
    }
}
