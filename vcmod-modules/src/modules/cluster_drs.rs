use async_trait::async_trait;
use tracing::info;
use vcmod_core::builders::cluster::{DrsBehavior, DrsSettings, config_spec_ex};
use vcmod_core::value::ValueExt;
use vcmod_core::{ArgumentSpec, CompareRules, Context, Module, Outcome, Param, Params, Result, converge};

use super::cluster::{configuration, reconfigure};
use crate::common;

/// DRS on one cluster.
pub struct ClusterDrs;

impl ClusterDrs {
    fn desired(params: &Params) -> Result<DrsSettings> {
        Ok(DrsSettings {
            enabled: params.bool("enable").unwrap_or(true),
            default_vm_behavior: common::parse_with(params, "drs_default_vm_behavior", DrsBehavior::parse)?,
            vmotion_rate: params.int("drs_vmotion_rate"),
            advanced: params.dict("advanced_settings").cloned().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Module for ClusterDrs {
    fn name(&self) -> &'static str {
        "cluster_drs"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("cluster_name").required())
            .param(Param::str("datacenter").aliases(&["datacenter_name"]))
            .param(Param::bool("enable").default(true))
            .param(
                Param::str("drs_default_vm_behavior")
                    .choices(&["manual", "partiallyAutomated", "fullyAutomated"]),
            )
            .param(Param::int("drs_vmotion_rate").choices(&[1, 2, 3, 4, 5]))
            .param(Param::dict("advanced_settings").doc("DRS advanced options as key/value pairs"))
            .param(common::name_match_param())
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let desired = Self::desired(params)?;
        // Validates the vMotion rate before anything is read.
        let drs_config = desired.drs_config()?;

        let cluster = common::cluster(ctx, params).await?;
        let config = configuration(ctx, &cluster).await?;
        let observed = DrsSettings::from_config(config.at("drsConfig").unwrap_or(&serde_json::Value::Null));

        let r = converge(ctx, &observed.view(), &desired.view(), &CompareRules::default(), |fields| async move {
            info!(cluster = %cluster.display_name(), ?fields, "reconfiguring DRS");
            reconfigure(ctx, &cluster, config_spec_ex(Some(drs_config), None, None)).await
        })
        .await?;
        Ok(Outcome::from_reconciled(r, "result").with("drs", desired.view()))
    }
}
