use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use vcmod_core::builders::datastore::{Congestion, IormSettings};
use vcmod_core::value::{Kind, ValueExt};
use vcmod_core::{
    ArgumentSpec, By, CompareRules, Context, Error, Module, Outcome, Param, Params, Result, Scope,
    args, converge,
};

use crate::common;

/// Storage I/O Control on one datastore.
pub struct DatastoreIoControl;

#[async_trait]
impl Module for DatastoreIoControl {
    fn name(&self) -> &'static str {
        "datastore_io_control"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("datastore_name").required().aliases(&["name"]))
            .param(Param::str("datacenter"))
            .param(
                Param::str("state")
                    .choices(&["enabled", "disabled"])
                    .default("enabled"),
            )
            .param(Param::int("congestion_threshold_percentage").doc("percent of peak throughput, 50-100"))
            .param(Param::int("congestion_threshold_manual").doc("latency in ms, 5-100"))
            .param(Param::bool("statistic_collection"))
            .param(common::name_match_param())
            .mutually_exclusive(&["congestion_threshold_percentage", "congestion_threshold_manual"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let enabled = match params.str("state").unwrap_or("enabled") {
            "enabled" => true,
            "disabled" => false,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "state must be 'enabled' or 'disabled', got '{other}'"
                )));
            }
        };
        let desired = IormSettings {
            enabled,
            congestion: Congestion::from_params(
                params.int("congestion_threshold_percentage"),
                params.int("congestion_threshold_manual"),
            )?,
            stats_collection: params.bool("statistic_collection"),
        };

        let name = params.require_str("datastore_name")?;
        let scope = Scope {
            datacenter: params.string("datacenter"),
            ..Scope::default()
        };
        let ds = ctx
            .resolver()
            .find(Kind::Datastore, &By::Name(name.to_string()), &scope, common::name_match(params)?)
            .await?;
        let props = ctx.properties(&ds.moref(), &["iormConfiguration"]).await?;
        let observed = IormSettings::from_config(props.at("iormConfiguration").unwrap_or(&Value::Null));

        let r = converge(ctx, &observed.view(), &desired.view(), &CompareRules::default(), |fields| async move {
            let manager = ctx.content().storage_resource_manager()?.clone();
            info!(datastore = %name, ?fields, "configuring storage I/O control");
            ctx.mutate_task(
                &manager,
                "ConfigureDatastoreIORM_Task",
                args! { "datastore" => ds.moref().to_value(), "spec" => desired.spec() },
            )
            .await?;
            Ok(())
        })
        .await?;
        Ok(Outcome::from_reconciled(r, "result"))
    }
}
