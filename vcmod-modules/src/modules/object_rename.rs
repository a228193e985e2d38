use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use vcmod_core::diff::Diff;
use vcmod_core::value::Kind;
use vcmod_core::{
    ArgumentSpec, By, Context, Module, Outcome, Param, Params, Result, Scope, args,
};

use crate::common;

/// Rename any inventory object found by name or moid.
pub struct ObjectRename;

const OBJECT_TYPES: &[&str] = &[
    "ClusterComputeResource",
    "Datacenter",
    "Datastore",
    "DistributedVirtualPortgroup",
    "DistributedVirtualSwitch",
    "Folder",
    "HostSystem",
    "ResourcePool",
    "VirtualMachine",
];

#[async_trait]
impl Module for ObjectRename {
    fn name(&self) -> &'static str {
        "object_rename"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("object_type").required().choices(OBJECT_TYPES))
            .param(Param::str("object_name"))
            .param(Param::str("object_moid"))
            .param(Param::str("new_name").required())
            .param(Param::str("datacenter"))
            .param(common::name_match_param())
            .required_one_of(&["object_name", "object_moid"])
            .mutually_exclusive(&["object_name", "object_moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let kind: Kind = params.require_str("object_type")?.parse()?;
        let new_name = params.require_str("new_name")?;
        let by = match params.string("object_moid") {
            Some(moid) => By::Moid(moid),
            None => By::Name(params.require_str("object_name")?.to_string()),
        };
        let scope = Scope {
            datacenter: params.string("datacenter"),
            ..Scope::default()
        };
        let object = ctx
            .resolver()
            .find(kind, &by, &scope, common::name_match(params)?)
            .await?;
        let previous = object.display_name().to_string();

        if previous == new_name {
            return Ok(Outcome::unchanged().with(
                "rename_status",
                json!({ "previous_name": previous, "current_name": previous, "desired_name": new_name }),
            ));
        }

        let diff = Diff::from_changes(&json!({ "name": previous }), &json!({ "name": new_name }), &["name".to_string()]);
        ctx.record_diff(&diff);
        if !ctx.check_mode() {
            info!(object = %object.moref(), from = %previous, to = %new_name, "renaming");
            ctx.mutate_task(&object.moref(), "Rename_Task", args! { "newName" => new_name })
                .await?;
        }
        let current = if ctx.check_mode() { previous.as_str() } else { new_name };
        Ok(Outcome::changed(true)
            .with(
                "rename_status",
                json!({ "previous_name": previous, "current_name": current, "desired_name": new_name }),
            )
            .with_diff(diff))
    }
}
