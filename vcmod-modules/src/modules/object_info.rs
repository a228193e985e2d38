//! Read-only view of one inventory object.

use async_trait::async_trait;
use vcmod_core::diff::{normalize, project};
use vcmod_core::value::Kind;
use vcmod_core::{ArgumentSpec, ArgType, By, Context, Module, Outcome, Param, Params, Result, Scope};

use crate::common;

pub struct ObjectInfo;

/// Properties read when the caller does not restrict them.
const DEFAULT_PROPERTIES: &[&str] = &["name", "overallStatus", "parent"];

#[async_trait]
impl Module for ObjectInfo {
    fn name(&self) -> &'static str {
        "object_info"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("object_type").required())
            .param(Param::str("object_name"))
            .param(Param::str("object_moid"))
            .param(Param::str("datacenter"))
            .param(
                Param::list("properties", ArgType::Str)
                    .doc("dotted property paths; the whole result is restricted to them"),
            )
            .param(common::name_match_param())
            .required_one_of(&["object_name", "object_moid"])
            .mutually_exclusive(&["object_name", "object_moid"])
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let kind: Kind = params.require_str("object_type")?.parse()?;
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

        let wanted = params.str_list("properties");
        let paths: Vec<&str> = if wanted.is_empty() {
            DEFAULT_PROPERTIES.to_vec()
        } else {
            wanted.iter().map(String::as_str).collect()
        };
        let raw = ctx.properties(&object.moref(), &paths).await?;
        let mut view = project(&normalize(&raw), &wanted);
        if let Some(map) = view.as_object_mut() {
            map.insert("moid".to_string(), object.moid.clone().into());
            map.insert("type".to_string(), kind.as_str().into());
        }
        Ok(Outcome::unchanged().with("object", view))
    }
}
