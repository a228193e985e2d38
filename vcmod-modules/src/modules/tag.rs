use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::Setting;
use vcmod_core::builders::tagging::{TagSpec, tag_view};
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgumentSpec, Context, Decision, Error, Method, Module, Needs, Outcome, Param, Params,
    Resource, Result, reconcile,
};

use crate::common;
use crate::modules::category::{TAG_PATH, category_id, list_items};

/// Tags within a category.
pub struct Tag;

/// The tag named `name` in a category.
pub(crate) async fn find_tag(ctx: &Context, category_id: &str, name: &str) -> Result<Option<Value>> {
    Ok(list_items(ctx, TAG_PATH)
        .await?
        .into_iter()
        .find(|t| t.str_at("category_id") == Some(category_id) && t.str_at("name") == Some(name)))
}

struct TagResource {
    spec: TagSpec,
}

fn item_path(observed: &Value) -> Result<String> {
    let id = observed
        .str_at("id")
        .ok_or_else(|| Error::Internal("tag without an id".to_string()))?;
    Ok(format!("{TAG_PATH}/{id}"))
}

#[async_trait]
impl Resource for TagResource {
    type Observed = Value;

    async fn observe(&self, ctx: &Context) -> Result<Option<Value>> {
        find_tag(ctx, &self.spec.category_id, &self.spec.name).await
    }

    fn observed_view(&self, observed: &Value) -> Value {
        tag_view(observed)
    }

    fn desired_view(&self, _observed: Option<&Value>) -> Result<Value> {
        Ok(self.spec.view())
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        info!(tag = %self.spec.name, category = %self.spec.category_id, "creating tag");
        ctx.rest_mutate(Method::Post, TAG_PATH, Some(self.spec.create_body())).await?;
        Ok(())
    }

    async fn update(&self, ctx: &Context, observed: &Value, fields: &[String]) -> Result<()> {
        info!(tag = %self.spec.name, fields = ?fields, "updating tag");
        ctx.rest_mutate(Method::Patch, &item_path(observed)?, Some(self.spec.update_body(fields)))
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context, observed: &Value) -> Result<()> {
        info!(tag = %self.spec.name, "deleting tag");
        ctx.rest_mutate(Method::Delete, &item_path(observed)?, None).await?;
        Ok(())
    }

    async fn result_of(&self, ctx: &Context, decision: &Decision, observed: Option<&Value>) -> Result<Value> {
        let id = match decision {
            Decision::Delete => None,
            Decision::Create if ctx.check_mode() => None,
            Decision::Create => find_tag(ctx, &self.spec.category_id, &self.spec.name)
                .await?
                .and_then(|t| t.str_at("id").map(str::to_string)),
            _ => observed.and_then(|t| t.str_at("id")).map(str::to_string),
        };
        let present = !matches!(decision, Decision::Delete) && (id.is_some() || decision.is_change());
        Ok(json!({
            "tag_id": id,
            "tag_name": self.spec.name,
            "category_id": self.spec.category_id,
            "state": if present { "present" } else { "absent" },
        }))
    }
}

#[async_trait]
impl Module for Tag {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("tag_name").required().aliases(&["name", "tag"]))
            .param(Param::str("tag_description").aliases(&["description"]))
            .param(Param::str("category_name").aliases(&["category"]))
            .param(Param::str("category_id"))
            .param(common::state_param())
            .required_one_of(&["category_name", "category_id"])
            .mutually_exclusive(&["category_name", "category_id"])
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs::rest()
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let category = match params.string("category_id") {
            Some(id) => id,
            None => category_id(ctx, params.require_str("category_name")?).await?,
        };
        let resource = TagResource {
            spec: TagSpec {
                name: params.require_str("tag_name")?.to_string(),
                description: Setting::from_param(params.str("tag_description")),
                category_id: category,
            },
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "tag_status"))
    }
}
