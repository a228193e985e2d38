//! Tag categories on the REST tagging service.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;
use vcmod_core::builders::Setting;
use vcmod_core::builders::tagging::{Cardinality, CategorySpec, associable_types, category_view};
use vcmod_core::diff::changed_fields;
use vcmod_core::value::ValueExt;
use vcmod_core::{
    ArgType, ArgumentSpec, CompareRules, Context, Decision, Error, Method, Module, Needs, Outcome,
    Param, Params, Resource, Result, reconcile,
};

use crate::common;

pub struct Category;

pub(crate) const CATEGORY_PATH: &str = "cis/tagging/category";
pub(crate) const TAG_PATH: &str = "cis/tagging/tag";

/// Fetch every item of a tagging collection.
pub(crate) async fn list_items(ctx: &Context, collection: &str) -> Result<Vec<Value>> {
    let ids = ctx.rest_get(collection).await?;
    let mut items = Vec::new();
    for id in ids.as_array().map(Vec::as_slice).unwrap_or_default() {
        if let Some(id) = id.as_str() {
            items.push(ctx.rest_get(&format!("{collection}/{id}")).await?);
        }
    }
    Ok(items)
}

pub(crate) async fn find_category(ctx: &Context, name: &str) -> Result<Option<Value>> {
    Ok(list_items(ctx, CATEGORY_PATH)
        .await?
        .into_iter()
        .find(|c| c.str_at("name") == Some(name)))
}

/// Category id for a name that must exist.
pub(crate) async fn category_id(ctx: &Context, name: &str) -> Result<String> {
    find_category(ctx, name)
        .await?
        .and_then(|c| c.str_at("id").map(str::to_string))
        .ok_or_else(|| Error::NotFound(format!("unable to find tag category '{name}'")))
}

fn rules() -> CompareRules {
    CompareRules::default().unordered("associable_types")
}

struct CategoryResource {
    name: String,
    spec: CategorySpec,
}

impl CategoryResource {
    fn item_path(observed: &Value) -> Result<String> {
        let id = observed
            .str_at("id")
            .ok_or_else(|| Error::Internal("category without an id".to_string()))?;
        Ok(format!("{CATEGORY_PATH}/{id}"))
    }
}

#[async_trait]
impl Resource for CategoryResource {
    type Observed = Value;

    async fn observe(&self, ctx: &Context) -> Result<Option<Value>> {
        find_category(ctx, &self.name).await
    }

    fn observed_view(&self, observed: &Value) -> Value {
        category_view(observed)
    }

    fn desired_view(&self, observed: Option<&Value>) -> Result<Value> {
        let want = self.spec.view();
        if let Some(have) = observed {
            // Narrowing changes are refused up front, before anything is sent.
            let fields = changed_fields(&category_view(have), &want, &rules());
            self.spec.update_body(have, &fields)?;
        }
        Ok(want)
    }

    fn rules(&self) -> CompareRules {
        rules()
    }

    async fn create(&self, ctx: &Context) -> Result<()> {
        info!(category = %self.spec.name, "creating tag category");
        ctx.rest_mutate(Method::Post, CATEGORY_PATH, Some(self.spec.create_body()))
            .await?;
        Ok(())
    }

    async fn update(&self, ctx: &Context, observed: &Value, fields: &[String]) -> Result<()> {
        let body = self.spec.update_body(observed, fields)?;
        info!(category = %self.name, fields = ?fields, "updating tag category");
        ctx.rest_mutate(Method::Patch, &Self::item_path(observed)?, Some(body))
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context, observed: &Value) -> Result<()> {
        info!(category = %self.name, "deleting tag category");
        ctx.rest_mutate(Method::Delete, &Self::item_path(observed)?, None).await?;
        Ok(())
    }

    async fn result_of(&self, ctx: &Context, decision: &Decision, observed: Option<&Value>) -> Result<Value> {
        let id = match decision {
            Decision::Delete => None,
            Decision::Create if ctx.check_mode() => None,
            Decision::Create => find_category(ctx, &self.spec.name)
                .await?
                .and_then(|c| c.str_at("id").map(str::to_string)),
            _ => observed.and_then(|c| c.str_at("id")).map(str::to_string),
        };
        let present = !matches!(decision, Decision::Delete) && (id.is_some() || decision.is_change());
        Ok(json!({
            "category_id": id,
            "category_name": self.spec.name,
            "state": if present { "present" } else { "absent" },
        }))
    }
}

#[async_trait]
impl Module for Category {
    fn name(&self) -> &'static str {
        "category"
    }

    fn argument_spec(&self) -> ArgumentSpec {
        ArgumentSpec::new()
            .param(Param::str("category_name").required().aliases(&["name"]))
            .param(Param::str("new_category_name").doc("rename an existing category"))
            .param(Param::str("category_description").aliases(&["description"]))
            .param(Param::str("category_cardinality").choices(&["single", "multiple"]))
            .param(
                Param::list("associable_object_types", ArgType::Str)
                    .doc("e.g. Virtual Machine, Host; 'All objects' for every type"),
            )
            .param(common::state_param())
    }

    fn needs(&self, _params: &Params) -> Needs {
        Needs::rest()
    }

    async fn run(&self, ctx: &Context, params: &Params) -> Result<Outcome> {
        let name = params.require_str("category_name")?.to_string();
        let types = match params.value("associable_object_types") {
            Some(Value::Array(_)) => Some(associable_types(&params.str_list("associable_object_types"))?),
            _ => None,
        };
        let resource = CategoryResource {
            spec: CategorySpec {
                name: params.string("new_category_name").unwrap_or_else(|| name.clone()),
                description: Setting::from_param(params.str("category_description")),
                cardinality: common::parse_with(params, "category_cardinality", Cardinality::parse)?,
                associable_types: types,
            },
            name,
        };
        let r = reconcile(ctx, &resource, common::state(params)?).await?;
        Ok(Outcome::from_reconciled(r, "category_results"))
    }
}
