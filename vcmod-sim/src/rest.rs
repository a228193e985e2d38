//! The `/api` tagging endpoints.

use serde_json::{Value, json};
use vcmod_core::value::ValueExt;
use vcmod_core::{Method, Result};

use crate::world::{World, fault};

const CATEGORY: &str = "cis/tagging/category";
const TAG: &str = "cis/tagging/tag";

fn not_found(what: &str, id: &str) -> vcmod_core::Error {
    fault("NOT_FOUND", format!("{what} {id} does not exist"))
}

fn new_id(kind: &str) -> String {
    format!("urn:vmomi:InventoryService{kind}:{}:GLOBAL", uuid::Uuid::new_v4())
}

fn body_str<'a>(body: &'a Option<Value>, key: &str) -> Option<&'a str> {
    body.as_ref().and_then(|b| b.str_at(key))
}

pub(crate) fn request(w: &mut World, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
    let path = path.trim_matches('/');
    let (collection, id) = if let Some(rest) = path.strip_prefix(CATEGORY) {
        ("category", rest.trim_start_matches('/'))
    } else if let Some(rest) = path.strip_prefix(TAG) {
        ("tag", rest.trim_start_matches('/'))
    } else {
        return Err(fault("NOT_FOUND", format!("no such endpoint /api/{path}")));
    };

    match (collection, method, id.is_empty()) {
        ("category", Method::Get, true) => Ok(Some(ids(&w.categories))),
        ("tag", Method::Get, true) => Ok(Some(ids(&w.tags))),
        ("category", Method::Get, false) => find(&w.categories, id)
            .cloned()
            .map(Some)
            .ok_or_else(|| not_found("category", id)),
        ("tag", Method::Get, false) => find(&w.tags, id)
            .cloned()
            .map(Some)
            .ok_or_else(|| not_found("tag", id)),
        ("category", Method::Post, true) => create_category(w, &body).map(Some),
        ("tag", Method::Post, true) => create_tag(w, &body).map(Some),
        ("category", Method::Patch, false) => update_category(w, id, &body).map(|_| None),
        ("tag", Method::Patch, false) => update_tag(w, id, &body).map(|_| None),
        ("category", Method::Delete, false) => {
            if find(&w.categories, id).is_none() {
                return Err(not_found("category", id));
            }
            w.categories.retain(|c| c.str_at("id") != Some(id));
            w.tags.retain(|t| t.str_at("category_id") != Some(id));
            Ok(None)
        }
        ("tag", Method::Delete, false) => {
            if find(&w.tags, id).is_none() {
                return Err(not_found("tag", id));
            }
            w.tags.retain(|t| t.str_at("id") != Some(id));
            Ok(None)
        }
        _ => Err(fault("INVALID_ARGUMENT", format!("{method:?} is not supported on /api/{path}"))),
    }
}

fn ids(items: &[Value]) -> Value {
    Value::Array(items.iter().filter_map(|i| i.get("id").cloned()).collect())
}

fn find<'a>(items: &'a [Value], id: &str) -> Option<&'a Value> {
    items.iter().find(|i| i.str_at("id") == Some(id))
}

pub(crate) fn category(name: &str, description: &str, cardinality: &str, types: &[String]) -> Value {
    json!({
        "id": new_id("Category"),
        "name": name,
        "description": description,
        "cardinality": cardinality,
        "associable_types": types,
        "used_by": [],
    })
}

fn create_category(w: &mut World, body: &Option<Value>) -> Result<Value> {
    let name = body_str(body, "name").unwrap_or_default();
    if name.is_empty() {
        return Err(fault("INVALID_ARGUMENT", "category name must not be empty"));
    }
    if w.categories.iter().any(|c| c.str_at("name") == Some(name)) {
        return Err(fault("ALREADY_EXISTS", format!("category '{name}' already exists")));
    }
    let types: Vec<String> = body
        .as_ref()
        .map(|b| b.list_at("associable_types"))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| t.as_str().map(str::to_string))
        .collect();
    let created = category(
        name,
        body_str(body, "description").unwrap_or_default(),
        body_str(body, "cardinality").unwrap_or("MULTIPLE"),
        &types,
    );
    let id = created["id"].clone();
    w.categories.push(created);
    Ok(id)
}

fn update_category(w: &mut World, id: &str, body: &Option<Value>) -> Result<()> {
    let name = body_str(body, "name").map(str::to_string);
    if let Some(n) = &name
        && w.categories.iter().any(|c| c.str_at("name") == Some(n.as_str()) && c.str_at("id") != Some(id))
    {
        return Err(fault("ALREADY_EXISTS", format!("category '{n}' already exists")));
    }
    let category = w
        .categories
        .iter_mut()
        .find(|c| c.str_at("id") == Some(id))
        .ok_or_else(|| not_found("category", id))?;
    if body_str(body, "cardinality") == Some("SINGLE") && category.str_at("cardinality") == Some("MULTIPLE") {
        return Err(fault("INVALID_ARGUMENT", "cardinality cannot be changed from MULTIPLE to SINGLE"));
    }
    if let Some(patch) = body.as_ref().and_then(Value::as_object) {
        for (k, v) in patch {
            category[k.as_str()] = v.clone();
        }
    }
    Ok(())
}

pub(crate) fn tag(name: &str, description: &str, category_id: &str) -> Value {
    json!({
        "id": new_id("Tag"),
        "name": name,
        "description": description,
        "category_id": category_id,
        "used_by": [],
    })
}

fn create_tag(w: &mut World, body: &Option<Value>) -> Result<Value> {
    let name = body_str(body, "name").unwrap_or_default();
    let category_id = body_str(body, "category_id").unwrap_or_default();
    if find(&w.categories, category_id).is_none() {
        return Err(not_found("category", category_id));
    }
    let duplicate = w
        .tags
        .iter()
        .any(|t| t.str_at("name") == Some(name) && t.str_at("category_id") == Some(category_id));
    if duplicate {
        return Err(fault("ALREADY_EXISTS", format!("tag '{name}' already exists in {category_id}")));
    }
    let created = tag(name, body_str(body, "description").unwrap_or_default(), category_id);
    let id = created["id"].clone();
    w.tags.push(created);
    Ok(id)
}

fn update_tag(w: &mut World, id: &str, body: &Option<Value>) -> Result<()> {
    let tag = w
        .tags
        .iter_mut()
        .find(|t| t.str_at("id") == Some(id))
        .ok_or_else(|| not_found("tag", id))?;
    if let Some(patch) = body.as_ref().and_then(Value::as_object) {
        for (k, v) in patch.iter().filter(|(k, _)| k.as_str() != "category_id") {
            tag[k.as_str()] = v.clone();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_lifecycle_and_cascade() {
        let mut w = World::default();
        let id = request(
            &mut w,
            Method::Post,
            "/cis/tagging/category",
            Some(json!({ "name": "tier", "cardinality": "SINGLE", "associable_types": [] })),
        )
        .unwrap()
        .unwrap();
        let id = id.as_str().unwrap().to_string();
        assert!(id.starts_with("urn:vmomi:InventoryServiceCategory:"));

        request(
            &mut w,
            Method::Post,
            "/cis/tagging/tag",
            Some(json!({ "name": "gold", "category_id": id })),
        )
        .unwrap();
        let dup = request(&mut w, Method::Post, "/cis/tagging/category", Some(json!({ "name": "tier" })));
        assert_eq!(dup.unwrap_err().fault().unwrap().name, "ALREADY_EXISTS");

        request(&mut w, Method::Delete, &format!("/cis/tagging/category/{id}"), None).unwrap();
        assert!(w.categories.is_empty());
        assert!(w.tags.is_empty());
    }

    #[test]
    fn test_cardinality_cannot_narrow() {
        let mut w = World::default();
        w.categories.push(category("env", "", "MULTIPLE", &[]));
        let id = w.categories[0]["id"].as_str().unwrap().to_string();
        let err = request(
            &mut w,
            Method::Patch,
            &format!("cis/tagging/category/{id}"),
            Some(json!({ "cardinality": "SINGLE" })),
        )
        .unwrap_err();
        assert_eq!(err.fault().unwrap().name, "INVALID_ARGUMENT");
    }
}
