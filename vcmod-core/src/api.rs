//! Endpoint traits consumed by the engine.
//!
//! The engine talks to vSphere through these seams only: the HTTP
//! implementations live in [`crate::soap`], [`crate::rest`], [`crate::mob`]
//! and [`crate::transfer`]; tests plug in an in-memory endpoint.

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::value::{MoRef, ValueExt, typed};

/// Arguments of a SOAP method, in schema order.
pub type Args = Vec<(String, Value)>;

/// Build an [`Args`] list from `name => value` pairs.
#[macro_export]
macro_rules! args {
    () => { Vec::<(String, serde_json::Value)>::new() };
    ($($name:literal => $value:expr),+ $(,)?) => {
        vec![$(($name.to_string(), serde_json::Value::from($value))),+]
    };
}

/// Entry points of a vim25 endpoint, from `RetrieveServiceContent`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceContent {
    pub root_folder: MoRef,
    pub property_collector: MoRef,
    pub view_manager: MoRef,
    pub search_index: MoRef,
    pub session_manager: MoRef,
    pub authorization_manager: Option<MoRef>,
    pub license_manager: Option<MoRef>,
    pub custom_fields_manager: Option<MoRef>,
    pub storage_resource_manager: Option<MoRef>,
    pub file_manager: Option<MoRef>,
    pub api_version: String,
}

impl ServiceContent {
    pub fn from_value(v: &Value) -> Result<Self> {
        let required = |path: &str| {
            v.moref_at(path)
                .ok_or_else(|| Error::Internal(format!("service content lacks {path}")))
        };
        Ok(Self {
            root_folder: required("rootFolder")?,
            property_collector: required("propertyCollector")?,
            view_manager: required("viewManager")?,
            search_index: required("searchIndex")?,
            session_manager: required("sessionManager")?,
            authorization_manager: v.moref_at("authorizationManager"),
            license_manager: v.moref_at("licenseManager"),
            custom_fields_manager: v.moref_at("customFieldsManager"),
            storage_resource_manager: v.moref_at("storageResourceManager"),
            file_manager: v.moref_at("fileManager"),
            api_version: v.str_at("about.apiVersion").unwrap_or_default().to_string(),
        })
    }

    pub fn license_manager(&self) -> Result<&MoRef> {
        self.license_manager
            .as_ref()
            .ok_or_else(|| Error::Unsupported("endpoint has no license manager".to_string()))
    }

    pub fn authorization_manager(&self) -> Result<&MoRef> {
        self.authorization_manager
            .as_ref()
            .ok_or_else(|| Error::Unsupported("endpoint has no authorization manager".to_string()))
    }

    pub fn storage_resource_manager(&self) -> Result<&MoRef> {
        self.storage_resource_manager.as_ref().ok_or_else(|| {
            Error::Unsupported("endpoint has no storage resource manager".to_string())
        })
    }
}

/// Which objects a property retrieval visits.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Every object of `types` below `root` (a container view).
    Container {
        root: MoRef,
        types: Vec<String>,
        recursive: bool,
    },
    /// Exactly these objects.
    Objects(Vec<MoRef>),
}

/// A single filtered PropertyCollector read.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveSpec {
    pub selection: Selection,
    /// Dotted property paths to fetch; empty fetches references only.
    pub properties: Vec<String>,
}

impl RetrieveSpec {
    pub fn container(root: &MoRef, types: Vec<String>, properties: &[&str]) -> Self {
        Self {
            selection: Selection::Container {
                root: root.clone(),
                types,
                recursive: true,
            },
            properties: properties.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn object(obj: &MoRef, properties: &[&str]) -> Self {
        Self {
            selection: Selection::Objects(vec![obj.clone()]),
            properties: properties.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// One object and the requested properties, keyed by their path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectContent {
    pub obj: MoRef,
    pub props: Map<String, Value>,
}

impl ObjectContent {
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.props.get(path).filter(|v| !v.is_null())
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Value::as_str)
    }

    /// Properties as one nested object, so dotted accessors work across
    /// requested paths.
    pub fn as_value(&self) -> Value {
        let mut root = Value::Object(Map::new());
        for (path, value) in &self.props {
            let mut cur = &mut root;
            let segments: Vec<&str> = path.split('.').collect();
            for (i, seg) in segments.iter().enumerate() {
                let Value::Object(map) = cur else { break };
                if i + 1 == segments.len() {
                    map.insert(seg.to_string(), value.clone());
                    break;
                }
                cur = map
                    .entry(seg.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
        }
        root
    }
}

/// The SOAP / Managed-Object API surface.
#[async_trait]
pub trait VimApi: Send + Sync {
    /// Invoke `method` on `this`; returns the decoded `returnval`.
    async fn invoke(&self, this: &MoRef, method: &str, args: Args) -> Result<Value>;

    /// Run one filtered property retrieval.
    async fn retrieve(&self, content: &ServiceContent, spec: &RetrieveSpec) -> Result<Vec<ObjectContent>> {
        retrieve_via_collector(self, content, spec).await
    }
}

/// Implement [`VimApi::retrieve`] with the server's PropertyCollector:
/// a temporary container view, `RetrievePropertiesEx` with continuation,
/// and view teardown.
pub async fn retrieve_via_collector<A: VimApi + ?Sized>(
    api: &A,
    content: &ServiceContent,
    spec: &RetrieveSpec,
) -> Result<Vec<ObjectContent>> {
    let (object_set, types, view) = match &spec.selection {
        Selection::Container {
            root,
            types,
            recursive,
        } => {
            let view = api
                .invoke(
                    &content.view_manager,
                    "CreateContainerView",
                    vec![
                        ("container".to_string(), root.to_value()),
                        ("type".to_string(), json!(types)),
                        ("recursive".to_string(), Value::Bool(*recursive)),
                    ],
                )
                .await?;
            let view = MoRef::from_value(&view)
                .ok_or_else(|| Error::Internal("CreateContainerView returned no view".to_string()))?;
            let object_spec = typed(
                "ObjectSpec",
                json!({
                    "obj": view.to_value(),
                    "skip": true,
                    "selectSet": [typed("TraversalSpec", json!({
                        "name": "traverseEntities",
                        "type": "ContainerView",
                        "path": "view",
                        "skip": false
                    }))]
                }),
            );
            (vec![object_spec], types.clone(), Some(view))
        }
        Selection::Objects(objs) => {
            let specs = objs
                .iter()
                .map(|o| typed("ObjectSpec", json!({ "obj": o.to_value(), "skip": false })))
                .collect();
            let mut types: Vec<String> = objs.iter().map(|o| o.kind.clone()).collect();
            types.dedup();
            (specs, types, None)
        }
    };

    let prop_set: Vec<Value> = types
        .iter()
        .map(|t| {
            typed(
                "PropertySpec",
                json!({ "type": t, "all": false, "pathSet": spec.properties }),
            )
        })
        .collect();
    let filter = typed(
        "PropertyFilterSpec",
        json!({ "propSet": prop_set, "objectSet": object_set }),
    );

    let result = collect_pages(api, content, filter).await;

    if let Some(view) = view
        && let Err(e) = api.invoke(&view, "DestroyView", Vec::new()).await
    {
        tracing::debug!(view = %view, error = %e, "failed to destroy container view");
    }
    result
}

async fn collect_pages<A: VimApi + ?Sized>(
    api: &A,
    content: &ServiceContent,
    filter: Value,
) -> Result<Vec<ObjectContent>> {
    let mut out = Vec::new();
    let mut page = api
        .invoke(
            &content.property_collector,
            "RetrievePropertiesEx",
            vec![
                ("specSet".to_string(), filter),
                ("options".to_string(), typed("RetrieveOptions", json!({}))),
            ],
        )
        .await?;
    loop {
        for object in page.list_at("objects") {
            out.push(object_content(object)?);
        }
        let Some(token) = page.str_at("token").map(str::to_string) else {
            break;
        };
        page = api
            .invoke(
                &content.property_collector,
                "ContinueRetrievePropertiesEx",
                vec![("token".to_string(), Value::String(token))],
            )
            .await?;
    }
    Ok(out)
}

fn object_content(v: &Value) -> Result<ObjectContent> {
    let obj = v
        .moref_at("obj")
        .ok_or_else(|| Error::Internal("ObjectContent without obj".to_string()))?;
    let mut props = Map::new();
    for prop in v.list_at("propSet") {
        if let Some(name) = prop.str_at("name") {
            props.insert(name.to_string(), prop.get("val").cloned().unwrap_or(Value::Null));
        }
    }
    Ok(ObjectContent { obj, props })
}

/// HTTP verbs used against the REST surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

/// The REST / Automation API surface (`/api`).
#[async_trait]
pub trait RestApi: Send + Sync {
    /// Issue a request; `Ok(None)` for empty (204) responses.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>>;

    async fn get(&self, path: &str) -> Result<Value> {
        Ok(self.request(Method::Get, path, None).await?.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Option<Value>> {
        self.request(Method::Post, path, Some(body)).await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<()> {
        self.request(Method::Patch, path, Some(body)).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.request(Method::Delete, path, None).await.map(|_| ())
    }
}

/// One vCenter global permission, as listed by the authorization service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalPermission {
    pub principal: String,
    pub group: bool,
    pub role_id: i64,
    pub propagate: bool,
}

/// Global permissions live behind the managed-object browser, not the
/// vim25 API.
#[async_trait]
pub trait GlobalPermissionApi: Send + Sync {
    async fn list(&self) -> Result<Vec<GlobalPermission>>;
    async fn add(&self, permission: &GlobalPermission) -> Result<()>;
    async fn remove(&self, principal: &str, group: bool) -> Result<()>;
}

/// Plain HTTP file transfer against the endpoint, authenticated with the
/// SOAP session cookie. Paths are relative to the endpoint root and
/// already encoded.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn exists(&self, url_path: &str) -> Result<bool>;
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
    async fn upload(&self, url: &str, source: &Path, timeout: std::time::Duration) -> Result<()>;
    async fn put_bytes(&self, url_path: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete(&self, url_path: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_content_as_value_nests_paths() {
        let mut props = Map::new();
        props.insert("name".into(), json!("esxi01"));
        props.insert("runtime.inMaintenanceMode".into(), json!("true"));
        props.insert("config.service".into(), json!({ "service": [] }));
        let oc = ObjectContent {
            obj: MoRef::new("HostSystem", "host-1"),
            props,
        };
        let v = oc.as_value();
        assert_eq!(v.str_at("name"), Some("esxi01"));
        assert_eq!(v.bool_at("runtime.inMaintenanceMode"), Some(true));
        assert!(v.at("config.service").is_some());
    }

    #[test]
    fn test_service_content_requires_core_managers() {
        let v = json!({
            "rootFolder": MoRef::new("Folder", "group-d1").to_value(),
            "propertyCollector": MoRef::new("PropertyCollector", "propertyCollector").to_value(),
            "viewManager": MoRef::new("ViewManager", "ViewManager").to_value(),
            "searchIndex": MoRef::new("SearchIndex", "SearchIndex").to_value(),
            "sessionManager": MoRef::new("SessionManager", "SessionManager").to_value(),
            "about": { "apiVersion": "8.0.2.0" }
        });
        let content = ServiceContent::from_value(&v).unwrap();
        assert_eq!(content.api_version, "8.0.2.0");
        assert!(content.license_manager().is_err());

        let mut broken = v.clone();
        broken.as_object_mut().unwrap().remove("searchIndex");
        assert!(ServiceContent::from_value(&broken).is_err());
    }
}
