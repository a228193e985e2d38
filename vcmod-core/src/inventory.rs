//! Inventory resolver: identifier plus optional scope to exactly one
//! managed-object handle.
//!
//! Every lookup is one filtered PropertyCollector traversal (or one
//! SearchIndex call) rooted at the deepest scope supplied. Nothing is
//! cached and nothing is retried.

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::api::{RetrieveSpec, ServiceContent, VimApi};
use crate::error::{Error, Result};
use crate::value::{Handle, Kind, MoRef, as_list};

/// How the target is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum By {
    Name(String),
    Uuid(String),
    InstanceUuid(String),
    Moid(String),
    DnsName(String),
    InventoryPath(String),
}

impl By {
    fn label(&self) -> (&'static str, &str) {
        match self {
            By::Name(v) => ("named", v),
            By::Uuid(v) => ("with UUID", v),
            By::InstanceUuid(v) => ("with instance UUID", v),
            By::Moid(v) => ("with moid", v),
            By::DnsName(v) => ("with DNS name", v),
            By::InventoryPath(v) => ("at path", v),
        }
    }
}

impl fmt::Display for By {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (how, value) = self.label();
        write!(f, "{how} '{value}'")
    }
}

/// Optional narrowing of a lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub datacenter: Option<String>,
    pub cluster: Option<String>,
    pub folder: Option<String>,
    pub host: Option<String>,
}

impl Scope {
    pub fn datacenter(name: impl Into<String>) -> Self {
        Self {
            datacenter: Some(name.into()),
            ..Self::default()
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(dc) = &self.datacenter {
            parts.push(format!("datacenter '{dc}'"));
        }
        if let Some(c) = &self.cluster {
            parts.push(format!("cluster '{c}'"));
        }
        if let Some(f) = &self.folder {
            parts.push(format!("folder '{f}'"));
        }
        if let Some(h) = &self.host {
            parts.push(format!("host '{h}'"));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" in {}", parts.join(", "))
        }
    }
}

/// Tie-breaking for by-name lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameMatch {
    /// More than one match is an error.
    #[default]
    Unique,
    First,
    Last,
}

impl NameMatch {
    pub fn parse(s: Option<&str>) -> Result<Self> {
        match s {
            None => Ok(NameMatch::Unique),
            Some("first") => Ok(NameMatch::First),
            Some("last") => Ok(NameMatch::Last),
            Some(other) => Err(Error::InvalidArgument(format!(
                "name_match must be 'first' or 'last', got '{other}'"
            ))),
        }
    }
}

/// Inventory names escape `%`, `/` and `\`; compare on the decoded form.
pub fn unescape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3).map(str::to_ascii_lowercase);
        match code.as_deref() {
            Some("25") => out.push('%'),
            Some("2f") => out.push('/'),
            Some("5c") => out.push('\\'),
            _ => {
                out.push('%');
                rest = &rest[at + 1..];
                continue;
            }
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    out
}

pub struct Resolver<'a> {
    vim: &'a dyn VimApi,
    content: &'a ServiceContent,
}

impl<'a> Resolver<'a> {
    pub fn new(vim: &'a dyn VimApi, content: &'a ServiceContent) -> Self {
        Self { vim, content }
    }

    /// Resolve exactly one object.
    pub async fn find(&self, kind: Kind, by: &By, scope: &Scope, name_match: NameMatch) -> Result<Handle> {
        self.lookup(kind, by, scope, name_match).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "unable to find {kind} {by}{}",
                scope.describe()
            ))
        })
    }

    /// Like [`Resolver::find`], with a missing target as `None`. A missing
    /// scope container is still an error.
    pub async fn find_optional(&self, kind: Kind, by: &By, scope: &Scope, name_match: NameMatch) -> Result<Option<Handle>> {
        self.lookup(kind, by, scope, name_match).await
    }

    async fn lookup(&self, kind: Kind, by: &By, scope: &Scope, name_match: NameMatch) -> Result<Option<Handle>> {
        let root = self.scope_root(scope).await?;
        match by {
            By::Name(name) => self.by_name(kind, name, &root, name_match).await,
            By::Moid(moid) => self.by_moid(kind, moid).await,
            By::Uuid(uuid) => self.by_uuid(kind, uuid, false, scope, name_match).await,
            By::InstanceUuid(uuid) => self.by_uuid(kind, uuid, true, scope, name_match).await,
            By::DnsName(dns) => self.by_dns_name(kind, dns, scope, name_match).await,
            By::InventoryPath(path) => self.by_path(kind, path).await,
        }
    }

    pub async fn datacenter(&self, name: &str) -> Result<Handle> {
        self.find(Kind::Datacenter, &By::Name(name.to_string()), &Scope::default(), NameMatch::Unique)
            .await
    }

    /// Every object of `kind` under the scope, in traversal order.
    pub async fn list(&self, kind: Kind, scope: &Scope) -> Result<Vec<Handle>> {
        let root = self.scope_root(scope).await?;
        self.collect(kind, &root).await
    }

    /// The deepest container named by `scope`.
    pub async fn scope_root(&self, scope: &Scope) -> Result<MoRef> {
        let mut root = self.content.root_folder.clone();
        let mut datacenter_name = None;
        if let Some(dc) = &scope.datacenter {
            root = self.unique_in(Kind::Datacenter, dc, &root).await?.moref();
            datacenter_name = Some(dc.clone());
        }
        let datacenter_root = root.clone();
        let cluster = match &scope.cluster {
            Some(name) => {
                let cluster = self.unique_in(Kind::ClusterComputeResource, name, &root).await?;
                Some(cluster)
            }
            None => None,
        };
        if let Some(folder) = &scope.folder {
            root = self.folder(folder, datacenter_name.as_deref(), &root).await?.moref();
        } else if let Some(cluster) = &cluster {
            root = cluster.moref();
        }
        if let Some(host_name) = &scope.host {
            // Clustered hosts sit under the datacenter's host folder, not the scope folder.
            let search_root = match &cluster {
                Some(_) => datacenter_root,
                None => root.clone(),
            };
            let host = self.unique_in(Kind::HostSystem, host_name, &search_root).await?;
            if let Some(cluster) = &cluster {
                self.ensure_member(&host, cluster).await?;
            }
            root = host.moref();
        }
        Ok(root)
    }

    async fn ensure_member(&self, host: &Handle, cluster: &Handle) -> Result<()> {
        let spec = RetrieveSpec::object(&host.moref(), &["parent"]);
        let found = self.vim.retrieve(self.content, &spec).await?;
        let parent = found
            .first()
            .and_then(|oc| oc.get("parent"))
            .and_then(MoRef::from_value);
        if parent.as_ref().map(|p| p.value.as_str()) == Some(cluster.moid.as_str()) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "host '{}' is not a member of cluster '{}'",
                host.display_name(),
                cluster.display_name()
            )))
        }
    }

    async fn folder(&self, folder: &str, datacenter: Option<&str>, root: &MoRef) -> Result<Handle> {
        if !folder.contains('/') {
            return self.unique_in(Kind::Folder, folder, root).await;
        }
        let trimmed = folder.trim_matches('/');
        // Relative folder paths are anchored at the datacenter.
        let path = match datacenter {
            Some(dc) if !trimmed.starts_with(&format!("{dc}/")) => format!("{dc}/{trimmed}"),
            _ => trimmed.to_string(),
        };
        self.by_path(Kind::Folder, &path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unable to find folder '{folder}'")))
    }

    async fn unique_in(&self, kind: Kind, name: &str, root: &MoRef) -> Result<Handle> {
        self.by_name(kind, name, root, NameMatch::Unique)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unable to find {kind} named '{name}'")))
    }

    async fn collect(&self, kind: Kind, root: &MoRef) -> Result<Vec<Handle>> {
        let spec = RetrieveSpec::container(root, kind.view_types(), &["name"]);
        let objects = self.vim.retrieve(self.content, &spec).await?;
        Ok(objects
            .into_iter()
            .filter(|oc| kind.matches(&oc.obj.kind))
            .map(|oc| Handle {
                kind,
                moid: oc.obj.value.clone(),
                name: oc.name().map(unescape_name),
                path: None,
            })
            .collect())
    }

    async fn by_name(&self, kind: Kind, name: &str, root: &MoRef, name_match: NameMatch) -> Result<Option<Handle>> {
        let matches: Vec<Handle> = self
            .collect(kind, root)
            .await?
            .into_iter()
            .filter(|h| h.name.as_deref() == Some(name))
            .collect();
        debug!(kind = %kind, name = %name, matches = matches.len(), "name lookup");
        pick(kind, &By::Name(name.to_string()), matches, name_match)
    }

    async fn by_moid(&self, kind: Kind, moid: &str) -> Result<Option<Handle>> {
        let handle = Handle {
            kind,
            moid: moid.to_string(),
            name: None,
            path: None,
        };
        let spec = RetrieveSpec::object(&handle.moref(), &["name"]);
        match self.vim.retrieve(self.content, &spec).await {
            Ok(found) => Ok(found.into_iter().find(|oc| kind.matches(&oc.obj.kind)).map(|oc| Handle {
                name: oc.name().map(unescape_name),
                ..handle
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn scope_datacenter(&self, scope: &Scope) -> Result<Value> {
        match &scope.datacenter {
            Some(dc) => Ok(self
                .unique_in(Kind::Datacenter, dc, &self.content.root_folder)
                .await?
                .moref()
                .to_value()),
            None => Ok(Value::Null),
        }
    }

    async fn by_uuid(&self, kind: Kind, uuid: &str, instance: bool, scope: &Scope, name_match: NameMatch) -> Result<Option<Handle>> {
        if uuid::Uuid::parse_str(uuid).is_err() {
            return Err(Error::InvalidArgument(format!("'{uuid}' is not a valid UUID")));
        }
        let vm_search = match kind {
            Kind::VirtualMachine => true,
            Kind::HostSystem if !instance => false,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{other} objects cannot be looked up by {}",
                    if instance { "instance UUID" } else { "UUID" }
                )));
            }
        };
        let found = self
            .vim
            .invoke(
                &self.content.search_index,
                "FindAllByUuid",
                vec![
                    ("datacenter".to_string(), self.scope_datacenter(scope).await?),
                    ("uuid".to_string(), Value::String(uuid.to_string())),
                    ("vmSearch".to_string(), Value::Bool(vm_search)),
                    ("instanceUuid".to_string(), Value::Bool(instance)),
                ],
            )
            .await?;
        let by = if instance {
            By::InstanceUuid(uuid.to_string())
        } else {
            By::Uuid(uuid.to_string())
        };
        self.named(kind, &by, &found, name_match).await
    }

    async fn by_dns_name(&self, kind: Kind, dns: &str, scope: &Scope, name_match: NameMatch) -> Result<Option<Handle>> {
        let vm_search = match kind {
            Kind::VirtualMachine => true,
            Kind::HostSystem => false,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{other} objects cannot be looked up by DNS name"
                )));
            }
        };
        let found = self
            .vim
            .invoke(
                &self.content.search_index,
                "FindAllByDnsName",
                vec![
                    ("datacenter".to_string(), self.scope_datacenter(scope).await?),
                    ("dnsName".to_string(), Value::String(dns.to_string())),
                    ("vmSearch".to_string(), Value::Bool(vm_search)),
                ],
            )
            .await?;
        self.named(kind, &By::DnsName(dns.to_string()), &found, name_match).await
    }

    async fn by_path(&self, kind: Kind, path: &str) -> Result<Option<Handle>> {
        let path = path.trim_start_matches('/');
        let found = self
            .vim
            .invoke(
                &self.content.search_index,
                "FindByInventoryPath",
                vec![("inventoryPath".to_string(), Value::String(path.to_string()))],
            )
            .await?;
        let Some(moref) = MoRef::from_value(&found) else {
            return Ok(None);
        };
        if !kind.matches(&moref.kind) {
            debug!(path = %path, found = %moref.kind, wanted = %kind, "path resolves to another kind");
            return Ok(None);
        }
        let name = path.rsplit('/').next().map(unescape_name);
        Ok(Some(Handle {
            kind,
            moid: moref.value,
            name,
            path: Some(format!("/{path}")),
        }))
    }

    /// Keep references of the right kind and fetch their names.
    async fn named(&self, kind: Kind, by: &By, found: &Value, name_match: NameMatch) -> Result<Option<Handle>> {
        let refs: Vec<MoRef> = as_list(Some(found))
            .into_iter()
            .filter_map(MoRef::from_value)
            .filter(|r| kind.matches(&r.kind))
            .collect();
        if refs.is_empty() {
            return Ok(None);
        }
        let spec = RetrieveSpec {
            selection: crate::api::Selection::Objects(refs.clone()),
            properties: vec!["name".to_string()],
        };
        let objects = self.vim.retrieve(self.content, &spec).await?;
        let handles = refs
            .into_iter()
            .map(|r| {
                let name = objects
                    .iter()
                    .find(|oc| oc.obj == r)
                    .and_then(|oc| oc.get("name"))
                    .and_then(|n| n.as_str())
                    .map(unescape_name);
                Handle {
                    kind,
                    moid: r.value,
                    name,
                    path: None,
                }
            })
            .collect();
        pick(kind, by, handles, name_match)
    }
}

fn pick(kind: Kind, by: &By, mut matches: Vec<Handle>, name_match: NameMatch) -> Result<Option<Handle>> {
    match (matches.len(), name_match) {
        (0, _) => Ok(None),
        (1, _) => Ok(matches.pop()),
        (_, NameMatch::First) => Ok(Some(matches.swap_remove(0))),
        (_, NameMatch::Last) => Ok(matches.pop()),
        (n, NameMatch::Unique) => {
            let moids: Vec<&str> = matches.iter().map(|h| h.moid.as_str()).collect();
            Err(Error::Ambiguous(format!(
                "{n} {kind} objects found {by} ({}); set name_match to 'first' or 'last' or narrow the scope",
                moids.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn handle(moid: &str) -> Handle {
        Handle {
            kind: Kind::VirtualMachine,
            moid: moid.into(),
            name: Some("web".into()),
            path: None,
        }
    }

    #[test]
    fn test_unescape_name() {
        assert_eq!(unescape_name("a%2fb%5cc%25d"), "a/b\\c%d");
        assert_eq!(unescape_name("R&D"), "R&D");
        assert_eq!(unescape_name("50%"), "50%");
        assert_eq!(unescape_name("%zz"), "%zz");
    }

    #[test]
    fn test_single_winner_rule() {
        let by = By::Name("web".into());
        let many = || vec![handle("vm-1"), handle("vm-2"), handle("vm-3")];
        let err = pick(Kind::VirtualMachine, &by, many(), NameMatch::Unique).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ambiguous);
        assert!(err.to_string().contains("vm-1, vm-2, vm-3"));
        assert_eq!(
            pick(Kind::VirtualMachine, &by, many(), NameMatch::First).unwrap().unwrap().moid,
            "vm-1"
        );
        assert_eq!(
            pick(Kind::VirtualMachine, &by, many(), NameMatch::Last).unwrap().unwrap().moid,
            "vm-3"
        );
        assert!(pick(Kind::VirtualMachine, &by, vec![], NameMatch::Unique).unwrap().is_none());
    }

    #[test]
    fn test_name_match_parse() {
        assert_eq!(NameMatch::parse(None).unwrap(), NameMatch::Unique);
        assert_eq!(NameMatch::parse(Some("last")).unwrap(), NameMatch::Last);
        assert!(NameMatch::parse(Some("middle")).is_err());
    }
}
