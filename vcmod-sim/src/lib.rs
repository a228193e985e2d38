//! vcmod-sim: an in-memory vSphere endpoint.
//!
//! [`Sim`] holds a small inventory (datacenters, clusters, hosts, VMs,
//! datastores, networks) plus the state behind the REST, MOB, file, SPBM
//! and SMS surfaces. [`SimConnector`] opens sessions against it, so
//! modules run end to end without a vCenter. Every request is recorded
//! and can be inspected with [`Sim::calls`].
//!
//! ```ignore
//! let sim = Sim::new();
//! let dc = sim.add_datacenter("DC0");
//! let cluster = sim.add_cluster(&dc, "C0");
//! let connector = SimConnector::new(sim.clone());
//! ```

mod connector;
mod devices;
mod rest;
mod services;
mod vim;
mod world;

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use vcmod_core::api::{Args, GlobalPermission, ServiceContent};
use vcmod_core::audit::Surface;
use vcmod_core::builders::storage_policy::TagPolicy;
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{Fault, Result};

pub use connector::SimConnector;
pub use world::Call;

use world::World;

/// Password every simulated endpoint accepts unless changed.
pub const DEFAULT_PASSWORD: &str = "Lab!Passw0rd";

/// Per-host managers and their managed object types.
const HOST_MANAGERS: &[(&str, &str)] = &[
    ("serviceSystem", "HostServiceSystem"),
    ("firewallSystem", "HostFirewallSystem"),
    ("storageSystem", "HostStorageSystem"),
    ("imageConfigManager", "HostImageConfigManager"),
    ("pciPassthruSystem", "HostPciPassthruSystem"),
    ("firmwareSystem", "HostFirmwareSystem"),
    ("hostAccessManager", "HostAccessManager"),
];

#[derive(Clone)]
pub struct Sim {
    world: Arc<Mutex<World>>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Self {
        let mut w = World::default();
        w.password = DEFAULT_PASSWORD.to_string();
        w.insert("Folder", Some("group-d1"), json!({ "name": "Datacenters" }));
        for (kind, moid) in [
            ("PropertyCollector", "propertyCollector"),
            ("ViewManager", "ViewManager"),
            ("SearchIndex", "SearchIndex"),
            ("SessionManager", "SessionManager"),
            ("CustomFieldsManager", "CustomFieldsManager"),
            ("StorageResourceManager", "StorageResourceManager"),
            ("FileManager", "FileManager"),
        ] {
            w.insert(kind, Some(moid), json!({}));
        }
        w.insert(
            "AuthorizationManager",
            Some("AuthorizationManager"),
            json!({ "roleList": [
                { "roleId": -1, "name": "Admin", "system": true, "info": { "label": "Administrator" } },
                { "roleId": -2, "name": "ReadOnly", "system": true, "info": { "label": "Read-only" } },
                { "roleId": -5, "name": "NoAccess", "system": true, "info": { "label": "No access" } },
                { "roleId": 1001, "name": "NetworkOps", "system": false, "info": { "label": "Network operators" } },
            ]}),
        );
        let assignment = w.insert("LicenseAssignmentManager", Some("LicenseAssignmentManager"), json!({}));
        w.insert(
            "LicenseManager",
            Some("LicenseManager"),
            json!({
                "licenseAssignmentManager": assignment.to_value(),
                "licenses": [{
                    "licenseKey": vim::EVAL_LICENSE,
                    "editionKey": "eval",
                    "name": "Evaluation Mode",
                    "total": 0,
                    "used": 0,
                }],
            }),
        );
        Self {
            world: Arc::new(Mutex::new(w)),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        let mut guard = self.world.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn content(&self) -> ServiceContent {
        let m = |kind: &str, moid: &str| MoRef::new(kind, moid);
        ServiceContent {
            root_folder: m("Folder", "group-d1"),
            property_collector: m("PropertyCollector", "propertyCollector"),
            view_manager: m("ViewManager", "ViewManager"),
            search_index: m("SearchIndex", "SearchIndex"),
            session_manager: m("SessionManager", "SessionManager"),
            authorization_manager: Some(m("AuthorizationManager", "AuthorizationManager")),
            license_manager: Some(m("LicenseManager", "LicenseManager")),
            custom_fields_manager: Some(m("CustomFieldsManager", "CustomFieldsManager")),
            storage_resource_manager: Some(m("StorageResourceManager", "StorageResourceManager")),
            file_manager: Some(m("FileManager", "FileManager")),
            api_version: "7.0.3.0".to_string(),
        }
    }

    /// Serve one SOAP request.
    pub fn dispatch(&self, surface: Surface, this: &MoRef, method: &str, args: Args) -> Result<Value> {
        let args = Value::Object(args.into_iter().collect::<Map<String, Value>>());
        self.with(|w| {
            w.record(surface, this.value.clone(), method, args.clone());
            if let Some(err) = w.injected(method) {
                if !method.ends_with("_Task") {
                    return Err(err);
                }
                return Ok(match surface {
                    Surface::Sms => w.finished_sms_task(Err(err)),
                    _ => w.finished_task(method, this, Err(err)),
                });
            }
            if w.held.contains(method) {
                return Ok(w.running_task(method, this).to_value());
            }
            match surface {
                Surface::Pbm => services::pbm(w, this, method, &args),
                Surface::Sms => services::sms(w, this, method, &args),
                Surface::Vsan => services::vsan(w, this, method, &args),
                _ => vim::handle(w, this, method, &args),
            }
        })
    }

    // === Inventory setup ===

    pub fn add_datacenter(&self, name: &str) -> MoRef {
        self.with(|w| {
            let root = MoRef::new("Folder", "group-d1");
            let dc = w.insert("Datacenter", None, json!({ "name": name, "parent": root.to_value() }));
            for folder in ["vm", "host", "datastore", "network"] {
                let f = w.insert("Folder", None, json!({ "name": folder, "parent": dc.to_value() }));
                let _ = w.set_prop(&dc, &format!("{folder}Folder"), f.to_value());
            }
            dc
        })
    }

    /// One of the datacenter's `vm`, `host`, `datastore` or `network` folders.
    pub fn folder_of(&self, dc: &MoRef, which: &str) -> MoRef {
        self.with(|w| w.prop(dc, &format!("{which}Folder")).and_then(|f| MoRef::from_value(&f)))
            .unwrap_or_else(|| panic!("{dc} has no {which} folder"))
    }

    pub fn add_folder(&self, parent: &MoRef, name: &str) -> MoRef {
        self.with(|w| w.insert("Folder", None, json!({ "name": name, "parent": parent.to_value() })))
    }

    pub fn add_cluster(&self, dc: &MoRef, name: &str) -> MoRef {
        let folder = self.folder_of(dc, "host");
        self.with(|w| {
            let created = vim::handle(w, &folder, "CreateClusterEx", &json!({ "name": name, "spec": {} }));
            created
                .ok()
                .and_then(|v| MoRef::from_value(&v))
                .unwrap_or_else(|| panic!("cannot create cluster {name}"))
        })
    }

    /// Add a host below a cluster, or standalone below a datacenter.
    pub fn add_host(&self, parent: &MoRef, name: &str) -> MoRef {
        let standalone_folder = (parent.kind == "Datacenter").then(|| self.folder_of(parent, "host"));
        self.with(|w| {
            let owner = match &standalone_folder {
                Some(folder) => w.insert(
                    "ComputeResource",
                    None,
                    json!({ "name": name, "parent": folder.to_value(), "host": [] }),
                ),
                None => parent.clone(),
            };
            let host = MoRef::new("HostSystem", w.new_moid("HostSystem"));
            let mut managers = Map::new();
            for (key, kind) in HOST_MANAGERS {
                let mut props = json!({ "host": host.to_value() });
                if *kind == "HostImageConfigManager" {
                    props["acceptanceLevel"] = json!("partner");
                }
                let manager = w.insert(kind, None, props);
                managers.insert(key.to_string(), manager.to_value());
            }
            let uuid = uuid::Uuid::new_v4().to_string();
            w.insert(
                "HostSystem",
                Some(&host.value),
                vim::host_props(name, &owner, &uuid, &managers),
            );
            let mut hosts = w.prop(&owner, "host").unwrap_or(json!([]));
            if let Value::Array(items) = &mut hosts {
                items.push(host.to_value());
            }
            let _ = w.set_prop(&owner, "host", hosts);
            host
        })
    }

    pub fn add_vm(&self, host: &MoRef, name: &str) -> MoRef {
        let moid = self.with(|w| w.new_moid("VirtualMachine"));
        self.add_vm_with_id(host, name, &moid)
    }

    pub fn add_vm_with_id(&self, host: &MoRef, name: &str, moid: &str) -> MoRef {
        let dc = self.datacenter_of(host);
        let folder = self.folder_of(&dc, "vm");
        self.with(|w| {
            let vm = w.insert(
                "VirtualMachine",
                Some(moid),
                json!({
                    "name": name,
                    "parent": folder.to_value(),
                    "runtime": { "powerState": "poweredOff", "host": host.to_value() },
                    "config": {
                        "name": name,
                        "uuid": uuid::Uuid::new_v4().to_string(),
                        "instanceUuid": uuid::Uuid::new_v4().to_string(),
                        "hardware": { "device": devices::default_devices(name) },
                    },
                    "guest": { "toolsRunningStatus": "guestToolsRunning", "hostName": name },
                }),
            );
            let mut vms = w.prop(host, "vm").unwrap_or(json!([]));
            if let Value::Array(items) = &mut vms {
                items.push(vm.to_value());
            }
            let _ = w.set_prop(host, "vm", vms);
            vm
        })
    }

    pub fn datacenter_of(&self, obj: &MoRef) -> MoRef {
        self.with(|w| {
            let mut cur = Some(obj.value.clone());
            while let Some(moid) = cur {
                if let Some(o) = w.object(&moid)
                    && o.moref.kind == "Datacenter"
                {
                    return Some(o.moref.clone());
                }
                cur = w.parent_of(&moid);
            }
            None
        })
        .unwrap_or_else(|| panic!("{obj} is not inside a datacenter"))
    }

    pub fn add_datastore(&self, dc: &MoRef, name: &str, hosts: &[MoRef]) -> MoRef {
        let folder = self.folder_of(dc, "datastore");
        self.with(|w| {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            let ds = w.insert("Datastore", None, vim::datastore_props(name, &uuid, Some(&folder), hosts));
            for host in hosts {
                let _ = vim::attach_datastore(w, host, &ds);
            }
            ds
        })
    }

    pub fn add_network(&self, dc: &MoRef, name: &str) -> MoRef {
        let folder = self.folder_of(dc, "network");
        self.with(|w| w.insert("Network", None, json!({ "name": name, "parent": folder.to_value() })))
    }

    pub fn add_dvswitch(&self, dc: &MoRef, name: &str) -> MoRef {
        let folder = self.folder_of(dc, "network");
        self.with(|w| {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            let pretty: Vec<String> = uuid.as_bytes().chunks(2).map(|c| String::from_utf8_lossy(c).into_owned()).collect();
            w.insert(
                "VmwareDistributedVirtualSwitch",
                None,
                json!({ "name": name, "parent": folder.to_value(), "uuid": pretty.join(" ") }),
            )
        })
    }

    pub fn add_portgroup(&self, dvs: &MoRef, name: &str) -> MoRef {
        let dc = self.datacenter_of(dvs);
        let folder = self.folder_of(&dc, "network");
        self.with(|w| {
            let moid = w.new_moid("DistributedVirtualPortgroup");
            w.insert(
                "DistributedVirtualPortgroup",
                Some(&moid),
                json!({
                    "name": name,
                    "parent": folder.to_value(),
                    "key": moid,
                    "config": { "distributedVirtualSwitch": dvs.to_value() },
                }),
            )
        })
    }

    /// Make a snapshot LUN visible to `host` as an unresolved VMFS volume.
    pub fn add_unresolved_volume(&self, host: &MoRef, label: &str, device_path: &str) {
        let storage = self.host_manager(host, "storageSystem");
        self.with(|w| {
            let mut volumes = w.prop(&storage, "unresolvedVolume").unwrap_or(json!([]));
            if let Value::Array(items) = &mut volumes {
                items.push(json!({
                    "vmfsLabel": label,
                    "vmfsUuid": uuid::Uuid::new_v4().simple().to_string(),
                    "extent": [{ "devicePath": device_path }],
                    "resolveStatus": { "resolvable": true },
                }));
            }
            let _ = w.set_prop(&storage, "unresolvedVolume", volumes);
        })
    }

    pub fn host_manager(&self, host: &MoRef, which: &str) -> MoRef {
        self.with(|w| {
            w.prop(host, &format!("configManager.{which}"))
                .and_then(|m| MoRef::from_value(&m))
        })
        .unwrap_or_else(|| panic!("{host} has no {which}"))
    }

    // === Inspection ===

    pub fn get(&self, obj: &MoRef, path: &str) -> Option<Value> {
        self.with(|w| w.prop(obj, path))
    }

    pub fn set(&self, obj: &MoRef, path: &str, value: Value) {
        self.with(|w| {
            let _ = w.set_prop(obj, path, value);
        })
    }

    pub fn find(&self, kind: &str, name: &str) -> Option<MoRef> {
        self.with(|w| w.find_named(kind, name))
    }

    pub fn exists(&self, obj: &MoRef) -> bool {
        self.with(|w| w.object(&obj.value).is_some())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|w| w.calls.clone())
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.with(|w| w.calls.iter().filter(|c| c.mutating).cloned().collect())
    }

    /// Method names of every call so far, in order.
    pub fn methods(&self) -> Vec<String> {
        self.with(|w| w.calls.iter().map(|c| c.method.clone()).collect())
    }

    pub fn clear_calls(&self) {
        self.with(|w| w.calls.clear())
    }

    /// Make every later `method` call fail with fault `name`.
    pub fn fail_with(&self, method: &str, name: &str, message: &str) {
        self.with(|w| {
            w.faults.insert(method.to_string(), Fault::new(name, message));
        })
    }

    /// Tasks started by `method` stay running forever.
    pub fn hold(&self, method: &str) {
        self.with(|w| {
            w.held.insert(method.to_string());
        })
    }

    /// Block `vm` on a question; `choices` are `(key, label)` pairs.
    pub fn ask(&self, vm: &MoRef, message_id: &str, text: &str, choices: &[(&str, &str)]) {
        let infos: Vec<Value> = choices
            .iter()
            .map(|(key, label)| json!({ "key": key, "label": label, "summary": label }))
            .collect();
        self.set(
            vm,
            "runtime.question",
            json!({
                "id": format!("{}-q1", vm.value),
                "text": text,
                "message": [{ "id": message_id, "text": text }],
                "choice": { "choiceInfo": infos, "defaultIndex": 0 },
            }),
        );
    }

    /// Choices answered on `vm`, oldest first.
    pub fn answers(&self, vm: &MoRef) -> Vec<String> {
        self.get(vm, "sim.answers")
            .map(|v| {
                v.list_at("")
                    .into_iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn opens(&self) -> usize {
        self.with(|w| w.opens)
    }

    pub fn closes(&self) -> usize {
        self.with(|w| w.closes)
    }

    pub fn set_password(&self, password: &str) {
        self.with(|w| w.password = password.to_string())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with(|w| w.unreachable = unreachable)
    }

    /// VASA providers must present `certificate` to register.
    pub fn require_certificate(&self, certificate: &str) {
        self.with(|w| w.provider_certificate = Some(certificate.to_string()))
    }

    // === REST, MOB and file state ===

    pub fn add_category(&self, name: &str, cardinality: &str, types: &[&str]) -> String {
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        self.with(|w| {
            let c = rest::category(name, "", cardinality, &types);
            let id = c.str_at("id").unwrap_or_default().to_string();
            w.categories.push(c);
            id
        })
    }

    pub fn add_tag(&self, category_id: &str, name: &str) -> String {
        self.with(|w| {
            let t = rest::tag(name, "", category_id);
            let id = t.str_at("id").unwrap_or_default().to_string();
            w.tags.push(t);
            id
        })
    }

    pub fn categories(&self) -> Vec<Value> {
        self.with(|w| w.categories.clone())
    }

    pub fn tags(&self) -> Vec<Value> {
        self.with(|w| w.tags.clone())
    }

    pub fn add_global_permission(&self, permission: GlobalPermission) {
        self.with(|w| w.global_permissions.push(permission))
    }

    pub fn global_permissions(&self) -> Vec<GlobalPermission> {
        self.with(|w| w.global_permissions.clone())
    }

    pub fn put_file(&self, url: &str, bytes: &[u8]) {
        self.with(|w| {
            w.files.insert(url.to_string(), bytes.to_vec());
        })
    }

    pub fn file(&self, url: &str) -> Option<Vec<u8>> {
        self.with(|w| w.files.get(url).cloned())
    }

    pub fn files(&self) -> Vec<String> {
        self.with(|w| w.files.keys().cloned().collect())
    }

    // === SPBM and SMS state ===

    /// Store a tag placement profile; returns its unique id.
    pub fn add_profile(&self, policy: &TagPolicy) -> String {
        let spec = policy
            .create_spec()
            .unwrap_or_else(|e| panic!("invalid policy {}: {e}", policy.name));
        self.with(|w| {
            let id = services::pbm(
                w,
                &MoRef::new("PbmProfileProfileManager", services::PROFILE_MANAGER),
                "PbmCreate",
                &json!({ "createSpec": spec }),
            );
            id.ok()
                .and_then(|v| v.str_at("uniqueId").map(str::to_string))
                .unwrap_or_else(|| panic!("cannot store profile {}", policy.name))
        })
    }

    pub fn profiles(&self) -> Vec<Value> {
        self.with(|w| w.profiles.clone())
    }

    /// Register a VASA provider directly; returns its uid.
    pub fn add_provider(&self, name: &str, url: &str, certificate: &str) -> String {
        self.with(|w| {
            let uid = uuid::Uuid::new_v4().to_string();
            w.insert(
                "VasaProvider",
                None,
                json!({ "info": {
                    "_type": "VasaProviderInfo",
                    "uid": uid,
                    "name": name,
                    "url": url,
                    "certificate": certificate,
                    "status": "online",
                }}),
            );
            uid
        })
    }

    /// Info of every registered VASA provider.
    pub fn providers(&self) -> Vec<Value> {
        self.with(|w| {
            w.objects
                .iter()
                .filter(|o| o.moref.kind == "VasaProvider")
                .filter_map(|o| o.props.at("info").cloned())
                .collect()
        })
    }

    // === Licensing and permissions ===

    pub fn licenses(&self) -> Vec<Value> {
        self.get(&MoRef::new("LicenseManager", "LicenseManager"), "licenses")
            .map(|l| l.list_at("").into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// License key assigned to an entity (moid, host name or `vcenter` uuid).
    pub fn assigned(&self, entity: &str) -> Option<String> {
        self.with(|w| w.assignments.get(entity).cloned())
    }

    pub fn permissions(&self, entity: &MoRef) -> Vec<Value> {
        self.with(|w| w.permissions.get(&entity.value).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use vcmod_core::api::{RetrieveSpec, VimApi};
    use vcmod_core::inventory::{By, NameMatch, Scope};
    use vcmod_core::session::{Connector, ConnectionParams, Needs};
    use vcmod_core::task::{TaskSettings, bracket_maintenance};
    use vcmod_core::value::Kind;
    use vcmod_core::{AuditLogger, Context, Error, args};

    fn params(password: &str) -> ConnectionParams {
        ConnectionParams {
            hostname: "vc.sim".into(),
            username: "administrator@vsphere.local".into(),
            password: password.to_string().into(),
            port: 443,
            validate_certs: true,
            proxy: None,
        }
    }

    async fn context(sim: &Sim) -> Context {
        let session = SimConnector::new(sim.clone())
            .open(&params(DEFAULT_PASSWORD), Needs::SOAP)
            .await
            .unwrap();
        let tasks = TaskSettings {
            poll_interval: Duration::from_millis(5),
            default_timeout: Duration::from_secs(5),
        };
        Context::new(session, false, false, tasks, AuditLogger::new_noop())
    }

    fn methods(sim: &Sim) -> Vec<String> {
        sim.mutating_calls().into_iter().map(|c| c.method).collect()
    }

    #[test]
    fn test_inventory_layout() {
        let sim = Sim::new();
        let dc = sim.add_datacenter("DC0");
        let cluster = sim.add_cluster(&dc, "C0");
        let host = sim.add_host(&cluster, "esxi01");
        let vm = sim.add_vm(&host, "web");

        assert_eq!(sim.datacenter_of(&vm), dc);
        assert_eq!(sim.get(&cluster, "host"), Some(json!([host.to_value()])));
        let service = sim.host_manager(&host, "serviceSystem");
        assert_eq!(sim.get(&service, "host"), Some(host.to_value()));
    }

    #[test]
    fn test_injected_fault_fails_task() {
        let sim = Sim::new();
        let dc = sim.add_datacenter("DC0");
        let cluster = sim.add_cluster(&dc, "C0");
        sim.fail_with("Destroy_Task", "NoPermission", "denied");
        let task = sim.dispatch(Surface::Soap, &cluster, "Destroy_Task", args!()).unwrap();
        let task = MoRef::from_value(&task).unwrap();
        assert_eq!(sim.get(&task, "info.state"), Some(json!("error")));
        assert!(sim.exists(&cluster));
        assert_eq!(sim.mutating_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_connector_checks_password_and_counts_sessions() {
        let sim = Sim::new();
        let connector = SimConnector::new(sim.clone());
        let err = connector.open(&params("nope"), Needs::SOAP).await.err().unwrap();
        assert_eq!(err.kind(), vcmod_core::ErrorKind::AuthFailed);

        let mut session = connector.open(&params(DEFAULT_PASSWORD), Needs::rest()).await.unwrap();
        assert!(session.endpoints().rest.is_some());
        assert!(session.endpoints().pbm.is_none());
        let root = sim.content().root_folder;
        let found = session
            .endpoints()
            .vim
            .retrieve(&sim.content(), &RetrieveSpec::object(&root, &["name"]))
            .await
            .unwrap();
        assert_eq!(found[0].name(), Some("Datacenters"));
        session.close().await.unwrap();
        assert_eq!((sim.opens(), sim.closes()), (1, 1));
    }

    #[tokio::test]
    async fn test_scope_host_stays_in_datacenter() {
        let sim = Sim::new();
        let dc0 = sim.add_datacenter("DC0");
        let c0 = sim.add_cluster(&dc0, "C0");
        let wanted = sim.add_host(&c0, "esxi01");
        let dc1 = sim.add_datacenter("DC1");
        let c1 = sim.add_cluster(&dc1, "C0");
        sim.add_host(&c1, "esxi01");

        let ctx = context(&sim).await;
        let scope = Scope {
            datacenter: Some("DC0".into()),
            cluster: Some("C0".into()),
            host: Some("esxi01".into()),
            ..Scope::default()
        };
        assert_eq!(ctx.resolver().scope_root(&scope).await.unwrap(), wanted);
    }

    #[tokio::test]
    async fn test_inventory_path_name_is_unescaped() {
        let sim = Sim::new();
        let dc = sim.add_datacenter("DC0");
        let cluster = sim.add_cluster(&dc, "C0");
        let host = sim.add_host(&cluster, "esxi01");
        let vm = sim.add_vm(&host, "web%2fprod");

        let ctx = context(&sim).await;
        let found = ctx
            .resolver()
            .find(
                Kind::VirtualMachine,
                &By::InventoryPath("/DC0/vm/web%2fprod".into()),
                &Scope::default(),
                NameMatch::Unique,
            )
            .await
            .unwrap();
        assert_eq!(found.moref(), vm);
        assert_eq!(found.display_name(), "web/prod");
    }

    #[tokio::test]
    async fn test_bracket_maintenance_exits_after_action() {
        let sim = Sim::new();
        let dc = sim.add_datacenter("DC0");
        let cluster = sim.add_cluster(&dc, "C0");
        let host = sim.add_host(&cluster, "esxi01");
        let ctx = context(&sim).await;

        let inside = bracket_maintenance(&ctx, &host, || async {
            let props = ctx.properties(&host, &["runtime.inMaintenanceMode"]).await?;
            Ok(props.bool_at("runtime.inMaintenanceMode"))
        })
        .await
        .unwrap();
        assert_eq!(inside, Some(true));
        assert_eq!(methods(&sim), vec!["EnterMaintenanceMode_Task", "ExitMaintenanceMode_Task"]);
        assert_eq!(sim.get(&host, "runtime.inMaintenanceMode"), Some(json!(false)));
    }

    #[tokio::test]
    async fn test_bracket_maintenance_exits_when_action_fails() {
        let sim = Sim::new();
        let dc = sim.add_datacenter("DC0");
        let cluster = sim.add_cluster(&dc, "C0");
        let host = sim.add_host(&cluster, "esxi01");
        let ctx = context(&sim).await;

        let err = bracket_maintenance(&ctx, &host, || async {
            Err::<(), _>(Error::PreconditionFailed("refused".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), vcmod_core::ErrorKind::PreconditionFailed);
        assert_eq!(sim.get(&host, "runtime.inMaintenanceMode"), Some(json!(false)));

        sim.clear_calls();
        sim.fail_with("EnterMaintenanceMode_Task", "InvalidState", "busy");
        let ran = std::cell::Cell::new(false);
        let err = bracket_maintenance(&ctx, &host, || async {
            ran.set(true);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(!ran.get());
        assert!(err.to_string().starts_with("entering maintenance mode"));
        assert_eq!(methods(&sim), vec!["EnterMaintenanceMode_Task"]);
    }
}
