//! The in-memory inventory: objects, their properties, tasks and the
//! request log.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Value, json};
use vcmod_core::api::{ObjectContent, RetrieveSpec, Selection};
use vcmod_core::audit::Surface;
use vcmod_core::diff::insert_path;
use vcmod_core::value::{MoRef, ValueExt};
use vcmod_core::{Error, Fault, GlobalPermission, Result};

/// Methods that never change server state.
const READ_ONLY: &[&str] = &[
    "RetrieveServiceContent",
    "FindAllByUuid",
    "FindAllByDnsName",
    "FindByInventoryPath",
    "RetrieveEntityPermissions",
    "QueryAssignedLicenses",
    "QueryUnresolvedVmfsVolume",
    "HostImageConfigGetAcceptance",
    "BackupFirmwareConfiguration",
    "QueryFirmwareConfigUploadURL",
    "VsanClusterGetConfig",
    "PbmRetrieveServiceContent",
    "PbmQueryProfile",
    "PbmRetrieveContent",
    "QueryStorageManager",
    "QueryProvider",
    "QueryProviderInfo",
    "QuerySmsTaskInfo",
    "QuerySmsTaskResult",
    "GET",
    "HEAD",
    "LIST",
];

/// One request the simulator served.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub surface: Surface,
    /// Managed object, REST path, principal or file URL.
    pub target: String,
    pub method: String,
    pub args: Value,
    pub mutating: bool,
}

pub(crate) struct Object {
    pub moref: MoRef,
    pub props: Value,
}

#[derive(Default)]
pub(crate) struct World {
    pub objects: Vec<Object>,
    next_id: u64,
    pub calls: Vec<Call>,
    pub faults: HashMap<String, Fault>,
    pub held: HashSet<String>,
    pub categories: Vec<Value>,
    pub tags: Vec<Value>,
    pub global_permissions: Vec<GlobalPermission>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Entity moid to license key.
    pub assignments: BTreeMap<String, String>,
    /// Entity moid to its `Permission` objects.
    pub permissions: BTreeMap<String, Vec<Value>>,
    pub profiles: Vec<Value>,
    /// Certificate a VASA provider registration has to present.
    pub provider_certificate: Option<String>,
    pub password: String,
    pub unreachable: bool,
    pub opens: usize,
    pub closes: usize,
    /// VM moid to the power-on task waiting for an answer.
    pub pending_power_on: HashMap<String, String>,
}

fn id_prefix(kind: &str) -> &'static str {
    match kind {
        "Datacenter" => "datacenter-",
        "Folder" => "group-",
        "ClusterComputeResource" => "domain-c",
        "ComputeResource" => "domain-s",
        "HostSystem" => "host-",
        "VirtualMachine" => "vm-",
        "Datastore" => "datastore-",
        "Network" => "network-",
        "DistributedVirtualPortgroup" => "dvportgroup-",
        "VmwareDistributedVirtualSwitch" => "dvs-",
        "ResourcePool" => "resgroup-",
        "Task" => "task-",
        "SmsTask" => "SmsTask-",
        "VasaProvider" => "VasaProvider-",
        _ => "obj-",
    }
}

pub(crate) fn fault(name: &str, message: impl Into<String>) -> Error {
    Error::Remote(Fault::new(name, message))
}

pub(crate) fn not_found(obj: &MoRef) -> Error {
    fault(
        "ManagedObjectNotFound",
        format!("The object '{}' has already been deleted or has not been completely created", obj),
    )
}

/// `LocalizedMethodFault` for a task that failed with `err`.
fn fault_value(err: &Error) -> Value {
    let (name, message, detail) = match err.fault() {
        Some(f) => (f.name.clone(), f.message.clone(), f.detail.clone()),
        None => ("SystemError".to_string(), err.to_string(), Value::Null),
    };
    let mut inner = json!({ "_type": name });
    if let Value::Object(extra) = detail {
        for (k, v) in extra {
            inner[k.as_str()] = v;
        }
    }
    json!({ "fault": inner, "localizedMessage": message })
}

impl World {
    pub fn new_moid(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}{}", id_prefix(kind), 1000 + self.next_id)
    }

    pub fn insert(&mut self, kind: &str, moid: Option<&str>, props: Value) -> MoRef {
        let moid = match moid {
            Some(m) => m.to_string(),
            None => self.new_moid(kind),
        };
        let moref = MoRef::new(kind, moid);
        self.objects.push(Object {
            moref: moref.clone(),
            props,
        });
        moref
    }

    pub fn object(&self, moid: &str) -> Option<&Object> {
        self.objects.iter().find(|o| o.moref.value == moid)
    }

    pub fn object_mut(&mut self, moid: &str) -> Option<&mut Object> {
        self.objects.iter_mut().find(|o| o.moref.value == moid)
    }

    pub fn require(&self, obj: &MoRef) -> Result<&Object> {
        self.object(&obj.value).ok_or_else(|| not_found(obj))
    }

    pub fn require_mut(&mut self, obj: &MoRef) -> Result<&mut Object> {
        match self.objects.iter_mut().find(|o| o.moref.value == obj.value) {
            Some(o) => Ok(o),
            None => Err(not_found(obj)),
        }
    }

    pub fn prop(&self, obj: &MoRef, path: &str) -> Option<Value> {
        self.object(&obj.value)?.props.at(path).cloned()
    }

    pub fn set_prop(&mut self, obj: &MoRef, path: &str, value: Value) -> Result<()> {
        let o = self.require_mut(obj)?;
        insert_path(&mut o.props, path, value);
        Ok(())
    }

    pub fn parent_of(&self, moid: &str) -> Option<String> {
        self.object(moid)?.props.moref_at("parent").map(|p| p.value)
    }

    fn descends_from(&self, moid: &str, root: &str) -> bool {
        let mut cur = self.parent_of(moid);
        let mut hops = 0;
        while let Some(p) = cur {
            if p == root {
                return true;
            }
            hops += 1;
            if hops > 64 {
                return false;
            }
            cur = self.parent_of(&p);
        }
        false
    }

    /// Whether `moid` is inside `root`. VMs also count as inside their host
    /// and whatever contains the host.
    pub fn is_under(&self, moid: &str, root: &str) -> bool {
        if self.descends_from(moid, root) {
            return true;
        }
        match self.object(moid) {
            Some(o) if o.moref.kind == "VirtualMachine" => o
                .props
                .moref_at("runtime.host")
                .is_some_and(|h| h.value == root || self.descends_from(&h.value, root)),
            _ => false,
        }
    }

    pub fn children(&self, parent: &str) -> Vec<&Object> {
        self.objects
            .iter()
            .filter(|o| self.parent_of(&o.moref.value).as_deref() == Some(parent))
            .collect()
    }

    pub fn child_named(&self, parent: &str, name: &str) -> Option<&Object> {
        self.children(parent)
            .into_iter()
            .find(|o| o.props.str_at("name") == Some(name))
    }

    pub fn find_named(&self, kind: &str, name: &str) -> Option<MoRef> {
        self.objects
            .iter()
            .find(|o| o.moref.kind == kind && o.props.str_at("name") == Some(name))
            .map(|o| o.moref.clone())
    }

    /// Drop an object and everything below it.
    pub fn remove_tree(&mut self, moid: &str) {
        let doomed: HashSet<String> = self
            .objects
            .iter()
            .filter(|o| o.moref.value == moid || self.descends_from(&o.moref.value, moid))
            .map(|o| o.moref.value.clone())
            .collect();
        self.objects.retain(|o| !doomed.contains(&o.moref.value));
    }

    pub fn retrieve(&self, spec: &RetrieveSpec) -> Vec<ObjectContent> {
        let selected: Vec<&Object> = match &spec.selection {
            Selection::Container {
                root,
                types,
                recursive,
            } => self
                .objects
                .iter()
                .filter(|o| o.moref.value != root.value)
                .filter(|o| types.is_empty() || types.contains(&o.moref.kind))
                .filter(|o| {
                    if *recursive {
                        self.is_under(&o.moref.value, &root.value)
                    } else {
                        self.parent_of(&o.moref.value).as_deref() == Some(root.value.as_str())
                    }
                })
                .collect(),
            Selection::Objects(refs) => refs.iter().filter_map(|r| self.object(&r.value)).collect(),
        };
        selected
            .into_iter()
            .map(|o| ObjectContent {
                obj: o.moref.clone(),
                props: spec
                    .properties
                    .iter()
                    .filter_map(|p| o.props.at(p).map(|v| (p.clone(), v.clone())))
                    .collect(),
            })
            .collect()
    }

    pub fn record(&mut self, surface: Surface, target: String, method: &str, args: Value) {
        self.calls.push(Call {
            surface,
            target,
            method: method.to_string(),
            args,
            mutating: !READ_ONLY.contains(&method),
        });
    }

    /// The fault injected for `method`, if any.
    pub fn injected(&self, method: &str) -> Option<Error> {
        self.faults.get(method).cloned().map(Error::Remote)
    }

    /// A vim25 task that has already finished with `outcome`.
    pub fn finished_task(&mut self, method: &str, entity: &MoRef, outcome: Result<Value>) -> Value {
        let mut info = match outcome {
            Ok(result) => json!({ "state": "success", "result": result }),
            Err(e) => json!({ "state": "error", "error": fault_value(&e) }),
        };
        info["descriptionId"] = json!(method);
        info["entity"] = entity.to_value();
        let key = self.new_moid("Task");
        info["key"] = json!(key);
        self.insert("Task", Some(&key), json!({ "info": info })).to_value()
    }

    /// A vim25 task that never finishes on its own.
    pub fn running_task(&mut self, method: &str, entity: &MoRef) -> MoRef {
        let key = self.new_moid("Task");
        self.insert(
            "Task",
            Some(&key),
            json!({ "info": {
                "key": key,
                "state": "running",
                "progress": 10,
                "descriptionId": method,
                "entity": entity.to_value(),
            }}),
        )
    }

    pub fn complete_task(&mut self, task: &str, result: Value) -> Result<()> {
        let task = MoRef::new("Task", task);
        self.set_prop(&task, "info.state", json!("success"))?;
        self.set_prop(&task, "info.result", result)
    }

    /// A storage-monitoring task that has already finished.
    pub fn finished_sms_task(&mut self, outcome: Result<Value>) -> Value {
        let info = match outcome {
            Ok(result) => json!({ "state": "success", "result": result }),
            Err(e) => {
                let error = fault_value(&e);
                json!({ "state": "error", "error": error })
            }
        };
        self.insert("SmsTask", None, json!({ "info": info })).to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> World {
        let mut w = World::default();
        let root = w.insert("Folder", Some("group-d1"), json!({ "name": "Datacenters" }));
        let dc = w.insert("Datacenter", None, json!({ "name": "DC0", "parent": root.to_value() }));
        let hosts = w.insert("Folder", None, json!({ "name": "host", "parent": dc.to_value() }));
        let cluster = w.insert(
            "ClusterComputeResource",
            None,
            json!({ "name": "C0", "parent": hosts.to_value() }),
        );
        let host = w.insert("HostSystem", None, json!({ "name": "esxi01", "parent": cluster.to_value() }));
        let vms = w.insert("Folder", None, json!({ "name": "vm", "parent": dc.to_value() }));
        w.insert(
            "VirtualMachine",
            Some("vm-42"),
            json!({ "name": "web", "parent": vms.to_value(), "runtime": { "host": host.to_value() } }),
        );
        w
    }

    #[test]
    fn test_container_selection_follows_host_placement() {
        let w = tree();
        let cluster = w.find_named("ClusterComputeResource", "C0").unwrap();
        let spec = RetrieveSpec::container(&cluster, vec!["VirtualMachine".into()], &["name"]);
        let found = w.retrieve(&spec);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].obj.value, "vm-42");
        assert_eq!(found[0].name(), Some("web"));
    }

    #[test]
    fn test_remove_tree_drops_descendants() {
        let mut w = tree();
        let cluster = w.find_named("ClusterComputeResource", "C0").unwrap();
        w.remove_tree(&cluster.value);
        assert!(w.find_named("HostSystem", "esxi01").is_none());
        assert!(w.object("vm-42").is_some());
    }

    #[test]
    fn test_failed_task_carries_fault() {
        let mut w = World::default();
        let entity = MoRef::new("HostSystem", "host-1");
        let task = w.finished_task(
            "ShutdownHost_Task",
            &entity,
            Err(fault("InvalidState", "not in maintenance mode")),
        );
        let task = MoRef::from_value(&task).unwrap();
        assert_eq!(w.prop(&task, "info.state"), Some(json!("error")));
        assert_eq!(w.prop(&task, "info.error.fault._type"), Some(json!("InvalidState")));
    }
}
