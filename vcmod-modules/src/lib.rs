//! vcmod-modules: the automation modules built on `vcmod-core`.
//!
//! Each module compiles its own [`ArgumentSpec`](vcmod_core::ArgumentSpec),
//! declares the endpoints it needs and reconciles one kind of vSphere
//! object. [`find`] looks a module up by the name callers use.

pub mod common;
pub mod modules;

use vcmod_core::Module;

/// Every module, in catalogue order.
pub fn all() -> Vec<Box<dyn Module>> {
    use modules::*;
    vec![
        Box::new(cluster::Cluster),
        Box::new(cluster_drs::ClusterDrs),
        Box::new(cluster_ha::ClusterHa),
        Box::new(cluster_vsan::ClusterVsan),
        Box::new(object_rename::ObjectRename),
        Box::new(object_info::ObjectInfo),
        Box::new(license::License),
        Box::new(vmfs_datastore::VmfsDatastore),
        Box::new(datastore_io_control::DatastoreIoControl),
        Box::new(datastore_file::DatastoreFile),
        Box::new(host_service::HostService),
        Box::new(host_acceptance::HostAcceptance),
        Box::new(host_lockdown::HostLockdown),
        Box::new(host_firewall::HostFirewall),
        Box::new(host_sriov::HostSriov),
        Box::new(host_passthrough::HostPassthrough),
        Box::new(host_iscsi::HostIscsi),
        Box::new(host_powerstate::HostPowerstate),
        Box::new(host_firmware::HostFirmware),
        Box::new(vm_controller::VmController),
        Box::new(vm_disk::VmDisk),
        Box::new(vm_cdrom::VmCdrom),
        Box::new(vm_nic::VmNic),
        Box::new(vm_tpm::VmTpm),
        Box::new(vm_vgpu::VmVgpu),
        Box::new(vm_powerstate::VmPowerstate),
        Box::new(permission::Permission),
        Box::new(global_permission::GlobalPermissionModule),
        Box::new(category::Category),
        Box::new(tag::Tag),
        Box::new(storage_policy::StoragePolicy),
        Box::new(vasa_provider::VasaProvider),
    ]
}

/// Look a module up by name; a `vmware_` prefix is accepted.
pub fn find(name: &str) -> Option<Box<dyn Module>> {
    let name = name.strip_prefix("vmware_").unwrap_or(name);
    all().into_iter().find(|m| m.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_names_are_unique() {
        let names: Vec<_> = all().iter().map(|m| m.name()).collect();
        let unique: BTreeSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
        assert_eq!(names.len(), 32);
    }

    #[test]
    fn test_find_accepts_prefix() {
        assert_eq!(find("vmware_cluster").map(|m| m.name()), Some("cluster"));
        assert_eq!(find("host_sriov").map(|m| m.name()), Some("host_sriov"));
        assert!(find("nope").is_none());
    }

    #[test]
    fn test_argument_specs_compile() {
        for module in all() {
            let spec = module.argument_spec().with_common();
            let json = serde_json::to_value(&spec).unwrap();
            assert!(json.is_object(), "{}", module.name());
        }
    }
}
