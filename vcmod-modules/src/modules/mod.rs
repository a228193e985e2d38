pub mod category;
pub mod cluster;
pub mod cluster_drs;
pub mod cluster_ha;
pub mod cluster_vsan;
pub mod datastore_file;
pub mod datastore_io_control;
pub mod global_permission;
pub mod host_acceptance;
pub mod host_firewall;
pub mod host_firmware;
pub mod host_iscsi;
pub mod host_lockdown;
pub mod host_passthrough;
pub mod host_powerstate;
pub mod host_service;
pub mod host_sriov;
pub mod license;
pub mod object_info;
pub mod object_rename;
pub mod permission;
pub mod storage_policy;
pub mod tag;
pub mod vasa_provider;
pub mod vm_cdrom;
pub mod vm_controller;
pub mod vm_disk;
pub mod vm_nic;
pub mod vm_powerstate;
pub mod vm_tpm;
pub mod vm_vgpu;
pub mod vmfs_datastore;
