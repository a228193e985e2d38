//! Host, cluster and datastore modules against the simulator.

mod common;

use serde_json::json;

use common::{Lab, failed_with, ok};

#[tokio::test]
async fn test_service_start_and_policy() {
    let lab = Lab::new();
    let args = json!({
        "esxi_hostname": "esxi01",
        "service_name": "TSM-SSH",
        "state": "start",
        "service_policy": "on",
    });

    let env = lab.run("host_service", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["StartService", "UpdateServicePolicy"]);
    assert_eq!(env["host_service_status"]["esxi01"]["running"], true);
    assert_eq!(env["host_service_status"]["esxi01"]["policy"], "on");

    lab.reset();
    let again = lab.run("host_service", args).await;
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_service_unknown() {
    let lab = Lab::new();
    let env = lab
        .run("host_service", json!({ "cluster_name": "C0", "service_name": "lbtd" }))
        .await;
    failed_with(&env, "NotFound");
}

#[tokio::test]
async fn test_acceptance_level() {
    let lab = Lab::new();
    let listed = lab.run("host_acceptance", json!({ "esxi_hostname": "esxi01" })).await;
    ok(&listed);
    assert_eq!(listed["changed"], false);
    assert_eq!(listed["facts"]["esxi01"]["level"], "partner");

    let env = lab
        .run(
            "host_acceptance",
            json!({ "esxi_hostname": "esxi01", "state": "present", "acceptance_level": "community" }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["facts"]["esxi01"]["level"], "community");
}

#[tokio::test]
async fn test_acceptance_level_required_for_present() {
    let lab = Lab::new();
    let env = lab
        .run("host_acceptance", json!({ "esxi_hostname": "esxi01", "state": "present" }))
        .await;
    failed_with(&env, "InvalidArgument");
}

#[tokio::test]
async fn test_lockdown_mode() {
    let lab = Lab::new();
    let env = lab
        .run("host_lockdown", json!({ "esxi_hostname": "esxi01", "lockdown_mode": "strict" }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["host_lockdown_state"]["esxi01"]["previous_state"], "disabled");
    assert_eq!(lab.sim.get(&lab.host, "config.lockdownMode"), Some(json!("lockdownStrict")));

    lab.reset();
    let again = lab
        .run("host_lockdown", json!({ "esxi_hostname": "esxi01", "lockdown_mode": "strict" }))
        .await;
    assert_eq!(again["changed"], false);
}

#[tokio::test]
async fn test_firewall_ruleset() {
    let lab = Lab::new();
    let args = json!({
        "esxi_hostname": "esxi01",
        "rules": [
            { "name": "nfsClient", "enabled": true },
            {
                "name": "sshServer",
                "enabled": true,
                "allowed_hosts": { "all_ip": false, "ip_address": ["10.0.0.5"], "ip_network": ["192.168.10.0/24"] },
            },
        ],
    });

    let env = lab.run("host_firewall", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    let mut methods = lab.mutations();
    methods.sort();
    assert_eq!(methods, vec!["EnableRuleset", "UpdateRuleset"]);
    assert_eq!(env["rule_set_state"]["esxi01"]["nfsClient"]["changed"], true);

    lab.reset();
    let again = lab.run("host_firewall", args).await;
    ok(&again);
    assert_eq!(again["changed"], false, "{again:#}");
}

#[tokio::test]
async fn test_firewall_bad_network() {
    let lab = Lab::new();
    let env = lab
        .run(
            "host_firewall",
            json!({
                "esxi_hostname": "esxi01",
                "rules": [{
                    "name": "sshServer",
                    "enabled": true,
                    "allowed_hosts": { "all_ip": false, "ip_network": ["10.0.0.0"] },
                }],
            }),
        )
        .await;
    failed_with(&env, "InvalidArgument");
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_sriov_enable() {
    let lab = Lab::new();
    let args = json!({ "esxi_hostname": "esxi01", "vmnic": "vmnic4", "sriov_on": true, "num_virt_func": 8 });

    let env = lab.run("host_sriov", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["host_sriov_diff"]["esxi01"]["max_virt_func_supported"], 63);
    assert_eq!(lab.mutations(), vec!["UpdatePassthruConfig"]);

    lab.reset();
    let again = lab.run("host_sriov", args).await;
    assert_eq!(again["changed"], false);
}

#[tokio::test]
async fn test_sriov_validation() {
    let lab = Lab::new();
    for (on, count) in [(true, 0), (false, 4), (true, 64)] {
        let env = lab
            .run(
                "host_sriov",
                json!({ "esxi_hostname": "esxi01", "vmnic": "vmnic4", "sriov_on": on, "num_virt_func": count }),
            )
            .await;
        failed_with(&env, "InvalidArgument");
    }
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_sriov_unsupported_nic() {
    let lab = Lab::new();
    let env = lab
        .run(
            "host_sriov",
            json!({ "esxi_hostname": "esxi01", "vmnic": "vmnic9", "sriov_on": true, "num_virt_func": 4 }),
        )
        .await;
    assert_eq!(env["failed"], true);
}

#[tokio::test]
async fn test_passthrough_by_device_name() {
    let lab = Lab::new();
    let env = lab
        .run("host_passthrough", json!({ "esxi_hostname": "esxi01", "devices": ["NVIDIA A40"] }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["passthrough_configs"]["esxi01"]["0000:af:00.0"]["current"], true);

    lab.reset();
    let off = lab
        .run(
            "host_passthrough",
            json!({ "esxi_hostname": "esxi01", "devices": ["0000:af:00.0"], "state": "absent" }),
        )
        .await;
    ok(&off);
    assert_eq!(off["changed"], true);
    assert_eq!(lab.mutations(), vec!["UpdatePassthruConfig"]);
}

#[tokio::test]
async fn test_iscsi_enable_with_targets() {
    let lab = Lab::new();
    let args = json!({
        "esxi_hostname": "esxi01",
        "iscsi_name": "iqn.1998-01.com.vmware:esxi01-lab",
        "send_targets": ["10.1.1.20", "10.1.1.21:3261"],
    });

    let env = lab.run("host_iscsi", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    let props = &env["iscsi_properties"]["esxi01"];
    assert_eq!(props["enabled"], true);
    assert_eq!(props["iscsi_name"], "iqn.1998-01.com.vmware:esxi01-lab");
    assert_eq!(props["send_targets"], json!(["10.1.1.20:3260", "10.1.1.21:3261"]));
    let methods = lab.mutations();
    assert_eq!(methods[0], "UpdateSoftwareInternetScsiEnabled");
    assert!(methods.contains(&"AddInternetScsiSendTargets".to_string()));

    lab.reset();
    let again = lab.run("host_iscsi", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
}

#[tokio::test]
async fn test_iscsi_purge_targets() {
    let lab = Lab::new();
    ok(&lab
        .run("host_iscsi", json!({ "esxi_hostname": "esxi01", "send_targets": ["10.1.1.20", "10.1.1.21"] }))
        .await);
    lab.reset();

    let env = lab
        .run(
            "host_iscsi",
            json!({ "esxi_hostname": "esxi01", "send_targets": ["10.1.1.20"], "purge_send_targets": true }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["iscsi_properties"]["esxi01"]["send_targets"], json!(["10.1.1.20:3260"]));
    assert!(lab.mutations().contains(&"RemoveInternetScsiSendTargets".to_string()));
}

#[tokio::test]
async fn test_shutdown_requires_maintenance() {
    let lab = Lab::new();
    let env = lab
        .run("host_powerstate", json!({ "esxi_hostname": "esxi01", "state": "shutdown-host" }))
        .await;
    failed_with(&env, "PreconditionFailed");
    assert!(lab.mutations().is_empty());

    let forced = lab
        .run(
            "host_powerstate",
            json!({ "esxi_hostname": "esxi01", "state": "shutdown-host", "force": true }),
        )
        .await;
    ok(&forced);
    assert_eq!(lab.sim.get(&lab.host, "runtime.powerState"), Some(json!("poweredOff")));
}

#[tokio::test]
async fn test_reboot_requires_maintenance() {
    let lab = Lab::new();
    let env = lab
        .run("host_powerstate", json!({ "esxi_hostname": "esxi01", "state": "reboot-host" }))
        .await;
    failed_with(&env, "PreconditionFailed");
    assert!(env["msg"].as_str().unwrap().contains("not in maintenance mode"));
    assert!(lab.mutations().is_empty());

    let forced = lab
        .run(
            "host_powerstate",
            json!({ "esxi_hostname": "esxi01", "state": "reboot-host", "force": true }),
        )
        .await;
    ok(&forced);
    assert_eq!(forced["changed"], true);
    assert_eq!(lab.mutations(), vec!["RebootHost_Task"]);
}

#[tokio::test]
async fn test_reboot_in_maintenance_leaves_mode_alone() {
    let lab = Lab::new();
    lab.sim.set(&lab.host, "runtime.inMaintenanceMode", json!(true));
    let env = lab
        .run("host_powerstate", json!({ "esxi_hostname": "esxi01", "state": "reboot-host" }))
        .await;
    ok(&env);
    assert_eq!(lab.mutations(), vec!["RebootHost_Task"]);
    assert_eq!(lab.sim.get(&lab.host, "runtime.inMaintenanceMode"), Some(json!(true)));
}

#[tokio::test]
async fn test_standby_round_trip() {
    let lab = Lab::new();
    let down = lab
        .run("host_powerstate", json!({ "esxi_hostname": "esxi01", "state": "power-down-to-standby" }))
        .await;
    ok(&down);
    assert_eq!(lab.sim.get(&lab.host, "runtime.powerState"), Some(json!("standBy")));

    let again = lab
        .run("host_powerstate", json!({ "esxi_hostname": "esxi01", "state": "power-down-to-standby" }))
        .await;
    assert_eq!(again["changed"], false);

    let up = lab
        .run("host_powerstate", json!({ "esxi_hostname": "esxi01", "state": "power-up-from-standby" }))
        .await;
    ok(&up);
    assert_eq!(lab.sim.get(&lab.host, "runtime.powerState"), Some(json!("poweredOn")));
}

#[tokio::test]
async fn test_firmware_backup_to_directory() {
    let lab = Lab::new();
    let dir = tempfile::tempdir().unwrap();
    let env = lab
        .run(
            "host_firmware",
            json!({ "esxi_hostname": "esxi01", "state": "saved", "dest": dir.path() }),
        )
        .await;
    ok(&env);
    let dest = env["results"]["esxi01"]["dest"].as_str().expect("dest").to_string();
    assert!(dest.contains("configBundle-esxi01-"));
    let bytes = std::fs::read(&dest).unwrap();
    assert_eq!(bytes, b"config bundle of esxi01");
}

#[tokio::test]
async fn test_firmware_reset_requires_maintenance() {
    let lab = Lab::new();
    let env = lab
        .run("host_firmware", json!({ "esxi_hostname": "esxi01", "state": "absent" }))
        .await;
    failed_with(&env, "PreconditionFailed");

    lab.sim.set(&lab.host, "runtime.inMaintenanceMode", json!(true));
    let env = lab
        .run("host_firmware", json!({ "esxi_hostname": "esxi01", "state": "absent" }))
        .await;
    ok(&env);
    assert!(lab.mutations().contains(&"ResetFirmwareToFactoryDefaults".to_string()));
}

#[tokio::test]
async fn test_firmware_restore_uploads_bundle() {
    let lab = Lab::new();
    lab.sim.set(&lab.host, "runtime.inMaintenanceMode", json!(true));
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("configBundle-esxi01.tgz");
    std::fs::write(&bundle, b"bundle").unwrap();

    let env = lab
        .run(
            "host_firmware",
            json!({ "esxi_hostname": "esxi01", "state": "loaded", "src": bundle }),
        )
        .await;
    ok(&env);
    assert!(lab.mutations().contains(&"RestoreFirmwareConfiguration".to_string()));
}

#[tokio::test]
async fn test_storage_io_control() {
    let lab = Lab::new();
    lab.sim.add_datastore(&lab.dc, "ds1", &[lab.host.clone()]);
    let args = json!({ "datastore_name": "ds1", "state": "enabled", "congestion_threshold_manual": 20 });

    let env = lab.run("datastore_io_control", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["ConfigureDatastoreIORM_Task"]);

    lab.reset();
    let again = lab.run("datastore_io_control", args).await;
    assert_eq!(again["changed"], false);
}

#[tokio::test]
async fn test_storage_io_control_thresholds() {
    let lab = Lab::new();
    lab.sim.add_datastore(&lab.dc, "ds1", &[lab.host.clone()]);
    for args in [
        json!({ "datastore_name": "ds1", "congestion_threshold_percentage": 49 }),
        json!({ "datastore_name": "ds1", "congestion_threshold_percentage": 101 }),
        json!({ "datastore_name": "ds1", "congestion_threshold_manual": 4 }),
        json!({ "datastore_name": "ds1", "congestion_threshold_percentage": 80, "congestion_threshold_manual": 20 }),
    ] {
        failed_with(&lab.run("datastore_io_control", args).await, "InvalidArgument");
    }
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_datastore_file_touch_upload_and_delete() {
    let lab = Lab::new();
    lab.sim.add_datastore(&lab.dc, "ds1", &[lab.host.clone()]);
    let base = json!({ "datacenter": "DC0", "datastore": "ds1" });
    let with = |extra: serde_json::Value| {
        let mut args = base.clone();
        for (k, v) in extra.as_object().cloned().unwrap_or_default() {
            args[k] = v;
        }
        args
    };

    let missing = lab.run("datastore_file", with(json!({ "path": "notes.txt" }))).await;
    failed_with(&missing, "NotFound");

    let touched = lab
        .run("datastore_file", with(json!({ "path": "notes.txt", "state": "touch" })))
        .await;
    ok(&touched);
    assert_eq!(touched["changed"], true);
    let url = touched["result"]["url"].as_str().expect("url").to_string();
    assert_eq!(lab.sim.file(&url), Some(Vec::new()));

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("seed.iso");
    std::fs::write(&src, b"ISO").unwrap();
    let upload = with(json!({ "path": "notes.txt", "state": "upload", "src": src }));
    let skipped = lab.run("datastore_file", upload.clone()).await;
    assert_eq!(skipped["changed"], false);
    let mut forced = upload;
    forced["force"] = json!(true);
    ok(&lab.run("datastore_file", forced).await);
    assert_eq!(lab.sim.file(&url), Some(b"ISO".to_vec()));

    let deleted = lab
        .run("datastore_file", with(json!({ "path": "notes.txt", "state": "absent" })))
        .await;
    ok(&deleted);
    assert_eq!(deleted["changed"], true);
    assert_eq!(lab.sim.file(&url), None);
}

#[tokio::test]
async fn test_object_info_properties() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let env = lab
        .run(
            "object_info",
            json!({ "object_type": "VirtualMachine", "object_name": "web01", "properties": ["name"] }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], false);
    assert_eq!(env["object"]["name"], "web01");
    assert_eq!(env["object"]["moid"], vm.value.as_str());
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_object_info_ambiguous_name() {
    let lab = Lab::new();
    lab.vm("web01");
    lab.vm("web01");
    let env = lab
        .run("object_info", json!({ "object_type": "VirtualMachine", "object_name": "web01" }))
        .await;
    failed_with(&env, "Ambiguous");

    let first = lab
        .run(
            "object_info",
            json!({ "object_type": "VirtualMachine", "object_name": "web01", "name_match": "first" }),
        )
        .await;
    ok(&first);
}

#[tokio::test]
async fn test_cluster_ha() {
    let lab = Lab::new();
    let args = json!({ "cluster_name": "C0", "enable": true, "ha_host_monitoring": true, "failover_level": 1 });
    let env = lab.run("cluster_ha", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["ReconfigureComputeResource_Task"]);

    lab.reset();
    let again = lab.run("cluster_ha", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
}

#[tokio::test]
async fn test_cluster_vsan() {
    let lab = Lab::new();
    let env = lab
        .run(
            "cluster_vsan",
            json!({
                "cluster_name": "C0",
                "enable": true,
                "advanced_options": { "object_repair_timer": 120 },
            }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert!(lab.mutations().contains(&"VsanClusterReconfig".to_string()));
}

#[tokio::test]
async fn test_rename_check_mode() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let env = lab
        .check(
            "object_rename",
            json!({ "object_type": "VirtualMachine", "object_name": "web01", "new_name": "web02" }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["rename_status"]["current_name"], "web01");
    assert_eq!(lab.sim.get(&vm, "name"), Some(json!("web01")));
}
