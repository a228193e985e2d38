//! Virtual machine device and power modules against the simulator.

mod common;

use serde_json::{Value, json};

use common::{Lab, failed_with, ok};

fn devices_of(lab: &Lab, vm: &vcmod_core::MoRef) -> Vec<Value> {
    lab.sim
        .get(vm, "config.hardware.device")
        .and_then(|d| d.as_array().cloned())
        .unwrap_or_default()
}

fn count(devices: &[Value], kind: &str) -> usize {
    devices.iter().filter(|d| d["_type"] == kind).count()
}

#[tokio::test]
async fn test_add_controller() {
    let lab = Lab::new();
    let vm = lab.vm("db01");
    let args = json!({ "name": "db01", "controller_type": "paravirtual", "bus_number": 1 });

    let env = lab.run("vm_controller", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["ReconfigVM_Task"]);
    assert_eq!(count(&devices_of(&lab, &vm), "ParaVirtualSCSIController"), 2);
    let controllers = env["disk_controller_data"].as_array().expect("controllers");
    assert!(controllers.iter().any(|c| c["bus_number"] == 1 && c["controller_type"] == "paravirtual"));

    lab.reset();
    let again = lab.run("vm_controller", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_controller_with_disks_is_kept() {
    let lab = Lab::new();
    lab.vm("db01");
    let env = lab
        .run(
            "vm_controller",
            json!({ "name": "db01", "controller_type": "paravirtual", "bus_number": 0, "state": "absent" }),
        )
        .await;
    failed_with(&env, "PreconditionFailed");
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_controller_bus_taken_by_other_type() {
    let lab = Lab::new();
    lab.vm("db01");
    let env = lab
        .run("vm_controller", json!({ "name": "db01", "controller_type": "lsilogic", "bus_number": 0 }))
        .await;
    failed_with(&env, "InvalidArgument");
}

#[tokio::test]
async fn test_remove_empty_controller() {
    let lab = Lab::new();
    let vm = lab.vm("db01");
    let add = json!({ "name": "db01", "controller_type": "sata", "bus_number": 0 });
    ok(&lab.run("vm_controller", add.clone()).await);

    let mut remove = add;
    remove["state"] = json!("absent");
    let env = lab.run("vm_controller", remove).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualAHCIController"), 0);
}

#[tokio::test]
async fn test_grow_disk() {
    let lab = Lab::new();
    let vm = lab.vm("db01");
    let args = json!({ "name": "db01", "disk": [{ "unit_number": 0, "size": "20gb" }] });

    let env = lab.run("vm_disk", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    let disk = devices_of(&lab, &vm).into_iter().find(|d| d["_type"] == "VirtualDisk").expect("disk");
    assert_eq!(disk["capacityInKB"], 20 * 1024 * 1024);

    lab.reset();
    let again = lab.run("vm_disk", args).await;
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_disk_cannot_shrink() {
    let lab = Lab::new();
    lab.vm("db01");
    let env = lab
        .run("vm_disk", json!({ "name": "db01", "disk": [{ "unit_number": 0, "size": "8gb" }] }))
        .await;
    failed_with(&env, "InvalidArgument");
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_disk_on_new_controller() {
    let lab = Lab::new();
    let vm = lab.vm("db01");
    let env = lab
        .run(
            "vm_disk",
            json!({
                "name": "db01",
                "disk": [{ "controller_number": 1, "unit_number": 0, "size": "2gb", "type": "thick" }],
            }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);

    let calls = lab.sim.mutating_calls();
    assert_eq!(calls.len(), 1, "{calls:?}");
    let changes = calls[0].args["spec"]["deviceChange"].as_array().expect("device changes");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0]["device"]["_type"], "ParaVirtualSCSIController");
    assert_eq!(changes[1]["fileOperation"], "create");

    let devices = devices_of(&lab, &vm);
    assert_eq!(count(&devices, "VirtualDisk"), 2);
    assert_eq!(env["disk_data"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_disk_reserved_unit() {
    let lab = Lab::new();
    lab.vm("db01");
    let env = lab
        .run("vm_disk", json!({ "name": "db01", "disk": [{ "unit_number": 7, "size": "1gb" }] }))
        .await;
    failed_with(&env, "InvalidArgument");
}

#[tokio::test]
async fn test_remove_disk() {
    let lab = Lab::new();
    let vm = lab.vm("db01");
    let env = lab
        .run("vm_disk", json!({ "name": "db01", "disk": [{ "unit_number": 0, "state": "absent" }] }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualDisk"), 0);
}

#[tokio::test]
async fn test_iso_cdrom() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let args = json!({
        "name": "web01",
        "type": "iso",
        "iso_path": "[ds1] iso/rhel-9.4.iso",
    });

    let env = lab.run("vm_cdrom", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["cdrom_status"]["iso_path"], "[ds1] iso/rhel-9.4.iso");
    let cdrom = devices_of(&lab, &vm).into_iter().find(|d| d["_type"] == "VirtualCdrom").expect("cdrom");
    assert_eq!(cdrom["controllerKey"], 200);
    assert_eq!(cdrom["backing"]["fileName"], "[ds1] iso/rhel-9.4.iso");

    lab.reset();
    let again = lab.run("vm_cdrom", args).await;
    assert_eq!(again["changed"], false);

    let client = lab.run("vm_cdrom", json!({ "name": "web01", "type": "client" })).await;
    ok(&client);
    assert_eq!(client["changed"], true);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualCdrom"), 1);
}

#[tokio::test]
async fn test_iso_cdrom_requires_path() {
    let lab = Lab::new();
    lab.vm("web01");
    let env = lab.run("vm_cdrom", json!({ "name": "web01", "type": "iso" })).await;
    failed_with(&env, "InvalidArgument");
    assert_eq!(lab.sim.opens(), 0);
}

#[tokio::test]
async fn test_add_nic_on_standard_network() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    lab.sim.add_network(&lab.dc, "VM Network");
    lab.sim.add_network(&lab.dc, "Backend");
    let args = json!({ "name": "web01", "network_name": "Backend" });

    let env = lab.run("vm_nic", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualVmxnet3"), 2);
    let nics = env["network_data"].as_array().expect("nics");
    assert!(nics.iter().any(|n| n["network"] == "Backend"));

    lab.reset();
    let again = lab.run("vm_nic", args).await;
    ok(&again);
    assert_eq!(again["changed"], false, "{again:#}");
}

#[tokio::test]
async fn test_nic_on_port_group() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let dvs = lab.sim.add_dvswitch(&lab.dc, "dvs-prod");
    let pg = lab.sim.add_portgroup(&dvs, "pg-app");

    let env = lab.run("vm_nic", json!({ "name": "web01", "network_name": "pg-app" })).await;
    ok(&env);
    let added = devices_of(&lab, &vm)
        .into_iter()
        .find(|d| d["backing"]["port"]["portgroupKey"] == pg.value.as_str())
        .expect("nic on the port group");
    assert!(added["backing"]["port"]["switchUuid"].is_string());
}

#[tokio::test]
async fn test_change_nic_type_replaces_it() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    lab.sim.add_network(&lab.dc, "VM Network");
    let env = lab
        .run(
            "vm_nic",
            json!({ "name": "web01", "label": "Network adapter 1", "network_name": "VM Network", "device_type": "e1000e" }),
        )
        .await;
    ok(&env);
    let calls = lab.sim.mutating_calls();
    let changes = calls[0].args["spec"]["deviceChange"].as_array().expect("device changes");
    let ops: Vec<&str> = changes.iter().filter_map(|c| c["operation"].as_str()).collect();
    assert_eq!(ops, vec!["remove", "add"]);
    let devices = devices_of(&lab, &vm);
    assert_eq!(count(&devices, "VirtualVmxnet3"), 0);
    assert_eq!(count(&devices, "VirtualE1000e"), 1);
}

#[tokio::test]
async fn test_remove_nic_by_mac() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let env = lab
        .run("vm_nic", json!({ "name": "web01", "mac_address": "00:50:56:AA:BB:01", "state": "absent" }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualVmxnet3"), 0);
}

#[tokio::test]
async fn test_invalid_mac() {
    let lab = Lab::new();
    lab.vm("web01");
    lab.sim.add_network(&lab.dc, "VM Network");
    let env = lab
        .run("vm_nic", json!({ "name": "web01", "network_name": "VM Network", "mac_address": "00:50:56:zz" }))
        .await;
    failed_with(&env, "InvalidArgument");
}

#[tokio::test]
async fn test_tpm() {
    let lab = Lab::new();
    let vm = lab.vm("win11");
    let env = lab.run("vm_tpm", json!({ "name": "win11" })).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["tpm_info"]["tpm_present"], true);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualTPM"), 1);

    lab.reset();
    let again = lab.run("vm_tpm", json!({ "name": "win11" })).await;
    assert_eq!(again["changed"], false);

    let removed = lab.run("vm_tpm", json!({ "name": "win11", "state": "absent" })).await;
    ok(&removed);
    assert_eq!(removed["tpm_info"]["tpm_present"], false);
    assert_eq!(count(&devices_of(&lab, &vm), "VirtualTPM"), 0);
}

#[tokio::test]
async fn test_tpm_needs_power_off() {
    let lab = Lab::new();
    let vm = lab.vm("win11");
    lab.sim.set(&vm, "runtime.powerState", json!("poweredOn"));
    let env = lab.run("vm_tpm", json!({ "name": "win11" })).await;
    failed_with(&env, "PreconditionFailed");
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_vgpu_profile() {
    let lab = Lab::new();
    lab.vm("ml01");
    let args = json!({ "name": "ml01", "vgpu": "grid_a40-4q" });

    let env = lab.run("vm_vgpu", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["vgpu_info"]["attached_profiles"], json!(["grid_a40-4q"]));

    lab.reset();
    let again = lab.run("vm_vgpu", args).await;
    assert_eq!(again["changed"], false);

    let removed = lab
        .run("vm_vgpu", json!({ "name": "ml01", "vgpu": "grid_a40-4q", "state": "absent" }))
        .await;
    ok(&removed);
    assert_eq!(removed["vgpu_info"]["attached_profiles"], json!([]));
}

#[tokio::test]
async fn test_power_on_and_off() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let env = lab.run("vm_powerstate", json!({ "name": "web01", "state": "powered-on" })).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.sim.get(&vm, "runtime.powerState"), Some(json!("poweredOn")));

    let again = lab.run("vm_powerstate", json!({ "name": "web01", "state": "powered-on" })).await;
    assert_eq!(again["changed"], false);

    let off = lab.run("vm_powerstate", json!({ "name": "web01", "state": "powered-off" })).await;
    ok(&off);
    assert_eq!(lab.sim.get(&vm, "runtime.powerState"), Some(json!("poweredOff")));
}

#[tokio::test]
async fn test_power_on_answers_question() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    lab.sim.ask(
        &vm,
        "msg.uuid.altered",
        "This virtual machine might have been moved or copied.",
        &[("0", "Cancel"), ("1", "I Moved It"), ("2", "I Copied It")],
    );

    let env = lab
        .run(
            "vm_powerstate",
            json!({
                "name": "web01",
                "state": "powered-on",
                "answer": [{ "question": "msg.uuid.altered", "response": "I Copied It" }],
            }),
        )
        .await;
    ok(&env);
    assert_eq!(lab.sim.answers(&vm), vec!["2"]);
    assert_eq!(lab.sim.get(&vm, "runtime.powerState"), Some(json!("poweredOn")));
}

#[tokio::test]
async fn test_unanswered_question_fails() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    lab.sim.ask(&vm, "msg.uuid.altered", "Moved or copied?", &[("1", "I Moved It"), ("2", "I Copied It")]);
    let env = lab.run("vm_powerstate", json!({ "name": "web01", "state": "powered-on" })).await;
    failed_with(&env, "PreconditionFailed");
    assert!(lab.sim.answers(&vm).is_empty());
}

#[tokio::test]
async fn test_guest_shutdown_requires_running_vm() {
    let lab = Lab::new();
    lab.vm("web01");
    let env = lab
        .run("vm_powerstate", json!({ "name": "web01", "state": "reboot-guest" }))
        .await;
    failed_with(&env, "PreconditionFailed");
}

#[tokio::test]
async fn test_power_check_mode() {
    let lab = Lab::new();
    let vm = lab.vm("web01");
    let env = lab.check("vm_powerstate", json!({ "name": "web01", "state": "powered-on" })).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.sim.get(&vm, "runtime.powerState"), Some(json!("poweredOff")));
}
