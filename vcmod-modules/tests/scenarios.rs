//! End-to-end runs of whole invocations against the simulator.

mod common;

use serde_json::json;
use vcmod_core::redact::MASK;
use vcmod_core::value::MoRef;
use vcmod_sim::Sim;

use common::{Lab, failed_with, ok, run};

#[tokio::test]
async fn test_create_cluster() {
    let sim = Sim::new();
    let dc = sim.add_datacenter("DC0");

    let env = run(&sim, "cluster", json!({ "datacenter": "DC0", "cluster_name": "C0" })).await;
    ok(&env);
    assert_eq!(env["changed"], true);

    let cluster = sim.find("ClusterComputeResource", "C0").expect("cluster created");
    let parent = sim.get(&cluster, "parent").and_then(|p| MoRef::from_value(&p));
    assert_eq!(parent, Some(sim.folder_of(&dc, "host")));
    assert_eq!(env["result"]["moid"], cluster.value.as_str());
    let creates = sim.methods().into_iter().filter(|m| m == "CreateClusterEx").count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_create_cluster_is_idempotent() {
    let sim = Sim::new();
    sim.add_datacenter("DC0");
    let args = json!({ "datacenter": "DC0", "cluster_name": "C0" });

    ok(&run(&sim, "cluster", args.clone()).await);
    sim.clear_calls();
    let env = run(&sim, "cluster", args).await;
    ok(&env);
    assert_eq!(env["changed"], false);
    assert!(sim.mutating_calls().is_empty(), "{:?}", sim.methods());
}

#[tokio::test]
async fn test_reconfigure_drs() {
    let lab = Lab::new();
    let env = lab
        .run(
            "cluster_drs",
            json!({
                "cluster_name": "C0",
                "enable": true,
                "drs_default_vm_behavior": "partiallyAutomated",
                "drs_vmotion_rate": 3,
                "advanced_settings": { "TryBalanceVmsPerHost": "1" },
            }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);

    let calls = lab.sim.mutating_calls();
    assert_eq!(calls.len(), 1, "{calls:?}");
    assert_eq!(calls[0].method, "ReconfigureComputeResource_Task");
    let drs = &calls[0].args["spec"]["drsConfig"];
    assert_eq!(drs["vmotionRate"], 3);
    assert_eq!(drs["defaultVmBehavior"], "partiallyAutomated");
    let options = drs["option"].as_array().expect("advanced options");
    assert!(options.iter().any(|o| o["key"] == "TryBalanceVmsPerHost"));

    // Applying it again changes nothing.
    lab.reset();
    let again = lab
        .run(
            "cluster_drs",
            json!({
                "cluster_name": "C0",
                "enable": true,
                "drs_default_vm_behavior": "partiallyAutomated",
                "drs_vmotion_rate": 3,
                "advanced_settings": { "TryBalanceVmsPerHost": "1" },
            }),
        )
        .await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_rename_by_moid() {
    let lab = Lab::new();
    let vm = lab.sim.add_vm_with_id(&lab.host, "rhel8-template", "vm-42");

    let env = lab
        .run(
            "object_rename",
            json!({ "object_type": "VirtualMachine", "object_moid": "vm-42", "new_name": "rhel9" }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["rename_status"]["previous_name"], "rhel8-template");
    assert_eq!(env["rename_status"]["current_name"], "rhel9");
    assert_eq!(lab.mutations(), vec!["Rename_Task"]);
    assert_eq!(lab.sim.get(&vm, "name"), Some(json!("rhel9")));
}

#[tokio::test]
async fn test_force_mount_snapshot_volume() {
    let lab = Lab::new();
    let device = "/vmfs/devices/disks/naa.600a098038304437415d4b6a59684a52:1";
    lab.sim.add_unresolved_volume(&lab.host, "snap_ds", device);

    let env = lab
        .run("vmfs_datastore", json!({ "datastore_name": "snap_ds", "state": "mounted" }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);

    let calls = lab.sim.mutating_calls();
    let resolve = calls
        .iter()
        .find(|c| c.method == "ResolveMultipleUnresolvedVmfsVolumes")
        .expect("volume resolved");
    let spec = &resolve.args["resolutionSpec"][0];
    assert_eq!(spec["uuidResolution"], "forceMount");
    assert_eq!(spec["extentDevicePath"], json!([device]));
    assert!(lab.sim.find("Datastore", "snap_ds").is_some());
}

#[tokio::test]
async fn test_assign_license_to_host() {
    let lab = Lab::new();
    let key = "4J4TK-0P19N-08V8C-0T0AH-CAWJ5";

    let env = lab.run("license", json!({ "license": key, "esxi_hostname": "esxi01" })).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    let methods = lab.mutations();
    assert_eq!(methods, vec!["AddLicense", "UpdateAssignedLicense"]);
    assert!(env["licenses"].as_array().is_some_and(|l| l.contains(&json!(key))));
    assert_eq!(lab.sim.assigned(&lab.host.value).as_deref(), Some(key));
}

#[tokio::test]
async fn test_check_mode_makes_no_changes() {
    let sim = Sim::new();
    sim.add_datacenter("DC0");
    let args = json!({ "datacenter": "DC0", "cluster_name": "C0", "_ansible_check_mode": true });

    let env = run(&sim, "cluster", args).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert!(sim.mutating_calls().is_empty(), "{:?}", sim.methods());
    assert!(sim.find("ClusterComputeResource", "C0").is_none());
}

#[tokio::test]
async fn test_check_mode_reports_no_change_when_converged() {
    let lab = Lab::new();
    let env = lab
        .check("cluster", json!({ "datacenter": "DC0", "cluster_name": "C0" }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], false);
}

#[tokio::test]
async fn test_diff_is_reported_on_request() {
    let lab = Lab::new();
    let env = lab
        .diff("cluster_drs", json!({ "cluster_name": "C0", "drs_vmotion_rate": 5 }))
        .await;
    ok(&env);
    assert!(env["diff"]["before"].is_object());
    assert!(env["diff"]["after"].is_object());

    let quiet = lab.run("cluster_drs", json!({ "cluster_name": "C0", "drs_vmotion_rate": 1 })).await;
    assert!(quiet.get("diff").is_none());
}

#[tokio::test]
async fn test_secret_values_are_masked() {
    let sim = Sim::new();
    sim.add_datacenter("DC0");
    sim.set_password("DC9");

    // The datacenter name happens to equal the password.
    let env = run(
        &sim,
        "cluster",
        json!({ "datacenter": "DC9", "cluster_name": "C0", "password": "DC9" }),
    )
    .await;
    failed_with(&env, "NotFound");
    let msg = env["msg"].as_str().unwrap_or_default();
    assert!(!msg.contains("DC9"), "{msg}");
    assert!(msg.contains(MASK), "{msg}");
}

#[tokio::test]
async fn test_short_password_keeps_envelope_keys() {
    let sim = Sim::new();
    sim.add_datacenter("DC0");
    sim.set_password("ang");

    let env = run(
        &sim,
        "cluster",
        json!({ "datacenter": "DC0", "cluster_name": "C9", "password": "ang" }),
    )
    .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert!(env.get("ch********ed").is_none(), "{env:#}");
}

#[tokio::test]
async fn test_session_closed_after_failure() {
    let lab = Lab::new();
    lab.sim.fail_with("Rename_Task", "DuplicateName", "The name 'rhel9' already exists.");
    lab.sim.add_vm_with_id(&lab.host, "web01", "vm-7");

    let env = lab
        .run(
            "object_rename",
            json!({ "object_type": "VirtualMachine", "object_moid": "vm-7", "new_name": "rhel9" }),
        )
        .await;
    assert_eq!(env["failed"], true);
    assert_eq!(lab.sim.opens(), 1);
    assert_eq!(lab.sim.closes(), 1);
}

#[tokio::test]
async fn test_stuck_task_times_out() {
    let lab = Lab::new();
    lab.sim.hold("Rename_Task");
    let vm = lab.sim.add_vm_with_id(&lab.host, "web01", "vm-7");

    let env = lab
        .run(
            "object_rename",
            json!({ "object_type": "VirtualMachine", "object_moid": "vm-7", "new_name": "web02" }),
        )
        .await;
    failed_with(&env, "Timeout");
    let msg = env["msg"].as_str().unwrap();
    assert!(msg.starts_with("Rename_Task"), "{msg}");
    assert!(msg.contains("server-side task continues"), "{msg}");
    assert_eq!(lab.sim.get(&vm, "name"), Some(json!("web01")));
    assert_eq!(lab.sim.closes(), 1);
}

#[tokio::test]
async fn test_invalid_arguments_open_no_session() {
    let lab = Lab::new();
    let env = lab.run("cluster", json!({ "cluster_name": "C0", "colour": "blue" })).await;
    failed_with(&env, "InvalidArgument");
    assert_eq!(lab.sim.opens(), 0);
}

#[tokio::test]
async fn test_wrong_password() {
    let lab = Lab::new();
    let env = lab
        .run("cluster", json!({ "datacenter": "DC0", "cluster_name": "C0", "password": "nope" }))
        .await;
    failed_with(&env, "AuthFailed");
    assert_eq!(lab.sim.opens(), 0);
}

#[tokio::test]
async fn test_unverified_certificates_warn() {
    let lab = Lab::new();
    let env = lab
        .run(
            "cluster",
            json!({ "datacenter": "DC0", "cluster_name": "C0", "validate_certs": false }),
        )
        .await;
    ok(&env);
    let warnings = env["warnings"].as_array().expect("warnings");
    assert!(warnings.iter().any(|w| w.as_str().is_some_and(|w| w.contains("certificate"))));
}

#[tokio::test]
async fn test_delete_cluster() {
    let lab = Lab::new();
    let env = lab
        .run("cluster", json!({ "datacenter": "DC0", "cluster_name": "C0", "state": "absent" }))
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert!(!lab.sim.exists(&lab.cluster));
    assert_eq!(env["result"]["state"], "absent");
}
