//! Tags, storage policies, permissions and storage providers.

mod common;

use serde_json::json;
use vcmod_core::GlobalPermission;

use common::{Lab, failed_with, ok};

#[tokio::test]
async fn test_category_lifecycle() {
    let lab = Lab::new();
    let args = json!({
        "category_name": "environment",
        "category_description": "Deployment stage",
        "category_cardinality": "multiple",
        "associable_object_types": ["VirtualMachine", "HostSystem"],
    });

    let env = lab.run("category", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["POST"]);
    let categories = lab.sim.categories();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0]["cardinality"], "MULTIPLE");
    assert_eq!(env["category_results"]["category_id"], categories[0]["id"]);

    lab.reset();
    let again = lab.run("category", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());

    lab.reset();
    let gone = lab
        .run("category", json!({ "category_name": "environment", "state": "absent" }))
        .await;
    ok(&gone);
    assert_eq!(gone["changed"], true);
    assert_eq!(gone["category_results"]["state"], "absent");
    assert!(lab.sim.categories().is_empty());
}

#[tokio::test]
async fn test_category_cardinality_cannot_narrow() {
    let lab = Lab::new();
    lab.sim.add_category("environment", "MULTIPLE", &["VirtualMachine"]);

    let env = lab
        .run(
            "category",
            json!({ "category_name": "environment", "category_cardinality": "single" }),
        )
        .await;
    failed_with(&env, "InvalidArgument");
    assert!(lab.mutations().is_empty());
    assert_eq!(lab.sim.categories()[0]["cardinality"], "MULTIPLE");
}

#[tokio::test]
async fn test_tag_in_category() {
    let lab = Lab::new();
    let category = lab.sim.add_category("environment", "SINGLE", &[]);
    let args = json!({ "tag_name": "prod", "tag_description": "Production", "category_name": "environment" });

    let env = lab.run("tag", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["tag_status"]["category_id"], category.as_str());
    let tags = lab.sim.tags();
    assert_eq!(tags.len(), 1);
    assert_eq!(env["tag_status"]["tag_id"], tags[0]["id"]);

    lab.reset();
    let again = lab.run("tag", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_tag_needs_existing_category() {
    let lab = Lab::new();
    let env = lab.run("tag", json!({ "tag_name": "prod", "category_name": "nope" })).await;
    failed_with(&env, "NotFound");
    assert!(lab.sim.tags().is_empty());
}

#[tokio::test]
async fn test_tag_category_choice_is_exclusive() {
    let lab = Lab::new();
    let env = lab
        .run(
            "tag",
            json!({ "tag_name": "prod", "category_name": "environment", "category_id": "urn:x" }),
        )
        .await;
    failed_with(&env, "InvalidArgument");
    assert_eq!(lab.sim.opens(), 0);
}

#[tokio::test]
async fn test_storage_policy_from_tag() {
    let lab = Lab::new();
    let category = lab.sim.add_category("tier", "SINGLE", &["Datastore"]);
    lab.sim.add_tag(&category, "gold");
    let args = json!({ "name": "gold-placement", "tag_category": "tier", "tag_name": "gold" });

    let env = lab.run("storage_policy", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["PbmCreate"]);
    assert_eq!(lab.sim.profiles().len(), 1);
    assert_eq!(env["vmware_vm_storage_policy"]["state"], "present");
    assert!(env["vmware_vm_storage_policy"]["id"].is_string());

    lab.reset();
    let again = lab.run("storage_policy", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());

    lab.reset();
    let gone = lab
        .run("storage_policy", json!({ "name": "gold-placement", "state": "absent" }))
        .await;
    ok(&gone);
    assert_eq!(lab.mutations(), vec!["PbmDelete"]);
    assert!(lab.sim.profiles().is_empty());
}

#[tokio::test]
async fn test_storage_policy_needs_existing_tag() {
    let lab = Lab::new();
    lab.sim.add_category("tier", "SINGLE", &["Datastore"]);

    let env = lab
        .run(
            "storage_policy",
            json!({ "name": "gold-placement", "tag_category": "tier", "tag_name": "gold" }),
        )
        .await;
    failed_with(&env, "NotFound");
    assert!(lab.sim.profiles().is_empty());
}

#[tokio::test]
async fn test_storage_policy_present_requires_tag() {
    let lab = Lab::new();
    let env = lab.run("storage_policy", json!({ "name": "gold-placement" })).await;
    failed_with(&env, "InvalidArgument");
    assert_eq!(lab.sim.opens(), 0);
}

#[tokio::test]
async fn test_permission_grant_change_and_revoke() {
    let lab = Lab::new();
    let grant = |role: &str| {
        json!({
            "role": role,
            "principal": "VSPHERE.LOCAL\\ops",
            "object_name": "DC0",
            "object_type": "Datacenter",
        })
    };

    let env = lab.run("permission", grant("Admin")).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["SetEntityPermissions"]);
    assert_eq!(env["changed_permission"]["role_id"], -1);
    let stored = lab.sim.permissions(&lab.dc);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["roleId"], -1);
    assert_eq!(stored[0]["propagate"], true);

    lab.reset();
    let again = lab.run("permission", grant("Admin")).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());

    lab.reset();
    let changed = lab.run("permission", grant("ReadOnly")).await;
    ok(&changed);
    assert_eq!(changed["changed"], true);
    assert_eq!(lab.sim.permissions(&lab.dc)[0]["roleId"], -2);

    lab.reset();
    let mut revoke = grant("ReadOnly");
    revoke["state"] = json!("absent");
    let gone = lab.run("permission", revoke).await;
    ok(&gone);
    assert_eq!(lab.mutations(), vec!["RemoveEntityPermission"]);
    assert!(lab.sim.permissions(&lab.dc).is_empty());
}

#[tokio::test]
async fn test_permission_on_root_by_role_label() {
    let lab = Lab::new();
    let env = lab
        .run(
            "permission",
            json!({
                "role": "Network operators",
                "group": "VSPHERE.LOCAL\\netadmins",
                "object_name": "rootFolder",
                "recursive": false,
            }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed_permission"]["role_id"], 1001);
    assert_eq!(env["changed_permission"]["role"], "NetworkOps");
    assert_eq!(env["changed_permission"]["group"], true);
}

#[tokio::test]
async fn test_permission_unknown_role() {
    let lab = Lab::new();
    let env = lab
        .run(
            "permission",
            json!({ "role": "Wizard", "principal": "ops", "object_name": "DC0", "object_type": "Datacenter" }),
        )
        .await;
    failed_with(&env, "NotFound");
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_global_permission_lifecycle() {
    let lab = Lab::new();
    let args = json!({ "principal": "VSPHERE.LOCAL\\netops", "role": "NetworkOps" });

    let env = lab.run("global_permission", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(lab.mutations(), vec!["add"]);
    let all = lab.sim.global_permissions();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].role_id, 1001);
    assert!(all[0].propagate);

    lab.reset();
    let again = lab.run("global_permission", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());

    lab.reset();
    let gone = lab
        .run(
            "global_permission",
            json!({ "principal": "VSPHERE.LOCAL\\netops", "role": "NetworkOps", "state": "absent" }),
        )
        .await;
    ok(&gone);
    assert_eq!(lab.mutations(), vec!["remove"]);
    assert!(lab.sim.global_permissions().is_empty());
}

#[tokio::test]
async fn test_global_permission_role_change_replaces_entry() {
    let lab = Lab::new();
    lab.sim.add_global_permission(GlobalPermission {
        principal: "VSPHERE.LOCAL\\auditors".to_string(),
        group: true,
        role_id: -2,
        propagate: true,
    });

    let env = lab
        .run(
            "global_permission",
            json!({ "principal": "VSPHERE.LOCAL\\auditors", "group": true, "role": "Admin" }),
        )
        .await;
    ok(&env);
    assert_eq!(env["changed"], true);
    let all = lab.sim.global_permissions();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].role_id, -1);
}

#[tokio::test]
async fn test_vasa_provider_register_and_unregister() {
    let lab = Lab::new();
    let args = json!({
        "name": "array01",
        "url": "https://array01.lab:8443/vasa/version.xml",
        "certificate": "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----",
    });

    let env = lab.run("vasa_provider", args.clone()).await;
    ok(&env);
    assert_eq!(env["changed"], true);
    assert_eq!(env["vasa_provider"]["status"], "online");
    let providers = lab.sim.providers();
    assert_eq!(providers.len(), 1);
    assert_eq!(env["vasa_provider"]["uid"], providers[0]["uid"]);

    lab.reset();
    let again = lab.run("vasa_provider", args).await;
    ok(&again);
    assert_eq!(again["changed"], false);
    assert!(lab.mutations().is_empty());

    lab.reset();
    let gone = lab.run("vasa_provider", json!({ "name": "array01", "state": "absent" })).await;
    ok(&gone);
    assert_eq!(lab.mutations(), vec!["UnregisterProvider_Task"]);
    assert!(lab.sim.providers().is_empty());
}

#[tokio::test]
async fn test_vasa_provider_trusts_presented_certificate() {
    let lab = Lab::new();
    let presented = "-----BEGIN CERTIFICATE-----\nMIIC\n-----END CERTIFICATE-----";
    lab.sim.require_certificate(presented);

    let env = lab
        .run(
            "vasa_provider",
            json!({ "name": "array02", "url": "https://array02.lab:8443/vasa/version.xml" }),
        )
        .await;
    ok(&env);
    assert_eq!(lab.mutations(), vec!["RegisterProvider_Task", "RegisterProvider_Task"]);
    let providers = lab.sim.providers();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["certificate"], presented);
}

#[tokio::test]
async fn test_vasa_provider_url_change_registers_again() {
    let lab = Lab::new();
    lab.sim.add_provider("array03", "https://old.lab/vasa/version.xml", "PEM");

    let env = lab
        .run(
            "vasa_provider",
            json!({ "name": "array03", "url": "https://new.lab/vasa/version.xml", "certificate": "PEM" }),
        )
        .await;
    ok(&env);
    assert_eq!(lab.mutations(), vec!["UnregisterProvider_Task", "RegisterProvider_Task"]);
    let providers = lab.sim.providers();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["url"], "https://new.lab/vasa/version.xml");
}
