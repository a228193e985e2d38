//! Shared test utilities for vcmod-modules integration tests.

#![allow(dead_code)]

use serde_json::{Value, json};
use vcmod_core::{FileConfig, execute};
use vcmod_core::value::MoRef;
use vcmod_sim::{DEFAULT_PASSWORD, Sim, SimConnector};

/// A simulated vCenter with one datacenter, one cluster and one host.
pub struct Lab {
    pub sim: Sim,
    pub dc: MoRef,
    pub cluster: MoRef,
    pub host: MoRef,
}

impl Lab {
    pub fn new() -> Self {
        let sim = Sim::new();
        let dc = sim.add_datacenter("DC0");
        let cluster = sim.add_cluster(&dc, "C0");
        let host = sim.add_host(&cluster, "esxi01");
        Self { sim, dc, cluster, host }
    }

    /// A powered-off VM on the lab host.
    pub fn vm(&self, name: &str) -> MoRef {
        self.sim.add_vm(&self.host, name)
    }

    pub async fn run(&self, module: &str, args: Value) -> Value {
        run(&self.sim, module, args).await
    }

    pub async fn check(&self, module: &str, args: Value) -> Value {
        run(&self.sim, module, with_flag(args, "_ansible_check_mode")).await
    }

    pub async fn diff(&self, module: &str, args: Value) -> Value {
        run(&self.sim, module, with_flag(args, "_ansible_diff")).await
    }

    /// Names of the mutating calls made since the last [`Lab::reset`].
    pub fn mutations(&self) -> Vec<String> {
        self.sim.mutating_calls().into_iter().map(|c| c.method).collect()
    }

    pub fn reset(&self) {
        self.sim.clear_calls();
    }
}

fn with_flag(mut args: Value, flag: &str) -> Value {
    args[flag] = json!(true);
    args
}

/// Tasks finish immediately in the simulator; poll fast anyway.
pub fn file_config() -> FileConfig {
    FileConfig::parse("[tasks]\npoll_interval_ms = 5\ndefault_timeout_secs = 5\n").expect("valid config")
}

fn no_env(_: &str) -> Option<String> {
    None
}

/// Run `module` against `sim` with lab credentials filled in.
pub async fn run(sim: &Sim, module: &str, mut args: Value) -> Value {
    let m = vcmod_modules::find(module).unwrap_or_else(|| panic!("no module {module}"));
    for (key, value) in [
        ("hostname", "vcenter.lab"),
        ("username", "administrator@vsphere.local"),
        ("password", DEFAULT_PASSWORD),
    ] {
        if args.get(key).is_none() {
            args[key] = json!(value);
        }
    }
    let connector = SimConnector::new(sim.clone());
    execute(m.as_ref(), args, &connector, &file_config(), &no_env).await
}

/// Panic with the envelope when a run failed.
pub fn ok(envelope: &Value) -> &Value {
    assert_eq!(envelope["failed"], false, "module failed: {envelope:#}");
    envelope
}

pub fn failed_with<'a>(envelope: &'a Value, kind: &str) -> &'a Value {
    assert_eq!(envelope["failed"], true, "module succeeded: {envelope:#}");
    assert_eq!(envelope["kind"], kind, "unexpected failure: {envelope:#}");
    envelope
}
