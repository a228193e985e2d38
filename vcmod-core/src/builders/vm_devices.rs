//! Virtual machine device specs: controllers, disks, CD-ROMs, NICs, TPM
//! and vGPU profiles.
//!
//! New devices carry negative keys from a reserved range per device class
//! so that a disk can reference a controller added in the same
//! reconfigure.

use serde_json::{Value, json};

use super::one_of;
use crate::error::{Error, Result};
use crate::value::{MoRef, ValueExt, scalar_i64, typed};

/// Device classes with their own temporary key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Controller,
    Disk,
    Cdrom,
    Nic,
    Tpm,
    Vgpu,
}

impl DeviceClass {
    fn base(&self) -> i64 {
        match self {
            DeviceClass::Controller => -100,
            DeviceClass::Disk => -200,
            DeviceClass::Cdrom => -300,
            DeviceClass::Nic => -400,
            DeviceClass::Tpm => -500,
            DeviceClass::Vgpu => -600,
        }
    }
}

/// Hands out temporary device keys, decrementing within each range.
#[derive(Debug, Default)]
pub struct TempKeys {
    issued: [i64; 6],
}

impl TempKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, class: DeviceClass) -> i64 {
        let slot = class as usize;
        let key = class.base() - self.issued[slot];
        self.issued[slot] += 1;
        key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Scsi,
    Sata,
    Nvme,
    Ide,
}

impl Bus {
    /// Highest unit number the bus accepts.
    pub fn max_unit(&self) -> i64 {
        match self {
            Bus::Scsi => 15,
            Bus::Sata => 29,
            Bus::Nvme => 14,
            Bus::Ide => 1,
        }
    }

    pub fn check_unit(&self, unit: i64) -> Result<()> {
        if *self == Bus::Scsi && unit == 7 {
            return Err(Error::InvalidArgument(
                "SCSI unit number 7 is reserved for the controller".to_string(),
            ));
        }
        if !(0..=self.max_unit()).contains(&unit) {
            return Err(Error::InvalidArgument(format!(
                "unit number {unit} is out of range for {self:?} (0-{})",
                self.max_unit()
            )));
        }
        Ok(())
    }

    /// Controllers of this bus a VM may have.
    pub fn max_controllers(&self) -> i64 {
        match self {
            Bus::Ide => 2,
            _ => 4,
        }
    }

    /// First free unit number on a controller.
    pub fn free_unit(&self, used: &[i64]) -> Option<i64> {
        (0..=self.max_unit())
            .filter(|u| !(*self == Bus::Scsi && *u == 7))
            .find(|u| !used.contains(u))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerType {
    LsiLogic,
    LsiLogicSas,
    BusLogic,
    Paravirtual,
    Sata,
    Nvme,
    Ide,
}

const CONTROLLER_TYPES: &[(&str, ControllerType)] = &[
    ("lsilogic", ControllerType::LsiLogic),
    ("lsilogicsas", ControllerType::LsiLogicSas),
    ("buslogic", ControllerType::BusLogic),
    ("paravirtual", ControllerType::Paravirtual),
    ("sata", ControllerType::Sata),
    ("nvme", ControllerType::Nvme),
    ("ide", ControllerType::Ide),
];

impl ControllerType {
    pub fn parse(s: &str) -> Result<Self> {
        one_of("controller type", s, CONTROLLER_TYPES)
    }

    pub fn bus(&self) -> Bus {
        match self {
            ControllerType::Sata => Bus::Sata,
            ControllerType::Nvme => Bus::Nvme,
            ControllerType::Ide => Bus::Ide,
            _ => Bus::Scsi,
        }
    }

    pub fn server_type(&self) -> &'static str {
        match self {
            ControllerType::LsiLogic => "VirtualLsiLogicController",
            ControllerType::LsiLogicSas => "VirtualLsiLogicSASController",
            ControllerType::BusLogic => "VirtualBusLogicController",
            ControllerType::Paravirtual => "ParaVirtualSCSIController",
            ControllerType::Sata => "VirtualAHCIController",
            ControllerType::Nvme => "VirtualNVMEController",
            ControllerType::Ide => "VirtualIDEController",
        }
    }

    /// Controller type of a server device, if it is a controller.
    pub fn of_device(device: &Value) -> Option<Self> {
        let t = device.type_name()?;
        CONTROLLER_TYPES
            .iter()
            .map(|(_, c)| *c)
            .find(|c| c.server_type() == t)
            .or(match t {
                "VirtualSATAController" => Some(ControllerType::Sata),
                _ => None,
            })
    }

    pub fn name(&self) -> &'static str {
        CONTROLLER_TYPES
            .iter()
            .find(|(_, c)| c == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }
}

fn device_spec(operation: &str, device: Value, file_operation: Option<&str>) -> Value {
    let mut spec = json!({ "operation": operation });
    if let Some(op) = file_operation {
        spec["fileOperation"] = json!(op);
    }
    spec["device"] = device;
    typed("VirtualDeviceConfigSpec", spec)
}

pub fn add(device: Value) -> Value {
    device_spec("add", device, None)
}

pub fn add_with_file(device: Value) -> Value {
    device_spec("add", device, Some("create"))
}

pub fn edit(device: Value) -> Value {
    device_spec("edit", device, None)
}

/// Remove a device; `destroy_file` also deletes its backing file.
pub fn remove(device: Value, destroy_file: bool) -> Value {
    device_spec("remove", device, destroy_file.then_some("destroy"))
}

/// `VirtualMachineConfigSpec` applying the given device changes.
pub fn config_spec(changes: Vec<Value>) -> Value {
    typed("VirtualMachineConfigSpec", json!({ "deviceChange": changes }))
}

pub fn controller(kind: ControllerType, bus_number: i64, key: i64) -> Result<Value> {
    let bus = kind.bus();
    if !(0..bus.max_controllers()).contains(&bus_number) {
        return Err(Error::InvalidArgument(format!(
            "bus number {bus_number} is out of range for {} controllers (0-{})",
            kind.name(),
            bus.max_controllers() - 1
        )));
    }
    let mut fields = json!({ "key": key, "busNumber": bus_number });
    if bus == Bus::Scsi {
        fields["sharedBus"] = json!("noSharing");
    }
    Ok(typed(kind.server_type(), fields))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    Thin,
    Thick,
    EagerZeroedThick,
}

impl Provisioning {
    pub fn parse(s: &str) -> Result<Self> {
        one_of(
            "disk_type",
            s,
            &[
                ("thin", Provisioning::Thin),
                ("thick", Provisioning::Thick),
                ("eagerzeroedthick", Provisioning::EagerZeroedThick),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskSpec {
    pub size_kb: i64,
    pub controller_key: i64,
    pub unit: i64,
    pub provisioning: Provisioning,
    pub mode: String,
    /// Datastore for the new file; the VM's own when unset.
    pub datastore: Option<MoRef>,
}

/// Parse `10gb`, `512mb`, `1tb` or a bare number of KB.
pub fn parse_size_kb(s: &str) -> Result<i64> {
    let t = s.trim().to_ascii_lowercase();
    let split = t.find(|c: char| !c.is_ascii_digit()).unwrap_or(t.len());
    let (num, unit) = t.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid disk size '{s}'")))?;
    let factor = match unit.trim() {
        "" | "kb" => 1,
        "mb" => 1024,
        "gb" => 1024 * 1024,
        "tb" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::InvalidArgument(format!(
                "invalid disk size unit '{other}'"
            )));
        }
    };
    if n <= 0 {
        return Err(Error::InvalidArgument(format!("disk size must be positive, got '{s}'")));
    }
    Ok(n * factor)
}

pub fn disk(spec: &DiskSpec, bus: Bus, key: i64) -> Result<Value> {
    bus.check_unit(spec.unit)?;
    let mut backing = json!({
        "fileName": "",
        "diskMode": spec.mode,
        "thinProvisioned": spec.provisioning == Provisioning::Thin,
    });
    if spec.provisioning == Provisioning::EagerZeroedThick {
        backing["eagerlyScrub"] = json!(true);
    }
    if let Some(ds) = &spec.datastore {
        backing["datastore"] = ds.to_value();
    }
    Ok(typed(
        "VirtualDisk",
        json!({
            "key": key,
            "backing": typed("VirtualDiskFlatVer2BackingInfo", backing),
            "controllerKey": spec.controller_key,
            "unitNumber": spec.unit,
            "capacityInKB": spec.size_kb,
        }),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdromBacking {
    None,
    Client,
    Iso(String),
}

impl CdromBacking {
    pub fn parse(kind: &str, iso_path: Option<&str>) -> Result<Self> {
        match (kind, iso_path) {
            ("none", _) => Ok(CdromBacking::None),
            ("client", _) => Ok(CdromBacking::Client),
            ("iso", Some(path)) if !path.is_empty() => Ok(CdromBacking::Iso(path.to_string())),
            ("iso", _) => Err(Error::InvalidArgument(
                "iso_path is required when type is iso".to_string(),
            )),
            (other, _) => Err(Error::InvalidArgument(format!(
                "CD-ROM type must be one of none, client, iso, got '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CdromBacking::None => "none",
            CdromBacking::Client => "client",
            CdromBacking::Iso(_) => "iso",
        }
    }

    /// Backing kind of an existing CD-ROM.
    pub fn of_device(device: &Value) -> Self {
        match device.at("backing").and_then(|b| b.type_name()) {
            Some("VirtualCdromIsoBackingInfo") => {
                CdromBacking::Iso(device.str_at("backing.fileName").unwrap_or_default().to_string())
            }
            Some("VirtualCdromRemotePassthroughBackingInfo" | "VirtualCdromRemoteAtapiBackingInfo") => {
                CdromBacking::Client
            }
            _ => CdromBacking::None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            CdromBacking::Iso(path) => typed("VirtualCdromIsoBackingInfo", json!({ "fileName": path })),
            _ => typed(
                "VirtualCdromRemotePassthroughBackingInfo",
                json!({ "deviceName": "", "exclusive": false }),
            ),
        }
    }
}

pub fn cdrom(key: i64, controller_key: i64, unit: i64, bus: Bus, backing: &CdromBacking, connected: bool) -> Result<Value> {
    if !matches!(bus, Bus::Ide | Bus::Sata) {
        return Err(Error::InvalidArgument(
            "CD-ROMs attach to IDE or SATA controllers only".to_string(),
        ));
    }
    bus.check_unit(unit)?;
    let connectable = json!({
        "startConnected": connected && *backing != CdromBacking::None,
        "allowGuestControl": true,
        "connected": connected && *backing != CdromBacking::None,
    });
    Ok(typed(
        "VirtualCdrom",
        json!({
            "key": key,
            "backing": backing.to_value(),
            "connectable": typed("VirtualDeviceConnectInfo", connectable),
            "controllerKey": controller_key,
            "unitNumber": unit,
        }),
    ))
}

/// Re-point an existing CD-ROM at another backing.
pub fn cdrom_rebacked(existing: &Value, backing: &CdromBacking, connected: bool) -> Value {
    let mut device = existing.clone();
    device["backing"] = backing.to_value();
    let on = connected && *backing != CdromBacking::None;
    device["connectable"] = typed(
        "VirtualDeviceConnectInfo",
        json!({ "startConnected": on, "allowGuestControl": true, "connected": on }),
    );
    device
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicType {
    Pcnet32,
    Vmxnet2,
    Vmxnet3,
    E1000,
    E1000e,
    Sriov,
}

const NIC_TYPES: &[(&str, NicType)] = &[
    ("pcnet32", NicType::Pcnet32),
    ("vmxnet2", NicType::Vmxnet2),
    ("vmxnet3", NicType::Vmxnet3),
    ("e1000", NicType::E1000),
    ("e1000e", NicType::E1000e),
    ("sriov", NicType::Sriov),
];

impl NicType {
    pub fn parse(s: &str) -> Result<Self> {
        one_of("device_type", s, NIC_TYPES)
    }

    pub fn server_type(&self) -> &'static str {
        match self {
            NicType::Pcnet32 => "VirtualPCNet32",
            NicType::Vmxnet2 => "VirtualVmxnet2",
            NicType::Vmxnet3 => "VirtualVmxnet3",
            NicType::E1000 => "VirtualE1000",
            NicType::E1000e => "VirtualE1000e",
            NicType::Sriov => "VirtualSriovEthernetCard",
        }
    }

    pub fn of_device(device: &Value) -> Option<Self> {
        let t = device.type_name()?;
        NIC_TYPES.iter().map(|(_, n)| *n).find(|n| n.server_type() == t)
    }

    pub fn name(&self) -> &'static str {
        NIC_TYPES
            .iter()
            .find(|(_, n)| n == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }
}

/// Where a NIC connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicNetwork {
    Standard { name: String, network: MoRef },
    Distributed { switch_uuid: String, portgroup_key: String },
}

impl NicNetwork {
    fn backing(&self) -> Value {
        match self {
            NicNetwork::Standard { name, network } => typed(
                "VirtualEthernetCardNetworkBackingInfo",
                json!({ "deviceName": name, "network": network.to_value() }),
            ),
            NicNetwork::Distributed {
                switch_uuid,
                portgroup_key,
            } => typed(
                "VirtualEthernetCardDistributedVirtualPortBackingInfo",
                json!({
                    "port": typed("DistributedVirtualSwitchPortConnection", json!({
                        "switchUuid": switch_uuid,
                        "portgroupKey": portgroup_key,
                    }))
                }),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    pub kind: NicType,
    pub network: NicNetwork,
    pub mac: Option<String>,
    pub connected: bool,
    /// Physical function backing an SR-IOV adapter.
    pub physical_function: Option<String>,
}

pub fn validate_mac(mac: &str) -> Result<()> {
    let parts: Vec<&str> = mac.split(':').collect();
    let ok = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("'{mac}' is not a valid MAC address")))
    }
}

pub fn nic(spec: &NicSpec, key: i64) -> Result<Value> {
    let mut fields = json!({
        "key": key,
        "backing": spec.network.backing(),
        "connectable": typed("VirtualDeviceConnectInfo", json!({
            "startConnected": spec.connected,
            "allowGuestControl": true,
            "connected": spec.connected,
        })),
    });
    match &spec.mac {
        Some(mac) => {
            validate_mac(mac)?;
            fields["addressType"] = json!("manual");
            fields["macAddress"] = json!(mac);
        }
        None => fields["addressType"] = json!("generated"),
    }
    match (spec.kind, &spec.physical_function) {
        (NicType::Sriov, Some(pf)) => {
            fields["sriovBacking"] = typed(
                "VirtualSriovEthernetCardSriovBackingInfo",
                json!({
                    "physicalFunctionBacking": typed(
                        "VirtualPCIPassthroughDeviceBackingInfo",
                        json!({ "id": pf, "deviceId": "", "systemId": "", "vendorId": 0, "deviceName": "" }),
                    )
                }),
            );
        }
        (NicType::Sriov, None) => {
            return Err(Error::InvalidArgument(
                "an SR-IOV adapter requires physical_function".to_string(),
            ));
        }
        _ => {}
    }
    Ok(typed(spec.kind.server_type(), fields))
}

pub fn tpm(key: i64) -> Value {
    typed("VirtualTPM", json!({ "key": key }))
}

pub fn vgpu(key: i64, profile: &str) -> Result<Value> {
    if profile.trim().is_empty() {
        return Err(Error::InvalidArgument("vgpu profile must not be empty".to_string()));
    }
    Ok(typed(
        "VirtualPCIPassthrough",
        json!({
            "key": key,
            "backing": typed("VirtualPCIPassthroughVmiopBackingInfo", json!({ "vgpu": profile })),
        }),
    ))
}

/// vGPU profile of an existing passthrough device.
pub fn vgpu_profile(device: &Value) -> Option<&str> {
    if device.type_name() != Some("VirtualPCIPassthrough") {
        return None;
    }
    device.str_at("backing.vgpu")
}

pub fn device_key(device: &Value) -> Option<i64> {
    device.get("key").and_then(scalar_i64)
}

/// Unit numbers taken on a controller.
pub fn used_units(devices: &[&Value], controller_key: i64) -> Vec<i64> {
    devices
        .iter()
        .filter(|d| d.i64_at("controllerKey") == Some(controller_key))
        .filter_map(|d| d.i64_at("unitNumber"))
        .collect()
}

/// The controller of a bus with the given bus number.
pub fn find_controller<'a>(devices: &[&'a Value], bus: Bus, bus_number: i64) -> Option<&'a Value> {
    devices.iter().copied().find(|d| {
        ControllerType::of_device(d).is_some_and(|c| c.bus() == bus)
            && d.i64_at("busNumber") == Some(bus_number)
    })
}

/// The device sitting at `unit` on a controller.
pub fn device_at<'a>(devices: &[&'a Value], controller_key: i64, unit: i64) -> Option<&'a Value> {
    devices.iter().copied().find(|d| {
        d.i64_at("controllerKey") == Some(controller_key) && d.i64_at("unitNumber") == Some(unit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_number_legality() {
        for unit in (0..=6).chain(8..=15) {
            assert!(Bus::Scsi.check_unit(unit).is_ok(), "scsi {unit}");
        }
        assert!(Bus::Scsi.check_unit(7).is_err());
        assert!(Bus::Scsi.check_unit(16).is_err());
        assert!(Bus::Sata.check_unit(29).is_ok());
        assert!(Bus::Sata.check_unit(30).is_err());
        assert!(Bus::Nvme.check_unit(14).is_ok());
        assert!(Bus::Nvme.check_unit(15).is_err());
        assert!(Bus::Nvme.check_unit(-1).is_err());
    }

    #[test]
    fn test_free_unit_skips_scsi_seven() {
        let used: Vec<i64> = (0..7).collect();
        assert_eq!(Bus::Scsi.free_unit(&used), Some(8));
        assert_eq!(Bus::Sata.free_unit(&used), Some(7));
    }

    #[test]
    fn test_temp_keys_per_class() {
        let mut keys = TempKeys::new();
        assert_eq!(keys.next(DeviceClass::Controller), -100);
        assert_eq!(keys.next(DeviceClass::Disk), -200);
        assert_eq!(keys.next(DeviceClass::Controller), -101);
        assert_eq!(keys.next(DeviceClass::Nic), -400);
        assert_eq!(keys.next(DeviceClass::Vgpu), -600);
    }

    #[test]
    fn test_disk_on_new_controller() {
        let mut keys = TempKeys::new();
        let ctrl_key = keys.next(DeviceClass::Controller);
        let ctrl = controller(ControllerType::Paravirtual, 1, ctrl_key).unwrap();
        let spec = DiskSpec {
            size_kb: parse_size_kb("10gb").unwrap(),
            controller_key: ctrl_key,
            unit: 0,
            provisioning: Provisioning::Thin,
            mode: "persistent".into(),
            datastore: None,
        };
        let d = disk(&spec, Bus::Scsi, keys.next(DeviceClass::Disk)).unwrap();
        let change = config_spec(vec![add(ctrl), add_with_file(d)]);
        let changes = change.list_at("deviceChange");
        assert_eq!(changes[0].str_at("device._type"), Some("ParaVirtualSCSIController"));
        assert_eq!(changes[1].i64_at("device.controllerKey"), Some(-100));
        assert_eq!(changes[1].i64_at("device.capacityInKB"), Some(10 * 1024 * 1024));
        assert_eq!(changes[1].str_at("fileOperation"), Some("create"));
        assert_eq!(changes[1].bool_at("device.backing.thinProvisioned"), Some(true));
    }

    #[test]
    fn test_disk_rejects_reserved_unit() {
        let spec = DiskSpec {
            size_kb: 1024,
            controller_key: 1000,
            unit: 7,
            provisioning: Provisioning::Thick,
            mode: "persistent".into(),
            datastore: None,
        };
        assert!(disk(&spec, Bus::Scsi, -200).is_err());
        assert!(disk(&spec, Bus::Sata, -200).is_ok());
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!(parse_size_kb("512mb").unwrap(), 512 * 1024);
        assert_eq!(parse_size_kb("2048").unwrap(), 2048);
        assert!(parse_size_kb("ten gb").is_err());
        assert!(parse_size_kb("5pb").is_err());
    }

    #[test]
    fn test_nic_mac_and_sriov() {
        let network = NicNetwork::Standard {
            name: "VM Network".into(),
            network: MoRef::new("Network", "network-1"),
        };
        let mut spec = NicSpec {
            kind: NicType::Vmxnet3,
            network,
            mac: Some("00:50:56:aa:bb:cc".into()),
            connected: true,
            physical_function: None,
        };
        let v = nic(&spec, -400).unwrap();
        assert_eq!(v.str_at("addressType"), Some("manual"));
        spec.mac = Some("00:50:56".into());
        assert!(nic(&spec, -400).is_err());
        spec.mac = None;
        spec.kind = NicType::Sriov;
        assert!(nic(&spec, -400).is_err());
    }

    #[test]
    fn test_cdrom_backings() {
        assert_eq!(CdromBacking::parse("iso", None).unwrap_err().kind(), crate::error::ErrorKind::InvalidArgument);
        let iso = CdromBacking::parse("iso", Some("[ds1] isos/rhel9.iso")).unwrap();
        let dev = cdrom(-300, 200, 0, Bus::Ide, &iso, true).unwrap();
        assert_eq!(CdromBacking::of_device(&dev), iso);
        assert!(cdrom(-300, 1000, 0, Bus::Scsi, &iso, true).is_err());
    }
}
