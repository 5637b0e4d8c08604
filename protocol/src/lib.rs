use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// MAC value the UI stores for "no fixed address". Treated the same as an absent MAC.
pub const UNSET_MAC_SENTINEL: &str = "00:a0:98:FF:FF:FF";

/// OEM prefix used for generated NIC MAC addresses.
pub const MAC_OUI: [u8; 3] = [0x00, 0xa0, 0x98];

/// VNC port of VM 0; each VM defaults to this plus its ID.
pub const VNC_BASE_PORT: u64 = 5900;

/// Framebuffer size used when a VNC device has no fixed resolution.
pub const DEFAULT_VNC_RESOLUTION: (u32, u32) = (1024, 768);

pub const DEFAULT_VNC_BIND: &str = "0.0.0.0";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A VM or device specification that cannot be turned into a hypervisor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),

    #[error("{dtype} device is missing required attribute '{attribute}'")]
    MissingAttribute {
        dtype: &'static str,
        attribute: &'static str,
    },

    #[error("{dtype} device has invalid '{attribute}': {reason}")]
    InvalidAttribute {
        dtype: &'static str,
        attribute: &'static str,
        reason: String,
    },

    #[error("invalid VM definition: {0}")]
    InvalidVm(String),

    #[error("too many devices: at most {max} slotted devices are supported")]
    TooManyDevices { max: u8 },
}

// ---------------------------------------------------------------------------
// Datastore records
// ---------------------------------------------------------------------------

/// Firmware the guest boots with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bootloader {
    /// Legacy boot, no firmware image.
    #[default]
    Grub,
    Uefi,
    /// UEFI firmware with the compatibility support module.
    UefiCsm,
}

impl Bootloader {
    /// File name of the firmware image passed as `bootrom`, if any.
    pub fn firmware_image(&self) -> Option<&'static str> {
        match self {
            Bootloader::Grub => None,
            Bootloader::Uefi => Some("BHYVE_UEFI.fd"),
            Bootloader::UefiCsm => Some("BHYVE_UEFI_CSM.fd"),
        }
    }
}

/// A row of the VM table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub vcpus: u32,
    /// Guest memory in MiB.
    pub memory: u64,
    #[serde(default)]
    pub bootloader: Bootloader,
    #[serde(default)]
    pub autostart: bool,
}

/// A row of the device table. `id` and `vm` are join keys and are stripped
/// when devices are attached to a VM record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<u64>,
    pub dtype: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl DeviceRecord {
    pub fn new(dtype: &str, attributes: Value) -> Self {
        Self {
            id: None,
            vm: None,
            dtype: dtype.to_string(),
            attributes: match attributes {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

/// A VM record with its devices attached, as returned by a datastore query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    #[serde(flatten)]
    pub vm: VmRecord,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

// ---------------------------------------------------------------------------
// Validated specification
// ---------------------------------------------------------------------------

/// Storage bus a disk is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskBus {
    Ahci,
    Virtio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    pub path: String,
    /// Only emitted when set and non-zero.
    pub sector_size: Option<u32>,
    pub bus: DiskBus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdromDevice {
    pub path: String,
}

/// Emulated network adapter model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicModel {
    Virtio,
    E1000,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicDevice {
    /// Physical uplink to bridge with. `None` falls back to the default-route interface.
    pub attach: Option<String>,
    pub model: NicModel,
    /// Fixed MAC. `None` when unset or equal to [`UNSET_MAC_SENTINEL`].
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncDevice {
    pub bind: String,
    pub port: u16,
    pub resolution: Option<(u32, u32)>,
    pub password: Option<String>,
    /// Hold guest boot until a VNC client connects.
    pub wait: bool,
    /// Also expose the console through the web proxy.
    pub web: bool,
}

/// A guest device. Closed set: anything else is rejected when records are loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Disk(DiskDevice),
    Raw(DiskDevice),
    Cdrom(CdromDevice),
    Nic(NicDevice),
    Vnc(VncDevice),
}

impl Device {
    /// Convert a device table row. `vm_id` supplies the default VNC port.
    pub fn from_record(record: &DeviceRecord, vm_id: u64) -> Result<Self, SpecError> {
        let attrs = &record.attributes;
        match record.dtype.as_str() {
            "DISK" => Ok(Device::Disk(parse_disk("DISK", attrs)?)),
            "RAW" => Ok(Device::Raw(parse_disk("RAW", attrs)?)),
            "CDROM" => Ok(Device::Cdrom(CdromDevice {
                path: required_str("CDROM", attrs, "path")?,
            })),
            "NIC" => Ok(Device::Nic(parse_nic(attrs)?)),
            "VNC" => Ok(Device::Vnc(parse_vnc(attrs, vm_id)?)),
            other => Err(SpecError::UnknownDeviceType(other.to_string())),
        }
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Device::Disk(_) => "DISK",
            Device::Raw(_) => "RAW",
            Device::Cdrom(_) => "CDROM",
            Device::Nic(_) => "NIC",
            Device::Vnc(_) => "VNC",
        }
    }
}

fn parse_disk(dtype: &'static str, attrs: &Map<String, Value>) -> Result<DiskDevice, SpecError> {
    let path = required_str(dtype, attrs, "path")?;
    let bus = match optional_str(attrs, "type") {
        None => DiskBus::Virtio,
        Some(t) if t.eq_ignore_ascii_case("AHCI") => DiskBus::Ahci,
        Some(t) if t.eq_ignore_ascii_case("VIRTIO") => DiskBus::Virtio,
        Some(t) => {
            return Err(SpecError::InvalidAttribute {
                dtype,
                attribute: "type",
                reason: format!("unsupported disk bus '{}'", t),
            })
        }
    };
    let sector_size = match optional_u64(dtype, attrs, "sectorsize")? {
        None | Some(0) => None,
        Some(n) => Some(u32::try_from(n).map_err(|_| SpecError::InvalidAttribute {
            dtype,
            attribute: "sectorsize",
            reason: format!("{} is out of range", n),
        })?),
    };
    Ok(DiskDevice {
        path,
        sector_size,
        bus,
    })
}

fn parse_nic(attrs: &Map<String, Value>) -> Result<NicDevice, SpecError> {
    let model = match optional_str(attrs, "type") {
        None => NicModel::E1000,
        Some(t) if t.eq_ignore_ascii_case("VIRTIO") => NicModel::Virtio,
        Some(t) if t.eq_ignore_ascii_case("E1000") => NicModel::E1000,
        Some(t) => {
            return Err(SpecError::InvalidAttribute {
                dtype: "NIC",
                attribute: "type",
                reason: format!("unsupported adapter '{}'", t),
            })
        }
    };
    let mac = match optional_str(attrs, "mac") {
        Some(mac) => normalize_mac(mac)?,
        None => None,
    };
    Ok(NicDevice {
        attach: optional_str(attrs, "nic_attach").map(str::to_string),
        model,
        mac,
    })
}

fn parse_vnc(attrs: &Map<String, Value>, vm_id: u64) -> Result<VncDevice, SpecError> {
    let port = optional_u64("VNC", attrs, "vnc_port")?.unwrap_or(VNC_BASE_PORT + vm_id);
    let port = match u16::try_from(port) {
        Ok(p) if p > 0 => p,
        _ => {
            return Err(SpecError::InvalidAttribute {
                dtype: "VNC",
                attribute: "vnc_port",
                reason: format!("{} is not a valid TCP port", port),
            })
        }
    };
    let resolution = match optional_str(attrs, "vnc_resolution") {
        Some(res) => Some(parse_resolution(res)?),
        None => None,
    };
    Ok(VncDevice {
        bind: optional_str(attrs, "vnc_bind")
            .unwrap_or(DEFAULT_VNC_BIND)
            .to_string(),
        port,
        resolution,
        password: optional_str(attrs, "vnc_password").map(str::to_string),
        wait: optional_bool(attrs, "wait"),
        web: optional_bool(attrs, "vnc_web"),
    })
}

/// Parse a `WIDTHxHEIGHT` resolution string.
pub fn parse_resolution(value: &str) -> Result<(u32, u32), SpecError> {
    let invalid = || SpecError::InvalidAttribute {
        dtype: "VNC",
        attribute: "vnc_resolution",
        reason: format!("expected WIDTHxHEIGHT, got '{}'", value),
    };
    let (w, h) = value.split_once('x').ok_or_else(invalid)?;
    let width: u32 = w.trim().parse().map_err(|_| invalid())?;
    let height: u32 = h.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Normalize a stored MAC. Empty strings and the sentinel mean "generate one".
pub fn normalize_mac(value: &str) -> Result<Option<String>, SpecError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(UNSET_MAC_SENTINEL) {
        return Ok(None);
    }
    let octets: Vec<&str> = value.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(SpecError::InvalidAttribute {
            dtype: "NIC",
            attribute: "mac",
            reason: format!("'{}' is not a MAC address", value),
        });
    }
    Ok(Some(value.to_string()))
}

fn optional_str<'a>(attrs: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(Value::as_str)
}

fn required_str(
    dtype: &'static str,
    attrs: &Map<String, Value>,
    attribute: &'static str,
) -> Result<String, SpecError> {
    match optional_str(attrs, attribute) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(SpecError::MissingAttribute { dtype, attribute }),
    }
}

/// Numeric attribute stored either as a JSON number or a numeric string.
fn optional_u64(
    dtype: &'static str,
    attrs: &Map<String, Value>,
    attribute: &'static str,
) -> Result<Option<u64>, SpecError> {
    let invalid = |v: &Value| SpecError::InvalidAttribute {
        dtype,
        attribute,
        reason: format!("expected a non-negative integer, got {}", v),
    };
    match attrs.get(attribute) {
        None | Some(Value::Null) => Ok(None),
        Some(v @ Value::Number(_)) => v.as_u64().map(Some).ok_or_else(|| invalid(v)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) => s.trim().parse().map(Some).map_err(|_| invalid(v)),
            None => Err(invalid(v)),
        },
    }
}

fn optional_bool(attrs: &Map<String, Value>, key: &str) -> bool {
    attrs.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Immutable VM snapshot taken when a VM is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub vcpus: u32,
    pub memory: u64,
    pub bootloader: Bootloader,
    pub devices: Vec<Device>,
    pub autostart: bool,
}

impl VmSpec {
    /// Validate a VM record and its devices. Malformed devices fail here,
    /// before anything is launched.
    pub fn from_records(vm: &VmRecord, devices: &[DeviceRecord]) -> Result<Self, SpecError> {
        if vm.name.trim().is_empty() {
            return Err(SpecError::InvalidVm("name must not be empty".into()));
        }
        if vm.name.chars().any(char::is_whitespace) {
            return Err(SpecError::InvalidVm(format!(
                "name '{}' must not contain whitespace",
                vm.name
            )));
        }
        if vm.vcpus == 0 {
            return Err(SpecError::InvalidVm("vcpus must be at least 1".into()));
        }
        if vm.memory == 0 {
            return Err(SpecError::InvalidVm("memory must be at least 1 MiB".into()));
        }

        let devices = devices
            .iter()
            .map(|d| Device::from_record(d, vm.id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: vm.id,
            name: vm.name.clone(),
            description: vm.description.clone(),
            vcpus: vm.vcpus,
            memory: vm.memory,
            bootloader: vm.bootloader,
            devices,
            autostart: vm.autostart,
        })
    }

    pub fn from_definition(def: &VmDefinition) -> Result<Self, SpecError> {
        Self::from_records(&def.vm, &def.devices)
    }

    /// The first VNC device, which owns the framebuffer slots.
    pub fn vnc(&self) -> Option<&VncDevice> {
        self.devices.iter().find_map(|d| match d {
            Device::Vnc(v) => Some(v),
            _ => None,
        })
    }

    pub fn vnc_devices(&self) -> impl Iterator<Item = &VncDevice> {
        self.devices.iter().filter_map(|d| match d {
            Device::Vnc(v) => Some(v),
            _ => None,
        })
    }

    /// Uplink interfaces named by this VM's NICs.
    pub fn attached_interfaces(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter_map(|d| match d {
                Device::Nic(nic) => nic.attach.as_deref(),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub state: RunState,
}

impl VmStatus {
    pub fn running() -> Self {
        Self {
            state: RunState::Running,
        }
    }

    pub fn stopped() -> Self {
        Self {
            state: RunState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

impl From<bool> for VmStatus {
    fn from(running: bool) -> Self {
        if running {
            Self::running()
        } else {
            Self::stopped()
        }
    }
}
