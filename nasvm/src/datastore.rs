use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nasvm_protocol::{DeviceRecord, VmDefinition, VmRecord, VmSpec};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Device kinds accepted when devices are added to an existing VM.
const DEVICE_TYPES: &[&str] = &["NIC", "DISK", "CDROM", "VNC", "RAW"];

/// Row filter for [`VmStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub autostart: Option<bool>,
}

impl VmFilter {
    pub fn id(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn autostart() -> Self {
        Self {
            autostart: Some(true),
            ..Self::default()
        }
    }

    fn matches(&self, vm: &VmRecord) -> bool {
        self.id.map_or(true, |id| vm.id == id)
            && self.name.as_deref().map_or(true, |name| vm.name == name)
            && self.autostart.map_or(true, |a| vm.autostart == a)
    }
}

/// Persistent VM and device tables.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// VMs matching `filter`, ordered by name, each with its devices attached.
    async fn query(&self, filter: &VmFilter) -> Result<Vec<VmDefinition>>;

    /// Insert a VM and its devices. Returns the new VM id.
    async fn insert(&self, definition: VmDefinition) -> Result<u64>;

    /// Add one device to an existing VM. Returns false if the VM does not
    /// exist or the device kind is unknown.
    async fn add_device(&self, vm_id: u64, device: DeviceRecord) -> Result<bool>;

    /// Replace the attributes of a VM's devices, pairing them up in order.
    /// Pairs of different kinds are skipped. Returns false if the number of
    /// devices differs.
    async fn update_devices(&self, vm_id: u64, devices: Vec<DeviceRecord>) -> Result<bool>;

    /// Delete a VM and its devices. Returns whether it existed.
    async fn delete(&self, vm_id: u64) -> Result<bool>;

    async fn get(&self, vm_id: u64) -> Result<Option<VmDefinition>> {
        Ok(self.query(&VmFilter::id(vm_id)).await?.into_iter().next())
    }

    /// Fetch and validate a VM. `Ok(None)` if it does not exist.
    async fn get_spec(&self, vm_id: u64) -> Result<Option<VmSpec>> {
        match self.get(vm_id).await? {
            Some(def) => Ok(Some(VmSpec::from_definition(&def)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    vms: Vec<VmRecord>,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

impl Tables {
    fn next_vm_id(&self) -> u64 {
        self.vms.iter().map(|v| v.id).max().unwrap_or(0) + 1
    }

    fn next_device_id(&self) -> u64 {
        self.devices.iter().filter_map(|d| d.id).max().unwrap_or(0) + 1
    }

    /// Devices of `vm_id` in insertion order, with the join keys stripped.
    fn devices_of(&self, vm_id: u64) -> Vec<DeviceRecord> {
        let mut devices: Vec<&DeviceRecord> = self
            .devices
            .iter()
            .filter(|d| d.vm == Some(vm_id))
            .collect();
        devices.sort_by_key(|d| d.id);
        devices
            .into_iter()
            .map(|d| DeviceRecord {
                id: None,
                vm: None,
                ..d.clone()
            })
            .collect()
    }

    fn push_device(&mut self, vm_id: u64, device: DeviceRecord) {
        let id = self.next_device_id();
        self.devices.push(DeviceRecord {
            id: Some(id),
            vm: Some(vm_id),
            ..device
        });
    }
}

/// [`VmStore`] kept in memory and mirrored to a JSON file.
pub struct JsonStore {
    /// `None` for a purely in-memory store.
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl JsonStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: &Path) -> Result<Self> {
        let tables = if path.exists() {
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading datastore: {}", path.display()))?;
            let tables: Tables = serde_json::from_str(&data)
                .with_context(|| format!("parsing datastore: {}", path.display()))?;
            if tables.schema_version > 1 {
                warn!(
                    version = tables.schema_version,
                    "datastore has newer schema version than supported (1), some fields may be lost"
                );
            }
            debug!(path = %path.display(), vms = tables.vms.len(), "datastore loaded");
            tables
        } else {
            info!(path = %path.display(), "no datastore file, starting empty");
            Tables::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            tables: RwLock::new(tables),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    async fn save(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating datastore directory: {}", parent.display()))?;
        }

        let data = serde_json::to_string_pretty(&Tables {
            schema_version: 1,
            ..tables.clone()
        })
        .context("serializing datastore")?;

        // Write to temp file then rename (atomic on same filesystem)
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("writing temp datastore: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("renaming temp datastore to: {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl VmStore for JsonStore {
    async fn query(&self, filter: &VmFilter) -> Result<Vec<VmDefinition>> {
        let tables = self.tables.read().await;
        let mut result: Vec<VmDefinition> = tables
            .vms
            .iter()
            .filter(|vm| filter.matches(vm))
            .map(|vm| VmDefinition {
                vm: vm.clone(),
                devices: tables.devices_of(vm.id),
            })
            .collect();
        result.sort_by(|a, b| a.vm.name.cmp(&b.vm.name));
        Ok(result)
    }

    async fn insert(&self, definition: VmDefinition) -> Result<u64> {
        let mut tables = self.tables.write().await;
        if tables.vms.iter().any(|vm| vm.name == definition.vm.name) {
            bail!("a VM named '{}' already exists", definition.vm.name);
        }

        let id = tables.next_vm_id();
        tables.vms.push(VmRecord {
            id,
            ..definition.vm
        });
        for device in definition.devices {
            tables.push_device(id, device);
        }

        self.save(&tables).await?;
        info!(id, "VM created");
        Ok(id)
    }

    async fn add_device(&self, vm_id: u64, device: DeviceRecord) -> Result<bool> {
        if !DEVICE_TYPES.contains(&device.dtype.as_str()) {
            return Ok(false);
        }
        let mut tables = self.tables.write().await;
        if !tables.vms.iter().any(|vm| vm.id == vm_id) {
            return Ok(false);
        }
        tables.push_device(vm_id, device);
        self.save(&tables).await?;
        Ok(true)
    }

    async fn update_devices(&self, vm_id: u64, devices: Vec<DeviceRecord>) -> Result<bool> {
        let mut tables = self.tables.write().await;

        let mut existing: Vec<&mut DeviceRecord> = tables
            .devices
            .iter_mut()
            .filter(|d| d.vm == Some(vm_id))
            .collect();
        if existing.len() != devices.len() {
            return Ok(false);
        }
        existing.sort_by_key(|d| d.id);

        for (old, new) in existing.into_iter().zip(devices) {
            if old.dtype == new.dtype {
                old.attributes = new.attributes;
            } else {
                debug!(vm_id, old = %old.dtype, new = %new.dtype, "device kind differs, skipping");
            }
        }

        self.save(&tables).await?;
        Ok(true)
    }

    async fn delete(&self, vm_id: u64) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.vms.len();
        tables.vms.retain(|vm| vm.id != vm_id);
        if tables.vms.len() == before {
            return Ok(false);
        }
        tables.devices.retain(|d| d.vm != Some(vm_id));
        self.save(&tables).await?;
        info!(id = vm_id, "VM deleted");
        Ok(true)
    }
}
