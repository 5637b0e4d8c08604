//! Fakes and helpers shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use nasvm_protocol::{Bootloader, DeviceRecord, VmRecord, VmSpec};
use parking_lot::Mutex;

use crate::network::NetworkDriver;
use crate::vm::bhyve::{ControlOp, HypervisorControl};

pub fn vm_record(id: u64) -> VmRecord {
    VmRecord {
        id,
        name: format!("vm{}", id),
        description: String::new(),
        vcpus: 2,
        memory: 1024,
        bootloader: Bootloader::Grub,
        autostart: false,
    }
}

pub fn spec_with(id: u64, devices: Vec<DeviceRecord>) -> VmSpec {
    VmSpec::from_records(&vm_record(id), &devices).unwrap()
}

/// Write an executable `/bin/sh` script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetState {
    interfaces: Vec<String>,
    mtus: HashMap<String, u32>,
    bridges: HashMap<String, Vec<String>>,
    up: HashSet<String>,
    default_route: Option<String>,
    next_tap: u32,
    created_bridges: usize,
    destroyed: Vec<String>,
    fail_tap: bool,
    member_delay: Duration,
}

/// In-memory host network that records every operation.
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<NetState>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interface(&self, name: &str, mtu: u32) {
        let mut s = self.state.lock();
        s.interfaces.push(name.to_string());
        s.mtus.insert(name.to_string(), mtu);
    }

    pub fn add_bridge(&self, name: &str, members: &[&str], mtu: u32) {
        self.add_interface(name, mtu);
        self.state.lock().bridges.insert(
            name.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn set_default_route(&self, iface: Option<&str>) {
        self.state.lock().default_route = iface.map(str::to_string);
    }

    pub fn fail_tap_creation(&self, fail: bool) {
        self.state.lock().fail_tap = fail;
    }

    /// Make every bridge member addition take `delay`.
    pub fn delay_bridge_members(&self, delay: Duration) {
        self.state.lock().member_delay = delay;
    }

    pub fn members(&self, bridge: &str) -> Vec<String> {
        self.state.lock().bridges.get(bridge).cloned().unwrap_or_default()
    }

    pub fn mtu_of(&self, name: &str) -> u32 {
        self.state.lock().mtus[name]
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.state.lock().up.contains(name)
    }

    pub fn created_bridges(&self) -> usize {
        self.state.lock().created_bridges
    }

    /// Every destroy call, in order, including ones for unknown interfaces.
    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    /// Taps that currently exist.
    pub fn live_taps(&self) -> Vec<String> {
        self.state
            .lock()
            .interfaces
            .iter()
            .filter(|i| i.starts_with("tap"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NetworkDriver for FakeNetwork {
    async fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().interfaces.clone())
    }

    async fn create_tap(&self) -> Result<String> {
        let mut s = self.state.lock();
        if s.fail_tap {
            bail!("tap creation disabled");
        }
        let name = format!("tap{}", s.next_tap);
        s.next_tap += 1;
        s.interfaces.push(name.clone());
        s.mtus.insert(name.clone(), 1500);
        Ok(name)
    }

    async fn create_bridge(&self) -> Result<String> {
        let mut s = self.state.lock();
        let name = (0..)
            .map(|n| format!("bridge{}", n))
            .find(|n| !s.interfaces.contains(n))
            .unwrap();
        s.interfaces.push(name.clone());
        s.mtus.insert(name.clone(), 1500);
        s.bridges.insert(name.clone(), Vec::new());
        s.created_bridges += 1;
        Ok(name)
    }

    async fn destroy_interface(&self, name: &str) -> Result<()> {
        let mut s = self.state.lock();
        s.destroyed.push(name.to_string());
        let Some(pos) = s.interfaces.iter().position(|i| i == name) else {
            bail!("interface {} does not exist", name);
        };
        s.interfaces.remove(pos);
        s.mtus.remove(name);
        s.up.remove(name);
        for members in s.bridges.values_mut() {
            members.retain(|m| m != name);
        }
        Ok(())
    }

    async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>> {
        Ok(self.members(bridge))
    }

    async fn mtu(&self, name: &str) -> Result<u32> {
        match self.state.lock().mtus.get(name) {
            Some(mtu) => Ok(*mtu),
            None => bail!("interface {} does not exist", name),
        }
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.state.lock().mtus.insert(name.to_string(), mtu);
        Ok(())
    }

    async fn add_bridge_member(&self, bridge: &str, member: &str) -> Result<()> {
        let delay = self.state.lock().member_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.state.lock();
        match s.bridges.get_mut(bridge) {
            Some(members) => {
                members.push(member.to_string());
                Ok(())
            }
            None => bail!("{} is not a bridge", bridge),
        }
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        self.state.lock().up.insert(name.to_string());
        Ok(())
    }

    async fn default_route_interface(&self) -> Result<Option<String>> {
        Ok(self.state.lock().default_route.clone())
    }
}

// ---------------------------------------------------------------------------
// bhyvectl
// ---------------------------------------------------------------------------

/// Records control operations. Status queries answer with a configurable exit
/// code (default 1: VM absent); every other operation succeeds.
pub struct FakeControl {
    calls: Mutex<Vec<(ControlOp, String)>>,
    status_code: Mutex<Option<i32>>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            status_code: Mutex::new(Some(1)),
        }
    }

    pub fn set_status_code(&self, code: Option<i32>) {
        *self.status_code.lock() = code;
    }

    pub fn calls(&self) -> Vec<(ControlOp, String)> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: ControlOp) -> usize {
        self.calls.lock().iter().filter(|(o, _)| *o == op).count()
    }
}

#[async_trait]
impl HypervisorControl for FakeControl {
    async fn exec(&self, op: ControlOp, vm_name: &str) -> io::Result<Option<i32>> {
        self.calls.lock().push((op, vm_name.to_string()));
        match op {
            ControlOp::Status => Ok(*self.status_code.lock()),
            _ => Ok(Some(0)),
        }
    }
}
