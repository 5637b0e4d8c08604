//! Subcommand implementations.
//!
//! `check` only inspects the host. Everything else goes through a [`Host`],
//! the wired-up manager and storage built from the config file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nasvm_protocol::{DeviceRecord, VmDefinition, VmSpec};
use serde::de::DeserializeOwned;
use tracing::{error, info};

use crate::config::Config;
use crate::datastore::{JsonStore, VmFilter};
use crate::network::{BridgeManager, IfconfigDriver};
use crate::storage::{StorageManager, Zfs};
use crate::vm::bhyve::{self, Bhyvectl};
use crate::vm::{VmError, VmManager, VmManagerConfig};

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load_or_default(path)
}

/// Manager and storage wired to the host's real tools.
pub struct Host {
    pub config: Config,
    pub manager: VmManager,
    pub storage: StorageManager,
}

impl Host {
    pub async fn build(config: &Config) -> Result<Self> {
        let store = JsonStore::open(&config.storage.datastore_path).await?;
        let driver = IfconfigDriver::new(
            config.network.ifconfig_binary.clone(),
            config.network.route_binary.clone(),
        );
        let bridges = BridgeManager::new(Arc::new(driver), config.network.bridge_prefix.clone());
        let control = Bhyvectl::new(config.hypervisor.bhyvectl_binary.clone());
        let manager = VmManager::new(
            Arc::new(store),
            Arc::new(bridges),
            Arc::new(control),
            VmManagerConfig::from_config(config),
        );
        let storage = StorageManager::new(
            Zfs::new(config.storage.zfs_binary.clone()),
            config.storage.zvol_prefix.clone(),
        );
        Ok(Self {
            config: config.clone(),
            manager,
            storage,
        })
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Start `ids` plus the autostart set, then supervise until a shutdown signal.
pub async fn run_daemon(host: &Host, ids: &[u64]) -> Result<()> {
    let manager = &host.manager;
    for &id in ids {
        match manager.start(id).await {
            Ok(true) => {}
            Ok(false) => info!(id, "VM already running"),
            Err(e) => error!(id, error = %e, "failed to start VM"),
        }
    }
    let started = manager.autostart().await?;
    info!(
        started = ?started,
        running = ?manager.registered().await,
        "supervising VMs"
    );

    wait_for_shutdown().await?;

    info!("shutdown signal received, stopping VMs");
    manager.stop_all().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// per-VM queries
// ---------------------------------------------------------------------------

pub async fn run_status(host: &Host, id: u64) -> Result<()> {
    let status = host.manager.status(id).await?;
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

/// Print the command line `start` would run. NICs show a placeholder tap.
pub async fn run_args(host: &Host, id: u64) -> Result<()> {
    println!("{}", command_line(host, id).await?);
    Ok(())
}

async fn command_line(host: &Host, id: u64) -> Result<String> {
    let spec = fetch_spec(host, id).await?;
    let command = bhyve::build_command(
        &spec,
        &host.manager.config().hypervisor,
        &bhyve::placeholder_taps(&spec),
    )?;
    Ok(command.command_line())
}

async fn fetch_spec(host: &Host, id: u64) -> Result<VmSpec> {
    match host.manager.store().get_spec(id).await? {
        Some(spec) => Ok(spec),
        None => Err(VmError::NotFound(id).into()),
    }
}

pub async fn run_vnc_web(host: &Host, id: u64) -> Result<()> {
    for url in host.manager.vnc_web_urls(id).await? {
        println!("{}", url);
    }
    Ok(())
}

pub async fn run_console(host: &Host, id: u64) -> Result<()> {
    match host.manager.console_device(id).await? {
        Some(device) => println!("{}", device),
        None => bail!("VM {} has no serial console (not running)", id),
    }
    Ok(())
}

pub async fn run_interfaces(host: &Host, id: u64) -> Result<()> {
    for iface in host.manager.attached_interfaces(id).await? {
        println!("{}", iface);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// datastore edits
// ---------------------------------------------------------------------------

pub async fn run_clone(host: &Host, id: u64) -> Result<()> {
    let new_id = host
        .manager
        .clone_vm(id, &host.storage, host.storage.zvol_prefix())
        .await?;
    println!("{}", new_id);
    Ok(())
}

pub async fn run_create(host: &Host, file: &Path) -> Result<()> {
    let definition: VmDefinition = read_json(file)?;
    let id = host.manager.create(definition).await?;
    println!("{}", id);
    Ok(())
}

pub async fn run_add_device(host: &Host, id: u64, file: &Path) -> Result<()> {
    let device: DeviceRecord = read_json(file)?;
    let dtype = device.dtype.clone();
    if !host.manager.add_device(id, device).await? {
        bail!("could not add {} device to VM {}", dtype, id);
    }
    Ok(())
}

pub async fn run_update_devices(host: &Host, id: u64, file: &Path) -> Result<()> {
    let devices: Vec<DeviceRecord> = read_json(file)?;
    if !host.manager.update_devices(id, devices).await? {
        bail!("VM {} not updated: device list does not match", id);
    }
    Ok(())
}

pub async fn run_delete(host: &Host, id: u64) -> Result<()> {
    if !host.manager.delete(id).await? {
        return Err(VmError::NotFound(id).into());
    }
    Ok(())
}

pub async fn run_list(host: &Host) -> Result<()> {
    let vms = host.manager.store().query(&VmFilter::default()).await?;
    let mut rows = Vec::with_capacity(vms.len());
    for def in &vms {
        let running = host.manager.status(def.vm.id).await?.is_running();
        rows.push((def, running));
    }
    print!("{}", format_list(&rows));
    Ok(())
}

fn format_list(rows: &[(&VmDefinition, bool)]) -> String {
    let mut out = format!(
        "{:<6} {:<20} {:>5} {:>8} {:<9} {}\n",
        "ID", "NAME", "VCPUS", "MEMORY", "AUTOSTART", "STATE"
    );
    for (def, running) in rows {
        out.push_str(&format!(
            "{:<6} {:<20} {:>5} {:>8} {:<9} {}\n",
            def.vm.id,
            def.vm.name,
            def.vm.vcpus,
            def.vm.memory,
            if def.vm.autostart { "yes" } else { "no" },
            if *running { "RUNNING" } else { "STOPPED" },
        ));
    }
    out
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `nasvm check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_executable("bhyve", &config.hypervisor.bhyve_binary),
        check_executable("bhyvectl", &config.hypervisor.bhyvectl_binary),
        check_kernel_module("vmm"),
        check_kernel_module("nmdm"),
        check_firmware(config),
        check_executable("ifconfig", &config.network.ifconfig_binary),
        check_executable("zfs", &config.storage.zfs_binary),
        check_executable("websockify", &config.console.websockify_binary),
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let (false, Some(fix)) = (c.ok, &c.fix) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        bail!("{} check(s) failed", failed)
    }
}

fn check_executable(label: &'static str, path: &Path) -> Check {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => {
            Check::pass(label, path.display().to_string())
        }
        Ok(_) => Check::fail(
            label,
            format!("{} is not an executable file", path.display()),
            format!("Point the config at a working {} binary", label),
        ),
        Err(e) => Check::fail(
            label,
            format!("{}: {}", path.display(), e),
            format!("Install {} or set its path in the config file", label),
        ),
    }
}

fn check_kernel_module(module: &'static str) -> Check {
    match std::process::Command::new("kldstat")
        .args(["-q", "-m", module])
        .status()
    {
        Ok(status) if status.success() => Check::pass(module, "loaded"),
        Ok(_) => Check::fail(
            module,
            "kernel module not loaded",
            format!("kldload {}", module),
        ),
        Err(e) => Check::fail(
            module,
            format!("kldstat not available: {}", e),
            "Run on a FreeBSD host with bhyve support",
        ),
    }
}

fn check_firmware(config: &Config) -> Check {
    let dir = &config.hypervisor.firmware_dir;
    let missing: Vec<&str> = ["BHYVE_UEFI.fd", "BHYVE_UEFI_CSM.fd"]
        .into_iter()
        .filter(|image| !dir.join(image).is_file())
        .collect();
    if missing.is_empty() {
        Check::pass("UEFI firmware", dir.display().to_string())
    } else {
        Check::fail(
            "UEFI firmware",
            format!("missing in {}: {}", dir.display(), missing.join(", ")),
            "Install sysutils/uefi-edk2-bhyve or set hypervisor.firmware_dir",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{vm_record, write_script, FakeControl, FakeNetwork};
    use serde_json::json;

    fn host() -> Host {
        let config = Config::default();
        let bridges = BridgeManager::new(Arc::new(FakeNetwork::new()), "bridge".into());
        let manager = VmManager::new(
            Arc::new(JsonStore::in_memory()),
            Arc::new(bridges),
            Arc::new(FakeControl::new()),
            VmManagerConfig::from_config(&config),
        );
        let storage = StorageManager::new(Zfs::new("/nonexistent/zfs".into()), "/dev/zvol/".into());
        Host { config, manager, storage }
    }

    #[tokio::test]
    async fn test_args_uses_placeholder_taps() {
        let host = host();
        let id = host
            .manager
            .create(VmDefinition {
                vm: vm_record(0),
                devices: vec![DeviceRecord::new("NIC", json!({"type": "VIRTIO"}))],
            })
            .await
            .unwrap();

        let line = command_line(&host, id).await.unwrap();
        assert!(line.starts_with("/usr/sbin/bhyve -H -w -c 2 -m 1024"), "{}", line);
        assert!(line.contains("-s 3,virtio-net,tap?,mac=00:a0:98:"), "{}", line);
        assert!(line.ends_with(" vm0"), "{}", line);
    }

    #[tokio::test]
    async fn test_args_unknown_vm() {
        let err = command_line(&host(), 42).await.unwrap_err();
        assert!(err.to_string().contains("VM 42 does not exist"), "{}", err);
    }

    #[tokio::test]
    async fn test_create_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("vm.json");
        std::fs::write(
            &file,
            json!({
                "name": "web",
                "vcpus": 1,
                "memory": 512,
                "bootloader": "UEFI",
                "devices": [{"dtype": "CDROM", "attributes": {"path": "/mnt/iso/x.iso"}}]
            })
            .to_string(),
        )
        .unwrap();

        let host = host();
        run_create(&host, &file).await.unwrap();
        let vms = host.manager.store().query(&VmFilter::default()).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].vm.name, "web");
        assert_eq!(vms[0].devices[0].dtype, "CDROM");
    }

    #[tokio::test]
    async fn test_delete_unknown_vm_fails() {
        assert!(run_delete(&host(), 3).await.is_err());
    }

    #[test]
    fn test_format_list() {
        let mut vm = vm_record(4);
        vm.autostart = true;
        let def = VmDefinition { vm, devices: vec![] };
        let out = format_list(&[(&def, true)]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].starts_with("4      vm4"), "{}", lines[1]);
        assert!(lines[1].ends_with("yes       RUNNING"), "{}", lines[1]);
    }

    #[test]
    fn test_check_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "bhyve", "exit 0\n");
        assert!(check_executable("bhyve", &script).ok);

        let plain = dir.path().join("plain");
        std::fs::write(&plain, "").unwrap();
        assert!(!check_executable("bhyve", &plain).ok);
        assert!(!check_executable("bhyve", &dir.path().join("missing")).ok);
    }

    #[test]
    fn test_check_firmware_reports_missing_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.hypervisor.firmware_dir = dir.path().to_path_buf();
        std::fs::write(dir.path().join("BHYVE_UEFI.fd"), "").unwrap();

        let check = check_firmware(&config);
        assert!(!check.ok);
        assert!(check.detail.contains("BHYVE_UEFI_CSM.fd"));
        assert!(!check.detail.contains("BHYVE_UEFI.fd,"));

        std::fs::write(dir.path().join("BHYVE_UEFI_CSM.fd"), "").unwrap();
        assert!(check_firmware(&config).ok);
    }
}
