pub mod bhyve;
pub mod clone;
pub mod console;
pub mod device;
pub mod slot;
pub mod supervisor;

use std::os::unix::fs::FileTypeExt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use nasvm_protocol::{DeviceRecord, SpecError, VmDefinition, VmRecord, VmSpec, VmStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConsoleConfig, HypervisorConfig};
use crate::datastore::{VmFilter, VmStore};
use crate::network::BridgeManager;
use crate::storage::DiskCloner;
use bhyve::HypervisorControl;
use supervisor::{LifecycleRequest, Registry, SupervisorContext};

pub use supervisor::{Supervisor, SupervisorState};

/// Errors surfaced to callers of [`VmManager`].
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM {0} does not exist")]
    NotFound(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VmError {
    /// errno-style code for callers that report one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            VmError::NotFound(_) => Some(libc::ENOENT),
            VmError::InvalidArgument(_) | VmError::Spec(_) => Some(libc::EINVAL),
            VmError::Other(_) => None,
        }
    }
}

/// Global configuration for the VM manager.
#[derive(Debug, Clone)]
pub struct VmManagerConfig {
    pub hypervisor: HypervisorConfig,
    pub console: ConsoleConfig,
    /// Grace period after a force-poweroff before SIGTERM.
    pub stop_timeout: Duration,
    /// Grace period after SIGTERM before SIGKILL.
    pub kill_timeout: Duration,
}

impl VmManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hypervisor: config.hypervisor.clone(),
            console: config.console.clone(),
            stop_timeout: config.hypervisor.stop_timeout(),
            kill_timeout: config.hypervisor.kill_timeout(),
        }
    }
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct ManagerInner {
    store: Arc<dyn VmStore>,
    ctx: Arc<SupervisorContext>,
    registry: Arc<Registry>,
    requests: mpsc::UnboundedSender<LifecycleRequest>,
}

/// Process-wide registry of VM supervisors.
///
/// At most one active supervisor exists per VM id. Cheap to clone; clones
/// share the registry.
#[derive(Clone)]
pub struct VmManager {
    inner: Arc<ManagerInner>,
}

impl VmManager {
    /// Create a manager. Must be called from within a tokio runtime: it spawns
    /// the task that handles restart and stop requests from exiting VMs.
    pub fn new(
        store: Arc<dyn VmStore>,
        bridges: Arc<BridgeManager>,
        control: Arc<dyn HypervisorControl>,
        config: VmManagerConfig,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            store,
            ctx: Arc::new(SupervisorContext {
                config,
                control,
                bridges,
            }),
            registry: Arc::new(Registry::default()),
            requests,
        });
        spawn_dispatcher(Arc::downgrade(&inner), rx);
        Self { inner }
    }

    pub fn store(&self) -> &Arc<dyn VmStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &VmManagerConfig {
        &self.inner.ctx.config
    }

    /// The registered supervisor for `id`, if any.
    pub async fn supervisor(&self, id: u64) -> Option<Arc<Supervisor>> {
        self.inner.registry.lock().await.get(&id).cloned()
    }

    /// Ids with a registered supervisor.
    pub async fn registered(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.registry.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn fetch_spec(&self, id: u64) -> Result<VmSpec, VmError> {
        let def = self.inner.store.get(id).await?.ok_or(VmError::NotFound(id))?;
        Ok(VmSpec::from_definition(&def)?)
    }

    /// Start VM `id`. Returns false if it already has a supervisor, including
    /// one that is still tearing down.
    pub async fn start(&self, id: u64) -> Result<bool, VmError> {
        let spec = self.fetch_spec(id).await?;
        bhyve::preflight(&spec, &self.inner.ctx.config.hypervisor)?;

        let supervisor = {
            let mut registry = self.inner.registry.lock().await;
            if let Some(existing) = registry.get(&id) {
                info!(id, vm = %spec.name, state = ?existing.state(), "VM already has a supervisor");
                return Ok(false);
            }
            let supervisor = Arc::new(Supervisor::new(
                spec,
                self.inner.ctx.clone(),
                Arc::downgrade(&self.inner.registry),
                self.inner.requests.clone(),
            ));
            supervisor.begin();
            registry.insert(id, supervisor.clone());
            supervisor
        };

        info!(id, vm = %supervisor.spec().name, "starting VM");
        tokio::spawn(supervisor.run());
        Ok(true)
    }

    /// Stop VM `id`. Returns false if it is not registered, otherwise whether
    /// a bhyve process was running.
    pub async fn stop(&self, id: u64) -> bool {
        match self.supervisor(id).await {
            Some(supervisor) => supervisor.stop().await,
            None => false,
        }
    }

    /// Reset VM `id`. Returns false if it is not registered or not running.
    pub async fn restart(&self, id: u64) -> bool {
        match self.supervisor(id).await {
            Some(supervisor) => supervisor.restart().await,
            None => false,
        }
    }

    /// Status of VM `id`. VMs without a supervisor are checked against the
    /// kernel by name; unknown VMs are stopped.
    pub async fn status(&self, id: u64) -> Result<VmStatus, VmError> {
        if let Some(supervisor) = self.supervisor(id).await {
            return Ok(supervisor.status().await);
        }

        let Some(def) = self.inner.store.get(id).await? else {
            return Ok(VmStatus::stopped());
        };
        // Only the name matters for a status probe.
        let spec = VmSpec::from_records(&def.vm, &[])?;
        let transient = Supervisor::new(
            spec,
            self.inner.ctx.clone(),
            Weak::new(),
            self.inner.requests.clone(),
        );
        Ok(transient.status().await)
    }

    /// The stored definition of VM `id`, as the source of a clone.
    pub async fn clone_definition(&self, id: u64) -> Result<VmDefinition, VmError> {
        self.inner.store.get(id).await?.ok_or_else(|| {
            VmError::InvalidArgument("cannot clone a VM that does not exist".into())
        })
    }

    /// Clone VM `id` into a new VM, cloning its zvol disks. Returns the new id.
    pub async fn clone_vm(
        &self,
        id: u64,
        disks: &dyn DiskCloner,
        zvol_prefix: &str,
    ) -> Result<u64, VmError> {
        let source = self.clone_definition(id).await?;
        let existing = self.inner.store.query(&VmFilter::default()).await?;
        let plan = clone::plan_clone(
            &source,
            existing.iter().map(|d| d.vm.name.as_str()),
            zvol_prefix,
        );

        for zvol in &plan.zvols {
            disks
                .clone_dataset(&zvol.dataset, &zvol.snapshot, &zvol.target)
                .await?;
        }

        let name = plan.definition.vm.name.clone();
        let new_id = self.inner.store.insert(plan.definition).await?;
        info!(from = %source.vm.name, to = %name, id = new_id, "VM cloned");
        Ok(new_id)
    }

    /// Validate and store a new VM. Returns its id.
    pub async fn create(&self, definition: VmDefinition) -> Result<u64, VmError> {
        VmSpec::from_definition(&definition)?;
        Ok(self.inner.store.insert(definition).await?)
    }

    pub async fn add_device(&self, id: u64, device: DeviceRecord) -> Result<bool, VmError> {
        Ok(self.inner.store.add_device(id, device).await?)
    }

    pub async fn update_devices(&self, id: u64, devices: Vec<DeviceRecord>) -> Result<bool, VmError> {
        Ok(self.inner.store.update_devices(id, devices).await?)
    }

    /// Stop VM `id` if it is running, then delete it.
    pub async fn delete(&self, id: u64) -> Result<bool, VmError> {
        if self.stop(id).await {
            debug!(id, "stopped VM before delete");
        }
        Ok(self.inner.store.delete(id).await?)
    }

    /// Start every VM flagged for autostart. Returns the ids started.
    pub async fn autostart(&self) -> Result<Vec<u64>, VmError> {
        let mut started = Vec::new();
        for def in self.inner.store.query(&VmFilter::autostart()).await? {
            let VmRecord { id, name, .. } = def.vm;
            match self.start(id).await {
                Ok(true) => started.push(id),
                Ok(false) => {}
                Err(e) => error!(id, vm = %name, error = %e, "autostart failed"),
            }
        }
        Ok(started)
    }

    /// Stop every registered VM concurrently.
    pub async fn stop_all(&self) {
        let mut tasks = JoinSet::new();
        for id in self.registered().await {
            let manager = self.clone();
            tasks.spawn(async move { manager.stop(id).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "stop task failed");
            }
        }
    }

    /// Serial console device users attach to, if the VM is running.
    pub async fn console_device(&self, id: u64) -> Result<Option<String>, VmError> {
        if !self.status(id).await?.is_running() {
            return Ok(None);
        }
        let device = bhyve::serial_device(&self.inner.ctx.config.hypervisor, id, 'B');
        match std::fs::metadata(&device) {
            Ok(meta) if meta.file_type().is_char_device() => Ok(Some(device)),
            _ => Ok(None),
        }
    }

    /// Web console URLs of the VM's web-enabled VNC devices.
    pub async fn vnc_web_urls(&self, id: u64) -> Result<Vec<String>, VmError> {
        let spec = self.fetch_spec(id).await?;
        Ok(spec.vnc_devices().filter_map(console::web_console_url).collect())
    }

    /// Uplinks the VM's NICs are attached to.
    pub async fn attached_interfaces(&self, id: u64) -> Result<Vec<String>, VmError> {
        let spec = self.fetch_spec(id).await?;
        Ok(spec
            .attached_interfaces()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    async fn handle_request(&self, request: LifecycleRequest) {
        match request {
            LifecycleRequest::Restart { id, done } => {
                self.stop(id).await;
                match self.start(id).await {
                    Ok(_) => info!(id, "VM restarted"),
                    Err(e) => error!(id, error = %e, "failed to restart VM"),
                }
                let _ = done.send(());
            }
            LifecycleRequest::Stop { id, done } => {
                self.stop(id).await;
                let _ = done.send(());
            }
        }
    }
}

/// Handle supervisor requests, one task per request so a slow stop never
/// holds up another VM.
fn spawn_dispatcher(inner: Weak<ManagerInner>, mut rx: mpsc::UnboundedReceiver<LifecycleRequest>) {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let manager = VmManager { inner };
            tokio::spawn(async move { manager.handle_request(request).await });
        }
        debug!("lifecycle dispatcher stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::JsonStore;
    use crate::testutil::{vm_record, wait_until, write_script, FakeControl, FakeNetwork};
    use anyhow::Result;
    use async_trait::async_trait;
    use bhyve::ControlOp;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Harness {
        dir: tempfile::TempDir,
        net: Arc<FakeNetwork>,
        control: Arc<FakeControl>,
        manager: VmManager,
    }

    impl Harness {
        fn new(script: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let script = script.replace("{dir}", &dir.path().display().to_string());
            let bhyve = write_script(dir.path(), "bhyve", &script);
            let net = Arc::new(FakeNetwork::new());
            net.add_interface("igb0", 1500);
            let control = Arc::new(FakeControl::new());
            let config = VmManagerConfig {
                hypervisor: HypervisorConfig {
                    bhyve_binary: bhyve,
                    ..HypervisorConfig::default()
                },
                console: ConsoleConfig::default(),
                stop_timeout: Duration::from_millis(100),
                kill_timeout: Duration::from_millis(100),
            };
            let manager = VmManager::new(
                Arc::new(JsonStore::in_memory()),
                Arc::new(BridgeManager::new(net.clone(), "bridge".into())),
                control.clone(),
                config,
            );
            Self {
                dir,
                net,
                control,
                manager,
            }
        }

        async fn create(&self, name: &str, devices: Vec<DeviceRecord>) -> u64 {
            let mut vm = vm_record(0);
            vm.name = name.into();
            self.manager
                .create(VmDefinition { vm, devices })
                .await
                .unwrap()
        }

        async fn wait_running(&self, id: u64) -> Arc<Supervisor> {
            let manager = self.manager.clone();
            assert!(
                wait_until(Duration::from_secs(5), || {
                    let manager = manager.clone();
                    async move {
                        match manager.supervisor(id).await {
                            Some(s) => s.pid().is_some(),
                            None => false,
                        }
                    }
                })
                .await,
                "VM {} never started",
                id
            );
            self.manager.supervisor(id).await.unwrap()
        }

        async fn wait_unregistered(&self, id: u64) {
            let manager = self.manager.clone();
            assert!(
                wait_until(Duration::from_secs(5), || {
                    let manager = manager.clone();
                    async move { manager.supervisor(id).await.is_none() }
                })
                .await,
                "VM {} still registered",
                id
            );
        }
    }

    fn nic() -> DeviceRecord {
        DeviceRecord::new("NIC", json!({"nic_attach": "igb0"}))
    }

    #[tokio::test]
    async fn test_start_unknown_vm() {
        let h = Harness::new("exit 1\n");
        assert!(matches!(h.manager.start(9).await, Err(VmError::NotFound(9))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_spec_before_launch() {
        let h = Harness::new("exit 1\n");
        let mut vm = vm_record(0);
        vm.name = "bad".into();
        let id = h
            .manager
            .store()
            .insert(VmDefinition {
                vm,
                devices: vec![DeviceRecord::new("DISK", json!({}))],
            })
            .await
            .unwrap();

        let err = h.manager.start(id).await.unwrap_err();
        assert!(matches!(err, VmError::Spec(SpecError::MissingAttribute { .. })));
        assert_eq!(err.errno(), Some(libc::EINVAL));
        assert!(h.manager.registered().await.is_empty());
        assert!(h.net.live_taps().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_supervisor() {
        let h = Harness::new("exec sleep 30\n");
        let id = h.create("web", vec![nic()]).await;

        assert!(h.manager.start(id).await.unwrap());
        let first = h.wait_running(id).await;
        assert!(!h.manager.start(id).await.unwrap());
        assert!(Arc::ptr_eq(&first, &h.manager.supervisor(id).await.unwrap()));
        assert_eq!(h.net.live_taps().len(), 1);

        assert!(h.manager.stop(id).await);
        assert!(h.manager.registered().await.is_empty());
        assert!(h.net.live_taps().is_empty());
        assert!(!h.manager.stop(id).await);
    }

    #[tokio::test]
    async fn test_concurrent_starts_register_once() {
        let h = Harness::new("exec sleep 30\n");
        let id = h.create("web", vec![]).await;

        let mut tasks = JoinSet::new();
        for _ in 0..5 {
            let manager = h.manager.clone();
            tasks.spawn(async move { manager.start(id).await.unwrap() });
        }
        let mut started = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        h.wait_running(id).await;
        h.manager.stop_all().await;
        assert!(h.manager.registered().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_refused_while_stopping() {
        // Ignores SIGTERM, so a stop has to wait out both grace periods.
        let h = Harness::new("trap '' TERM\nwhile :; do sleep 0.1; done\n");
        let id = h.create("web", vec![nic()]).await;

        assert!(h.manager.start(id).await.unwrap());
        let first = h.wait_running(id).await;

        let manager = h.manager.clone();
        let stopping = tokio::spawn(async move { manager.stop(id).await });
        let s = first.clone();
        assert!(wait_until(Duration::from_secs(5), || {
            let s = s.clone();
            async move { s.state() == SupervisorState::Destroying }
        })
        .await);

        assert!(!h.manager.start(id).await.unwrap());
        assert!(Arc::ptr_eq(&first, &h.manager.supervisor(id).await.unwrap()));
        assert_eq!(h.net.live_taps().len(), 1);

        assert!(stopping.await.unwrap());
        assert_eq!(first.state(), SupervisorState::Stopped);
        assert_eq!(h.control.count(ControlOp::Destroy), 1);
        assert!(h.manager.registered().await.is_empty());

        // Once torn down, the id is free again.
        assert!(h.manager.start(id).await.unwrap());
        let second = h.wait_running(id).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(h.manager.stop(id).await);
        assert_eq!(h.control.count(ControlOp::Destroy), 2);
    }

    #[tokio::test]
    async fn test_stop_and_restart_unknown_return_false() {
        let h = Harness::new("exit 1\n");
        assert!(!h.manager.stop(3).await);
        assert!(!h.manager.restart(3).await);
    }

    #[tokio::test]
    async fn test_status_without_supervisor() {
        let h = Harness::new("exit 1\n");
        assert_eq!(h.manager.status(42).await.unwrap(), VmStatus::stopped());

        let id = h.create("idle", vec![]).await;
        assert_eq!(h.manager.status(id).await.unwrap(), VmStatus::stopped());

        // Kernel knows the VM but nothing here launched it.
        h.control.set_status_code(Some(0));
        assert_eq!(h.manager.status(id).await.unwrap(), VmStatus::running());
        assert_eq!(h.control.calls().last().unwrap(), &(ControlOp::Status, "idle".to_string()));
    }

    #[tokio::test]
    async fn test_reset_exit_restarts_with_new_supervisor() {
        let h = Harness::new(
            "if [ -f {dir}/booted ]; then exec sleep 30; fi\ntouch {dir}/booted\nexit 0\n",
        );
        let id = h.create("web", vec![nic()]).await;

        assert!(h.manager.start(id).await.unwrap());
        let control = h.control.clone();
        assert!(wait_until(Duration::from_secs(5), || {
            let control = control.clone();
            async move { control.count(ControlOp::Destroy) == 1 }
        })
        .await);
        let sup = h.wait_running(id).await;
        assert!(h.dir.path().join("booted").exists());

        // The relaunched instance stays up; the first one was fully torn down.
        assert_eq!(sup.state(), SupervisorState::Running);
        assert_eq!(h.net.destroyed().len(), 1);
        assert_eq!(h.net.live_taps().len(), 1);
        assert_eq!(h.control.count(ControlOp::Destroy), 1);

        h.manager.stop_all().await;
        assert!(h.net.live_taps().is_empty());
    }

    #[tokio::test]
    async fn test_poweroff_exit_unregisters() {
        let h = Harness::new("exit 1\n");
        let id = h.create("web", vec![nic(), nic()]).await;

        assert!(h.manager.start(id).await.unwrap());
        h.wait_unregistered(id).await;

        let net = h.net.clone();
        assert!(wait_until(Duration::from_secs(5), || {
            let net = net.clone();
            async move { net.live_taps().is_empty() }
        })
        .await);
        assert_eq!(h.net.destroyed().len(), 2);
    }

    #[tokio::test]
    async fn test_halt_exit_stops_once() {
        for code in [2, 3] {
            let h = Harness::new(&format!("exit {}\n", code));
            let id = h.create("web", vec![nic()]).await;

            assert!(h.manager.start(id).await.unwrap());
            h.wait_unregistered(id).await;

            let net = h.net.clone();
            assert!(wait_until(Duration::from_secs(5), || {
                let net = net.clone();
                async move { !net.destroyed().is_empty() }
            })
            .await);
            assert_eq!(h.net.destroyed(), vec!["tap0".to_string()]);
            assert_eq!(h.control.count(ControlOp::Destroy), 1);
            // No restart happened.
            assert_eq!(h.control.count(ControlOp::ForcePowerOff), 0);
        }
    }

    #[tokio::test]
    async fn test_clone_of_missing_vm_is_invalid_argument() {
        let h = Harness::new("exit 1\n");
        let err = h.manager.clone_definition(5).await.unwrap_err();
        assert!(matches!(err, VmError::InvalidArgument(_)));
        assert_eq!(err.errno(), Some(libc::EINVAL));
    }

    #[derive(Default)]
    struct RecordingCloner {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl DiskCloner for RecordingCloner {
        async fn clone_dataset(&self, dataset: &str, snapshot: &str, target: &str) -> Result<()> {
            self.calls
                .lock()
                .push((dataset.into(), snapshot.into(), target.into()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_clone_vm_inserts_clone() {
        let h = Harness::new("exit 1\n");
        let id = h
            .create(
                "web",
                vec![DeviceRecord::new("DISK", json!({"path": "/dev/zvol/tank/web"}))],
            )
            .await;

        let source = h.manager.clone_definition(id).await.unwrap();
        assert_eq!(source.vm.name, "web");

        let cloner = RecordingCloner::default();
        let first = h.manager.clone_vm(id, &cloner, "/dev/zvol/").await.unwrap();
        let second = h.manager.clone_vm(id, &cloner, "/dev/zvol/").await.unwrap();

        let first_def = h.manager.store().get(first).await.unwrap().unwrap();
        let second_def = h.manager.store().get(second).await.unwrap().unwrap();
        assert_eq!(first_def.vm.name, "web_clone0");
        assert_eq!(second_def.vm.name, "web_clone1");
        assert_eq!(
            first_def.devices[0].attributes["path"],
            json!("/dev/zvol/tank/web_web_clone0")
        );
        assert_eq!(
            *cloner.calls.lock(),
            vec![
                ("tank/web".to_string(), "web_clone0".to_string(), "tank/web_web_clone0".to_string()),
                ("tank/web".to_string(), "web_clone1".to_string(), "tank/web_web_clone1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_autostart_starts_flagged_vms() {
        let h = Harness::new("exec sleep 30\n");
        let mut vm = vm_record(0);
        vm.name = "auto".into();
        vm.autostart = true;
        let auto = h
            .manager
            .create(VmDefinition { vm, devices: vec![] })
            .await
            .unwrap();
        h.create("manual", vec![]).await;

        assert_eq!(h.manager.autostart().await.unwrap(), vec![auto]);
        h.wait_running(auto).await;
        assert_eq!(h.manager.registered().await, vec![auto]);

        h.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_delete_stops_running_vm() {
        let h = Harness::new("exec sleep 30\n");
        let id = h.create("web", vec![nic()]).await;
        h.manager.start(id).await.unwrap();
        h.wait_running(id).await;

        assert!(h.manager.delete(id).await.unwrap());
        assert!(h.manager.registered().await.is_empty());
        assert!(h.net.live_taps().is_empty());
        assert!(h.manager.store().get(id).await.unwrap().is_none());
        assert!(!h.manager.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_vnc_web_urls_and_interfaces() {
        let h = Harness::new("exit 1\n");
        let id = h
            .create(
                "desk",
                vec![
                    DeviceRecord::new("VNC", json!({"vnc_bind": "10.0.0.5", "vnc_web": true})),
                    DeviceRecord::new("VNC", json!({"vnc_port": 5990})),
                    nic(),
                    DeviceRecord::new("NIC", json!({})),
                ],
            )
            .await;

        assert_eq!(
            h.manager.vnc_web_urls(id).await.unwrap(),
            vec![format!("http://10.0.0.5:{}/vnc_auto.html", 5800 + id)]
        );
        assert_eq!(h.manager.attached_interfaces(id).await.unwrap(), vec!["igb0"]);
        assert!(matches!(
            h.manager.vnc_web_urls(id + 100).await,
            Err(VmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_console_device_requires_running_vm() {
        let h = Harness::new("exit 1\n");
        let id = h.create("web", vec![]).await;
        assert_eq!(h.manager.console_device(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_and_add_devices() {
        let h = Harness::new("exit 1\n");
        let id = h.create("web", vec![nic()]).await;

        assert!(h
            .manager
            .update_devices(id, vec![DeviceRecord::new("NIC", json!({"type": "VIRTIO"}))])
            .await
            .unwrap());
        assert!(h
            .manager
            .add_device(id, DeviceRecord::new("CDROM", json!({"path": "/iso"})))
            .await
            .unwrap());

        let def = h.manager.store().get(id).await.unwrap().unwrap();
        assert_eq!(def.devices.len(), 2);
        assert_eq!(def.devices[0].attributes["type"], json!("VIRTIO"));
    }
}
