use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nasvm_protocol::{Device, VmSpec, VmStatus};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::bhyve::{self, ControlOp, HypervisorControl};
use super::{console, VmManagerConfig};
use crate::network::BridgeManager;
use crate::util::{is_process_alive, signal_process};

/// VM id to live supervisor.
pub(crate) type Registry = tokio::sync::Mutex<HashMap<u64, Arc<Supervisor>>>;

/// Requests a supervisor sends back to the manager when the guest exits.
#[derive(Debug)]
pub(crate) enum LifecycleRequest {
    /// Stop the VM, then start it again from a fresh spec.
    Restart { id: u64, done: oneshot::Sender<()> },
    Stop { id: u64, done: oneshot::Sender<()> },
}

/// Collaborators shared by every supervisor of one manager.
pub(crate) struct SupervisorContext {
    pub config: VmManagerConfig,
    pub control: Arc<dyn HypervisorControl>,
    pub bridges: Arc<BridgeManager>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Rebooting,
    PoweringOff,
    Halting,
    Faulted,
    Destroying,
}

impl SupervisorState {
    /// Whether this supervisor still owns the VM.
    pub fn is_active(&self) -> bool {
        !matches!(self, SupervisorState::Stopped | SupervisorState::Destroying)
    }
}

/// Meaning of a bhyve exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTransition {
    /// 0: the guest rebooted.
    Reset,
    /// 1: the guest powered off.
    PowerOff,
    /// 2: the guest halted.
    Halt,
    /// 3: the guest triple-faulted.
    TripleFault,
    /// Anything else, including death by signal.
    Fault(Option<i32>),
}

impl ExitTransition {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitTransition::Reset,
            Some(1) => ExitTransition::PowerOff,
            Some(2) => ExitTransition::Halt,
            Some(3) => ExitTransition::TripleFault,
            other => ExitTransition::Fault(other),
        }
    }

    pub fn next_state(&self) -> SupervisorState {
        match self {
            ExitTransition::Reset => SupervisorState::Rebooting,
            ExitTransition::PowerOff => SupervisorState::PoweringOff,
            ExitTransition::Halt | ExitTransition::TripleFault => SupervisorState::Halting,
            ExitTransition::Fault(_) => SupervisorState::Faulted,
        }
    }
}

struct Inner {
    state: SupervisorState,
    pid: Option<u32>,
    /// Set once bhyve has been spawned by this supervisor.
    launched: bool,
    console: Option<Child>,
    taps: Vec<String>,
}

/// Owns the lifecycle of one VM run: network provisioning, the bhyve process,
/// its exit policy and teardown.
pub struct Supervisor {
    spec: VmSpec,
    ctx: Arc<SupervisorContext>,
    registry: Weak<Registry>,
    requests: mpsc::UnboundedSender<LifecycleRequest>,
    inner: Mutex<Inner>,
    exited: watch::Sender<bool>,
    /// Set once `launch` has returned, successfully or not.
    launch_done: watch::Sender<bool>,
}

impl Supervisor {
    pub(crate) fn new(
        spec: VmSpec,
        ctx: Arc<SupervisorContext>,
        registry: Weak<Registry>,
        requests: mpsc::UnboundedSender<LifecycleRequest>,
    ) -> Self {
        let (exited, _) = watch::channel(false);
        let (launch_done, _) = watch::channel(false);
        Self {
            spec,
            ctx,
            registry,
            requests,
            inner: Mutex::new(Inner {
                state: SupervisorState::Stopped,
                pid: None,
                launched: false,
                console: None,
                taps: Vec::new(),
            }),
            exited,
            launch_done,
        }
    }

    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Taps currently owned by this run.
    #[cfg(test)]
    pub fn taps(&self) -> Vec<String> {
        self.inner.lock().taps.clone()
    }

    /// Mark the supervisor as starting. Called by the manager under the
    /// registry lock, before the run task is spawned.
    pub(crate) fn begin(&self) {
        self.inner.lock().state = SupervisorState::Starting;
    }

    /// Launch bhyve, drain its output, wait for it to exit and apply the exit
    /// policy.
    pub async fn run(self: Arc<Self>) {
        let launched = self.launch().await;
        self.launch_done.send_replace(true);
        let mut child = match launched {
            Ok(child) => child,
            Err(e) => {
                error!(vm = %self.spec.name, error = %format!("{:#}", e), "failed to start VM");
                self.destroy().await;
                return;
            }
        };

        tokio::join!(
            drain_lines(child.stdout.take(), &self.spec.name),
            drain_lines(child.stderr.take(), &self.spec.name),
        );

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!(vm = %self.spec.name, error = %e, "failed to wait for bhyve");
                None
            }
        };

        self.inner.lock().pid = None;
        self.exited.send_replace(true);

        self.on_exit(code).await;
    }

    async fn launch(&self) -> Result<Child> {
        let nics: Vec<_> = self
            .spec
            .devices
            .iter()
            .filter_map(|d| match d {
                Device::Nic(nic) => Some(nic),
                _ => None,
            })
            .collect();

        let mut taps = Vec::with_capacity(nics.len());
        for nic in nics {
            let tap = self
                .ctx
                .bridges
                .create_tap()
                .await
                .context("failed to create tap device")?;
            if !self.record_tap(&tap) {
                self.destroy_tap(&tap).await;
                bail!("VM {} was stopped while starting", self.spec.name);
            }
            self.ctx
                .bridges
                .attach(&tap, nic.attach.as_deref())
                .await
                .with_context(|| format!("failed to bridge {}", tap))?;
            taps.push(tap);
        }

        let cmd = bhyve::build_command(&self.spec, &self.ctx.config.hypervisor, &taps)?;
        info!(vm = %self.spec.name, cmd = %cmd.command_line(), "starting bhyve");

        let mut child = cmd
            .to_tokio_command()
            .spawn()
            .with_context(|| format!("failed to spawn {}", cmd.binary.display()))?;

        let accepted = {
            let mut inner = self.inner.lock();
            if inner.state == SupervisorState::Starting {
                inner.pid = child.id();
                inner.launched = true;
                inner.state = SupervisorState::Running;
                true
            } else {
                false
            }
        };
        if !accepted {
            // bhyve may already have created its kernel object.
            if let Err(e) = child.kill().await {
                warn!(vm = %self.spec.name, error = %e, "failed to kill abandoned bhyve");
            }
            bhyve::control_best_effort(self.ctx.control.as_ref(), ControlOp::Destroy, &self.spec.name)
                .await;
            bail!("VM {} was stopped while starting", self.spec.name);
        }
        info!(vm = %self.spec.name, pid = child.id().unwrap_or(0), "VM running");

        if let Some(vnc) = self.spec.vnc().filter(|v| v.web) {
            match console::spawn_proxy(&self.ctx.config.console, vnc, &self.spec.name) {
                Ok(Some(proxy)) => self.record_console(proxy).await,
                Ok(None) => {}
                Err(e) => warn!(vm = %self.spec.name, error = %format!("{:#}", e), "web console unavailable"),
            }
        }

        Ok(child)
    }

    /// Record a tap as owned by this run. Returns false, leaving the tap to
    /// the caller, if the supervisor has already been torn down.
    fn record_tap(&self, tap: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() {
            return false;
        }
        inner.taps.push(tap.to_string());
        true
    }

    async fn record_console(&self, mut proxy: Child) {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.state.is_active() {
                inner.console = Some(proxy);
                None
            } else {
                Some(proxy)
            }
        };
        if let Some(mut proxy) = rejected {
            if let Err(e) = proxy.kill().await {
                warn!(vm = %self.spec.name, error = %e, "failed to kill console proxy");
            }
        }
    }

    async fn on_exit(&self, code: Option<i32>) {
        let transition = ExitTransition::from_exit_code(code);

        let claimed = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                SupervisorState::Running | SupervisorState::Rebooting
            ) {
                inner.state = transition.next_state();
                true
            } else {
                false
            }
        };
        if !claimed {
            debug!(vm = %self.spec.name, code = ?code, "bhyve exited after teardown");
            return;
        }

        match transition {
            ExitTransition::Reset => {
                info!(vm = %self.spec.name, "guest rebooted");
                self.request(|done| LifecycleRequest::Restart {
                    id: self.spec.id,
                    done,
                })
                .await;
            }
            ExitTransition::PowerOff => {
                info!(vm = %self.spec.name, "guest powered off");
                self.destroy().await;
            }
            ExitTransition::Halt => {
                info!(vm = %self.spec.name, "guest halted");
                self.request(|done| LifecycleRequest::Stop {
                    id: self.spec.id,
                    done,
                })
                .await;
            }
            ExitTransition::TripleFault => {
                warn!(vm = %self.spec.name, "guest triple fault");
                self.request(|done| LifecycleRequest::Stop {
                    id: self.spec.id,
                    done,
                })
                .await;
            }
            ExitTransition::Fault(code) => {
                error!(vm = %self.spec.name, code = ?code, "bhyve exited abnormally");
                self.destroy().await;
            }
        }
    }

    /// Hand a request to the manager and wait until it has been handled.
    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> LifecycleRequest) {
        let (done, ack) = oneshot::channel();
        if self.requests.send(make(done)).is_err() {
            warn!(vm = %self.spec.name, "manager gone, tearing down directly");
            self.destroy().await;
            return;
        }
        let _ = ack.await;
    }

    /// Tear the VM down unless something else already is.
    pub async fn destroy(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_active() {
                return;
            }
            inner.state = SupervisorState::Destroying;
        }
        self.teardown().await;
    }

    /// Power the guest off and tear it down. The process gets a
    /// force-poweroff, then SIGTERM, then SIGKILL, each after a grace period.
    /// A stop during launch waits for the launch to settle first. Returns
    /// whether a process was present.
    pub async fn stop(&self) -> bool {
        let (starting, mut pid) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_active() {
                return false;
            }
            let starting = inner.state == SupervisorState::Starting;
            inner.state = SupervisorState::Destroying;
            (starting, inner.pid)
        };

        // Let an in-flight launch finish so teardown never overlaps the spawn.
        if starting {
            self.wait_for_launch().await;
            pid = self.inner.lock().pid;
        }

        if let Some(pid) = pid {
            let ctl = self.ctx.control.as_ref();
            bhyve::control_best_effort(ctl, ControlOp::ForcePowerOff, &self.spec.name).await;

            if !self.wait_for_exit(self.ctx.config.stop_timeout).await {
                warn!(vm = %self.spec.name, pid, "VM did not power off, sending SIGTERM");
                self.signal(pid, libc::SIGTERM);

                if !self.wait_for_exit(self.ctx.config.kill_timeout).await {
                    warn!(vm = %self.spec.name, pid, "VM ignored SIGTERM, sending SIGKILL");
                    self.signal(pid, libc::SIGKILL);
                }
            }
        }

        self.teardown().await;
        pid.is_some()
    }

    /// Reset the guest. bhyve exits with status 0 and the exit policy
    /// relaunches the VM.
    pub async fn restart(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != SupervisorState::Running {
                return false;
            }
            inner.state = SupervisorState::Rebooting;
        }

        bhyve::control_best_effort(self.ctx.control.as_ref(), ControlOp::ForceReset, &self.spec.name)
            .await;
        self.destroy_taps().await;
        self.stop_console().await;
        true
    }

    /// Whether the VM is actually running.
    pub async fn running(&self) -> bool {
        let exists = match bhyve::vm_exists(self.ctx.control.as_ref(), &self.spec.name).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(error = %e, "could not query VM state");
                return false;
            }
        };
        if !exists {
            return false;
        }

        let (pid, launched) = {
            let inner = self.inner.lock();
            (inner.pid, inner.launched)
        };
        match pid {
            Some(pid) if is_process_alive(pid) => true,
            // Not launched by this daemon: a VM left behind by a previous
            // instance counts as running rather than inconsistent.
            None if !launched => true,
            _ => {
                error!(
                    vm = %self.spec.name,
                    pid = ?pid,
                    "VM exists in the kernel but its bhyve process is gone"
                );
                false
            }
        }
    }

    pub async fn status(&self) -> VmStatus {
        VmStatus::from(self.running().await)
    }

    async fn teardown(&self) {
        bhyve::control_best_effort(self.ctx.control.as_ref(), ControlOp::Destroy, &self.spec.name)
            .await;
        self.stop_console().await;
        self.destroy_taps().await;
        // Last, so the id stays taken until every resource is released.
        self.unregister().await;
        self.inner.lock().state = SupervisorState::Stopped;
        info!(vm = %self.spec.name, "VM stopped");
    }

    /// Remove this instance from the registry, leaving any newer supervisor
    /// for the same id alone.
    async fn unregister(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut map = registry.lock().await;
        if map
            .get(&self.spec.id)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self))
        {
            map.remove(&self.spec.id);
        }
    }

    async fn stop_console(&self) {
        let console = self.inner.lock().console.take();
        if let Some(mut proxy) = console {
            if let Err(e) = proxy.kill().await {
                warn!(vm = %self.spec.name, error = %e, "failed to kill console proxy");
            }
        }
    }

    async fn destroy_taps(&self) {
        let taps = std::mem::take(&mut self.inner.lock().taps);
        for tap in taps {
            self.destroy_tap(&tap).await;
        }
    }

    async fn destroy_tap(&self, tap: &str) {
        if let Err(e) = self.ctx.bridges.destroy_tap(tap).await {
            warn!(vm = %self.spec.name, tap = %tap, error = %format!("{:#}", e), "failed to destroy tap");
        }
    }

    fn signal(&self, pid: u32, signal: libc::c_int) {
        if let Err(e) = signal_process(pid, signal) {
            warn!(vm = %self.spec.name, pid, signal, error = %e, "failed to signal bhyve");
        }
    }

    async fn wait_for_launch(&self) {
        let mut rx = self.launch_done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exited.subscribe();
        let exited = async move { rx.wait_for(|exited| *exited).await.is_ok() };
        matches!(tokio::time::timeout(timeout, exited).await, Ok(true))
    }
}

/// Log each line of a bhyve output stream, tagged with the VM name.
async fn drain_lines<R: AsyncRead + Unpin>(reader: Option<R>, vm: &str) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(vm = %vm, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(vm = %vm, error = %e, "failed to read bhyve output");
                break;
            }
        }
    }
}
