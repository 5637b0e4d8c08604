use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nasvm_protocol::{Device, SpecError, VmSpec};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, warn};

use super::device::{cdrom_arg, disk_arg, nic_arg, vnc_args};
use super::slot::SlotAllocator;
use crate::config::HypervisorConfig;

/// Tap name shown for NICs when a command line is rendered without
/// provisioning any network resources.
pub const PLACEHOLDER_TAP: &str = "tap?";

/// A fully-resolved bhyve command ready to be spawned.
#[derive(Debug, Clone)]
pub struct BhyveCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl BhyveCommand {
    /// Convert to a tokio Command. Output is piped so the supervisor can drain
    /// it into the log; the process is killed if the handle is dropped.
    pub fn to_tokio_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Return the full command line as a string (for logging).
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(' ') {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

/// Build the bhyve invocation for `spec`.
///
/// `taps` holds one tap name per NIC, in device order. Slots are handed out in
/// device order starting at 3; the first VNC device takes the fixed
/// framebuffer and tablet slots. The VM name is always the last argument.
pub fn build_command(
    spec: &VmSpec,
    config: &HypervisorConfig,
    taps: &[String],
) -> Result<BhyveCommand, SpecError> {
    let mut args: Vec<String> = vec![
        "-H".into(),
        "-w".into(),
        "-c".into(),
        spec.vcpus.to_string(),
        "-m".into(),
        spec.memory.to_string(),
        "-s".into(),
        "0:0,hostbridge".into(),
        "-s".into(),
        "31,lpc".into(),
        "-l".into(),
        format!("com1,{}", serial_device(config, spec.id, 'A')),
    ];

    if let Some(image) = spec.bootloader.firmware_image() {
        args.push("-l".into());
        args.push(format!("bootrom,{}", config.firmware_dir.join(image).display()));
    }

    let mut slots = SlotAllocator::new();
    let mut taps = taps.iter();
    let mut framebuffer = false;

    for device in &spec.devices {
        match device {
            Device::Disk(disk) | Device::Raw(disk) => {
                args.push("-s".into());
                args.push(disk_arg(slots.allocate()?, disk));
            }
            Device::Cdrom(cdrom) => {
                args.push("-s".into());
                args.push(cdrom_arg(slots.allocate()?, cdrom));
            }
            Device::Nic(nic) => {
                let slot = slots.allocate()?;
                let tap = taps.next().ok_or_else(|| {
                    SpecError::InvalidVm(format!("no tap device provisioned for NIC in slot {}", slot))
                })?;
                args.push("-s".into());
                args.push(nic_arg(slot, nic, tap));
            }
            Device::Vnc(vnc) => {
                if framebuffer {
                    warn!(vm = %spec.name, port = vnc.port, "ignoring additional VNC device");
                    continue;
                }
                framebuffer = true;
                for arg in vnc_args(vnc) {
                    args.push("-s".into());
                    args.push(arg);
                }
            }
        }
    }

    args.push(spec.name.clone());

    Ok(BhyveCommand {
        binary: config.bhyve_binary.clone(),
        args,
    })
}

/// Validate that `spec` can be turned into a command line, without touching
/// any host resources.
pub fn preflight(spec: &VmSpec, config: &HypervisorConfig) -> Result<(), SpecError> {
    build_command(spec, config, &placeholder_taps(spec)).map(|_| ())
}

/// One placeholder tap per NIC.
pub fn placeholder_taps(spec: &VmSpec) -> Vec<String> {
    spec.devices
        .iter()
        .filter(|d| matches!(d, Device::Nic(_)))
        .map(|_| PLACEHOLDER_TAP.to_string())
        .collect()
}

/// Serial console device of VM `id`. bhyve opens side `A`; users attach to `B`.
pub fn serial_device(config: &HypervisorConfig, id: u64, side: char) -> String {
    format!("{}{}{}", config.nmdm_prefix, id, side)
}

// ---------------------------------------------------------------------------
// bhyvectl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    Destroy,
    ForceReset,
    ForcePowerOff,
    /// Bare `--vm=<name>`: exit 0 if the VM exists in the kernel.
    Status,
}

impl ControlOp {
    fn flag(&self) -> Option<&'static str> {
        match self {
            ControlOp::Destroy => Some("--destroy"),
            ControlOp::ForceReset => Some("--force-reset"),
            ControlOp::ForcePowerOff => Some("--force-poweroff"),
            ControlOp::Status => None,
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag().unwrap_or("--vm"))
    }
}

/// How a control command failed.
#[derive(Debug, Error)]
pub enum ControlFailure {
    /// The program ran and exited non-zero (or was killed).
    #[error("bhyvectl {op} for '{vm}' exited with {code:?}")]
    NonZeroExit {
        op: ControlOp,
        vm: String,
        code: Option<i32>,
    },

    /// The program could not be executed at all.
    #[error("failed to execute bhyvectl {op} for '{vm}': {source}")]
    Exec {
        op: ControlOp,
        vm: String,
        #[source]
        source: io::Error,
    },
}

/// Kernel-side VM control.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    /// Run `op` against `vm_name` and return the exit code (`None` if the
    /// control program was killed by a signal).
    async fn exec(&self, op: ControlOp, vm_name: &str) -> io::Result<Option<i32>>;
}

/// [`HypervisorControl`] backed by the `bhyvectl` program.
#[derive(Debug, Clone)]
pub struct Bhyvectl {
    binary: PathBuf,
}

impl Bhyvectl {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl HypervisorControl for Bhyvectl {
    async fn exec(&self, op: ControlOp, vm_name: &str) -> io::Result<Option<i32>> {
        let mut cmd = Command::new(&self.binary);
        if let Some(flag) = op.flag() {
            cmd.arg(flag);
        }
        cmd.arg(format!("--vm={}", vm_name));

        debug!(op = %op, vm = %vm_name, "running bhyvectl");
        let output = cmd.stdin(Stdio::null()).output().await?;
        if !output.status.success() {
            debug!(
                op = %op,
                vm = %vm_name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "bhyvectl returned non-zero"
            );
        }
        Ok(output.status.code())
    }
}

/// Run a control operation, classifying failures.
pub async fn control(
    ctl: &dyn HypervisorControl,
    op: ControlOp,
    vm_name: &str,
) -> Result<(), ControlFailure> {
    match ctl.exec(op, vm_name).await {
        Ok(Some(0)) => Ok(()),
        Ok(code) => Err(ControlFailure::NonZeroExit {
            op,
            vm: vm_name.to_string(),
            code,
        }),
        Err(source) => Err(ControlFailure::Exec {
            op,
            vm: vm_name.to_string(),
            source,
        }),
    }
}

/// Run a control operation whose failure must not abort the caller.
/// A non-zero exit is expected (the VM may already be gone) and logged at
/// warn; failing to run the program at all is logged at error.
pub async fn control_best_effort(ctl: &dyn HypervisorControl, op: ControlOp, vm_name: &str) {
    match control(ctl, op, vm_name).await {
        Ok(()) => debug!(op = %op, vm = %vm_name, "bhyvectl succeeded"),
        Err(e @ ControlFailure::NonZeroExit { .. }) => warn!(error = %e, "bhyvectl failed, ignoring"),
        Err(e @ ControlFailure::Exec { .. }) => error!(error = %e, "bhyvectl could not be run"),
    }
}

/// Whether the kernel knows about `vm_name`. Exit 0 means it exists, 1 means
/// it does not; anything else is a failure.
pub async fn vm_exists(ctl: &dyn HypervisorControl, vm_name: &str) -> Result<bool, ControlFailure> {
    match ctl.exec(ControlOp::Status, vm_name).await {
        Ok(Some(0)) => Ok(true),
        Ok(Some(1)) => Ok(false),
        Ok(code) => Err(ControlFailure::NonZeroExit {
            op: ControlOp::Status,
            vm: vm_name.to_string(),
            code,
        }),
        Err(source) => Err(ControlFailure::Exec {
            op: ControlOp::Status,
            vm: vm_name.to_string(),
            source,
        }),
    }
}
