use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Low-level ZFS command wrapper. All operations shell out to the `zfs` CLI.
#[derive(Debug, Clone)]
pub struct Zfs {
    binary: PathBuf,
}

impl Zfs {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Runs: `zfs snapshot {dataset}@{name}`. Returns the full snapshot name.
    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<String> {
        let snapshot = format!("{}@{}", dataset, name);
        run_zfs(&self.binary, &["snapshot", &snapshot])
            .await
            .with_context(|| format!("failed to create snapshot {}", snapshot))?;
        debug!(snapshot = %snapshot, "snapshot created");
        Ok(snapshot)
    }

    /// Runs: `zfs clone {snapshot} {target}`.
    #[instrument(skip(self))]
    pub async fn clone_snapshot(&self, snapshot: &str, target: &str) -> Result<()> {
        run_zfs(&self.binary, &["clone", snapshot, target])
            .await
            .with_context(|| format!("failed to clone {} -> {}", snapshot, target))?;
        debug!(snapshot = %snapshot, target = %target, "snapshot cloned");
        Ok(())
    }
}

/// Run a `zfs` command, failing with its stderr on non-zero exit.
async fn run_zfs(binary: &Path, args: &[&str]) -> Result<()> {
    debug!(args = ?args, "running zfs command");

    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .context("failed to execute zfs command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("zfs {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
    }

    Ok(())
}
