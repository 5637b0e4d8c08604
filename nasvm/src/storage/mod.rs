pub mod zfs;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

pub use zfs::Zfs;

/// Disk cloning used when a VM is cloned.
#[async_trait]
pub trait DiskCloner: Send + Sync {
    /// Snapshot `dataset` as `@{snapshot}` and clone that snapshot to `target`.
    async fn clone_dataset(&self, dataset: &str, snapshot: &str, target: &str) -> Result<()>;
}

/// zvol storage backing VM disks.
pub struct StorageManager {
    zfs: Zfs,
    /// Device path prefix in front of zvol dataset names (e.g. "/dev/zvol/").
    zvol_prefix: String,
}

impl StorageManager {
    pub fn new(zfs: Zfs, zvol_prefix: String) -> Self {
        Self { zfs, zvol_prefix }
    }

    pub fn zvol_prefix(&self) -> &str {
        &self.zvol_prefix
    }
}

#[async_trait]
impl DiskCloner for StorageManager {
    async fn clone_dataset(&self, dataset: &str, snapshot: &str, target: &str) -> Result<()> {
        let snap = self.zfs.create_snapshot(dataset, snapshot).await?;
        self.zfs
            .clone_snapshot(&snap, target)
            .await
            .with_context(|| format!("failed to clone zvol {}", dataset))?;
        info!(source = %dataset, target = %target, "zvol cloned");
        Ok(())
    }
}

/// Dataset name of a zvol device path: `/dev/zvol/tank/vm` -> `tank/vm`.
pub fn zvol_dataset<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix).filter(|d| !d.is_empty())
}
