use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::NetworkDriver;

/// Tap and bridge manager for VM NICs.
///
/// Each NIC gets a fresh tap device which is joined to a bridge that has the
/// NIC's uplink as a member. Bridges are shared between VMs and never removed;
/// taps belong to the supervisor run that created them.
pub struct BridgeManager {
    driver: Arc<dyn NetworkDriver>,
    /// Interfaces with this prefix are considered bridges (default: "bridge").
    bridge_prefix: String,
    /// Serializes find-or-create per uplink so concurrent starts share one bridge.
    uplink_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BridgeManager {
    pub fn new(driver: Arc<dyn NetworkDriver>, bridge_prefix: String) -> Self {
        Self {
            driver,
            bridge_prefix,
            uplink_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a tap device and bring it up. Returns the tap name.
    #[instrument(skip(self))]
    pub async fn create_tap(&self) -> Result<String> {
        let tap = self.driver.create_tap().await?;
        if let Err(e) = self.driver.set_up(&tap).await {
            if let Err(destroy_err) = self.driver.destroy_interface(&tap).await {
                warn!(tap = %tap, error = %destroy_err, "failed to destroy tap after setup error");
            }
            return Err(e).with_context(|| format!("failed to bring up {}", tap));
        }
        debug!(tap = %tap, "tap device created");
        Ok(tap)
    }

    #[instrument(skip(self))]
    pub async fn destroy_tap(&self, tap: &str) -> Result<()> {
        self.driver.destroy_interface(tap).await?;
        debug!(tap = %tap, "tap device destroyed");
        Ok(())
    }

    /// Join `tap` to the bridge carrying `uplink`.
    ///
    /// Without an uplink the default-route interface is used. If there is no
    /// default route either, the tap stays isolated and `Ok(None)` is returned.
    /// Otherwise returns the bridge the tap was added to.
    #[instrument(skip(self))]
    pub async fn attach(&self, tap: &str, uplink: Option<&str>) -> Result<Option<String>> {
        let uplink = match uplink {
            Some(u) => u.to_string(),
            None => match self.driver.default_route_interface().await? {
                Some(u) => u,
                None => {
                    debug!(tap = %tap, "no uplink and no default route; tap left unbridged");
                    return Ok(None);
                }
            },
        };

        let lock = self.uplink_lock(&uplink).await;
        let _guard = lock.lock().await;

        let uplink_mtu = self
            .driver
            .mtu(&uplink)
            .await
            .with_context(|| format!("failed to read mtu of uplink {}", uplink))?;

        let (bridge, created) = match self.find_bridge_for(&uplink).await? {
            Some(bridge) => (bridge, false),
            None => {
                let bridge = self.driver.create_bridge().await?;
                info!(bridge = %bridge, uplink = %uplink, "created bridge");
                (bridge, true)
            }
        };

        let bridge_mtu = self.driver.mtu(&bridge).await?;
        if bridge_mtu < uplink_mtu {
            self.driver.set_mtu(&bridge, uplink_mtu).await?;
        }
        let target_mtu = bridge_mtu.max(uplink_mtu);

        if created {
            self.driver
                .add_bridge_member(&bridge, &uplink)
                .await
                .with_context(|| format!("failed to add uplink {} to {}", uplink, bridge))?;
        }

        let tap_mtu = self.driver.mtu(tap).await?;
        if tap_mtu < target_mtu {
            self.driver.set_mtu(tap, target_mtu).await?;
        }

        self.driver.add_bridge_member(&bridge, tap).await?;
        self.driver.set_up(&bridge).await?;

        info!(tap = %tap, bridge = %bridge, uplink = %uplink, mtu = target_mtu, "tap attached");
        Ok(Some(bridge))
    }

    /// Find an existing bridge that has `uplink` as a member.
    pub async fn find_bridge_for(&self, uplink: &str) -> Result<Option<String>> {
        for iface in self.driver.interfaces().await? {
            if !is_bridge_name(&iface, &self.bridge_prefix) {
                continue;
            }
            let members = self.driver.bridge_members(&iface).await?;
            if members.iter().any(|m| m == uplink) {
                return Ok(Some(iface));
            }
        }
        Ok(None)
    }

    async fn uplink_lock(&self, uplink: &str) -> Arc<Mutex<()>> {
        let mut map = self.uplink_locks.lock().await;
        map.entry(uplink.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// `bridge0`, `bridge12`; not `bridged` or `bridge`.
fn is_bridge_name(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}
