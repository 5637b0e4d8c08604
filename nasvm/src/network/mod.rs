pub mod bridge;
pub mod ifconfig;

use anyhow::Result;
use async_trait::async_trait;

pub use bridge::BridgeManager;
pub use ifconfig::IfconfigDriver;

/// Host interface operations the bridge manager and supervisor need.
///
/// The production implementation shells out to `ifconfig(8)` and `route(8)`;
/// tests substitute a recording fake.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Names of every interface on the host.
    async fn interfaces(&self) -> Result<Vec<String>>;

    /// Create a new tap device and return its kernel-assigned name.
    async fn create_tap(&self) -> Result<String>;

    /// Create a new bridge and return its kernel-assigned name.
    async fn create_bridge(&self) -> Result<String>;

    async fn destroy_interface(&self, name: &str) -> Result<()>;

    /// Member interfaces of a bridge.
    async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>>;

    async fn mtu(&self, name: &str) -> Result<u32>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;

    async fn add_bridge_member(&self, bridge: &str, member: &str) -> Result<()>;

    async fn set_up(&self, name: &str) -> Result<()>;

    /// Interface carrying the IPv4 default route, if there is one.
    async fn default_route_interface(&self) -> Result<Option<String>>;
}
