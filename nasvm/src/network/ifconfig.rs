use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::NetworkDriver;

/// [`NetworkDriver`] backed by FreeBSD's `ifconfig` and `route` commands.
#[derive(Debug, Clone)]
pub struct IfconfigDriver {
    ifconfig: PathBuf,
    route: PathBuf,
}

impl IfconfigDriver {
    pub fn new(ifconfig: PathBuf, route: PathBuf) -> Self {
        Self { ifconfig, route }
    }

    async fn ifconfig(&self, args: &[&str]) -> Result<String> {
        run_output(&self.ifconfig, args).await
    }

    async fn create_cloned(&self, kind: &str) -> Result<String> {
        let name = self
            .ifconfig(&[kind, "create"])
            .await
            .with_context(|| format!("failed to create {} interface", kind))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("ifconfig {} create returned no interface name", kind);
        }
        Ok(name.to_string())
    }
}

#[async_trait]
impl NetworkDriver for IfconfigDriver {
    async fn interfaces(&self) -> Result<Vec<String>> {
        let out = self
            .ifconfig(&["-l"])
            .await
            .context("failed to list interfaces")?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn create_tap(&self) -> Result<String> {
        self.create_cloned("tap").await
    }

    async fn create_bridge(&self) -> Result<String> {
        self.create_cloned("bridge").await
    }

    async fn destroy_interface(&self, name: &str) -> Result<()> {
        self.ifconfig(&[name, "destroy"])
            .await
            .with_context(|| format!("failed to destroy {}", name))?;
        Ok(())
    }

    async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>> {
        let out = self
            .ifconfig(&[bridge])
            .await
            .with_context(|| format!("failed to query bridge {}", bridge))?;
        Ok(parse_bridge_members(&out))
    }

    async fn mtu(&self, name: &str) -> Result<u32> {
        let out = self
            .ifconfig(&[name])
            .await
            .with_context(|| format!("failed to query {}", name))?;
        parse_mtu(&out).with_context(|| format!("no mtu reported for {}", name))
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.ifconfig(&[name, "mtu", &mtu])
            .await
            .with_context(|| format!("failed to set mtu {} on {}", mtu, name))?;
        Ok(())
    }

    async fn add_bridge_member(&self, bridge: &str, member: &str) -> Result<()> {
        self.ifconfig(&[bridge, "addm", member])
            .await
            .with_context(|| format!("failed to add {} to {}", member, bridge))?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        self.ifconfig(&[name, "up"])
            .await
            .with_context(|| format!("failed to bring up {}", name))?;
        Ok(())
    }

    async fn default_route_interface(&self) -> Result<Option<String>> {
        let output = Command::new(&self.route)
            .args(["-n", "get", "default"])
            .output()
            .await
            .context("failed to execute route command")?;

        // route exits non-zero when there is no default route.
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_route_interface(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Extract `member:` lines from `ifconfig <bridge>` output.
///
/// ```text
/// bridge0: flags=8843<UP,BROADCAST,RUNNING,SIMPLEX,MULTICAST> metric 0 mtu 1500
///         member: tap0 flags=143<LEARNING,DISCOVER,AUTOEDGE,AUTOPTP>
///         member: igb0 flags=143<LEARNING,DISCOVER,AUTOEDGE,AUTOPTP>
/// ```
pub(crate) fn parse_bridge_members(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("member:"))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Extract the `mtu N` value from the header line of `ifconfig <if>` output.
pub(crate) fn parse_mtu(output: &str) -> Option<u32> {
    let header = output.lines().next()?;
    let mut words = header.split_whitespace();
    while let Some(word) = words.next() {
        if word == "mtu" {
            return words.next()?.parse().ok();
        }
    }
    None
}

/// Extract the `interface:` field from `route -n get default` output.
pub(crate) fn parse_route_interface(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("interface:"))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

async fn run_output(program: &PathBuf, args: &[&str]) -> Result<String> {
    debug!(program = %program.display(), args = ?args, "running network command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to execute {}", program.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} failed: {}",
            program.display(),
            args.join(" "),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
