//! noVNC web console proxy.

use std::process::Stdio;

use anyhow::{Context, Result};
use nasvm_protocol::{VncDevice, DEFAULT_VNC_BIND};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::ConsoleConfig;

/// Web console port for a VNC port.
///
/// The leading two digits are decremented and the rest kept as-is:
/// 5900 -> 5800, 5999 -> 5899, 6100 -> 6000. Existing console links depend on
/// this exact mapping. Returns `None` when the result is not a usable port.
pub fn web_console_port(vnc_port: u16) -> Option<u16> {
    let port = vnc_port.to_string();
    let split = port.len().min(2);
    let prefix: u32 = port[..split].parse().ok()?;
    let web = format!("{}{}", prefix.checked_sub(1)?, &port[split..]);
    match web.parse::<u16>() {
        Ok(p) if p > 0 => Some(p),
        _ => None,
    }
}

/// `http://<bind>:<web port>/vnc_auto.html`, if the device has a web console.
pub fn web_console_url(vnc: &VncDevice) -> Option<String> {
    if !vnc.web {
        return None;
    }
    let port = web_console_port(vnc.port)?;
    Some(format!("http://{}:{}/vnc_auto.html", vnc.bind, port))
}

/// Build the websockify invocation forwarding the web port to the VNC server.
pub fn proxy_command(config: &ConsoleConfig, vnc: &VncDevice) -> Option<Command> {
    let web_port = web_console_port(vnc.port)?;
    let web_bind = if vnc.bind == DEFAULT_VNC_BIND {
        format!(":{}", web_port)
    } else {
        format!("{}:{}", vnc.bind, web_port)
    };

    let mut cmd = Command::new(&config.websockify_binary);
    cmd.arg("--web")
        .arg(&config.novnc_dir)
        .arg("--wrap-mode=exit")
        .arg(web_bind)
        .arg(format!("{}:{}", vnc.bind, vnc.port));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    Some(cmd)
}

/// Spawn the console proxy for `vnc`. Returns `Ok(None)` if no web port can be
/// derived from the VNC port.
pub fn spawn_proxy(config: &ConsoleConfig, vnc: &VncDevice, vm_name: &str) -> Result<Option<Child>> {
    let Some(mut cmd) = proxy_command(config, vnc) else {
        debug!(vm = %vm_name, port = vnc.port, "no web console port for VNC port");
        return Ok(None);
    };
    let child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn console proxy {}",
            config.websockify_binary.display()
        )
    })?;
    info!(
        vm = %vm_name,
        pid = child.id().unwrap_or(0),
        web_port = web_console_port(vnc.port).unwrap_or(0),
        "web console proxy started"
    );
    Ok(Some(child))
}
