use nasvm_protocol::VmDefinition;
use serde_json::Value;
use tracing::warn;

use crate::storage::zvol_dataset;

const CLONE_MARKER: &str = "_clone";

/// A zvol to snapshot and clone for a cloned VM's disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZvolClone {
    pub dataset: String,
    pub snapshot: String,
    pub target: String,
}

/// Everything needed to materialize a clone.
#[derive(Debug, Clone)]
pub struct ClonePlan {
    /// The new VM, ready to insert.
    pub definition: VmDefinition,
    pub zvols: Vec<ZvolClone>,
}

/// Next free `<name>_clone<N>`.
///
/// Cloning a clone numbers from the original name: cloning `web_clone0`
/// yields `web_clone1`, not `web_clone0_clone0`.
pub fn next_clone_name<'a>(name: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let root = clone_root(name).unwrap_or(name);
    let next = existing
        .into_iter()
        .filter(|n| clone_root(n) == Some(root))
        .filter_map(|n| n[root.len() + CLONE_MARKER.len()..].parse::<u64>().ok())
        .max()
        .map_or(0, |n| n + 1);
    format!("{}{}{}", root, CLONE_MARKER, next)
}

/// `web` for `web_clone3`.
fn clone_root(name: &str) -> Option<&str> {
    let pos = name.rfind(CLONE_MARKER)?;
    let digits = &name[pos + CLONE_MARKER.len()..];
    if pos > 0 && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(&name[..pos])
    } else {
        None
    }
}

/// Derive the clone of `source`.
///
/// NIC MACs and VNC ports are dropped so the clone gets its own. Each zvol
/// disk is cloned to `<dataset>_<clone name>`; RAW images (and disks that are
/// not zvols) cannot be cloned here and their path is cleared.
pub fn plan_clone<'a>(
    source: &VmDefinition,
    existing_names: impl IntoIterator<Item = &'a str>,
    zvol_prefix: &str,
) -> ClonePlan {
    let name = next_clone_name(&source.vm.name, existing_names);
    let mut definition = source.clone();
    definition.vm.id = 0;
    definition.vm.name = name.clone();

    let mut zvols = Vec::new();
    for device in &mut definition.devices {
        let attrs = &mut device.attributes;
        match device.dtype.as_str() {
            "NIC" => {
                attrs.remove("mac");
            }
            "VNC" => {
                attrs.remove("vnc_port");
            }
            "DISK" => {
                let path = attrs.get("path").and_then(Value::as_str).unwrap_or_default();
                match zvol_dataset(path, zvol_prefix) {
                    Some(dataset) => {
                        let target = format!("{}_{}", dataset, name);
                        zvols.push(ZvolClone {
                            dataset: dataset.to_string(),
                            snapshot: name.clone(),
                            target: target.clone(),
                        });
                        attrs.insert(
                            "path".into(),
                            Value::String(format!("{}{}", zvol_prefix, target)),
                        );
                    }
                    None => {
                        warn!(path = %path, clone = %name, "disk is not a zvol; copy it manually");
                        attrs.insert("path".into(), Value::String(String::new()));
                    }
                }
            }
            "RAW" => {
                warn!(clone = %name, "RAW disk images must be copied manually");
                attrs.insert("path".into(), Value::String(String::new()));
            }
            _ => {}
        }
    }

    ClonePlan { definition, zvols }
}
