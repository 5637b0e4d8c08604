//! Translation of guest devices into bhyve `-s` slot arguments.

use nasvm_protocol::{
    CdromDevice, DiskBus, DiskDevice, NicDevice, NicModel, VncDevice, DEFAULT_VNC_RESOLUTION,
    MAC_OUI,
};
use rand::Rng;

use super::slot::{FRAMEBUFFER_SLOT, TABLET_SLOT};

/// `<slot>,ahci-hd|virtio-blk,<path>[,sectorsize=N]`. Used for both DISK and RAW.
pub fn disk_arg(slot: u8, disk: &DiskDevice) -> String {
    let driver = match disk.bus {
        DiskBus::Ahci => "ahci-hd",
        DiskBus::Virtio => "virtio-blk",
    };
    let mut arg = format!("{},{},{}", slot, driver, disk.path);
    if let Some(size) = disk.sector_size.filter(|s| *s > 0) {
        arg.push_str(&format!(",sectorsize={}", size));
    }
    arg
}

pub fn cdrom_arg(slot: u8, cdrom: &CdromDevice) -> String {
    format!("{},ahci-cd,{}", slot, cdrom.path)
}

/// `<slot>,virtio-net|e1000,<tap>,mac=<mac>`. A NIC without a fixed MAC gets a
/// freshly generated one on every launch.
pub fn nic_arg(slot: u8, nic: &NicDevice, tap: &str) -> String {
    let driver = match nic.model {
        NicModel::Virtio => "virtio-net",
        NicModel::E1000 => "e1000",
    };
    let mac = nic.mac.clone().unwrap_or_else(random_mac);
    format!("{},{},{},mac={}", slot, driver, tap, mac)
}

/// Framebuffer and tablet arguments for a VNC console. These always occupy
/// the fixed slots 29 and 30.
pub fn vnc_args(vnc: &VncDevice) -> [String; 2] {
    let (width, height) = vnc.resolution.unwrap_or(DEFAULT_VNC_RESOLUTION);
    let mut fbuf = format!(
        "{},fbuf,tcp={}:{},w={},h={}",
        FRAMEBUFFER_SLOT, vnc.bind, vnc.port, width, height
    );
    if let Some(password) = vnc.password.as_deref().filter(|p| !p.is_empty()) {
        fbuf.push_str(&format!(",password={}", password));
    }
    if vnc.wait {
        fbuf.push_str(",wait");
    }
    [fbuf, format!("{},xhci,tablet", TABLET_SLOT)]
}

/// Random MAC under the appliance OUI. The fourth octet stays below 0x80.
pub fn random_mac() -> String {
    let mut rng = rand::rng();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        MAC_OUI[0],
        MAC_OUI[1],
        MAC_OUI[2],
        rng.random_range(0x00..=0x7fu8),
        rng.random::<u8>(),
        rng.random::<u8>(),
    )
}
