//! GPU device discovery
//!
//! Enumerates DRM devices through udev, picks the one that should drive the
//! displays and opens its primary node (plus the render node for offscreen
//! work when available).

use bitflags::bitflags;
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::kms::Card;
use crate::config::DeviceConfig;
#[cfg(target_os = "linux")]
use crate::constants::MAX_DRM_DEVICES;

/// Fatal discovery failures; the manager is unusable after any of these
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to enumerate DRM devices: {0}")]
    Enumerate(#[source] io::Error),
    #[error("no DRM device with a primary node found")]
    NoDevices,
    #[error("can't open GPU file {}: {source}", .path.display())]
    OpenPrimary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("atomic modesetting unavailable: {0}")]
    ClientCapability(#[source] io::Error),
    #[error("failed to get DRM resources: {0:#}")]
    Resources(anyhow::Error),
    #[error("device exposes no display pipelines")]
    NoPipelines,
}

bitflags! {
    /// Device nodes exposed by a GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeKinds: u8 {
        const PRIMARY = 0b01;
        const RENDER  = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusType {
    Pci,
    Usb,
    Platform,
    Host1x,
    #[default]
    Unknown,
}

impl BusType {
    fn from_subsystem(subsystem: &str) -> Self {
        match subsystem {
            "pci" => Self::Pci,
            "usb" => Self::Usb,
            "platform" => Self::Platform,
            "host1x" => Self::Host1x,
            _ => Self::Unknown,
        }
    }
}

/// One enumerated GPU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuDeviceInfo {
    pub bus: BusType,
    /// Sysfs name of the bus device (e.g. PCI slot "0000:00:02.0")
    pub bus_id: String,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subvendor_id: u16,
    pub subdevice_id: u16,
    pub revision: u8,
    pub nodes: NodeKinds,
    pub primary_node: Option<PathBuf>,
    pub render_node: Option<PathBuf>,
}

/// Pick the device that drives the displays
///
/// The first device whose vendor matches and whose primary node is the
/// configured path wins. Otherwise the configured index is used, or the
/// first device when that index is out of range.
pub fn select_device(devices: &[GpuDeviceInfo], config: &DeviceConfig) -> Option<usize> {
    if devices.is_empty() {
        return None;
    }

    let preferred = devices.iter().position(|d| {
        d.vendor_id == config.vendor_id
            && d.nodes.contains(NodeKinds::PRIMARY)
            && d.primary_node.as_deref() == Some(Path::new(&config.primary_node))
    });
    if let Some(index) = preferred {
        debug!("Found preferred device {}", index);
        return Some(index);
    }

    if config.preferred_index >= devices.len() {
        warn!(
            "Preferred device {} out of range ({} devices), using the first one",
            config.preferred_index,
            devices.len()
        );
        return Some(0);
    }
    Some(config.preferred_index)
}

/// Enumerate DRM devices that expose a primary node
#[cfg(target_os = "linux")]
pub fn enumerate_devices() -> io::Result<Vec<GpuDeviceInfo>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;

    let mut devices: Vec<(PathBuf, GpuDeviceInfo)> = Vec::new();
    for node in enumerator.scan_devices()? {
        // Connector entries (card0-HDMI-A-1, ...) have no device node
        let Some(devnode) = node.devnode() else {
            continue;
        };
        let sysname = node.sysname().to_string_lossy();
        let kind = if sysname.starts_with("card") {
            NodeKinds::PRIMARY
        } else if sysname.starts_with("renderD") {
            NodeKinds::RENDER
        } else {
            continue;
        };
        let Some(parent) = node.parent() else {
            continue;
        };

        let parent_path = parent.syspath().to_path_buf();
        let index = match devices.iter().position(|(p, _)| *p == parent_path) {
            Some(index) => index,
            None => {
                devices.push((parent_path, bus_device_info(&parent)));
                devices.len() - 1
            }
        };

        let info = &mut devices[index].1;
        info.nodes |= kind;
        if kind == NodeKinds::PRIMARY {
            info.primary_node = Some(devnode.to_path_buf());
        } else {
            info.render_node = Some(devnode.to_path_buf());
        }
    }

    let mut devices: Vec<GpuDeviceInfo> = devices
        .into_iter()
        .map(|(_, info)| info)
        .filter(|info| info.nodes.contains(NodeKinds::PRIMARY))
        .collect();
    sort_by_minor(&mut devices);
    devices.truncate(MAX_DRM_DEVICES);

    debug!("Enumerated {} DRM devices", devices.len());
    Ok(devices)
}

/// Order devices by primary node minor (card2 before card10)
fn sort_by_minor(devices: &mut [GpuDeviceInfo]) {
    devices.sort_by_key(|d| {
        let minor = d.primary_node.as_deref().and_then(node_minor);
        (minor.is_none(), minor, d.primary_node.clone())
    });
}

/// Trailing number of a device node name (`/dev/dri/card1` -> 1)
fn node_minor(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.trim_start_matches(|c: char| !c.is_ascii_digit());
    digits.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn enumerate_devices() -> io::Result<Vec<GpuDeviceInfo>> {
    Ok(Vec::new())
}

#[cfg(target_os = "linux")]
fn bus_device_info(parent: &udev::Device) -> GpuDeviceInfo {
    let attr = |name: &str| {
        parent
            .attribute_value(name)
            .and_then(|v| parse_hex(&v.to_string_lossy()))
            .unwrap_or(0)
    };

    GpuDeviceInfo {
        bus: parent
            .subsystem()
            .map(|s| BusType::from_subsystem(&s.to_string_lossy()))
            .unwrap_or_default(),
        bus_id: parent.sysname().to_string_lossy().into_owned(),
        vendor_id: attr("vendor") as u16,
        device_id: attr("device") as u16,
        subvendor_id: attr("subsystem_vendor") as u16,
        subdevice_id: attr("subsystem_device") as u16,
        revision: attr("revision") as u8,
        ..Default::default()
    }
}

/// Parse a sysfs hex attribute ("0x8086")
fn parse_hex(value: &str) -> Option<u32> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).ok()
}

/// Open the selected device's nodes
///
/// A missing or inaccessible render node is not an error: offscreen work
/// then shares the primary descriptor.
pub fn open_preferred_device(config: &DeviceConfig) -> Result<(Card, GpuDeviceInfo), DiscoveryError> {
    let devices = enumerate_devices().map_err(DiscoveryError::Enumerate)?;
    let index = select_device(&devices, config).ok_or(DiscoveryError::NoDevices)?;
    let device = devices[index].clone();
    let path = device
        .primary_node
        .clone()
        .ok_or(DiscoveryError::NoDevices)?;

    let file = open_node(&path).map_err(|source| DiscoveryError::OpenPrimary {
        path: path.clone(),
        source,
    })?;
    info!("Opened DRM device: {}", path.display());

    let mut card = Card::new(file, path);
    card.set_render_node(open_render_node(device.render_node.as_deref()));
    card.enable_client_caps()
        .map_err(DiscoveryError::ClientCapability)?;

    log_device_info(&device, index);
    Ok((card, device))
}

fn open_node(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn open_render_node(path: Option<&Path>) -> Option<File> {
    let Some(path) = path else {
        warn!("No render node, offscreen rendering uses the primary node");
        return None;
    };

    match open_node(path) {
        Ok(file) => {
            debug!("Opened render node: {}", path.display());
            Some(file)
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(
                "No permission for {}, offscreen rendering uses the primary node",
                path.display()
            );
            None
        }
        Err(e) => {
            warn!(
                "Can't open {} ({}), offscreen rendering uses the primary node",
                path.display(),
                e
            );
            None
        }
    }
}

/// Report the selected device (diagnostics only)
pub fn log_device_info(device: &GpuDeviceInfo, index: usize) {
    info!("Device {} (selected)", index);
    info!("+-> bus {:?} ({})", device.bus, device.bus_id);
    if device.bus == BusType::Pci {
        info!(
            "    +-> vendor {:04x} device {:04x} subvendor {:04x} subdevice {:04x} revision {:02x}",
            device.vendor_id,
            device.device_id,
            device.subvendor_id,
            device.subdevice_id,
            device.revision
        );
    }
    for (label, node) in [
        ("primary", &device.primary_node),
        ("render", &device.render_node),
    ] {
        match node {
            Some(path) => info!("+-> {} node {}", label, path.display()),
            None => info!("+-> {} node unavailable", label),
        }
    }
}
