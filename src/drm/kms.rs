//! Kernel mode-setting queries
//!
//! `KmsDevice` is the seam between the display manager and the kernel:
//! resource snapshots, connector/encoder/plane probes and master control.
//! `Card` implements it on top of an opened DRM primary node.

use anyhow::{anyhow, Context, Result};
use drm::control::{
    connector, crtc, encoder, from_u32, CrtcListFilter, Device as ControlDevice, Mode,
    ModeTypeFlags, ResourceHandles,
};
use drm::{ClientCapability, Device as BasicDevice};
use log::{debug, info, warn};
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

/// One display timing a connector supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub vdisplay: u16,
    pub vrefresh: u32,
    /// Flagged "preferred" by the kernel
    pub preferred: bool,
}

impl From<&Mode> for DisplayMode {
    fn from(mode: &Mode) -> Self {
        let (hdisplay, vdisplay) = mode.size();
        Self {
            name: mode.name().to_string_lossy().into_owned(),
            clock: mode.clock(),
            hdisplay,
            vdisplay,
            vrefresh: mode.vrefresh(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        }
    }
}

/// Index of the preferred mode (first mode if none is flagged)
pub fn preferred_mode_index(modes: &[DisplayMode]) -> usize {
    modes.iter().position(|m| m.preferred).unwrap_or(0)
}

/// Pipeline and connector ids of the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// CRTC ids in enumeration order (index = pipe)
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
}

/// One connector as seen by a single reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorProbe {
    pub id: u32,
    pub connected: bool,
    pub modes: Vec<DisplayMode>,
    /// Currently attached encoder (0 = none)
    pub encoder_id: u32,
    /// Encoders that can drive this connector
    pub encoders: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderProbe {
    pub id: u32,
    /// CRTC the encoder is bound to (0 = none)
    pub crtc_id: u32,
    /// Bit N set = encoder can drive pipe N
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneProbe {
    pub id: u32,
    /// Bit N set = plane can be used on pipe N
    pub possible_crtcs: u32,
}

/// Kernel display queries and master control used by the display manager
///
/// All calls are blocking. Implementations must be shareable with the
/// hotplug worker thread.
pub trait KmsDevice: Send + Sync {
    /// Fetch the resource snapshot (pipelines and connectors)
    fn resources(&self) -> Result<ResourceSnapshot>;

    /// Probe one connector
    fn connector(&self, id: u32) -> Result<ConnectorProbe>;

    /// Query one encoder
    fn encoder(&self, id: u32) -> Result<EncoderProbe>;

    /// Enumerate display planes
    fn planes(&self) -> Result<Vec<PlaneProbe>>;

    /// Claim master rights (SET_MASTER)
    fn set_master(&self) -> Result<()>;

    /// Release master rights (DROP_MASTER)
    fn drop_master(&self) -> Result<()>;

    /// Generate an auth token and authenticate it against this descriptor
    ///
    /// Succeeds only when the descriptor already holds master rights.
    fn authenticate(&self) -> Result<()>;
}

/// Opened DRM device (primary node, plus an optional render node for
/// offscreen work)
pub struct Card {
    file: File,
    path: PathBuf,
    render: Option<File>,
}

// Trait implementations required by drm crate
impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Wrap an already opened primary node
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
            render: None,
        }
    }

    /// Primary node path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get RawFd of the primary node
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Attach the render node used for offscreen work
    pub fn set_render_node(&mut self, render: Option<File>) {
        self.render = render;
    }

    /// Whether a dedicated render node is open
    pub fn has_render_node(&self) -> bool {
        self.render.is_some()
    }

    /// Descriptor for offscreen rendering
    ///
    /// Falls back to the primary node when no render node could be opened.
    pub fn offscreen_fd(&self) -> BorrowedFd<'_> {
        match &self.render {
            Some(render) => render.as_fd(),
            None => self.file.as_fd(),
        }
    }

    /// Duplicate the primary descriptor (for GBM and framebuffer bookkeeping)
    pub fn try_clone(&self) -> Result<Self> {
        let file = self
            .file
            .try_clone()
            .with_context(|| format!("Failed to dup {}", self.path.display()))?;
        Ok(Self::new(file, self.path.clone()))
    }

    /// Give up the wrapper, keeping the primary descriptor
    pub fn into_file(self) -> File {
        self.file
    }

    /// Enable universal planes (best effort) and atomic modesetting
    pub fn enable_client_caps(&self) -> std::io::Result<()> {
        if let Err(e) = self.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!("Failed to enable universal planes: {}", e);
        }
        self.set_client_capability(ClientCapability::Atomic, true)?;
        info!("Atomic modesetting enabled on {}", self.path.display());
        Ok(())
    }

    fn handle<H: From<drm::control::RawResourceHandle>>(id: u32, kind: &str) -> Result<H> {
        from_u32(id).ok_or_else(|| anyhow!("Invalid {} id {}", kind, id))
    }
}

/// Convert a kernel CRTC filter into a pipe bitmask
fn crtc_mask(resources: &ResourceHandles, filter: CrtcListFilter) -> u32 {
    let allowed: Vec<crtc::Handle> = resources.filter_crtcs(filter);
    resources
        .crtcs()
        .iter()
        .enumerate()
        .filter(|(_, crtc)| allowed.contains(crtc))
        .fold(0, |mask, (pipe, _)| mask | (1 << pipe))
}

impl KmsDevice for Card {
    fn resources(&self) -> Result<ResourceSnapshot> {
        let resources = self
            .resource_handles()
            .context("Failed to get DRM resources")?;

        debug!(
            "DRM resources: connectors={}, crtcs={}, encoders={}",
            resources.connectors().len(),
            resources.crtcs().len(),
            resources.encoders().len()
        );

        Ok(ResourceSnapshot {
            crtcs: resources.crtcs().iter().map(|&c| u32::from(c)).collect(),
            connectors: resources
                .connectors()
                .iter()
                .map(|&c| u32::from(c))
                .collect(),
        })
    }

    fn connector(&self, id: u32) -> Result<ConnectorProbe> {
        let handle: connector::Handle = Self::handle(id, "connector")?;
        let info = self
            .get_connector(handle, true)
            .with_context(|| format!("Failed to get connector {} info", id))?;

        Ok(ConnectorProbe {
            id,
            connected: info.state() == connector::State::Connected,
            modes: info.modes().iter().map(DisplayMode::from).collect(),
            encoder_id: info.current_encoder().map(u32::from).unwrap_or(0),
            encoders: info.encoders().iter().map(|&e| u32::from(e)).collect(),
        })
    }

    fn encoder(&self, id: u32) -> Result<EncoderProbe> {
        let handle: encoder::Handle = Self::handle(id, "encoder")?;
        let info = self
            .get_encoder(handle)
            .with_context(|| format!("Failed to get encoder {} info", id))?;
        let resources = self
            .resource_handles()
            .context("Failed to get DRM resources")?;

        Ok(EncoderProbe {
            id,
            crtc_id: info.crtc().map(u32::from).unwrap_or(0),
            possible_crtcs: crtc_mask(&resources, info.possible_crtcs()),
        })
    }

    fn planes(&self) -> Result<Vec<PlaneProbe>> {
        let resources = self
            .resource_handles()
            .context("Failed to get DRM resources")?;
        let handles = self.plane_handles().context("Failed to get plane handles")?;

        let mut planes = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.get_plane(handle) {
                Ok(info) => planes.push(PlaneProbe {
                    id: u32::from(handle),
                    possible_crtcs: crtc_mask(&resources, info.possible_crtcs()),
                }),
                Err(e) => warn!("Failed to get plane {:?}: {}", handle, e),
            }
        }
        Ok(planes)
    }

    fn set_master(&self) -> Result<()> {
        self.acquire_master_lock()
            .with_context(|| format!("SET_MASTER failed on {}", self.path.display()))
    }

    fn drop_master(&self) -> Result<()> {
        self.release_master_lock()
            .with_context(|| format!("DROP_MASTER failed on {}", self.path.display()))
    }

    fn authenticate(&self) -> Result<()> {
        let token = self
            .generate_auth_token()
            .context("Failed to generate auth token")?;
        self.authenticate_auth_token(token)
            .context("Failed to authenticate auth token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(name: &str, preferred: bool) -> DisplayMode {
        DisplayMode {
            name: name.to_string(),
            clock: 148_500,
            hdisplay: 1920,
            vdisplay: 1080,
            vrefresh: 60,
            preferred,
        }
    }

    #[test]
    fn test_preferred_mode_flagged() {
        let modes = vec![mode("a", false), mode("b", true), mode("c", false)];
        assert_eq!(preferred_mode_index(&modes), 1);
    }

    #[test]
    fn test_preferred_mode_defaults_to_first() {
        let modes = vec![mode("a", false), mode("b", false)];
        assert_eq!(preferred_mode_index(&modes), 0);
        assert_eq!(preferred_mode_index(&[]), 0);
    }
}
