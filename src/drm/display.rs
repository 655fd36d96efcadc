//! Physical display state
//!
//! One `PhysicalDisplay` exists per kernel pipeline (CRTC). It tracks which
//! connector currently drives it, the connector's modes, the planes it owns
//! and the content protection the client asked for.

use log::{debug, info};
use std::sync::Arc;

use super::kms::DisplayMode;
use super::resources::BufferHandler;

/// Per-display connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No output attached (initial)
    Disconnected,
    /// Marked at the start of a reconciliation pass; becomes
    /// Disconnected unless the pass binds an output again
    PendingDisconnect,
    /// Bound to a live output with an active mode
    Connected,
}

/// HDCP desired state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentProtection {
    #[default]
    Undesired,
    Desired,
}

/// HDCP content type classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentType {
    #[default]
    Invalid,
    Type0,
    Type1,
}

/// Snapshot of a display handed to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayHandle {
    /// Pipeline index (stable for the manager's lifetime)
    pub pipe: usize,
    pub crtc_id: u32,
    /// Bound connector (0 when disconnected)
    pub connector_id: u32,
    pub connected: bool,
    /// Active mode, if connected
    pub mode: Option<DisplayMode>,
}

/// Per-display connection status callback
pub type StatusCallback = Arc<dyn Fn(&DisplayHandle, bool) + Send + Sync>;

/// Display entity for one kernel pipeline
pub struct PhysicalDisplay {
    pipe: usize,
    crtc_id: u32,
    connector_id: u32,
    state: ConnectionState,
    modes: Vec<DisplayMode>,
    active_mode: Option<usize>,
    /// Planes usable on this pipe
    planes: Vec<u32>,
    /// Unreserved planes already pruned in the current epoch
    planes_updated: bool,
    protection: ContentProtection,
    content_type: ContentType,
    /// HDCP System Renewability Message
    srm: Option<Vec<u8>>,
    refresh_pending: bool,
    ignore_updates: bool,
    buffer_handler: Option<Arc<BufferHandler>>,
    status_callback: Option<StatusCallback>,
    last_notified: Option<bool>,
}

impl PhysicalDisplay {
    pub fn new(pipe: usize, crtc_id: u32, planes: Vec<u32>) -> Self {
        Self {
            pipe,
            crtc_id,
            connector_id: 0,
            state: ConnectionState::Disconnected,
            modes: Vec::new(),
            active_mode: None,
            planes,
            planes_updated: false,
            protection: ContentProtection::default(),
            content_type: ContentType::default(),
            srm: None,
            refresh_pending: false,
            ignore_updates: false,
            buffer_handler: None,
            status_callback: None,
            last_notified: None,
        }
    }

    pub fn pipe(&self) -> usize {
        self.pipe
    }

    pub fn crtc_id(&self) -> u32 {
        self.crtc_id
    }

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn active_mode_index(&self) -> Option<usize> {
        self.active_mode
    }

    pub fn active_mode(&self) -> Option<&DisplayMode> {
        self.active_mode.and_then(|i| self.modes.get(i))
    }

    /// Bind the GPU buffer services
    pub fn initialize(&mut self, buffer_handler: Arc<BufferHandler>) {
        self.buffer_handler = Some(buffer_handler);
    }

    pub fn buffer_handler(&self) -> Option<&Arc<BufferHandler>> {
        self.buffer_handler.as_ref()
    }

    pub fn mark_for_disconnect(&mut self) {
        self.state = ConnectionState::PendingDisconnect;
    }

    /// Bind an output with its mode list, activating `preferred`
    ///
    /// Returns false (and leaves the display untouched) when the mode list
    /// is empty or `preferred` is out of range.
    pub fn connect(&mut self, connector_id: u32, modes: Vec<DisplayMode>, preferred: usize) -> bool {
        if preferred >= modes.len() {
            debug!(
                "Display {}: refusing connector {} (mode {} of {})",
                self.pipe,
                connector_id,
                preferred,
                modes.len()
            );
            return false;
        }

        if self.connector_id != connector_id || self.active_mode != Some(preferred) {
            let mode = &modes[preferred];
            info!(
                "Display {} (crtc {}): connector {} at {}x{}@{}",
                self.pipe, self.crtc_id, connector_id, mode.hdisplay, mode.vdisplay, mode.vrefresh
            );
        }

        self.connector_id = connector_id;
        self.modes = modes;
        self.active_mode = Some(preferred);
        self.state = ConnectionState::Connected;
        true
    }

    /// Release the output association
    pub fn disconnect(&mut self) {
        if self.connector_id != 0 {
            info!(
                "Display {} (crtc {}): connector {} disconnected",
                self.pipe, self.crtc_id, self.connector_id
            );
        }
        self.connector_id = 0;
        self.modes.clear();
        self.active_mode = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn planes(&self) -> &[u32] {
        &self.planes
    }

    pub fn planes_updated(&self) -> bool {
        self.planes_updated
    }

    pub fn set_planes_updated(&mut self, updated: bool) {
        self.planes_updated = updated;
    }

    /// Give every plane not in `reserved` back to the shared pool
    ///
    /// Returns the released plane ids.
    pub fn release_unreserved_planes(&mut self, reserved: &[u32]) -> Vec<u32> {
        let (kept, released): (Vec<u32>, Vec<u32>) =
            self.planes.iter().partition(|id| reserved.contains(id));
        if !released.is_empty() {
            info!(
                "Display {}: keeping planes {:?}, released {:?}",
                self.pipe, kept, released
            );
        }
        self.planes = kept;
        released
    }

    pub fn set_hdcp_state(&mut self, protection: ContentProtection, content_type: ContentType) {
        debug!(
            "Display {}: HDCP {:?} ({:?})",
            self.pipe, protection, content_type
        );
        self.protection = protection;
        self.content_type = content_type;
    }

    pub fn hdcp_state(&self) -> (ContentProtection, ContentType) {
        (self.protection, self.content_type)
    }

    pub fn set_hdcp_srm(&mut self, srm: &[u8]) {
        debug!("Display {}: SRM of {} bytes", self.pipe, srm.len());
        self.srm = Some(srm.to_vec());
    }

    pub fn hdcp_srm(&self) -> Option<&[u8]> {
        self.srm.as_deref()
    }

    /// Request a full repaint on the next commit
    pub fn force_refresh(&mut self) {
        self.ignore_updates = false;
        self.refresh_pending = true;
    }

    /// Consume a pending refresh request
    pub fn take_refresh(&mut self) -> bool {
        std::mem::take(&mut self.refresh_pending)
    }

    /// Stop presenting client updates until the next refresh
    pub fn ignore_updates(&mut self) {
        self.ignore_updates = true;
    }

    pub fn is_ignoring_updates(&self) -> bool {
        self.ignore_updates
    }

    pub fn set_status_callback(&mut self, callback: Option<StatusCallback>) {
        self.status_callback = callback;
        self.last_notified = None;
    }

    /// Status notification owed to the client, if the connection status
    /// differs from the last one reported
    pub fn take_status_notification(&mut self) -> Option<(StatusCallback, DisplayHandle, bool)> {
        let callback = self.status_callback.clone()?;
        let connected = self.is_connected();
        if self.last_notified == Some(connected) {
            return None;
        }
        self.last_notified = Some(connected);
        Some((callback, self.handle(), connected))
    }

    pub fn handle(&self) -> DisplayHandle {
        DisplayHandle {
            pipe: self.pipe,
            crtc_id: self.crtc_id,
            connector_id: self.connector_id,
            connected: self.is_connected(),
            mode: self.active_mode().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes(n: usize) -> Vec<DisplayMode> {
        (0..n)
            .map(|i| DisplayMode {
                name: format!("mode{}", i),
                clock: 0,
                hdisplay: 1920,
                vdisplay: 1080,
                vrefresh: 60,
                preferred: false,
            })
            .collect()
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut display = PhysicalDisplay::new(0, 41, vec![]);
        assert_eq!(display.state(), ConnectionState::Disconnected);

        assert!(display.connect(10, modes(3), 1));
        assert!(display.is_connected());
        assert_eq!(display.connector_id(), 10);
        assert_eq!(display.active_mode_index(), Some(1));

        display.mark_for_disconnect();
        assert!(!display.is_connected());
        display.disconnect();
        assert_eq!(display.state(), ConnectionState::Disconnected);
        assert_eq!(display.connector_id(), 0);
        assert!(display.active_mode().is_none());
    }

    #[test]
    fn test_connect_rejects_bad_mode() {
        let mut display = PhysicalDisplay::new(0, 41, vec![]);
        assert!(!display.connect(10, Vec::new(), 0));
        assert!(!display.connect(10, modes(2), 2));
        assert_eq!(display.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_release_unreserved_planes() {
        let mut display = PhysicalDisplay::new(0, 41, vec![31, 32, 33]);
        let released = display.release_unreserved_planes(&[32]);
        assert_eq!(released, vec![31, 33]);
        assert_eq!(display.planes(), &[32]);
    }

    #[test]
    fn test_status_notification_only_on_change() {
        let mut display = PhysicalDisplay::new(0, 41, vec![]);
        assert!(display.take_status_notification().is_none());

        display.set_status_callback(Some(Arc::new(|_: &DisplayHandle, _: bool| {})));
        let (_, handle, connected) = display.take_status_notification().unwrap();
        assert!(!connected);
        assert_eq!(handle.pipe, 0);
        assert!(display.take_status_notification().is_none());

        display.connect(10, modes(1), 0);
        let (_, handle, connected) = display.take_status_notification().unwrap();
        assert!(connected);
        assert_eq!(handle.connector_id, 10);
    }

    #[test]
    fn test_force_refresh_clears_ignore() {
        let mut display = PhysicalDisplay::new(0, 41, vec![]);
        display.ignore_updates();
        assert!(display.is_ignoring_updates());
        display.force_refresh();
        assert!(!display.is_ignoring_updates());
        assert!(display.take_refresh());
        assert!(!display.take_refresh());
    }
}
