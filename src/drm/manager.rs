//! Display manager
//!
//! Owns every physical display behind a single lock and keeps the
//! connector → pipeline mapping current as monitors come and go. Client
//! callbacks always run after the lock has been released, so they may call
//! back into the manager. Passes themselves are serialized: callbacks of one
//! pass are delivered before the next pass starts, so they must not run a
//! pass of their own.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::discovery::{self, DiscoveryError};
use super::display::{
    ContentProtection, ContentType, DisplayHandle, PhysicalDisplay, StatusCallback,
};
use super::hotplug::{HotplugMonitor, HotplugWorker};
use super::kms::{Card, KmsDevice};
use super::master;
use super::planes;
use super::reconcile::reconcile;
use super::resources::{BufferHandler, ResourceCache};
use super::virtual_display::{VirtualDisplay, VirtualDisplayRegistry};
use crate::config::{Config, NotifyPolicy};

/// Called with the connected displays after every reconciliation pass
pub type HotplugCallback = Arc<dyn Fn(&[DisplayHandle]) + Send + Sync>;

/// State guarded by the manager lock
struct SharedState {
    displays: Vec<PhysicalDisplay>,
    connected_count: u32,
    master: bool,
    notify_client: bool,
    ignore_updates: bool,
    /// Set by `force_refresh`, consumed by `handle_lazy_initialization`
    release_lock: bool,
    callback: Option<HotplugCallback>,
}

struct Inner<D> {
    device: D,
    config: Config,
    state: Mutex<SharedState>,
    /// Held for a whole reconciliation pass, callbacks included
    pass: Mutex<()>,
    virtual_displays: Mutex<VirtualDisplayRegistry>,
    resources: Mutex<Option<Arc<ResourceCache>>>,
}

impl<D: KmsDevice> Inner<D> {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        // Every pass leaves the state consistent before it can panic
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_display_state(&self) -> Result<()> {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let (callback, connected) = {
            let mut state = self.lock();
            let outcome = reconcile(&self.device, &mut state.displays, self.config.planes.reserve)?;
            state.connected_count = outcome.connected_outputs;

            let connected: Vec<DisplayHandle> = state
                .displays
                .iter()
                .filter(|d| d.is_connected())
                .map(PhysicalDisplay::handle)
                .collect();
            (state.callback.clone(), connected)
        };

        if let Some(callback) = callback {
            callback(&connected);
        }

        let notify = {
            let mut state = self.lock();
            if self.config.notify.policy == NotifyPolicy::Always {
                state.notify_client = true;
            }
            let first_connected = state.displays.first().map_or(false, |d| d.is_connected());
            state.notify_client || !first_connected
        };
        if notify {
            self.notify_clients();
        }

        if self.config.planes.reserve {
            let mut state = self.lock();
            planes::remove_unreserved_planes(&mut state.displays, &self.config.planes);
        }
        Ok(())
    }

    /// Tell each display about its own connection status
    fn notify_clients(&self) {
        let notifications: Vec<_> = {
            let mut state = self.lock();
            state.notify_client = true;
            state
                .displays
                .iter_mut()
                .filter_map(PhysicalDisplay::take_status_notification)
                .collect()
        };

        for (callback, handle, connected) in notifications {
            debug!(
                "Display {}: notifying {}",
                handle.pipe,
                if connected { "connected" } else { "disconnected" }
            );
            callback(&handle, connected);
        }
    }
}

/// Display manager for one DRM device
pub struct DisplayManager<D: KmsDevice + 'static> {
    inner: Arc<Inner<D>>,
    monitor: Mutex<Option<HotplugMonitor>>,
    worker: Mutex<Option<HotplugWorker>>,
}

impl<D: KmsDevice + 'static> DisplayManager<D> {
    /// Seed one display per pipeline of `device`
    ///
    /// Fails when the resource snapshot is unavailable or the device has no
    /// pipelines. Probes master rights once.
    pub fn new(device: D, config: Config) -> Result<Self, DiscoveryError> {
        let resources = device.resources().map_err(DiscoveryError::Resources)?;
        if resources.crtcs.is_empty() {
            return Err(DiscoveryError::NoPipelines);
        }

        let planes = device.planes().unwrap_or_else(|e| {
            warn!("Failed to enumerate planes: {:#}", e);
            Vec::new()
        });
        let displays: Vec<PhysicalDisplay> = resources
            .crtcs
            .iter()
            .enumerate()
            .map(|(pipe, &crtc_id)| {
                let usable = planes
                    .iter()
                    .filter(|p| pipe < 32 && p.possible_crtcs & (1 << pipe) != 0)
                    .map(|p| p.id)
                    .collect();
                PhysicalDisplay::new(pipe, crtc_id, usable)
            })
            .collect();
        info!("{} display pipelines", displays.len());

        let mut held = false;
        master::acquire_master_once(&device, &mut held);

        let state = SharedState {
            displays,
            connected_count: 0,
            master: held,
            notify_client: config.notify.policy == NotifyPolicy::Always,
            ignore_updates: false,
            release_lock: false,
            callback: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                device,
                config,
                state: Mutex::new(state),
                pass: Mutex::new(()),
                virtual_displays: Mutex::new(VirtualDisplayRegistry::new()),
                resources: Mutex::new(None),
            }),
            monitor: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &D {
        &self.inner.device
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Install the hotplug socket used by `start_hotplug_monitor`
    pub fn set_hotplug_monitor(&self, monitor: HotplugMonitor) {
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
    }

    /// Run one reconciliation pass
    ///
    /// An error means the resource snapshot could not be fetched; no display
    /// was changed.
    pub fn update_display_state(&self) -> Result<()> {
        self.inner.update_display_state()
    }

    /// Reconcile once, then watch for hotplug events
    ///
    /// Returns true when the hotplug worker is running. Without a hotplug
    /// socket the display set stays as found by this first pass.
    pub fn start_hotplug_monitor(&self) -> bool {
        if let Err(e) = self.update_display_state() {
            warn!("Initial display update failed: {:#}", e);
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return true;
        }
        let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            info!("Hotplug detection unavailable, display set is static");
            return false;
        };

        let inner = Arc::downgrade(&self.inner);
        match HotplugWorker::spawn(monitor, move || {
            if let Some(inner) = inner.upgrade() {
                if let Err(e) = inner.update_display_state() {
                    warn!("Display update after hotplug failed: {:#}", e);
                }
            }
        }) {
            Ok(spawned) => {
                *worker = Some(spawned);
                true
            }
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }

    /// Handles of every physical display, in pipeline order
    pub fn displays(&self) -> Vec<DisplayHandle> {
        self.inner
            .lock()
            .displays
            .iter()
            .map(PhysicalDisplay::handle)
            .collect()
    }

    /// Connected outputs seen by the last reconciliation pass
    pub fn connected_display_count(&self) -> u32 {
        self.inner.lock().connected_count
    }

    /// Replace the hotplug callback
    pub fn register_hotplug_callback(&self, callback: HotplugCallback) {
        self.inner.lock().callback = Some(callback);
    }

    /// Set (or clear) a display's own status callback
    ///
    /// Returns false when `pipe` is not a display of this device.
    pub fn register_display_status_callback(
        &self,
        pipe: usize,
        callback: Option<StatusCallback>,
    ) -> bool {
        match self.inner.lock().displays.get_mut(pipe) {
            Some(display) => {
                display.set_status_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Report each display's connection status to its own callback
    ///
    /// Also turns on per-display notification for every later pass, which
    /// the reduced policy otherwise only does while display 0 is down.
    pub fn notify_clients_of_display_change_status(&self) {
        self.inner.notify_clients();
    }

    /// Request a repaint of every display and resume client updates
    pub fn force_refresh(&self) {
        let mut state = self.inner.lock();
        state.ignore_updates = false;
        for display in state.displays.iter_mut() {
            display.force_refresh();
        }
        state.release_lock = true;
    }

    /// Stop presenting client updates until the next refresh
    pub fn ignore_updates(&self) {
        let mut state = self.inner.lock();
        state.ignore_updates = true;
        for display in state.displays.iter_mut() {
            display.ignore_updates();
        }
    }

    pub fn is_ignoring_updates(&self) -> bool {
        self.inner.lock().ignore_updates
    }

    /// Consume a pending refresh request for one display
    pub fn take_refresh(&self, pipe: usize) -> bool {
        self.inner
            .lock()
            .displays
            .get_mut(pipe)
            .map_or(false, PhysicalDisplay::take_refresh)
    }

    /// Release the hold taken at startup once a refresh was requested
    ///
    /// Returns true when the hold was released by this call.
    pub fn handle_lazy_initialization(&self) -> bool {
        let mut state = self.inner.lock();
        if !state.release_lock {
            return false;
        }
        state.release_lock = false;
        debug!("Lazy initialization released");
        true
    }

    /// Probe master rights once (no-op when held)
    pub fn acquire_master_once(&self) -> bool {
        let mut state = self.inner.lock();
        master::acquire_master_once(&self.inner.device, &mut state.master)
    }

    /// Claim master rights with bounded retry; returns whether they are held
    pub fn set_master(&self, force: bool) -> bool {
        let mut state = self.inner.lock();
        master::set_master(&self.inner.device, &mut state.master, force);
        state.master
    }

    /// Release master rights with bounded retry (no-op when not held)
    pub fn drop_master(&self) {
        let mut state = self.inner.lock();
        master::drop_master(&self.inner.device, &mut state.master);
    }

    pub fn is_master(&self) -> bool {
        self.inner.lock().master
    }

    /// Prune unreserved planes of connected displays (once per epoch)
    pub fn remove_unreserved_planes(&self) -> usize {
        let mut state = self.inner.lock();
        planes::remove_unreserved_planes(&mut state.displays, &self.inner.config.planes)
    }

    /// Planes currently owned by a display
    pub fn display_planes(&self, pipe: usize) -> Option<Vec<u32>> {
        self.inner
            .lock()
            .displays
            .get(pipe)
            .map(|d| d.planes().to_vec())
    }

    fn for_connector(&self, connector: u32, mut f: impl FnMut(&mut PhysicalDisplay)) {
        let mut state = self.inner.lock();
        for display in state
            .displays
            .iter_mut()
            .filter(|d| d.connector_id() == connector)
        {
            f(display);
        }
    }

    fn for_all(&self, mut f: impl FnMut(&mut PhysicalDisplay)) {
        let mut state = self.inner.lock();
        for display in state.displays.iter_mut() {
            f(display);
        }
    }

    pub fn enable_hdcp_session(&self, connector: u32, content_type: ContentType) {
        self.for_connector(connector, |d| {
            d.set_hdcp_state(ContentProtection::Desired, content_type)
        });
    }

    pub fn enable_hdcp_session_all(&self, content_type: ContentType) {
        self.for_all(|d| d.set_hdcp_state(ContentProtection::Desired, content_type));
    }

    pub fn disable_hdcp_session(&self, connector: u32) {
        self.for_connector(connector, |d| {
            d.set_hdcp_state(ContentProtection::Undesired, ContentType::Invalid)
        });
    }

    pub fn disable_hdcp_session_all(&self) {
        self.for_all(|d| d.set_hdcp_state(ContentProtection::Undesired, ContentType::Invalid));
    }

    /// Install a System Renewability Message on one output
    pub fn set_hdcp_srm(&self, connector: u32, srm: &[u8]) {
        self.for_connector(connector, |d| d.set_hdcp_srm(srm));
    }

    pub fn set_hdcp_srm_all(&self, srm: &[u8]) {
        self.for_all(|d| d.set_hdcp_srm(srm));
    }

    /// Requested content protection of a display
    pub fn hdcp_state(&self, pipe: usize) -> Option<(ContentProtection, ContentType)> {
        self.inner.lock().displays.get(pipe).map(|d| d.hdcp_state())
    }

    pub fn hdcp_srm(&self, pipe: usize) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .displays
            .get(pipe)
            .and_then(|d| d.hdcp_srm().map(<[u8]>::to_vec))
    }

    /// Create a virtual display at `index`, replacing any previous one
    pub fn create_virtual_display(&self, index: u32) -> Arc<VirtualDisplay> {
        let buffer_handler = self.buffer_handler();
        self.inner
            .virtual_displays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .create(index, buffer_handler)
    }

    /// Remove the virtual display at `index` (no-op when absent)
    pub fn destroy_virtual_display(&self, index: u32) {
        self.inner
            .virtual_displays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .destroy(index);
    }

    pub fn virtual_display(&self, index: u32) -> Option<Arc<VirtualDisplay>> {
        self.inner
            .virtual_displays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
    }

    pub fn resources(&self) -> Option<Arc<ResourceCache>> {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn buffer_handler(&self) -> Option<Arc<BufferHandler>> {
        self.resources().map(|r| r.buffer_handler().clone())
    }

    fn install_resources(&self, cache: Arc<ResourceCache>) {
        let handler = cache.buffer_handler().clone();
        *self
            .inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cache);
        self.for_all(|d| d.initialize(handler.clone()));
    }
}

impl DisplayManager<Card> {
    /// Open the preferred GPU and build a manager for it
    pub fn discover(config: Config) -> Result<Self, DiscoveryError> {
        let (card, _) = discovery::open_preferred_device(&config.device)?;
        let hotplug = config.hotplug.enabled;
        let manager = Self::new(card, config)?;

        if hotplug {
            match HotplugMonitor::new() {
                Ok(monitor) => manager.set_hotplug_monitor(monitor),
                Err(e) => warn!("Hotplug detection disabled: {:#}", e),
            }
        }
        Ok(manager)
    }

    /// Create the buffer handler and framebuffer manager
    ///
    /// On failure resources stay unset and the error is logged.
    pub fn initialize_display_resources(&self) -> bool {
        match ResourceCache::new(self.device()) {
            Ok(cache) => {
                self.install_resources(Arc::new(cache));
                true
            }
            Err(e) => {
                warn!("Failed to initialize display resources: {:#}", e);
                false
            }
        }
    }
}
