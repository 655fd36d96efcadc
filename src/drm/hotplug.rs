//! DRM hotplug detection
//!
//! Listens on a kernel uevent netlink socket for connector changes
//! (monitor plug/unplug) and runs a callback from a dedicated worker thread.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use crate::constants::{
    HOTPLUG_EVENT_SIZE, HOTPLUG_GROUP_MASK, UEVENT_DRM_MINOR, UEVENT_HOTPLUG_MARKERS,
};

/// Check whether one uevent datagram reports a DRM connector change
///
/// The payload is a sequence of NUL-terminated `KEY=value` records. Both a
/// DRM minor record and a hotplug record must be present.
pub fn is_drm_hotplug_event(payload: &[u8]) -> bool {
    let mut drm_event = false;
    let mut hotplug_event = false;

    for record in payload.split(|&b| b == 0) {
        if record == UEVENT_DRM_MINOR {
            drm_event = true;
        } else if UEVENT_HOTPLUG_MARKERS.iter().any(|m| *m == record) {
            hotplug_event = true;
        }

        if drm_event && hotplug_event {
            return true;
        }
    }
    false
}

/// Netlink uevent socket
pub struct HotplugMonitor {
    socket: OwnedFd,
}

impl HotplugMonitor {
    /// Open and bind the uevent socket
    pub fn new() -> Result<Self> {
        let socket = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .context("Failed to create socket for hotplug monitor")?;

        bind(
            socket.as_raw_fd(),
            &NetlinkAddr::new(0, HOTPLUG_GROUP_MASK),
        )
        .context("Failed to bind hotplug monitor socket")?;

        info!("DRM hotplug monitor initialized");
        Ok(Self { socket })
    }

    /// Wrap an already connected datagram socket
    #[cfg(test)]
    pub(crate) fn from_fd(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// Get the raw file descriptor for polling
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Read every queued datagram (non-blocking)
    ///
    /// Returns true if at least one of them was a DRM hotplug event.
    /// Empty reads and read errors end the drain.
    pub fn drain(&self) -> bool {
        let mut buffer = [0u8; HOTPLUG_EVENT_SIZE];
        let mut hotplug = false;

        loop {
            match recv(
                self.socket.as_raw_fd(),
                &mut buffer[..HOTPLUG_EVENT_SIZE - 1],
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) => break,
                Ok(len) => {
                    if is_drm_hotplug_event(&buffer[..len]) {
                        debug!("DRM hotplug uevent ({} bytes)", len);
                        hotplug = true;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("Failed to read uevent: {}", e);
                    break;
                }
            }
        }
        hotplug
    }
}

/// Worker thread waiting on the hotplug socket
///
/// Dropping the worker wakes the thread through a socket pair and joins it.
pub struct HotplugWorker {
    wake: UnixStream,
    handle: Option<JoinHandle<()>>,
}

impl HotplugWorker {
    /// Spawn the worker; `on_hotplug` runs on the worker thread
    pub fn spawn<F>(monitor: HotplugMonitor, on_hotplug: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (wake, shutdown) = UnixStream::pair().context("Failed to create wake socket")?;
        let handle = thread::Builder::new()
            .name("display-manager".to_string())
            .spawn(move || run(monitor, shutdown, on_hotplug))
            .context("Failed to spawn hotplug worker thread")?;

        Ok(Self {
            wake,
            handle: Some(handle),
        })
    }
}

fn run<F: FnMut()>(monitor: HotplugMonitor, shutdown: UnixStream, mut on_hotplug: F) {
    debug!("Hotplug worker started");
    loop {
        let mut fds = [
            PollFd::new(&monitor.socket, PollFlags::POLLIN),
            PollFd::new(&shutdown, PollFlags::POLLIN),
        ];

        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("Poll failed in hotplug worker: {}", e);
                break;
            }
        }

        let ready = |fd: &PollFd| {
            fd.revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .unwrap_or(false)
        };
        let uevent_ready = ready(&fds[0]);
        if ready(&fds[1]) {
            break;
        }

        if uevent_ready && monitor.drain() {
            info!("Hotplug event received, updating display state");
            on_hotplug();
        }
    }
    debug!("Hotplug worker stopped");
}

impl Drop for HotplugWorker {
    fn drop(&mut self) {
        let _ = self.wake.write_all(&[1]);
        let _ = self.wake.shutdown(Shutdown::Both);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Hotplug worker panicked");
            }
        }
    }
}
