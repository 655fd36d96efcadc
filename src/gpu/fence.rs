//! Sync fences
//!
//! A fence is a sync_file descriptor that becomes readable once the work it
//! tracks has completed. Whoever holds a `Fence` either waits on it (which
//! closes it) or hands the descriptor onward; "none" means already complete.

use anyhow::{Context, Result};
use log::trace;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::config::SyncConfig;

#[derive(Debug, Default)]
pub struct Fence(Option<OwnedFd>);

impl Fence {
    /// Already signaled
    pub fn none() -> Self {
        Self(None)
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self(Some(fd))
    }

    /// Take ownership of a raw fence descriptor (-1 means none)
    ///
    /// # Safety
    /// `fd` must be an open descriptor owned by the caller, or negative.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        if fd < 0 {
            Self::none()
        } else {
            Self(Some(OwnedFd::from_raw_fd(fd)))
        }
    }

    /// Fence produced by the renderer
    ///
    /// With native fences disabled the descriptor is closed and the fence
    /// is none.
    pub fn produced(fd: Option<OwnedFd>, sync: &SyncConfig) -> Self {
        match fd {
            Some(fd) if sync.native_fences => Self::from_fd(fd),
            _ => Self::none(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Raw descriptor for submission (-1 when none); ownership stays here
    pub fn as_raw_fd(&self) -> RawFd {
        self.0.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    /// Hand the descriptor onward
    pub fn into_fd(self) -> Option<OwnedFd> {
        self.0
    }

    /// Wait for the fence and close it
    ///
    /// Returns false if `timeout` expired first. `None` waits forever.
    pub fn wait(self, timeout: Option<Duration>) -> Result<bool> {
        let Some(fd) = self.0 else {
            return Ok(true);
        };

        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);
        loop {
            let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout_ms) {
                Ok(0) => {
                    trace!("Fence {} timed out", fd.as_raw_fd());
                    return Ok(false);
                }
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("Failed to wait on fence"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn pipe_fence() -> (Fence, UnixStream) {
        let (signal, waiter) = UnixStream::pair().unwrap();
        (Fence::from_fd(OwnedFd::from(waiter)), signal)
    }

    #[test]
    fn test_none_is_signaled() {
        let fence = Fence::none();
        assert!(fence.is_none());
        assert_eq!(fence.as_raw_fd(), -1);
        assert!(fence.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_wait_timeout_and_signal() {
        let (fence, _signal) = pipe_fence();
        assert!(!fence.wait(Some(Duration::from_millis(10))).unwrap());

        let (fence, mut signal) = pipe_fence();
        signal.write_all(&[1]).unwrap();
        assert!(fence.wait(None).unwrap());
    }

    #[test]
    fn test_disabled_sync_yields_none() {
        let (signal, _) = UnixStream::pair().unwrap();
        let sync = SyncConfig {
            native_fences: false,
        };
        assert!(Fence::produced(Some(OwnedFd::from(signal)), &sync).is_none());

        let (signal, _) = UnixStream::pair().unwrap();
        let fence = Fence::produced(Some(OwnedFd::from(signal)), &SyncConfig::default());
        assert!(!fence.is_none());
        assert!(fence.into_fd().is_some());
    }

    #[test]
    fn test_negative_raw_fd_is_none() {
        assert!(unsafe { Fence::from_raw_fd(-1) }.is_none());
    }
}
