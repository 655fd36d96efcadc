//! kmsdm - display-management core for a DRM/KMS compositor
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            DisplayManager                │
//! ├──────────────────────────────────────────┤
//! │  Discovery (udev)  →  Displays (1/CRTC)  │
//! │                          ↑               │
//! │  Hotplug (uevent) → Reconciliation pass  │
//! │                          ↓               │
//! │      Callbacks (after lock release)      │
//! └──────────────────────────────────────────┘
//! ```

pub mod config;
pub mod constants;
pub mod drm;
pub mod gpu;

pub use config::Config;
pub use self::drm::{DiscoveryError, DisplayHandle, DisplayManager};
