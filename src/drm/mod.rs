//! DRM/KMS display management

pub mod discovery;
pub mod display;
#[cfg(test)]
mod fake;
pub mod hotplug;
pub mod kms;
pub mod manager;
pub mod master;
pub mod planes;
pub mod reconcile;
pub mod resources;
pub mod virtual_display;

pub use discovery::{DiscoveryError, GpuDeviceInfo};
pub use display::{
    ConnectionState, ContentProtection, ContentType, DisplayHandle, PhysicalDisplay,
    StatusCallback,
};
pub use hotplug::{HotplugMonitor, HotplugWorker};
pub use kms::{Card, DisplayMode, KmsDevice};
pub use manager::{DisplayManager, HotplugCallback};
pub use resources::{BufferHandler, FrameBufferManager, ResourceCache};
pub use virtual_display::VirtualDisplay;
