//! Global constants for kmsdm
//!
//! Consolidates retry timing, device selection, and buffer size constants
//! to eliminate magic numbers throughout the codebase.

use std::time::Duration;

// ============================================================================
// Master Arbitration
// ============================================================================

/// Maximum number of SET_MASTER / DROP_MASTER attempts before giving up
pub const MASTER_RETRY_LIMIT: u32 = 10;

/// Delay between two master attempts
pub const MASTER_RETRY_BACKOFF: Duration = Duration::from_millis(10);

// ============================================================================
// Device Discovery
// ============================================================================

/// Primary node expected to drive the display
pub const PREFERRED_PRIMARY_NODE: &str = "/dev/dri/card0";

/// PCI vendor id of the target hardware family (Intel)
pub const PREFERRED_VENDOR_ID: u16 = 0x8086;

/// Upper bound on enumerated GPU devices
pub const MAX_DRM_DEVICES: usize = 64;

// ============================================================================
// Hotplug
// ============================================================================

/// Size of the buffer a single uevent datagram is read into
pub const HOTPLUG_EVENT_SIZE: usize = 256;

/// Netlink multicast group mask (all groups)
pub const HOTPLUG_GROUP_MASK: u32 = 0xffff_ffff;

/// Record marking a DRM minor device event
pub const UEVENT_DRM_MINOR: &[u8] = b"DEVTYPE=drm_minor";

/// Records marking a connector state change
/// ("HDMI-Change" is emitted for hotplugs that happened during suspend)
pub const UEVENT_HOTPLUG_MARKERS: &[&[u8]] = &[b"HOTPLUG=1", b"HDMI-Change"];

// ============================================================================
// Planes
// ============================================================================

/// Reservations with this many planes or more are ignored
/// (hardware exposes fewer planes than this per pipeline)
pub const MAX_RESERVED_PLANES: usize = 4;
