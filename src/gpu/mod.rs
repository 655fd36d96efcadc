//! GPU boundary
//!
//! Handles:
//! - dma-buf import into EGL images, cached per rendering context
//! - sync fences for render/blit completion

pub mod fence;
pub mod import;

pub use fence::Fence;
pub use import::{
    BufferImporter, ContextId, DmaBufDescriptor, EglImporter, ImportCache, PlaneLayout,
    DRM_FORMAT_MOD_NONE,
};
