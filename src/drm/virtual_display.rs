//! Virtual (software-only) displays
//!
//! Not backed by a kernel pipeline and never touched by hotplug
//! reconciliation. They render into buffers allocated from the manager's
//! buffer handler.

use anyhow::{anyhow, Result};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::resources::BufferHandler;

/// Software display keyed by a caller-supplied index
pub struct VirtualDisplay {
    index: u32,
    buffer_handler: Option<Arc<BufferHandler>>,
    size: Mutex<(u32, u32)>,
}

impl VirtualDisplay {
    pub fn new(index: u32, buffer_handler: Option<Arc<BufferHandler>>) -> Self {
        Self {
            index,
            buffer_handler,
            size: Mutex::new((0, 0)),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn buffer_handler(&self) -> Option<&Arc<BufferHandler>> {
        self.buffer_handler.as_ref()
    }

    /// Output size requested by the client
    pub fn set_size(&self, width: u32, height: u32) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = (width, height);
    }

    pub fn size(&self) -> (u32, u32) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an output buffer at the current size
    pub fn allocate_output(&self, format: gbm::Format) -> Result<gbm::BufferObject<()>> {
        let handler = self
            .buffer_handler
            .as_ref()
            .ok_or_else(|| anyhow!("Virtual display {}: no buffer handler", self.index))?;
        let (width, height) = self.size();
        if width == 0 || height == 0 {
            return Err(anyhow!("Virtual display {}: size not set", self.index));
        }
        handler.create_buffer(width, height, format, gbm::BufferObjectFlags::RENDERING)
    }
}

/// Index → virtual display map
///
/// Creating at an index already in use replaces the entry; holders of the
/// previous display keep it alive until they drop it.
#[derive(Default)]
pub struct VirtualDisplayRegistry {
    displays: HashMap<u32, Arc<VirtualDisplay>>,
}

impl VirtualDisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        index: u32,
        buffer_handler: Option<Arc<BufferHandler>>,
    ) -> Arc<VirtualDisplay> {
        let display = Arc::new(VirtualDisplay::new(index, buffer_handler));
        if self.displays.insert(index, display.clone()).is_some() {
            debug!("Virtual display {} replaced", index);
        } else {
            debug!("Virtual display {} created", index);
        }
        display
    }

    /// Remove the entry; no-op when absent
    pub fn destroy(&mut self, index: u32) -> bool {
        let removed = self.displays.remove(&index).is_some();
        if removed {
            debug!("Virtual display {} destroyed", index);
        }
        removed
    }

    pub fn get(&self, index: u32) -> Option<Arc<VirtualDisplay>> {
        self.displays.get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.displays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let mut registry = VirtualDisplayRegistry::new();
        let display = registry.create(3, None);
        assert_eq!(display.index(), 3);
        assert!(registry.get(3).is_some());

        assert!(registry.destroy(3));
        assert!(registry.get(3).is_none());
        assert!(!registry.destroy(3));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_index_last_writer_wins() {
        let mut registry = VirtualDisplayRegistry::new();
        let first = registry.create(1, None);
        first.set_size(640, 480);
        let second = registry.create(1, None);

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(1).unwrap(), &second));
        // The replaced display stays usable by its holder
        assert_eq!(first.size(), (640, 480));
        assert_eq!(second.size(), (0, 0));
    }

    #[test]
    fn test_allocate_without_handler_fails() {
        let display = VirtualDisplay::new(0, None);
        display.set_size(64, 64);
        assert!(display.allocate_output(gbm::Format::Argb8888).is_err());
    }
}
