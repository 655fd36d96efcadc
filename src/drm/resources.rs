//! Buffer and framebuffer services bound to the primary device
//!
//! `BufferHandler` allocates GBM buffers; `FrameBufferManager` turns them
//! into kernel framebuffers and caches the ids per GEM handle so repeated
//! scanout of the same buffer does not re-create them.

use anyhow::{anyhow, Context, Result};
use drm::control::{framebuffer, Device as ControlDevice};
use gbm::AsRaw;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fs::File;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use super::kms::Card;

/// GBM device on a duplicate of the primary descriptor
pub struct BufferHandler {
    device: Mutex<gbm::Device<File>>,
}

// SAFETY: the GBM device is only reached through the mutex
unsafe impl Send for BufferHandler {}
unsafe impl Sync for BufferHandler {}

impl BufferHandler {
    pub fn new(card: &Card) -> Result<Self> {
        let file = card
            .try_clone()
            .context("Failed to dup primary node for GBM")?;
        let device = gbm::Device::new(file.into_file())
            .map_err(|e| anyhow!("Failed to create GBM device: {:?}", e))?;
        info!("GBM device created on {}", card.path().display());
        Ok(Self {
            device: Mutex::new(device),
        })
    }

    fn device(&self) -> MutexGuard<'_, gbm::Device<File>> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a buffer object
    pub fn create_buffer(
        &self,
        width: u32,
        height: u32,
        format: gbm::Format,
        usage: gbm::BufferObjectFlags,
    ) -> Result<gbm::BufferObject<()>> {
        self.device()
            .create_buffer_object::<()>(width, height, format, usage)
            .with_context(|| format!("Failed to allocate {}x{} buffer", width, height))
    }

    /// Native GBM device pointer (valid while the handler lives)
    pub fn as_raw(&self) -> *mut c_void {
        self.device().as_raw() as *mut c_void
    }

    /// Whether the device can allocate `format` with `usage`
    pub fn supports(&self, format: gbm::Format, usage: gbm::BufferObjectFlags) -> bool {
        self.device().is_format_supported(format, usage)
    }
}

/// Reference counted id table
#[derive(Debug)]
struct Refcounts<K, V> {
    entries: HashMap<K, (V, u32)>,
}

impl<K: Eq + Hash, V: Copy> Refcounts<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Take a reference to an existing entry
    fn retain(&mut self, key: &K) -> Option<V> {
        self.entries.get_mut(key).map(|(value, refs)| {
            *refs += 1;
            *value
        })
    }

    fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, (value, 1));
    }

    /// Drop a reference; returns the value once the last one is gone
    fn release(&mut self, key: &K) -> Option<V> {
        let (value, refs) = self.entries.get_mut(key)?;
        *refs -= 1;
        if *refs > 0 {
            return None;
        }
        let value = *value;
        self.entries.remove(key);
        Some(value)
    }

    fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, (value, _))| value).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Kernel framebuffer cache keyed by GEM handle
pub struct FrameBufferManager {
    card: Card,
    framebuffers: Mutex<Refcounts<u32, framebuffer::Handle>>,
}

impl FrameBufferManager {
    pub fn new(card: &Card) -> Result<Self> {
        let card = card
            .try_clone()
            .context("Failed to dup primary node for framebuffers")?;
        Ok(Self {
            card,
            framebuffers: Mutex::new(Refcounts::new()),
        })
    }

    fn table(&self) -> MutexGuard<'_, Refcounts<u32, framebuffer::Handle>> {
        self.framebuffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get (or create) the framebuffer scanning out `bo`
    pub fn acquire<T: 'static>(&self, bo: &gbm::BufferObject<T>) -> Result<framebuffer::Handle> {
        let gem = gem_handle(bo)?;
        let mut table = self.table();
        if let Some(fb) = table.retain(&gem) {
            return Ok(fb);
        }

        let fb = self
            .card
            .add_framebuffer(bo, 24, 32)
            .with_context(|| format!("Failed to add framebuffer for GEM handle {}", gem))?;
        debug!("Framebuffer created: {:?} (GEM handle {})", fb, gem);
        table.insert(gem, fb);
        Ok(fb)
    }

    /// Drop one reference; the framebuffer is removed with the last one
    pub fn release<T: 'static>(&self, bo: &gbm::BufferObject<T>) -> Result<()> {
        let gem = gem_handle(bo)?;
        let released = self.table().release(&gem);
        if let Some(fb) = released {
            self.destroy(fb);
        }
        Ok(())
    }

    /// Remove every cached framebuffer
    pub fn purge(&self) {
        let framebuffers = self.table().drain();
        for fb in framebuffers {
            self.destroy(fb);
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn destroy(&self, fb: framebuffer::Handle) {
        if let Err(e) = self.card.destroy_framebuffer(fb) {
            warn!("Failed to remove framebuffer {:?}: {}", fb, e);
        }
    }
}

impl Drop for FrameBufferManager {
    fn drop(&mut self) {
        self.purge();
    }
}

fn gem_handle<T: 'static>(bo: &gbm::BufferObject<T>) -> Result<u32> {
    let raw = bo
        .handle()
        .map_err(|e| anyhow!("Failed to get BO handle: {:?}", e))?;
    // GEM handles are 32-bit
    Ok(unsafe { raw.s32 } as u32)
}

/// Buffer handler and framebuffer manager shared by every display
pub struct ResourceCache {
    buffer_handler: Arc<BufferHandler>,
    frame_buffers: FrameBufferManager,
}

impl ResourceCache {
    pub fn new(card: &Card) -> Result<Self> {
        Ok(Self {
            buffer_handler: Arc::new(BufferHandler::new(card)?),
            frame_buffers: FrameBufferManager::new(card)?,
        })
    }

    pub fn buffer_handler(&self) -> &Arc<BufferHandler> {
        &self.buffer_handler
    }

    pub fn frame_buffers(&self) -> &FrameBufferManager {
        &self.frame_buffers
    }
}
