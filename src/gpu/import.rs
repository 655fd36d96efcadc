//! dma-buf import into the GPU
//!
//! Client buffers arrive as dma-buf descriptors with layout metadata. They
//! are imported as EGL images once per rendering context and cached, so
//! the same buffer is not re-imported every frame.

use anyhow::{anyhow, Context, Result};
use khronos_egl as egl;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::drm::BufferHandler;

// EGL_EXT_image_dma_buf_import
const EGL_LINUX_DMA_BUF_EXT: egl::Enum = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: egl::Int = 0x3271;
const EGL_DMA_BUF_PLANE0_FD_EXT: egl::Int = 0x3272;
const EGL_DMA_BUF_PLANE0_OFFSET_EXT: egl::Int = 0x3273;
const EGL_DMA_BUF_PLANE0_PITCH_EXT: egl::Int = 0x3274;
const EGL_DMA_BUF_PLANE1_FD_EXT: egl::Int = 0x3275;
const EGL_DMA_BUF_PLANE1_OFFSET_EXT: egl::Int = 0x3276;
const EGL_DMA_BUF_PLANE1_PITCH_EXT: egl::Int = 0x3277;

// EGL_EXT_image_dma_buf_import_modifiers
const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: egl::Int = 0x3443;
const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: egl::Int = 0x3444;
const EGL_DMA_BUF_PLANE1_MODIFIER_LO_EXT: egl::Int = 0x3445;
const EGL_DMA_BUF_PLANE1_MODIFIER_HI_EXT: egl::Int = 0x3446;

// EGL_PLATFORM_GBM_KHR (EGL extension)
const EGL_PLATFORM_GBM_KHR: egl::Enum = 0x31D7;

/// "No modifier" sentinel (linear layout, single plane)
pub const DRM_FORMAT_MOD_NONE: u64 = 0;

/// Identifies the rendering context a resource was imported for
pub type ContextId = usize;

/// One dma-buf plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub fd: RawFd,
    pub pitch: u32,
    pub offset: u32,
}

/// Shared buffer handed over by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaBufDescriptor {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc pixel format code
    pub format: u32,
    pub modifier: u64,
    pub planes: [PlaneLayout; 2],
}

impl DmaBufDescriptor {
    /// EGL image attributes for this buffer
    ///
    /// Buffers without a modifier are imported as a single plane; others
    /// pass both planes with the modifier split in 32-bit halves.
    pub fn import_attributes(&self) -> Vec<egl::Attrib> {
        let mut attrs: Vec<egl::Int> = vec![
            egl::WIDTH,
            self.width as egl::Int,
            egl::HEIGHT,
            self.height as egl::Int,
            EGL_LINUX_DRM_FOURCC_EXT,
            self.format as egl::Int,
            EGL_DMA_BUF_PLANE0_FD_EXT,
            self.planes[0].fd,
            EGL_DMA_BUF_PLANE0_PITCH_EXT,
            self.planes[0].pitch as egl::Int,
            EGL_DMA_BUF_PLANE0_OFFSET_EXT,
            self.planes[0].offset as egl::Int,
        ];

        if self.modifier != DRM_FORMAT_MOD_NONE {
            let lo = (self.modifier & 0xffff_ffff) as u32 as egl::Int;
            let hi = (self.modifier >> 32) as u32 as egl::Int;
            attrs.extend_from_slice(&[
                EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
                lo,
                EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
                hi,
                EGL_DMA_BUF_PLANE1_FD_EXT,
                self.planes[1].fd,
                EGL_DMA_BUF_PLANE1_PITCH_EXT,
                self.planes[1].pitch as egl::Int,
                EGL_DMA_BUF_PLANE1_OFFSET_EXT,
                self.planes[1].offset as egl::Int,
                EGL_DMA_BUF_PLANE1_MODIFIER_LO_EXT,
                lo,
                EGL_DMA_BUF_PLANE1_MODIFIER_HI_EXT,
                hi,
            ]);
        }

        // Sign-extension keeps negative values (fd -1) intact
        let mut attribs: Vec<egl::Attrib> = attrs.into_iter().map(|v| v as egl::Attrib).collect();
        attribs.push(egl::ATTRIB_NONE);
        attribs
    }
}

/// Turns a client buffer into a GPU resource
pub trait BufferImporter {
    type Resource;

    fn import(&self, buffer: &DmaBufDescriptor) -> Result<Self::Resource>;

    fn release(&self, resource: Self::Resource);
}

/// Imported resources keyed by (context, client buffer)
pub struct ImportCache<I: BufferImporter> {
    importer: I,
    entries: HashMap<(ContextId, u64), I::Resource>,
}

impl<I: BufferImporter> ImportCache<I> {
    pub fn new(importer: I) -> Self {
        Self {
            importer,
            entries: HashMap::new(),
        }
    }

    pub fn importer(&self) -> &I {
        &self.importer
    }

    /// Resource for `buffer` in `context`, importing it on first use
    pub fn get_or_import(
        &mut self,
        context: ContextId,
        buffer_id: u64,
        buffer: &DmaBufDescriptor,
    ) -> Result<&I::Resource> {
        let key = (context, buffer_id);
        if !self.entries.contains_key(&key) {
            let resource = self
                .importer
                .import(buffer)
                .with_context(|| format!("Failed to import buffer {}", buffer_id))?;
            debug!("Imported buffer {} for context {}", buffer_id, context);
            self.entries.insert(key, resource);
        }
        self.entries
            .get(&key)
            .ok_or_else(|| anyhow!("Buffer {} missing from import cache", buffer_id))
    }

    /// Drop every import of a client buffer (the buffer is going away)
    pub fn invalidate_buffer(&mut self, buffer_id: u64) -> usize {
        self.remove_where(|(_, id)| *id == buffer_id)
    }

    /// Drop every import made for a context (the context is going away)
    pub fn invalidate_context(&mut self, context: ContextId) -> usize {
        self.remove_where(|(ctx, _)| *ctx == context)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_where(&mut self, matches: impl Fn(&(ContextId, u64)) -> bool) -> usize {
        let keys: Vec<_> = self.entries.keys().filter(|k| matches(k)).copied().collect();
        for key in &keys {
            if let Some(resource) = self.entries.remove(key) {
                self.importer.release(resource);
            }
        }
        keys.len()
    }
}

impl<I: BufferImporter> Drop for ImportCache<I> {
    fn drop(&mut self) {
        for (_, resource) in self.entries.drain() {
            self.importer.release(resource);
        }
    }
}

/// EGL instance type (dynamic loading)
type EglInstance = egl::Instance<egl::Dynamic<libloading::Library, egl::EGL1_5>>;

/// Imports dma-bufs as EGL images on the GBM platform display
pub struct EglImporter {
    instance: EglInstance,
    display: egl::Display,
    // Keeps the GBM device behind `display` alive
    _buffer_handler: Arc<BufferHandler>,
}

impl EglImporter {
    pub fn new(buffer_handler: Arc<BufferHandler>) -> Result<Self> {
        let lib = unsafe {
            libloading::Library::new("libEGL.so.1")
                .or_else(|_| libloading::Library::new("libEGL.so"))
                .context("Failed to load EGL library")?
        };

        let instance: EglInstance = unsafe {
            egl::DynamicInstance::<egl::EGL1_5>::load_required_from(lib)
                .context("Failed to create EGL instance")?
        };

        let display = unsafe {
            instance
                .get_platform_display(
                    EGL_PLATFORM_GBM_KHR,
                    buffer_handler.as_raw(),
                    &[egl::ATTRIB_NONE],
                )
                .context("Failed to get EGL display")?
        };

        instance
            .initialize(display)
            .context("Failed to initialize EGL")?;
        info!("EGL importer ready");

        Ok(Self {
            instance,
            display,
            _buffer_handler: buffer_handler,
        })
    }
}

impl BufferImporter for EglImporter {
    type Resource = egl::Image;

    fn import(&self, buffer: &DmaBufDescriptor) -> Result<egl::Image> {
        let attribs = buffer.import_attributes();
        unsafe {
            self.instance
                .create_image(
                    self.display,
                    egl::Context::from_ptr(egl::NO_CONTEXT),
                    EGL_LINUX_DMA_BUF_EXT,
                    egl::ClientBuffer::from_ptr(std::ptr::null_mut()),
                    &attribs,
                )
                .with_context(|| {
                    format!(
                        "Failed to create EGL image ({}x{}, format {:#x})",
                        buffer.width, buffer.height, buffer.format
                    )
                })
        }
    }

    fn release(&self, image: egl::Image) {
        if let Err(e) = self.instance.destroy_image(self.display, image) {
            warn!("Failed to destroy EGL image: {}", e);
        }
    }
}

impl Drop for EglImporter {
    fn drop(&mut self) {
        let _ = self.instance.terminate(self.display);
    }
}
