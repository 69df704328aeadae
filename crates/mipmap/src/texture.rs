use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::MipmapError;
use crate::level::LevelPayload;
use crate::source::{MipSize, PixelFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureHandle {
    pub id: u64,
    pub size: MipSize,
    pub pixel_format: PixelFormat,
    pub byte_size: u64,
}

/// Creates and destroys the renderer-side texture for a loaded level.
pub trait TextureBackend: Send + Sync + 'static {
    fn create_texture(&self, payload: &LevelPayload) -> Result<TextureHandle, MipmapError>;

    fn destroy_texture(&self, texture: &TextureHandle);
}

/// Backend that keeps pixels on the CPU and only hands out ids.
#[derive(Debug, Default)]
pub struct CpuTextureBackend {
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl CpuTextureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_texture_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl TextureBackend for CpuTextureBackend {
    fn create_texture(&self, payload: &LevelPayload) -> Result<TextureHandle, MipmapError> {
        let pixel_format = match payload {
            LevelPayload::Image(image) => image.color().into(),
            LevelPayload::Compressed(image) => image.format.pixel_format(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(TextureHandle {
            id,
            size: payload.size(),
            pixel_format,
            byte_size: payload.byte_size(),
        })
    }

    fn destroy_texture(&self, _texture: &TextureHandle) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
