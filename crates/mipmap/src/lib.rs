//! Lazily loaded mipmap chains for source images.
//!
//! A [`MipmapStore`] hands out one shared [`Mipmap`] per source file. Accessors never block:
//! a missing level starts exactly one background load and the nearest ready level is
//! returned meanwhile. Derived levels are cached on disk, and a store-wide release task
//! evicts least recently used levels when the memory budget is exceeded.

mod budget;
mod cache_path;
mod compress;
mod error;
mod level;
mod lod;
mod mipmap;
mod source;
mod store;
mod tasks;
mod texture;

pub use budget::{MemoryBudget, ResidentBytesBudget};
pub use cache_path::{CachePaths, SourceFingerprint};
pub use compress::BlockCompressor;
pub use error::MipmapError;
pub use level::{AtomicLevelState, LevelPayload, LevelState};
pub use lod::{Affine2, select_level};
pub use mipmap::{LevelHit, Mipmap, MipmapState};
pub use source::{
    CompressedFormat, CompressedImage, FileImageSource, ImageHeader, ImageSource, MinifyFilter,
    MipSize, PixelFormat, max_level_for,
};
pub use store::{
    DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_MIN_MIP_SIZE, MipmapKey, MipmapStats, MipmapStore,
    MipmapStoreConfig, StoreCollaborators,
};
pub use task_queue::TaskPriority;
pub use texture::{CpuTextureBackend, TextureBackend, TextureHandle};

#[cfg(test)]
mod tests;
