use std::sync::Arc;

use task_queue::{BackgroundTask, TaskOutcome};

use crate::compress::{read_compressed_file, write_compressed_file};
use crate::error::MipmapError;
use crate::level::LevelPayload;
use crate::mipmap::{ChainState, Mipmap};
use crate::source::CompressedImage;
use crate::store::StatsCounters;
use crate::tasks::COMPRESSED_SUFFIX;

/// Decodes the source once and writes every level block-compressed to the disk cache.
pub(crate) struct GenerateCompressedChainTask {
    mipmap: Arc<Mipmap>,
}

impl GenerateCompressedChainTask {
    pub fn new(mipmap: Arc<Mipmap>) -> Self {
        Self { mipmap }
    }

    fn generate(&self) -> Result<(), MipmapError> {
        let mipmap = &self.mipmap;
        let context = mipmap.context();
        let compressor = context
            .compressor
            .as_ref()
            .ok_or_else(|| MipmapError::Compression("no block compressor configured".to_owned()))?;
        let max_level = mipmap.max_level().unwrap_or(0);

        let mut image = context.source.read(mipmap.path())?;
        StatsCounters::bump(&context.stats.source_decodes);
        for level in 0..=max_level {
            let size = mipmap.level_size(level);
            if level > 0 {
                image = context.source.minify(&image, size);
                StatsCounters::bump(&context.stats.derived_levels);
            }
            let compressed = CompressedImage {
                width: size.width,
                height: size.height,
                format: compressor.format(),
                data: compressor.compress(&image)?,
            };
            let path = mipmap.cache_path(level, COMPRESSED_SUFFIX).ok_or_else(|| {
                MipmapError::Compression("compressed chain needs a cache location".to_owned())
            })?;
            write_compressed_file(&path, &compressed)?;
            StatsCounters::bump(&context.stats.disk_cache_writes);
        }
        Ok(())
    }
}

impl BackgroundTask for GenerateCompressedChainTask {
    fn run(&self) -> TaskOutcome {
        let mipmap = &self.mipmap;
        match self.generate() {
            Ok(()) => {
                StatsCounters::bump(&mipmap.context().stats.compressed_chains_generated);
                mipmap.set_chain_state(ChainState::Ready);
                tracing::debug!(
                    target: "mipmap",
                    path = %mipmap.path().display(),
                    "compressed chain written"
                );
            }
            Err(error) => {
                tracing::warn!(
                    target: "mipmap",
                    path = %mipmap.path().display(),
                    %error,
                    "compressed chain generation failed"
                );
                mipmap.set_chain_state(ChainState::Failed);
            }
        }
        TaskOutcome::Done
    }

    fn label(&self) -> &'static str {
        "mipmap.generate_compressed_chain"
    }
}

/// Loads one block-compressed level from the chain on disk, waiting for the chain first.
pub(crate) struct LoadCompressedImageTask {
    mipmap: Arc<Mipmap>,
    level: usize,
}

impl LoadCompressedImageTask {
    pub fn new(mipmap: Arc<Mipmap>, level: usize) -> Self {
        Self { mipmap, level }
    }

    fn load(&self) -> Result<(), MipmapError> {
        let mipmap = &self.mipmap;
        let path = mipmap
            .cache_path(self.level, COMPRESSED_SUFFIX)
            .ok_or_else(|| {
                MipmapError::Compression("compressed level has no cache location".to_owned())
            })?;
        let image = read_compressed_file(&path)?;
        let expected = mipmap.level_size(self.level);
        if (image.width, image.height) != (expected.width, expected.height) {
            return Err(MipmapError::CorruptCache {
                path,
                reason: "level size mismatch",
            });
        }
        StatsCounters::bump(&mipmap.context().stats.disk_cache_hits);
        mipmap.install_level(self.level, LevelPayload::Compressed(Arc::new(image)))
    }
}

impl BackgroundTask for LoadCompressedImageTask {
    fn run(&self) -> TaskOutcome {
        let mipmap = &self.mipmap;
        let result = match mipmap.chain_state() {
            ChainState::Pending => {
                return TaskOutcome::RunAgainAfter(mipmap.context().config.release_retry_interval());
            }
            ChainState::Failed => Err(MipmapError::Compression(
                "compressed chain unavailable".to_owned(),
            )),
            ChainState::Ready => self.load(),
        };
        if let Err(error) = result {
            tracing::warn!(
                target: "mipmap",
                path = %mipmap.path().display(),
                level = self.level,
                %error,
                "compressed level load failed"
            );
            mipmap.fail_level(self.level);
        }
        mipmap.finish_load(self.level);
        TaskOutcome::Done
    }

    fn label(&self) -> &'static str {
        "mipmap.load_compressed_image"
    }
}
