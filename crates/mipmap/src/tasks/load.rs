use std::sync::Arc;

use image::DynamicImage;
use task_queue::{BackgroundTask, TaskOutcome};

use crate::error::MipmapError;
use crate::level::LevelPayload;
use crate::mipmap::Mipmap;
use crate::store::StatsCounters;

/// Loads one uncompressed level.
///
/// The chain starts at the nearest finer level that is already in memory or in the disk
/// cache, or at the source file for level 0, and halves down to the target. Intermediate
/// levels are cached on disk and installed when nobody else is loading them.
pub(crate) struct LoadImageTask {
    mipmap: Arc<Mipmap>,
    level: usize,
}

impl LoadImageTask {
    pub fn new(mipmap: Arc<Mipmap>, level: usize) -> Self {
        Self { mipmap, level }
    }

    fn load(&self) -> Result<(), MipmapError> {
        let mipmap = &self.mipmap;
        let context = mipmap.context();
        let (start_level, mut image) = self.chain_start()?;
        for level in start_level + 1..=self.level {
            image = Arc::new(context.source.minify(&image, mipmap.level_size(level)));
            StatsCounters::bump(&context.stats.derived_levels);
            self.write_cache(level, &image);
            if level < self.level {
                mipmap.offer_derived_level(level, &image);
            }
        }
        mipmap.install_level(self.level, LevelPayload::Image(image))
    }

    fn chain_start(&self) -> Result<(usize, Arc<DynamicImage>), MipmapError> {
        let mipmap = &self.mipmap;
        let context = mipmap.context();
        for level in (0..=self.level).rev() {
            if level < self.level {
                if let Some(image) = mipmap.peek_image(level) {
                    return Ok((level, image));
                }
            }
            if level > 0 {
                if let Some(image) = self.read_cache(level) {
                    return Ok((level, Arc::new(image)));
                }
            }
        }
        let image = context.source.read(mipmap.path())?;
        StatsCounters::bump(&context.stats.source_decodes);
        Ok((0, Arc::new(image)))
    }

    /// A missing, unreadable or mis-sized cache file counts as a miss.
    fn read_cache(&self, level: usize) -> Option<DynamicImage> {
        let mipmap = &self.mipmap;
        let context = mipmap.context();
        let path = mipmap.cache_path(level, context.source.cache_suffix())?;
        let image = match context.source.read_cache(&path) {
            Ok(image) => image?,
            Err(error) => {
                tracing::warn!(
                    target: "mipmap",
                    path = %path.display(),
                    %error,
                    "unreadable cache file"
                );
                return None;
            }
        };
        let expected = mipmap.level_size(level);
        if (image.width(), image.height()) != (expected.width, expected.height) {
            tracing::warn!(
                target: "mipmap",
                path = %path.display(),
                width = image.width(),
                height = image.height(),
                "cache file has wrong size"
            );
            return None;
        }
        StatsCounters::bump(&context.stats.disk_cache_hits);
        Some(image)
    }

    fn write_cache(&self, level: usize, image: &DynamicImage) {
        let mipmap = &self.mipmap;
        let context = mipmap.context();
        if !context.config.write_disk_cache {
            return;
        }
        let Some(path) = mipmap.cache_path(level, context.source.cache_suffix()) else {
            return;
        };
        match context.source.write_cache(image, &path) {
            Ok(()) => StatsCounters::bump(&context.stats.disk_cache_writes),
            Err(error) => {
                tracing::warn!(target: "mipmap", path = %path.display(), %error, "cache write failed");
            }
        }
    }
}

impl BackgroundTask for LoadImageTask {
    fn run(&self) -> TaskOutcome {
        if let Err(error) = self.load() {
            tracing::warn!(
                target: "mipmap",
                path = %self.mipmap.path().display(),
                level = self.level,
                %error,
                "level load failed"
            );
            self.mipmap.fail_level(self.level);
        }
        self.mipmap.finish_load(self.level);
        TaskOutcome::Done
    }

    fn label(&self) -> &'static str {
        "mipmap.load_image"
    }
}
