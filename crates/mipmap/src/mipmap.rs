use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use image::DynamicImage;
use task_queue::{BackgroundTask, TaskPriority};

use crate::cache_path::SourceFingerprint;
use crate::error::MipmapError;
use crate::level::{LevelData, LevelPayload, LevelState, MipmapLevel, PendingLoad};
use crate::lod::{Affine2, select_level};
use crate::source::{ImageHeader, MipSize, max_level_for};
use crate::store::{MipmapKey, StatsCounters, StoreContext};
use crate::tasks::{LoadCompressedImageTask, LoadImageTask, PingTask};
use crate::texture::TextureHandle;

/// A level returned by an accessor, which may be coarser than the one requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelHit<T> {
    pub level: usize,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MipmapState {
    New = 0,
    Loading = 1,
    HeaderReady = 2,
    Ready = 3,
    /// Permanent: the source could not be read.
    Error = 4,
}

impl MipmapState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => MipmapState::New,
            1 => MipmapState::Loading,
            2 => MipmapState::HeaderReady,
            3 => MipmapState::Ready,
            _ => MipmapState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChainState {
    Pending = 0,
    Ready = 1,
    Failed = 2,
}

pub(crate) enum EvictOutcome {
    Freed(u64),
    Busy,
    Skipped,
}

/// A ready level considered for eviction. Orders so that a max-heap pops the least
/// recently used level first.
pub(crate) struct EvictionCandidate {
    pub last_used: u64,
    pub mipmap: Arc<Mipmap>,
    pub level: usize,
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .last_used
            .cmp(&self.last_used)
            .then_with(|| other.level.cmp(&self.level))
    }
}

const LOOKUP_ATTEMPTS: usize = 4;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lazily loaded level chain of one source image.
pub struct Mipmap {
    key: MipmapKey,
    fingerprint: Option<SourceFingerprint>,
    compressed_levels: bool,
    context: Arc<StoreContext>,
    state: AtomicU8,
    header: OnceLock<ImageHeader>,
    levels: OnceLock<Box<[MipmapLevel]>>,
    chain: AtomicU8,
    obsolete: AtomicBool,
}

impl std::fmt::Debug for Mipmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mipmap")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("header", &self.header.get())
            .field("obsolete", &self.is_obsolete())
            .finish_non_exhaustive()
    }
}

impl Mipmap {
    pub(crate) fn new(
        key: MipmapKey,
        fingerprint: Option<SourceFingerprint>,
        compressed_levels: bool,
        context: Arc<StoreContext>,
    ) -> Self {
        Self {
            key,
            fingerprint,
            compressed_levels,
            context,
            state: AtomicU8::new(MipmapState::New as u8),
            header: OnceLock::new(),
            levels: OnceLock::new(),
            chain: AtomicU8::new(ChainState::Pending as u8),
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &MipmapKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.key.path
    }

    pub fn state(&self) -> MipmapState {
        MipmapState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn header(&self) -> Option<ImageHeader> {
        self.header.get().copied()
    }

    /// Whether levels are block-compressed. False when no compressor is configured.
    pub fn is_compressed(&self) -> bool {
        self.compressed_levels
    }

    pub fn max_level(&self) -> Option<usize> {
        self.levels.get().map(|levels| levels.len() - 1)
    }

    /// Size of `level`; level 0 is the native size and every level halves the previous one.
    pub fn mipmap_size(&self, level: usize) -> Option<MipSize> {
        self.header().map(|header| header.size.at_level(level))
    }

    pub fn is_level_available(&self, level: usize) -> bool {
        self.levels()
            .get(level)
            .is_some_and(MipmapLevel::is_available)
    }

    pub fn level_state(&self, level: usize) -> Option<LevelState> {
        self.levels().get(level).map(|level| level.state.load())
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Texture for `level`, or for the nearest ready level while it loads. Never blocks.
    pub fn texture(
        self: &Arc<Self>,
        level: usize,
        priority: TaskPriority,
    ) -> Option<LevelHit<TextureHandle>> {
        self.lookup(level, priority).map(|(found, data)| LevelHit {
            level: found,
            value: data.texture.clone(),
        })
    }

    /// Pixels for `level`, or for the nearest ready level while it loads. Never blocks.
    pub fn image(
        self: &Arc<Self>,
        level: usize,
        priority: TaskPriority,
    ) -> Option<LevelHit<LevelPayload>> {
        self.lookup(level, priority).map(|(found, data)| LevelHit {
            level: found,
            value: data.payload.clone(),
        })
    }

    /// Level to draw with `transform`, where one output pixel spans `pixel_size` units.
    pub fn level(
        &self,
        transform: &Affine2,
        pixel_size: f32,
        max_size: Option<u32>,
    ) -> Option<usize> {
        let header = self.header()?;
        let max_level = self.max_level()?;
        Some(select_level(header.size, max_level, transform, pixel_size, max_size))
    }

    /// Polls until the header read finished or failed.
    pub fn wait_for_header(&self, timeout: Duration) -> MipmapState {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state();
            let pending = matches!(state, MipmapState::New | MipmapState::Loading);
            if !pending || Instant::now() >= deadline {
                return state;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Requests `level` and polls until it is ready. Returns false on timeout or load error.
    pub fn wait_for_level(
        self: &Arc<Self>,
        level: usize,
        priority: TaskPriority,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.texture(level, priority).is_some_and(|hit| hit.level == level) {
                return true;
            }
            let failed = self.state() == MipmapState::Error
                || self.level_state(level) == Some(LevelState::LoadError);
            if failed || Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn lookup(
        self: &Arc<Self>,
        level: usize,
        priority: TaskPriority,
    ) -> Option<(usize, Arc<LevelData>)> {
        for _ in 0..LOOKUP_ATTEMPTS {
            let found = self.find(level, priority)?;
            // An eviction can land between the state check and the payload read.
            if let Some(data) = self.levels()[found].data.load_full() {
                return Some((found, data));
            }
        }
        None
    }

    /// Returns the requested level when ready, otherwise starts its load and returns the
    /// nearest ready level, checking the coarser side first at each distance.
    pub(crate) fn find(
        self: &Arc<Self>,
        requested: usize,
        priority: TaskPriority,
    ) -> Option<usize> {
        if self.state() == MipmapState::Error {
            return None;
        }
        let levels = self.levels.get()?;
        let max_level = levels.len() - 1;
        let requested = requested.min(max_level);
        let frame = self.context.current_frame();
        if levels[requested].state.touch(frame) {
            return Some(requested);
        }
        self.request_load(requested, priority);
        for distance in 1..=max_level {
            let coarser = requested + distance;
            if coarser <= max_level && levels[coarser].state.touch(frame) {
                return Some(coarser);
            }
            if let Some(finer) = requested.checked_sub(distance) {
                if levels[finer].state.touch(frame) {
                    return Some(finer);
                }
            }
        }
        None
    }

    /// Enqueues the single loader for `index` if the level is new, or raises the priority
    /// of its queued loader.
    pub(crate) fn request_load(self: &Arc<Self>, index: usize, priority: TaskPriority) {
        let level = &self.levels()[index];
        match level.state.compare_exchange(LevelState::New, LevelState::Loading) {
            Ok(_) => {
                let task: Arc<dyn BackgroundTask> = if self.compressed_levels {
                    Arc::new(LoadCompressedImageTask::new(Arc::clone(self), index))
                } else {
                    Arc::new(LoadImageTask::new(Arc::clone(self), index))
                };
                let task_id = self.context.queue.add_task(task, priority);
                level.set_pending(Some(PendingLoad { task_id, priority }));
                StatsCounters::bump(&self.context.stats.load_tasks_enqueued);
                tracing::trace!(
                    target: "mipmap",
                    path = %self.path().display(),
                    level = index,
                    "level load enqueued"
                );
            }
            Err(LevelState::Loading) => {
                let Some(pending) = level.pending() else {
                    return;
                };
                if pending.priority < priority
                    && self.context.queue.reschedule(pending.task_id, priority)
                {
                    level.set_pending(Some(PendingLoad {
                        task_id: pending.task_id,
                        priority,
                    }));
                }
            }
            Err(_) => {}
        }
    }

    pub(crate) fn context(&self) -> &StoreContext {
        &self.context
    }

    pub(crate) fn levels(&self) -> &[MipmapLevel] {
        self.levels.get().map(|levels| &**levels).unwrap_or(&[])
    }

    pub(crate) fn start_ping(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                MipmapState::New as u8,
                MipmapState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.context
                .queue
                .add_task(Arc::new(PingTask::new(Arc::clone(self))), TaskPriority::HIGH);
        }
    }

    /// Builds the level table. Returns the coarsest level index.
    pub(crate) fn install_header(&self, header: ImageHeader) -> usize {
        let max_level = max_level_for(header.size, self.context.config.min_mip_size);
        let levels: Box<[MipmapLevel]> =
            (0..=max_level).map(|_| MipmapLevel::default()).collect();
        if self.levels.set(levels).is_err() || self.header.set(header).is_err() {
            panic!("mipmap header installed twice for {}", self.path().display());
        }
        self.state
            .store(MipmapState::HeaderReady as u8, Ordering::Release);
        max_level
    }

    pub(crate) fn mark_error(&self) {
        self.state.store(MipmapState::Error as u8, Ordering::Release);
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub(crate) fn chain_state(&self) -> ChainState {
        match self.chain.load(Ordering::Acquire) {
            0 => ChainState::Pending,
            1 => ChainState::Ready,
            _ => ChainState::Failed,
        }
    }

    pub(crate) fn set_chain_state(&self, state: ChainState) {
        self.chain.store(state as u8, Ordering::Release);
    }

    pub(crate) fn level_size(&self, level: usize) -> MipSize {
        self.mipmap_size(level).unwrap_or_else(|| {
            panic!(
                "level size requested before header of {}",
                self.path().display()
            )
        })
    }

    pub(crate) fn cache_path(&self, level: usize, suffix: &str) -> Option<PathBuf> {
        self.fingerprint
            .as_ref()
            .map(|fingerprint| self.context.cache_paths.level_path(fingerprint, level, suffix))
    }

    /// Payload of a finer level that is already in memory, kept alive by the returned `Arc`
    /// even if the level is evicted meanwhile.
    pub(crate) fn peek_image(&self, level: usize) -> Option<Arc<DynamicImage>> {
        let data = self.levels().get(level)?.data.load_full()?;
        data.payload.as_image().cloned()
    }

    /// Stores a loaded payload and marks the level ready. The caller owns the level's
    /// `Loading` state.
    pub(crate) fn install_level(
        &self,
        index: usize,
        payload: LevelPayload,
    ) -> Result<(), MipmapError> {
        let level = &self.levels()[index];
        let texture = self.context.textures.create_texture(&payload)?;
        let byte_size = payload.byte_size();
        self.context.add_resident_bytes(byte_size);
        let previous = {
            let _lock = level.lock();
            let previous = level.data.swap(Some(Arc::new(LevelData {
                payload,
                texture,
                byte_size,
            })));
            level
                .state
                .store(LevelState::Ready(self.context.current_frame()));
            previous
        };
        if let Some(previous) = previous {
            self.context.release_level_data(&previous);
        }
        let _ = self.state.compare_exchange(
            MipmapState::HeaderReady as u8,
            MipmapState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.context.request_release_if_overallocated();
        Ok(())
    }

    /// Installs a level produced on the way to another one, unless someone else owns it.
    pub(crate) fn offer_derived_level(&self, index: usize, image: &Arc<DynamicImage>) {
        let level = &self.levels()[index];
        if level
            .state
            .compare_exchange(LevelState::New, LevelState::Loading)
            .is_err()
        {
            return;
        }
        if let Err(error) = self.install_level(index, LevelPayload::Image(Arc::clone(image))) {
            tracing::warn!(
                target: "mipmap",
                path = %self.path().display(),
                level = index,
                %error,
                "derived level install failed"
            );
            self.fail_level(index);
        }
    }

    pub(crate) fn fail_level(&self, index: usize) {
        self.levels()[index].state.store(LevelState::LoadError);
        StatsCounters::bump(&self.context.stats.load_errors);
    }

    pub(crate) fn finish_load(&self, index: usize) {
        self.levels()[index].set_pending(None);
    }

    /// Pushes every ready level except the coarsest, which always stays resident.
    pub(crate) fn collect_eviction_candidates(
        self: &Arc<Self>,
        candidates: &mut BinaryHeap<EvictionCandidate>,
    ) {
        let levels = self.levels();
        let Some(coarsest) = levels.len().checked_sub(1) else {
            return;
        };
        for (index, level) in levels.iter().enumerate().take(coarsest) {
            if let LevelState::Ready(last_used) = level.state.load() {
                candidates.push(EvictionCandidate {
                    last_used,
                    mipmap: Arc::clone(self),
                    level: index,
                });
            }
        }
    }

    /// Resets a level that is still ready with `last_used` back to `New`.
    pub(crate) fn evict_level(&self, index: usize, last_used: u64) -> EvictOutcome {
        let level = &self.levels()[index];
        let Some(lock) = level.try_lock() else {
            return EvictOutcome::Busy;
        };
        if level
            .state
            .compare_exchange(LevelState::Ready(last_used), LevelState::New)
            .is_err()
        {
            return EvictOutcome::Skipped;
        }
        let data = level.data.swap(None);
        drop(lock);
        match data {
            Some(data) => {
                self.context.release_level_data(&data);
                StatsCounters::bump(&self.context.stats.evictions);
                EvictOutcome::Freed(data.byte_size)
            }
            None => EvictOutcome::Skipped,
        }
    }
}

impl Drop for Mipmap {
    fn drop(&mut self) {
        let this: *const Mipmap = self;
        for level in self.levels() {
            if let Some(data) = level.data.swap(None) {
                self.context.release_level_data(&data);
            }
        }
        self.context.forget_mipmap(&self.key, this);
    }
}
