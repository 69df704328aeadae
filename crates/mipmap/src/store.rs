use std::collections::{BinaryHeap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use task_queue::{TaskId, TaskPriority, TaskQueue, TaskQueueConfig};

use crate::budget::{MemoryBudget, ResidentBytesBudget};
use crate::cache_path::{CachePaths, SourceFingerprint};
use crate::compress::BlockCompressor;
use crate::error::MipmapError;
use crate::level::LevelData;
use crate::mipmap::{EvictionCandidate, Mipmap};
use crate::source::{FileImageSource, ImageSource};
use crate::tasks::MipmapReleaseTask;
use crate::texture::{CpuTextureBackend, TextureBackend};

pub const DEFAULT_MIN_MIP_SIZE: u32 = 128;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;

static GLOBAL_STORE: OnceLock<MipmapStore> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MipmapStoreConfig {
    pub cache_dir: PathBuf,
    pub cache_version: u32,
    /// Halving stops once both dimensions are at most this size.
    pub min_mip_size: u32,
    pub memory_limit_bytes: u64,
    pub release_idle_interval_ms: u64,
    pub release_retry_interval_ms: u64,
    pub worker_count: usize,
    pub write_disk_cache: bool,
    /// Queue the coarsest level as soon as the header is known.
    pub preload_coarsest_level: bool,
}

impl Default for MipmapStoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("mipmap-cache"),
            cache_version: 1,
            min_mip_size: DEFAULT_MIN_MIP_SIZE,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            release_idle_interval_ms: 60_000,
            release_retry_interval_ms: 50,
            worker_count: TaskQueueConfig::default().worker_count,
            write_disk_cache: true,
            preload_coarsest_level: true,
        }
    }
}

impl MipmapStoreConfig {
    pub fn release_idle_interval(&self) -> Duration {
        Duration::from_millis(self.release_idle_interval_ms)
    }

    pub fn release_retry_interval(&self) -> Duration {
        Duration::from_millis(self.release_retry_interval_ms)
    }
}

pub struct StoreCollaborators {
    pub source: Arc<dyn ImageSource>,
    pub textures: Arc<dyn TextureBackend>,
    /// `None` uses a [`ResidentBytesBudget`] at `memory_limit_bytes`.
    pub budget: Option<Arc<dyn MemoryBudget>>,
    pub compressor: Option<Arc<dyn BlockCompressor>>,
}

impl Default for StoreCollaborators {
    fn default() -> Self {
        Self {
            source: Arc::new(FileImageSource::default()),
            textures: Arc::new(CpuTextureBackend::new()),
            budget: None,
            compressor: None,
        }
    }
}

/// Registry identity: one live [`Mipmap`] per source version and compression mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MipmapKey {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MipmapStats {
    pub source_decodes: u64,
    pub derived_levels: u64,
    pub disk_cache_hits: u64,
    pub disk_cache_writes: u64,
    pub load_tasks_enqueued: u64,
    pub load_errors: u64,
    pub evictions: u64,
    pub compressed_chains_generated: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub source_decodes: AtomicU64,
    pub derived_levels: AtomicU64,
    pub disk_cache_hits: AtomicU64,
    pub disk_cache_writes: AtomicU64,
    pub load_tasks_enqueued: AtomicU64,
    pub load_errors: AtomicU64,
    pub evictions: AtomicU64,
    pub compressed_chains_generated: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MipmapStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MipmapStats {
            source_decodes: read(&self.source_decodes),
            derived_levels: read(&self.derived_levels),
            disk_cache_hits: read(&self.disk_cache_hits),
            disk_cache_writes: read(&self.disk_cache_writes),
            load_tasks_enqueued: read(&self.load_tasks_enqueued),
            load_errors: read(&self.load_errors),
            evictions: read(&self.evictions),
            compressed_chains_generated: read(&self.compressed_chains_generated),
        }
    }
}

/// State shared by the store, every mipmap it created and their background tasks.
pub(crate) struct StoreContext {
    pub config: MipmapStoreConfig,
    pub queue: TaskQueue,
    pub source: Arc<dyn ImageSource>,
    pub textures: Arc<dyn TextureBackend>,
    pub compressor: Option<Arc<dyn BlockCompressor>>,
    pub cache_paths: CachePaths,
    pub stats: StatsCounters,
    budget: Arc<dyn MemoryBudget>,
    resident_bytes: AtomicU64,
    frame: AtomicU64,
    registry: Mutex<HashMap<MipmapKey, Weak<Mipmap>>>,
    release_task: Mutex<Option<TaskId>>,
}

impl StoreContext {
    fn registry(&self) -> MutexGuard<'_, HashMap<MipmapKey, Weak<Mipmap>>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Acquire)
    }

    pub fn overallocated_bytes(&self) -> u64 {
        self.budget.overallocated_bytes(self.resident_bytes())
    }

    pub fn add_resident_bytes(&self, bytes: u64) {
        self.resident_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Gives back the memory and texture of a level that was swapped out.
    pub fn release_level_data(&self, data: &LevelData) {
        let _ = self
            .resident_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |resident| {
                Some(resident.saturating_sub(data.byte_size))
            });
        self.textures.destroy_texture(&data.texture);
    }

    /// Wakes the release task when the budget is exceeded. A running pass is queued to
    /// run again once it finishes.
    pub fn request_release_if_overallocated(&self) {
        if self.overallocated_bytes() == 0 {
            return;
        }
        let release_task = *self
            .release_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task_id) = release_task {
            self.queue.run_now(task_id);
        }
    }

    /// Removes the registry entry of a mipmap being dropped, unless the key already
    /// belongs to a newer instance.
    pub fn forget_mipmap(&self, key: &MipmapKey, mipmap: *const Mipmap) {
        let mut registry = self.registry();
        if registry
            .get(key)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), mipmap))
        {
            registry.remove(key);
        }
    }

    /// Every evictable level of every live mipmap, oldest first. The registry lock is taken
    /// once per entry so `acquire` is never stalled by a full scan.
    pub fn eviction_candidates(&self) -> BinaryHeap<EvictionCandidate> {
        let keys: Vec<MipmapKey> = self.registry().keys().cloned().collect();
        let mut candidates = BinaryHeap::new();
        for key in keys {
            let mipmap = self.registry().get(&key).and_then(Weak::upgrade);
            if let Some(mipmap) = mipmap {
                mipmap.collect_eviction_candidates(&mut candidates);
            }
        }
        candidates
    }

    fn ensure_release_task(context: &Arc<StoreContext>) -> TaskId {
        let mut release_task = context
            .release_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task_id) = *release_task {
            return task_id;
        }
        let task = Arc::new(MipmapReleaseTask::new(Arc::downgrade(context)));
        let task_id = context.queue.add_task(task, TaskPriority::LOW);
        *release_task = Some(task_id);
        task_id
    }
}

/// Process-wide cache of [`Mipmap`]s keyed by source file.
pub struct MipmapStore {
    context: Arc<StoreContext>,
}

impl MipmapStore {
    pub fn new(config: MipmapStoreConfig) -> Result<Self, MipmapError> {
        Self::with_collaborators(config, StoreCollaborators::default())
    }

    pub fn with_collaborators(
        config: MipmapStoreConfig,
        collaborators: StoreCollaborators,
    ) -> Result<Self, MipmapError> {
        let queue = TaskQueue::new(TaskQueueConfig {
            worker_count: config.worker_count,
            thread_name_prefix: "mipmap".to_owned(),
        })?;
        let budget = collaborators
            .budget
            .unwrap_or_else(|| Arc::new(ResidentBytesBudget::new(config.memory_limit_bytes)));
        let cache_paths = CachePaths::new(&config.cache_dir, config.cache_version);
        tracing::debug!(
            target: "mipmap",
            cache_dir = %config.cache_dir.display(),
            workers = config.worker_count,
            "mipmap store started"
        );
        Ok(Self {
            context: Arc::new(StoreContext {
                config,
                queue,
                source: collaborators.source,
                textures: collaborators.textures,
                compressor: collaborators.compressor,
                cache_paths,
                stats: StatsCounters::default(),
                budget,
                resident_bytes: AtomicU64::new(0),
                frame: AtomicU64::new(1),
                registry: Mutex::new(HashMap::new()),
                release_task: Mutex::new(None),
            }),
        })
    }

    /// The lazily built process-wide store with default configuration.
    ///
    /// Panics if the worker threads cannot be spawned.
    pub fn global() -> &'static MipmapStore {
        GLOBAL_STORE.get_or_init(|| {
            MipmapStore::new(MipmapStoreConfig::default())
                .unwrap_or_else(|error| panic!("failed to start global mipmap store: {error}"))
        })
    }

    /// Configures the process-wide store. Has no effect once [`MipmapStore::global`] built it.
    pub fn init_global(
        config: MipmapStoreConfig,
        collaborators: StoreCollaborators,
    ) -> Result<&'static MipmapStore, MipmapError> {
        if let Some(store) = GLOBAL_STORE.get() {
            tracing::warn!(target: "mipmap", "global mipmap store already initialized");
            return Ok(store);
        }
        let store = Self::with_collaborators(config, collaborators)?;
        if GLOBAL_STORE.set(store).is_err() {
            tracing::warn!(target: "mipmap", "global mipmap store initialized concurrently");
        }
        Ok(Self::global())
    }

    pub fn config(&self) -> &MipmapStoreConfig {
        &self.context.config
    }

    /// Returns the live mipmap for `path`, creating one and starting its header read when no
    /// current instance exists.
    pub fn acquire(
        &self,
        path: impl AsRef<Path>,
        compressed: bool,
    ) -> Result<Arc<Mipmap>, MipmapError> {
        let absolute = absolute_path(path.as_ref())?;
        let metadata = fs::metadata(&absolute).ok();
        let modified = metadata.as_ref().and_then(|metadata| metadata.modified().ok());
        let key = MipmapKey {
            path: absolute.clone(),
            modified,
            compressed,
        };

        let mut registry = self.context.registry();
        let existing = registry.get(&key).and_then(Weak::upgrade);
        if let Some(existing) = existing.as_ref() {
            if !existing.is_obsolete() {
                return Ok(Arc::clone(existing));
            }
        }
        let fingerprint = metadata.map(|metadata| SourceFingerprint {
            path: absolute,
            file_size: metadata.len(),
            modified,
        });
        let compressed_levels = compressed
            && self.context.compressor.is_some()
            && fingerprint.is_some()
            && self.context.config.write_disk_cache;
        let mipmap = Arc::new(Mipmap::new(
            key.clone(),
            fingerprint,
            compressed_levels,
            Arc::clone(&self.context),
        ));
        let previous = registry.insert(key, Arc::downgrade(&mipmap));
        // Dropping the last handle of a replaced instance takes the registry lock.
        drop(registry);
        drop((previous, existing));

        tracing::debug!(
            target: "mipmap",
            path = %mipmap.path().display(),
            compressed = compressed_levels,
            "mipmap created"
        );
        StoreContext::ensure_release_task(&self.context);
        mipmap.start_ping();
        Ok(mipmap)
    }

    /// Marks every instance of `path` obsolete and forgets them, so the next `acquire`
    /// builds a fresh mipmap. Live instances keep working for their current holders.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<usize, MipmapError> {
        let absolute = absolute_path(path.as_ref())?;
        let mut removed = Vec::new();
        self.context.registry().retain(|key, mipmap| {
            if key.path != absolute {
                return true;
            }
            removed.push(mipmap.clone());
            false
        });
        let mut marked = 0;
        for mipmap in removed.iter().filter_map(Weak::upgrade) {
            mipmap.mark_obsolete();
            marked += 1;
        }
        tracing::debug!(target: "mipmap", path = %absolute.display(), marked, "mipmap reload");
        Ok(marked)
    }

    /// Advances the frame clock used as the LRU timestamp and returns the new frame.
    pub fn advance_frame(&self) -> u64 {
        self.context.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_frame(&self) -> u64 {
        self.context.current_frame()
    }

    /// Runs the release task immediately.
    pub fn notify_out_of_memory(&self) {
        let task_id = StoreContext::ensure_release_task(&self.context);
        if !self.context.queue.run_now(task_id) {
            tracing::debug!(target: "mipmap", "release task already running");
        }
    }

    pub fn stats(&self) -> MipmapStats {
        self.context.stats.snapshot()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.context.resident_bytes()
    }

    pub fn live_mipmap_count(&self) -> usize {
        self.context
            .registry()
            .values()
            .filter(|mipmap| mipmap.strong_count() > 0)
            .count()
    }

    pub(crate) fn registered_mipmap_count(&self) -> usize {
        self.context.registry().len()
    }

    /// Drops registry entries whose mipmaps are gone. Returns how many were removed.
    pub fn collect_garbage(&self) -> usize {
        let mut registry = self.context.registry();
        let before = registry.len();
        registry.retain(|_, mipmap| mipmap.strong_count() > 0);
        before - registry.len()
    }

    /// Blocks until no background work is ready or running.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.context.queue.wait_until_idle(timeout)
    }
}

fn absolute_path(path: &Path) -> Result<PathBuf, MipmapError> {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .map_err(|error| MipmapError::io(path, error))
}
