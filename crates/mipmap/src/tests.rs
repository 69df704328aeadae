use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use image::{DynamicImage, Rgba, RgbaImage};

use crate::{
    BlockCompressor, CompressedFormat, CpuTextureBackend, LevelPayload,
    LevelState, MemoryBudget, MipSize, MipmapError, MipmapState, MipmapStore, MipmapStoreConfig,
    PixelFormat, StoreCollaborators, TaskPriority,
};

const WAIT: Duration = Duration::from_secs(10);

fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    })
    .save(&path)
    .expect("write source png");
    path
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn config(cache_dir: &Path) -> MipmapStoreConfig {
    MipmapStoreConfig {
        cache_dir: cache_dir.to_path_buf(),
        worker_count: 2,
        ..MipmapStoreConfig::default()
    }
}

fn store_with(config: MipmapStoreConfig, collaborators: StoreCollaborators) -> MipmapStore {
    MipmapStore::with_collaborators(config, collaborators).expect("create mipmap store")
}

/// Budget whose overage the test sets directly.
#[derive(Default)]
struct ManualBudget {
    overallocated: AtomicU64,
}

impl MemoryBudget for ManualBudget {
    fn overallocated_bytes(&self, _resident_bytes: u64) -> u64 {
        self.overallocated.load(Ordering::Acquire)
    }
}

struct ArcBudget(Arc<ManualBudget>);

impl MemoryBudget for ArcBudget {
    fn overallocated_bytes(&self, resident_bytes: u64) -> u64 {
        self.0.overallocated_bytes(resident_bytes)
    }
}

/// Stores one byte per pixel so payload sizes are predictable.
struct LumaCompressor;

impl BlockCompressor for LumaCompressor {
    fn format(&self) -> CompressedFormat {
        CompressedFormat::Bc1
    }

    fn compress(&self, image: &DynamicImage) -> Result<Vec<u8>, MipmapError> {
        Ok(image.to_luma8().into_raw())
    }
}

#[test]
fn level_sizes_follow_the_source_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "odd.png", 1000, 333);
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());

    let mipmap = store.acquire(&source, false).expect("acquire");
    assert!(matches!(
        mipmap.wait_for_header(WAIT),
        MipmapState::HeaderReady | MipmapState::Ready
    ));
    assert_eq!(mipmap.max_level(), Some(3));
    assert_eq!(mipmap.mipmap_size(0), Some(MipSize::new(1000, 333)));
    assert_eq!(mipmap.mipmap_size(1), Some(MipSize::new(500, 166)));
    assert_eq!(mipmap.mipmap_size(2), Some(MipSize::new(250, 83)));
    assert_eq!(mipmap.mipmap_size(3), Some(MipSize::new(125, 41)));
    assert_eq!(
        mipmap.header().map(|header| header.pixel_format),
        Some(PixelFormat::Rgba8)
    );
}

#[test]
fn acquire_shares_one_instance_per_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "shared.png", 64, 64);
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());

    let first = store.acquire(&source, false).expect("first acquire");
    let second = store.acquire(&source, false).expect("second acquire");
    assert!(Arc::ptr_eq(&first, &second));
    let compressed = store.acquire(&source, true).expect("compressed acquire");
    assert!(!Arc::ptr_eq(&first, &compressed));
    assert_eq!(store.live_mipmap_count(), 2);

    drop((first, second, compressed));
    assert!(store.wait_until_idle(WAIT));
    // Workers release their task handles just after the queue reports idle.
    assert!(eventually(|| store.live_mipmap_count() == 0));
    assert!(eventually(|| store.registered_mipmap_count() == 0));
    assert_eq!(store.collect_garbage(), 0);
}

#[test]
fn dropped_mipmaps_leave_the_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());
    let sources: Vec<PathBuf> = (0..20)
        .map(|index| write_png(dir.path(), &format!("source{index}.png"), 32, 32))
        .collect();

    for source in &sources {
        let mipmap = store.acquire(source, false).expect("acquire");
        assert!(mipmap.wait_for_header(WAIT) != MipmapState::Error);
    }
    assert!(store.wait_until_idle(WAIT));
    assert!(eventually(|| store.registered_mipmap_count() == 0));
    assert_eq!(store.live_mipmap_count(), 0);
    assert_eq!(store.collect_garbage(), 0);

    let kept = store.acquire(&sources[0], false).expect("acquire again");
    assert_eq!(store.registered_mipmap_count(), 1);
    drop(kept);
    assert!(store.wait_until_idle(WAIT));
    assert!(eventually(|| store.registered_mipmap_count() == 0));
}

#[test]
fn concurrent_requests_enqueue_a_single_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "busy.png", 512, 512);
    let store = store_with(
        MipmapStoreConfig {
            preload_coarsest_level: false,
            ..config(&dir.path().join("cache"))
        },
        StoreCollaborators::default(),
    );
    let mipmap = store.acquire(&source, false).expect("acquire");
    assert_eq!(mipmap.wait_for_header(WAIT), MipmapState::HeaderReady);
    let before = store.stats().load_tasks_enqueued;

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mipmap = Arc::clone(&mipmap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                mipmap.texture(0, TaskPriority::NORMAL)
            })
        })
        .collect();
    for handle in handles {
        let hit = handle.join().expect("request thread");
        assert!(hit.is_none_or(|hit| hit.level == 0));
    }

    assert!(store.wait_until_idle(WAIT));
    assert_eq!(store.stats().load_tasks_enqueued - before, 1);
    assert!(mipmap.is_level_available(0));
}

#[test]
fn unready_level_falls_back_to_a_coarser_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "fallback.png", 512, 256);
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());
    let mipmap = store.acquire(&source, false).expect("acquire");
    let max_level = 2;
    assert!(mipmap.wait_for_level(max_level, TaskPriority::NORMAL, WAIT));
    assert_eq!(mipmap.max_level(), Some(max_level));

    let hit = mipmap
        .texture(0, TaskPriority::LOW)
        .expect("some level is ready");
    assert_eq!(
        Some(hit.value.size),
        mipmap.mipmap_size(hit.level),
        "texture matches the level it came from"
    );
    assert!(store.wait_until_idle(WAIT));
    let hit = mipmap.texture(0, TaskPriority::LOW).expect("level 0 loaded");
    assert_eq!(hit.level, 0);
    assert_eq!(hit.value.size, MipSize::new(512, 256));
}

#[test]
fn eviction_frees_least_recently_used_levels_but_keeps_the_coarsest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "lru.png", 512, 512);
    let budget = Arc::new(ManualBudget::default());
    let textures = Arc::new(CpuTextureBackend::new());
    let store = store_with(
        config(&dir.path().join("cache")),
        StoreCollaborators {
            budget: Some(Arc::new(ArcBudget(Arc::clone(&budget)))),
            textures: Arc::clone(&textures) as _,
            ..StoreCollaborators::default()
        },
    );
    let mipmap = store.acquire(&source, false).expect("acquire");
    assert!(mipmap.wait_for_level(2, TaskPriority::NORMAL, WAIT));
    assert!(store.wait_until_idle(WAIT));

    assert!(mipmap.wait_for_level(0, TaskPriority::NORMAL, WAIT));
    assert!(store.wait_until_idle(WAIT));
    assert_eq!(textures.live_texture_count(), 3);
    assert!(matches!(mipmap.level_state(1), Some(LevelState::Ready(1))));

    let frame = store.advance_frame();
    assert_eq!(mipmap.texture(0, TaskPriority::NORMAL).map(|hit| hit.level), Some(0));
    assert_eq!(mipmap.level_state(0), Some(LevelState::Ready(frame)));

    budget.overallocated.store(1, Ordering::Release);
    store.notify_out_of_memory();
    assert!(store.wait_until_idle(WAIT));
    assert!(!mipmap.is_level_available(1));
    assert_eq!(mipmap.level_state(1), Some(LevelState::New));
    assert!(mipmap.is_level_available(0));
    assert!(mipmap.is_level_available(2));
    assert_eq!(store.stats().evictions, 1);
    assert_eq!(textures.live_texture_count(), 2);

    budget.overallocated.store(u64::MAX, Ordering::Release);
    for _ in 0..3 {
        store.notify_out_of_memory();
        assert!(store.wait_until_idle(WAIT));
    }
    assert!(!mipmap.is_level_available(0));
    assert!(mipmap.is_level_available(2));
    assert_eq!(store.resident_bytes(), 128 * 128 * 4);
}

#[test]
fn exceeding_the_memory_limit_evicts_without_a_notification() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "large.png", 1024, 1024);
    let memory_limit_bytes = 200_000;
    let store = store_with(
        MipmapStoreConfig {
            memory_limit_bytes,
            ..config(&dir.path().join("cache"))
        },
        StoreCollaborators::default(),
    );
    let mipmap = store.acquire(&source, false).expect("acquire");
    assert!(mipmap.wait_for_header(WAIT) != MipmapState::Error);
    let coarsest = mipmap.max_level().expect("header installed");
    assert_eq!(coarsest, 3);

    // One request only: polling would reload level 0 after each eviction.
    let _ = mipmap.texture(0, TaskPriority::HIGH);
    assert!(store.wait_until_idle(WAIT));
    assert!(eventually(|| {
        !mipmap.is_level_available(0) && store.resident_bytes() <= memory_limit_bytes
    }));
    assert!(store.stats().evictions > 0);
    assert!(mipmap.is_level_available(coarsest));
}

#[test]
fn derived_levels_are_reused_from_the_disk_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "cached.png", 1024, 512);
    let cache_dir = dir.path().join("cache");

    let first = store_with(config(&cache_dir), StoreCollaborators::default());
    let mipmap = first.acquire(&source, false).expect("acquire");
    assert!(mipmap.wait_for_level(3, TaskPriority::NORMAL, WAIT));
    assert!(first.wait_until_idle(WAIT));
    let stats = first.stats();
    assert_eq!(stats.source_decodes, 1);
    assert_eq!(stats.derived_levels, 3);
    assert_eq!(stats.disk_cache_writes, 3);
    assert!(mipmap.is_level_available(1));
    drop(mipmap);
    drop(first);

    let second = store_with(config(&cache_dir), StoreCollaborators::default());
    let mipmap = second.acquire(&source, false).expect("acquire again");
    assert!(mipmap.wait_for_level(3, TaskPriority::NORMAL, WAIT));
    assert!(mipmap.wait_for_level(2, TaskPriority::NORMAL, WAIT));
    assert!(second.wait_until_idle(WAIT));
    let stats = second.stats();
    assert_eq!(stats.derived_levels, 0);
    assert_eq!(stats.source_decodes, 0);
    assert_eq!(stats.disk_cache_hits, 2);
}

#[test]
fn unreadable_source_puts_the_mipmap_in_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());
    let mipmap = store
        .acquire(dir.path().join("missing.png"), false)
        .expect("acquire missing file");
    assert_eq!(mipmap.wait_for_header(WAIT), MipmapState::Error);
    assert!(mipmap.texture(0, TaskPriority::HIGH).is_none());
    assert!(mipmap.header().is_none());
}

#[test]
fn failed_level_load_is_sticky() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "vanishing.png", 256, 256);
    let store = store_with(
        MipmapStoreConfig {
            preload_coarsest_level: false,
            ..config(&dir.path().join("cache"))
        },
        StoreCollaborators::default(),
    );
    let mipmap = store.acquire(&source, false).expect("acquire");
    assert_eq!(mipmap.wait_for_header(WAIT), MipmapState::HeaderReady);
    std::fs::write(&source, b"not an image").expect("corrupt source");

    assert!(!mipmap.wait_for_level(0, TaskPriority::HIGH, WAIT));
    assert!(store.wait_until_idle(WAIT));
    assert_eq!(mipmap.level_state(0), Some(LevelState::LoadError));
    let enqueued = store.stats().load_tasks_enqueued;
    assert!(mipmap.texture(0, TaskPriority::HIGH).is_none());
    assert_eq!(store.stats().load_tasks_enqueued, enqueued);
    assert_eq!(store.stats().load_errors, 1);
}

#[test]
fn reload_hands_out_a_fresh_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "reload.png", 128, 128);
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());
    let before = store.acquire(&source, false).expect("acquire");
    assert!(before.wait_for_level(0, TaskPriority::NORMAL, WAIT));

    assert_eq!(store.reload(&source).expect("reload"), 1);
    assert!(before.is_obsolete());
    assert!(before.is_level_available(0));
    let after = store.acquire(&source, false).expect("acquire after reload");
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(!after.is_obsolete());
}

#[test]
fn lod_selection_uses_the_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "lod.png", 1024, 512);
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());
    let mipmap = store.acquire(&source, false).expect("acquire");
    mipmap.wait_for_header(WAIT);

    assert_eq!(mipmap.level(&crate::Affine2::scale(0.25), 1.0, None), Some(2));
    assert_eq!(mipmap.level(&crate::Affine2::IDENTITY, 1.0, Some(200)), Some(3));
}

#[test]
fn compressed_chain_is_generated_once_and_loaded_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "compressed.png", 512, 256);
    let cache_dir = dir.path().join("cache");
    let collaborators = || StoreCollaborators {
        compressor: Some(Arc::new(LumaCompressor)),
        ..StoreCollaborators::default()
    };

    let first = store_with(config(&cache_dir), collaborators());
    let mipmap = first.acquire(&source, true).expect("acquire");
    assert!(mipmap.is_compressed());
    assert!(mipmap.wait_for_level(0, TaskPriority::NORMAL, WAIT));
    assert!(first.wait_until_idle(WAIT));
    assert_eq!(first.stats().compressed_chains_generated, 1);
    let hit = mipmap.image(0, TaskPriority::NORMAL).expect("level 0");
    match hit.value {
        LevelPayload::Compressed(image) => {
            assert_eq!((image.width, image.height), (512, 256));
            assert_eq!(image.data.len(), 512 * 256);
        }
        LevelPayload::Image(_) => panic!("expected a compressed payload"),
    }
    drop(mipmap);
    drop(first);

    let second = store_with(config(&cache_dir), collaborators());
    let mipmap = second.acquire(&source, true).expect("acquire again");
    assert!(mipmap.wait_for_level(1, TaskPriority::NORMAL, WAIT));
    assert!(second.wait_until_idle(WAIT));
    assert_eq!(second.stats().compressed_chains_generated, 0);
    assert_eq!(second.stats().source_decodes, 0);
}

#[test]
fn compressed_request_without_compressor_loads_plain_levels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = write_png(dir.path(), "plain.png", 64, 64);
    let store = store_with(config(&dir.path().join("cache")), StoreCollaborators::default());
    let mipmap = store.acquire(&source, true).expect("acquire");
    assert!(!mipmap.is_compressed());
    assert!(mipmap.wait_for_level(0, TaskPriority::NORMAL, WAIT));
    let hit = mipmap.image(0, TaskPriority::NORMAL).expect("level 0");
    assert!(matches!(hit.value, LevelPayload::Image(_)));
}
