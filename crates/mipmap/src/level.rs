//! Per-level cache entry: a lock-free state word, a short-held structural latch, and the
//! payload behind an atomically swappable pointer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use image::DynamicImage;
use task_queue::{TaskId, TaskPriority};

use crate::source::{CompressedImage, MipSize};
use crate::texture::TextureHandle;

const TAG_SHIFT: u32 = 62;
const TIMESTAMP_MASK: u64 = (1 << TAG_SHIFT) - 1;
const TAG_NEW: u64 = 0;
const TAG_LOADING: u64 = 1;
const TAG_LOAD_ERROR: u64 = 2;
const TAG_READY: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelState {
    New,
    Loading,
    /// Sticky: failed levels are never retried automatically.
    LoadError,
    /// Loaded; carries the frame in which the level was last used.
    Ready(u64),
}

impl LevelState {
    fn encode(self) -> u64 {
        match self {
            LevelState::New => TAG_NEW << TAG_SHIFT,
            LevelState::Loading => TAG_LOADING << TAG_SHIFT,
            LevelState::LoadError => TAG_LOAD_ERROR << TAG_SHIFT,
            LevelState::Ready(frame) => (TAG_READY << TAG_SHIFT) | (frame & TIMESTAMP_MASK),
        }
    }

    fn decode(bits: u64) -> Self {
        match bits >> TAG_SHIFT {
            TAG_NEW => LevelState::New,
            TAG_LOADING => LevelState::Loading,
            TAG_LOAD_ERROR => LevelState::LoadError,
            _ => LevelState::Ready(bits & TIMESTAMP_MASK),
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, LevelState::Ready(_))
    }
}

/// A [`LevelState`] packed into one compare-and-swap word: the tag lives in the top two
/// bits and the ready timestamp in the remaining 62.
#[derive(Debug)]
pub struct AtomicLevelState {
    bits: AtomicU64,
}

impl Default for AtomicLevelState {
    fn default() -> Self {
        Self::new(LevelState::New)
    }
}

impl AtomicLevelState {
    pub fn new(state: LevelState) -> Self {
        Self {
            bits: AtomicU64::new(state.encode()),
        }
    }

    pub fn load(&self) -> LevelState {
        LevelState::decode(self.bits.load(Ordering::Acquire))
    }

    pub fn store(&self, state: LevelState) {
        self.bits.store(state.encode(), Ordering::Release);
    }

    pub fn compare_exchange(
        &self,
        current: LevelState,
        new: LevelState,
    ) -> Result<LevelState, LevelState> {
        self.bits
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(LevelState::decode)
            .map_err(LevelState::decode)
    }

    /// Moves a ready level's timestamp forward to `frame`. Returns false when the level is
    /// not ready.
    pub fn touch(&self, frame: u64) -> bool {
        let mut current = self.load();
        loop {
            let LevelState::Ready(last_used) = current else {
                return false;
            };
            if last_used >= frame {
                return true;
            }
            match self.compare_exchange(current, LevelState::Ready(frame)) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Decoded pixels of one level, either plain or block-compressed.
#[derive(Debug, Clone)]
pub enum LevelPayload {
    Image(Arc<DynamicImage>),
    Compressed(Arc<CompressedImage>),
}

impl LevelPayload {
    pub fn byte_size(&self) -> u64 {
        match self {
            LevelPayload::Image(image) => image.as_bytes().len() as u64,
            LevelPayload::Compressed(image) => image.data.len() as u64,
        }
    }

    pub fn size(&self) -> MipSize {
        match self {
            LevelPayload::Image(image) => MipSize::new(image.width(), image.height()),
            LevelPayload::Compressed(image) => MipSize::new(image.width, image.height),
        }
    }

    pub fn as_image(&self) -> Option<&Arc<DynamicImage>> {
        match self {
            LevelPayload::Image(image) => Some(image),
            LevelPayload::Compressed(_) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LevelData {
    pub payload: LevelPayload,
    pub texture: TextureHandle,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingLoad {
    pub task_id: TaskId,
    pub priority: TaskPriority,
}

#[derive(Debug, Default)]
pub(crate) struct MipmapLevel {
    pub state: AtomicLevelState,
    locked: AtomicBool,
    pub data: ArcSwapOption<LevelData>,
    pub pending: Mutex<Option<PendingLoad>>,
}

/// Holds a level's structural latch; released on drop.
pub(crate) struct LevelLock<'a> {
    level: &'a MipmapLevel,
}

impl Drop for LevelLock<'_> {
    fn drop(&mut self) {
        self.level.locked.store(false, Ordering::Release);
    }
}

impl MipmapLevel {
    pub fn try_lock(&self) -> Option<LevelLock<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LevelLock { level: self })
    }

    /// Spins until the latch is free. Holders only swap pointers, so waits are short.
    pub fn lock(&self) -> LevelLock<'_> {
        loop {
            if let Some(lock) = self.try_lock() {
                return lock;
            }
            std::thread::yield_now();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        self.state.load().is_ready() && self.data.load().is_some()
    }

    pub fn set_pending(&self, pending: Option<PendingLoad>) {
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = pending;
    }

    pub fn pending(&self) -> Option<PendingLoad> {
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_round_trips_every_tag() {
        for state in [
            LevelState::New,
            LevelState::Loading,
            LevelState::LoadError,
            LevelState::Ready(0),
            LevelState::Ready(TIMESTAMP_MASK),
        ] {
            assert_eq!(LevelState::decode(state.encode()), state);
        }
    }

    #[test]
    fn only_one_new_to_loading_transition_wins() {
        let state = AtomicLevelState::default();
        assert_eq!(
            state.compare_exchange(LevelState::New, LevelState::Loading),
            Ok(LevelState::New)
        );
        assert_eq!(
            state.compare_exchange(LevelState::New, LevelState::Loading),
            Err(LevelState::Loading)
        );
    }

    #[test]
    fn touch_only_moves_ready_timestamps_forward() {
        let state = AtomicLevelState::new(LevelState::Loading);
        assert!(!state.touch(5));
        state.store(LevelState::Ready(3));
        assert!(state.touch(7));
        assert_eq!(state.load(), LevelState::Ready(7));
        assert!(state.touch(4));
        assert_eq!(state.load(), LevelState::Ready(7));
    }

    #[test]
    fn latch_excludes_a_second_holder() {
        let level = MipmapLevel::default();
        let guard = level.try_lock().expect("first lock");
        assert!(level.try_lock().is_none());
        assert!(level.is_locked());
        drop(guard);
        assert!(level.try_lock().is_some());
        assert!(!level.is_locked());
    }
}
