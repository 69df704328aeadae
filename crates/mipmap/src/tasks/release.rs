use std::sync::Weak;

use task_queue::{BackgroundTask, TaskOutcome};

use crate::mipmap::EvictOutcome;
use crate::store::StoreContext;

/// Store-wide evictor. Frees least recently used levels until the budget holds, then sleeps
/// for the idle interval; busy levels schedule a quick retry.
pub(crate) struct MipmapReleaseTask {
    context: Weak<StoreContext>,
}

impl MipmapReleaseTask {
    pub fn new(context: Weak<StoreContext>) -> Self {
        Self { context }
    }
}

impl BackgroundTask for MipmapReleaseTask {
    fn run(&self) -> TaskOutcome {
        let Some(context) = self.context.upgrade() else {
            return TaskOutcome::Done;
        };
        let idle = context.config.release_idle_interval();
        let overallocated = context.overallocated_bytes();
        if overallocated == 0 {
            return TaskOutcome::RunAgainAfter(idle);
        }

        let mut candidates = context.eviction_candidates();
        let mut freed = 0;
        let mut evicted = 0;
        let mut busy = false;
        while freed < overallocated {
            let Some(candidate) = candidates.pop() else {
                break;
            };
            match candidate.mipmap.evict_level(candidate.level, candidate.last_used) {
                EvictOutcome::Freed(bytes) => {
                    freed += bytes;
                    evicted += 1;
                }
                EvictOutcome::Busy => busy = true,
                EvictOutcome::Skipped => {}
            }
        }
        drop(candidates);
        tracing::debug!(
            target: "mipmap",
            overallocated,
            freed,
            evicted,
            busy,
            "release pass"
        );
        if busy && freed < overallocated {
            TaskOutcome::RunAgainAfter(context.config.release_retry_interval())
        } else {
            TaskOutcome::RunAgainAfter(idle)
        }
    }

    fn label(&self) -> &'static str {
        "mipmap.release"
    }
}
