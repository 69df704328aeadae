use std::sync::Arc;

use task_queue::{BackgroundTask, TaskOutcome, TaskPriority};

use crate::mipmap::{ChainState, Mipmap};
use crate::tasks::{COMPRESSED_SUFFIX, GenerateCompressedChainTask};

/// Reads the source header once and builds the level table.
pub(crate) struct PingTask {
    mipmap: Arc<Mipmap>,
}

impl PingTask {
    pub fn new(mipmap: Arc<Mipmap>) -> Self {
        Self { mipmap }
    }

    fn start_compressed_chain(&self, max_level: usize) {
        let mipmap = &self.mipmap;
        let cached = (0..=max_level).all(|level| {
            mipmap
                .cache_path(level, COMPRESSED_SUFFIX)
                .is_some_and(|path| path.is_file())
        });
        if cached {
            mipmap.set_chain_state(ChainState::Ready);
            return;
        }
        let task = GenerateCompressedChainTask::new(Arc::clone(mipmap));
        mipmap
            .context()
            .queue
            .add_task(Arc::new(task), TaskPriority::HIGH);
    }
}

impl BackgroundTask for PingTask {
    fn run(&self) -> TaskOutcome {
        let mipmap = &self.mipmap;
        let context = mipmap.context();
        match context.source.ping(mipmap.path()) {
            Ok(header) => {
                let max_level = mipmap.install_header(header);
                tracing::debug!(
                    target: "mipmap",
                    path = %mipmap.path().display(),
                    width = header.size.width,
                    height = header.size.height,
                    max_level,
                    "mipmap header read"
                );
                if mipmap.is_compressed() {
                    self.start_compressed_chain(max_level);
                }
                if context.config.preload_coarsest_level {
                    mipmap.request_load(max_level, TaskPriority::NORMAL);
                }
            }
            Err(error) => {
                tracing::warn!(
                    target: "mipmap",
                    path = %mipmap.path().display(),
                    %error,
                    "mipmap header read failed"
                );
                mipmap.mark_error();
            }
        }
        TaskOutcome::Done
    }

    fn label(&self) -> &'static str {
        "mipmap.ping"
    }
}
