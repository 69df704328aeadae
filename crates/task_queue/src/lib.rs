//! Shared background task executor.
//!
//! Worker threads pull from a priority queue guarded by a mutex. Idle workers park on a
//! bounded notify channel, the same wake-up scheme the engine input ring used: producers
//! `try_send` a token after queueing work and a full channel means a wake-up is already
//! pending. Tasks run to completion and may ask to run again after a delay.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

const IDLE_WAIT: Duration = Duration::from_millis(250);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Larger values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskPriority(pub i32);

impl TaskPriority {
    pub const LOW: Self = Self(-100);
    pub const NORMAL: Self = Self(0);
    pub const HIGH: Self = Self(100);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    RunAgainAfter(Duration),
}

pub trait BackgroundTask: Send + Sync + 'static {
    fn run(&self) -> TaskOutcome;

    fn label(&self) -> &'static str {
        "task"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueConfig {
    pub worker_count: usize,
    pub thread_name_prefix: String,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        let worker_count = thread::available_parallelism()
            .map(|count| count.get().clamp(1, 4))
            .unwrap_or(2);
        Self {
            worker_count,
            thread_name_prefix: "task-queue".to_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task queue needs at least one worker thread")]
    NoWorkers,
    #[error("failed to spawn task queue worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskSlot {
    Queued { sequence: u64 },
    Delayed { sequence: u64, run_at: Instant },
    Running { rerun_requested: bool },
}

struct TaskRecord {
    task: Arc<dyn BackgroundTask>,
    priority: TaskPriority,
    slot: TaskSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: TaskPriority,
    sequence: u64,
    id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    run_at: Instant,
    sequence: u64,
    id: TaskId,
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    tasks: HashMap<TaskId, TaskRecord>,
    next_id: u64,
    next_sequence: u64,
}

impl QueueState {
    fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence = self
            .next_sequence
            .checked_add(1)
            .expect("task sequence overflow");
        sequence
    }

    fn enqueue_ready(&mut self, id: TaskId) {
        let sequence = self.allocate_sequence();
        let record = self.tasks.get_mut(&id).expect("queued task must be recorded");
        record.slot = TaskSlot::Queued { sequence };
        let priority = record.priority;
        self.ready.push(ReadyEntry {
            priority,
            sequence,
            id,
        });
    }

    fn enqueue_delayed(&mut self, id: TaskId, run_at: Instant) {
        let sequence = self.allocate_sequence();
        let record = self.tasks.get_mut(&id).expect("delayed task must be recorded");
        record.slot = TaskSlot::Delayed { sequence, run_at };
        self.delayed.push(Reverse(DelayedEntry {
            run_at,
            sequence,
            id,
        }));
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(entry)) = self.delayed.peek().copied() {
            if entry.run_at > now {
                break;
            }
            self.delayed.pop();
            let is_current = matches!(
                self.tasks.get(&entry.id).map(|record| record.slot),
                Some(TaskSlot::Delayed { sequence, .. }) if sequence == entry.sequence
            );
            if is_current {
                self.enqueue_ready(entry.id);
            }
        }
    }

    /// Pops the highest-priority live entry, skipping entries superseded by a
    /// reschedule or removal.
    fn pop_ready(&mut self) -> Option<(TaskId, Arc<dyn BackgroundTask>)> {
        while let Some(entry) = self.ready.pop() {
            let Some(record) = self.tasks.get_mut(&entry.id) else {
                continue;
            };
            if record.slot != (TaskSlot::Queued { sequence: entry.sequence }) {
                continue;
            }
            record.slot = TaskSlot::Running {
                rerun_requested: false,
            };
            return Some((entry.id, record.task.clone()));
        }
        None
    }

    fn next_wake(&self, now: Instant) -> Duration {
        self.delayed
            .peek()
            .map(|Reverse(entry)| entry.run_at.saturating_duration_since(now))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT)
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.tasks.values().all(|record| match record.slot {
            TaskSlot::Queued { .. } | TaskSlot::Running { .. } => false,
            TaskSlot::Delayed { run_at, .. } => run_at > now,
        })
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        match self.notify_sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                panic!("task queue notify channel disconnected")
            }
        }
    }
}

/// Priority work queue served by a fixed pool of worker threads.
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Result<Self, TaskQueueError> {
        if config.worker_count == 0 {
            return Err(TaskQueueError::NoWorkers);
        }
        let (notify_sender, notify_receiver) = bounded(config.worker_count);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify_sender,
            notify_receiver,
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_index in 0..config.worker_count {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{worker_index}", config.thread_name_prefix))
                .spawn(move || worker_loop(worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    shared.shutdown.store(true, AtomicOrdering::Release);
                    for _ in 0..workers.len() {
                        shared.notify();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(TaskQueueError::Spawn(error));
                }
            }
        }
        tracing::debug!(
            target: "task_queue",
            worker_count = config.worker_count,
            "task queue started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn add_task(&self, task: Arc<dyn BackgroundTask>, priority: TaskPriority) -> TaskId {
        let id = {
            let mut state = self.shared.lock();
            let id = Self::insert_record(&mut state, task, priority);
            state.enqueue_ready(id);
            id
        };
        self.shared.notify();
        id
    }

    pub fn add_delayed_task(
        &self,
        task: Arc<dyn BackgroundTask>,
        priority: TaskPriority,
        delay: Duration,
    ) -> TaskId {
        let id = {
            let mut state = self.shared.lock();
            let id = Self::insert_record(&mut state, task, priority);
            state.enqueue_delayed(id, Instant::now() + delay);
            id
        };
        self.shared.notify();
        id
    }

    /// Removes a queued or delayed task. Running tasks cannot be removed.
    pub fn remove_task(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.shared.lock();
            match state.tasks.get(&id).map(|record| record.slot) {
                Some(TaskSlot::Queued { .. } | TaskSlot::Delayed { .. }) => state.tasks.remove(&id),
                _ => None,
            }
        };
        removed.is_some()
    }

    /// Changes the priority of a task that has not started running yet.
    pub fn reschedule(&self, id: TaskId, priority: TaskPriority) -> bool {
        let mut state = self.shared.lock();
        let Some(record) = state.tasks.get_mut(&id) else {
            return false;
        };
        match record.slot {
            TaskSlot::Queued { .. } => {
                if record.priority != priority {
                    record.priority = priority;
                    state.enqueue_ready(id);
                }
                true
            }
            TaskSlot::Delayed { .. } => {
                record.priority = priority;
                true
            }
            TaskSlot::Running { .. } => false,
        }
    }

    /// Makes a delayed task runnable immediately. A running task is queued again as soon
    /// as its current run finishes.
    pub fn run_now(&self, id: TaskId) -> bool {
        let found = {
            let mut state = self.shared.lock();
            let Some(record) = state.tasks.get_mut(&id) else {
                return false;
            };
            match record.slot {
                TaskSlot::Queued { .. } => {}
                TaskSlot::Delayed { .. } => state.enqueue_ready(id),
                TaskSlot::Running { .. } => {
                    record.slot = TaskSlot::Running {
                        rerun_requested: true,
                    };
                }
            }
            true
        };
        self.shared.notify();
        found
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.shared.lock().tasks.contains_key(&id)
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Waits until no task is queued, due, or running. Delayed tasks that are not due
    /// yet do not count as work.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if self.shared.lock().is_idle(now) {
                return true;
            }
            if now >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for _ in 0..workers.len() {
            self.shared.notify();
        }
        let current = thread::current().id();
        for handle in workers {
            // The queue can be dropped from one of its own workers when a task held the
            // last reference; that worker exits on its own.
            if handle.thread().id() == current {
                continue;
            }
            if let Err(error) = handle.join() {
                tracing::error!(target: "task_queue", "worker thread panic: {error:?}");
            }
        }
        let abandoned = std::mem::take(&mut self.shared.lock().tasks);
        drop(abandoned);
    }

    fn insert_record(
        state: &mut QueueState,
        task: Arc<dyn BackgroundTask>,
        priority: TaskPriority,
    ) -> TaskId {
        let id = TaskId(state.next_id);
        state.next_id = state.next_id.checked_add(1).expect("task id overflow");
        state.tasks.insert(
            id,
            TaskRecord {
                task,
                priority,
                slot: TaskSlot::Running {
                    rerun_requested: false,
                },
            },
        );
        id
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(AtomicOrdering::Acquire) {
            return;
        }
        let next = {
            let mut state = shared.lock();
            let now = Instant::now();
            state.promote_due(now);
            match state.pop_ready() {
                Some(next) => Ok(next),
                None => Err(state.next_wake(now)),
            }
        };
        let (id, task) = match next {
            Ok(next) => next,
            Err(wait) => {
                match shared.notify_receiver.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
                continue;
            }
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(outcome) => Some(outcome),
            Err(panic) => {
                tracing::error!(
                    target: "task_queue",
                    task = task.label(),
                    "background task panicked: {panic:?}"
                );
                None
            }
        };
        let finished = {
            let mut state = shared.lock();
            match (state.tasks.get(&id).map(|record| record.slot), outcome) {
                // Removed by a shutdown that overlapped the run.
                (None, _) => None,
                (Some(TaskSlot::Running { rerun_requested: true }), Some(_)) => {
                    state.enqueue_ready(id);
                    None
                }
                (_, Some(TaskOutcome::RunAgainAfter(delay))) => {
                    state.enqueue_delayed(id, Instant::now() + delay);
                    None
                }
                (_, Some(TaskOutcome::Done) | None) => state.tasks.remove(&id),
            }
        };
        // Dropping the last reference to a task may drop the queue itself, so it must
        // happen without the state lock held.
        drop(finished);
        drop(task);
        if !shared.shutdown.load(AtomicOrdering::Acquire) {
            shared.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        label: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl BackgroundTask for Recorder {
        fn run(&self) -> TaskOutcome {
            self.log.lock().expect("log lock").push(self.label);
            TaskOutcome::Done
        }
    }

    struct Gate {
        started: Sender<()>,
        release: Receiver<()>,
    }

    impl BackgroundTask for Gate {
        fn run(&self) -> TaskOutcome {
            self.started.send(()).expect("gate started send");
            self.release.recv().expect("gate release recv");
            TaskOutcome::Done
        }
    }

    struct Repeating {
        runs: Arc<AtomicUsize>,
        limit: usize,
        delay: Duration,
    }

    impl BackgroundTask for Repeating {
        fn run(&self) -> TaskOutcome {
            let runs = self.runs.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if runs >= self.limit {
                TaskOutcome::Done
            } else {
                TaskOutcome::RunAgainAfter(self.delay)
            }
        }
    }

    struct Panicking;

    impl BackgroundTask for Panicking {
        fn run(&self) -> TaskOutcome {
            panic!("task failure for test");
        }
    }

    fn single_worker_queue() -> TaskQueue {
        TaskQueue::new(TaskQueueConfig {
            worker_count: 1,
            thread_name_prefix: "test-queue".to_owned(),
        })
        .expect("create task queue")
    }

    /// Occupies the only worker until the returned sender fires.
    fn block_worker(queue: &TaskQueue) -> Sender<()> {
        let (started_sender, started_receiver) = bounded(1);
        let (release_sender, release_receiver) = bounded(1);
        queue.add_task(
            Arc::new(Gate {
                started: started_sender,
                release: release_receiver,
            }),
            TaskPriority::HIGH,
        );
        started_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("gate task started");
        release_sender
    }

    fn recorder(label: u32, log: &Arc<Mutex<Vec<u32>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            label,
            log: log.clone(),
        })
    }

    #[test]
    fn rejects_zero_workers() {
        let error = TaskQueue::new(TaskQueueConfig {
            worker_count: 0,
            thread_name_prefix: "none".to_owned(),
        })
        .err()
        .expect("zero workers should fail");
        assert!(matches!(error, TaskQueueError::NoWorkers));
    }

    #[test]
    fn runs_higher_priority_first_and_fifo_within_priority() {
        let queue = single_worker_queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        let release = block_worker(&queue);

        queue.add_task(recorder(1, &log), TaskPriority::LOW);
        queue.add_task(recorder(2, &log), TaskPriority::NORMAL);
        queue.add_task(recorder(3, &log), TaskPriority::HIGH);
        queue.add_task(recorder(4, &log), TaskPriority::NORMAL);
        release.send(()).expect("release gate");

        assert!(queue.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(*log.lock().expect("log lock"), vec![3, 2, 4, 1]);
    }

    #[test]
    fn reschedule_and_remove_affect_queued_tasks() {
        let queue = single_worker_queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        let release = block_worker(&queue);

        let first = queue.add_task(recorder(1, &log), TaskPriority::NORMAL);
        let second = queue.add_task(recorder(2, &log), TaskPriority::NORMAL);
        let third = queue.add_task(recorder(3, &log), TaskPriority::NORMAL);
        assert!(queue.reschedule(third, TaskPriority::HIGH));
        assert!(queue.remove_task(second));
        assert!(!queue.remove_task(second));
        release.send(()).expect("release gate");

        assert!(queue.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(*log.lock().expect("log lock"), vec![3, 1]);
        assert!(!queue.contains(first));
        assert!(!queue.reschedule(first, TaskPriority::LOW));
    }

    #[test]
    fn delayed_task_runs_again_until_done() {
        let queue = single_worker_queue();
        let runs = Arc::new(AtomicUsize::new(0));
        queue.add_task(
            Arc::new(Repeating {
                runs: runs.clone(),
                limit: 3,
                delay: Duration::from_millis(5),
            }),
            TaskPriority::NORMAL,
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(AtomicOrdering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(queue.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(queue.pending_task_count(), 0);
    }

    #[test]
    fn run_now_wakes_a_delayed_task() {
        let queue = single_worker_queue();
        let runs = Arc::new(AtomicUsize::new(0));
        let id = queue.add_delayed_task(
            Arc::new(Repeating {
                runs: runs.clone(),
                limit: 1,
                delay: Duration::ZERO,
            }),
            TaskPriority::NORMAL,
            Duration::from_secs(3600),
        );
        assert!(queue.wait_until_idle(Duration::from_secs(1)));
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 0);
        assert!(queue.run_now(id));
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.contains(id) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let queue = single_worker_queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.add_task(Arc::new(Panicking), TaskPriority::HIGH);
        queue.add_task(recorder(7, &log), TaskPriority::LOW);
        assert!(queue.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(*log.lock().expect("log lock"), vec![7]);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let queue = single_worker_queue();
        queue.shutdown();
        queue.shutdown();
    }
}
