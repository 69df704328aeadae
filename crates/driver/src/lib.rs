//! Pointer input to live stroke splines.
//!
//! [`StrokeSplineDriver`] feeds pointer samples of one stroke through the incremental
//! spline builder and describes every change as a [`SplineUpdate`]. [`DriverEngine`] routes
//! pointer events to it and hands the updates to the render side in frame batches.

pub mod stroke_spline;

use spline::{BezierNode, BezierSpline, Rect};

pub use stroke_spline::{FinishedStroke, StrokeSplineDriver, StrokeSplineDriverConfig};

pub type StrokeSessionId = u64;
pub type EventTimestampMicros = u64;
pub type FrameSequenceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerDeviceKind {
    Mouse,
    Pen,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEventPhase {
    Hover,
    Down,
    Move,
    Up,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPointerInput {
    pub pointer_id: u64,
    pub device_kind: PointerDeviceKind,
    pub phase: PointerEventPhase,
    pub timestamp_micros: EventTimestampMicros,
    pub screen_x: f32,
    pub screen_y: f32,
    pub pressure: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrokeContext {
    pub stroke_session_id: StrokeSessionId,
    pub pointer_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDispatchSignal {
    pub frame_sequence_id: FrameSequenceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("invalid stroke config: {0}")]
    InvalidConfig(&'static str),
    #[error("pointer input has non-finite coordinates or pressure")]
    InvalidInput,
    #[error("pointer timestamp went backwards")]
    NonMonotonicTimestamp,
    #[error("no active stroke")]
    NoActiveStroke,
    #[error("a stroke is already active")]
    StrokeAlreadyActive,
    #[error("pointer id does not match the active stroke")]
    PointerIdMismatch,
    #[error("spline update queue needs a non-zero capacity")]
    ZeroQueueCapacity,
    #[error("spline update queue is full")]
    QueueFull,
}

/// Change of a stroke spline since the previous update of the same stroke.
///
/// Nodes before `first_node_index` are unchanged; `tail_nodes` replaces everything from
/// there on. Nodes below `stable_node_count` will never change again.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineUpdate {
    pub stroke_session_id: StrokeSessionId,
    pub pointer_id: u64,
    pub first_node_index: usize,
    pub tail_nodes: Vec<BezierNode>,
    pub stable_node_count: usize,
    pub node_count: usize,
    pub bounds: Rect,
    pub stable_bounds: Rect,
    pub starts_stroke: bool,
    pub ends_stroke: bool,
    /// Updates of another stroke were dropped before this one.
    pub discontinuity_before: bool,
    pub dropped_update_count_before: u16,
}

impl SplineUpdate {
    pub fn apply_to(&self, nodes: &mut Vec<BezierNode>) {
        nodes.truncate(self.first_node_index);
        nodes.extend_from_slice(&self.tail_nodes);
    }

    /// Folds an older queued update into this one. Updates of the same stroke merge without
    /// loss; an update of another stroke is counted as dropped.
    pub fn absorb_previous(&mut self, previous: SplineUpdate) {
        let dropped_before = self
            .dropped_update_count_before
            .saturating_add(previous.dropped_update_count_before);
        if previous.stroke_session_id != self.stroke_session_id {
            self.discontinuity_before = true;
            self.dropped_update_count_before = dropped_before.saturating_add(1);
            return;
        }
        let kept = self
            .first_node_index
            .saturating_sub(previous.first_node_index)
            .min(previous.tail_nodes.len());
        let mut tail_nodes = previous.tail_nodes;
        tail_nodes.truncate(kept);
        tail_nodes.append(&mut self.tail_nodes);
        self.tail_nodes = tail_nodes;
        self.first_node_index = previous.first_node_index.min(self.first_node_index);
        self.starts_stroke |= previous.starts_stroke;
        self.discontinuity_before |= previous.discontinuity_before;
        self.dropped_update_count_before = dropped_before;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FramedSplineUpdate {
    pub frame_sequence_id: FrameSequenceId,
    pub update: SplineUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedStroke {
    pub stroke_session_id: StrokeSessionId,
    pub spline: BezierSpline,
}

pub trait SplineUpdateSink {
    fn push_update(&mut self, update: SplineUpdate) -> Result<(), DriverError>;
}

#[derive(Debug)]
pub struct SplineUpdateSender {
    producer: rtrb::Producer<SplineUpdate>,
}

#[derive(Debug)]
pub struct SplineUpdateReceiver {
    consumer: rtrb::Consumer<SplineUpdate>,
}

/// Single-owner queue that never rejects a push: when full, queued updates are folded
/// into the new one.
#[derive(Debug)]
pub struct SplineUpdateRealtimeQueue {
    producer: rtrb::Producer<SplineUpdate>,
    consumer: rtrb::Consumer<SplineUpdate>,
}

pub fn create_spline_update_ring_buffer(
    capacity: usize,
) -> Result<(SplineUpdateSender, SplineUpdateReceiver), DriverError> {
    if capacity == 0 {
        return Err(DriverError::ZeroQueueCapacity);
    }
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    Ok((SplineUpdateSender { producer }, SplineUpdateReceiver { consumer }))
}

pub fn create_spline_update_realtime_queue(
    capacity: usize,
) -> Result<SplineUpdateRealtimeQueue, DriverError> {
    if capacity == 0 {
        return Err(DriverError::ZeroQueueCapacity);
    }
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    Ok(SplineUpdateRealtimeQueue { producer, consumer })
}

impl SplineUpdateSink for SplineUpdateSender {
    fn push_update(&mut self, update: SplineUpdate) -> Result<(), DriverError> {
        self.producer
            .push(update)
            .map_err(|_| DriverError::QueueFull)
    }
}

impl SplineUpdateReceiver {
    pub fn pop_update(&mut self) -> Option<SplineUpdate> {
        self.consumer.pop().ok()
    }
}

impl SplineUpdateRealtimeQueue {
    pub fn pop_update(&mut self) -> Option<SplineUpdate> {
        self.consumer.pop().ok()
    }

    pub fn len(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }
}

impl SplineUpdateSink for SplineUpdateRealtimeQueue {
    fn push_update(&mut self, update: SplineUpdate) -> Result<(), DriverError> {
        let pending = match self.producer.push(update) {
            Ok(()) => return Ok(()),
            Err(rtrb::PushError::Full(returned)) => returned,
        };
        // Fold the queue oldest-first so each update absorbs its direct predecessor.
        let mut folded: Option<SplineUpdate> = None;
        while let Ok(mut queued) = self.consumer.pop() {
            if let Some(older) = folded.take() {
                queued.absorb_previous(older);
            }
            folded = Some(queued);
        }
        let mut pending = pending;
        if let Some(older) = folded {
            pending.absorb_previous(older);
        }
        self.producer
            .push(pending)
            .map_err(|_| DriverError::QueueFull)
    }
}

/// Owns the active stroke and turns pointer events into queued spline updates.
#[derive(Debug)]
pub struct DriverEngine {
    queue: SplineUpdateRealtimeQueue,
    config: StrokeSplineDriverConfig,
    driver: StrokeSplineDriver,
    next_stroke_session_id: StrokeSessionId,
    completed_strokes: Vec<CompletedStroke>,
}

impl DriverEngine {
    pub fn new(
        queue_capacity: usize,
        config: StrokeSplineDriverConfig,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            queue: create_spline_update_realtime_queue(queue_capacity)?,
            config,
            driver: StrokeSplineDriver::new(),
            next_stroke_session_id: 1,
            completed_strokes: Vec::new(),
        })
    }

    pub fn config(&self) -> &StrokeSplineDriverConfig {
        &self.config
    }

    /// Applies to strokes started after the call.
    pub fn set_config(&mut self, config: StrokeSplineDriverConfig) {
        self.config = config;
    }

    pub fn active_stroke(&self) -> Option<StrokeContext> {
        self.driver.stroke_context()
    }

    pub fn handle_pointer_event(&mut self, input: RawPointerInput) -> Result<(), DriverError> {
        match input.phase {
            PointerEventPhase::Down => self.handle_pointer_down(input),
            PointerEventPhase::Move => self.handle_pointer_move(input),
            PointerEventPhase::Up => self.handle_pointer_up(input, true),
            PointerEventPhase::Cancel => self.handle_pointer_up(input, false),
            PointerEventPhase::Hover => Ok(()),
        }
    }

    pub fn dispatch_frame(&mut self, signal: FrameDispatchSignal) -> Vec<FramedSplineUpdate> {
        let mut output = Vec::new();
        while let Some(update) = self.queue.pop_update() {
            output.push(FramedSplineUpdate {
                frame_sequence_id: signal.frame_sequence_id,
                update,
            });
        }
        output
    }

    pub fn take_completed_strokes(&mut self) -> Vec<CompletedStroke> {
        std::mem::take(&mut self.completed_strokes)
    }

    fn handle_pointer_down(&mut self, input: RawPointerInput) -> Result<(), DriverError> {
        if self.driver.stroke_context().is_some() {
            return Err(DriverError::StrokeAlreadyActive);
        }
        let context = StrokeContext {
            stroke_session_id: self.next_stroke_session_id,
            pointer_id: input.pointer_id,
        };
        self.driver.begin_stroke(context, &self.config)?;
        self.next_stroke_session_id = self
            .next_stroke_session_id
            .checked_add(1)
            .expect("stroke session id overflow");
        self.feed(input)
    }

    fn handle_pointer_move(&mut self, input: RawPointerInput) -> Result<(), DriverError> {
        self.check_pointer(input)?;
        self.feed(input)
    }

    fn handle_pointer_up(
        &mut self,
        input: RawPointerInput,
        feed_last: bool,
    ) -> Result<(), DriverError> {
        self.check_pointer(input)?;
        if feed_last {
            self.feed(input)?;
        }
        let finished = self.driver.end_stroke()?;
        self.completed_strokes.push(CompletedStroke {
            stroke_session_id: finished.final_update.stroke_session_id,
            spline: finished.spline,
        });
        self.queue.push_update(finished.final_update)
    }

    fn check_pointer(&self, input: RawPointerInput) -> Result<(), DriverError> {
        let context = self
            .driver
            .stroke_context()
            .ok_or(DriverError::NoActiveStroke)?;
        if context.pointer_id != input.pointer_id {
            return Err(DriverError::PointerIdMismatch);
        }
        Ok(())
    }

    fn feed(&mut self, input: RawPointerInput) -> Result<(), DriverError> {
        let update = self.driver.feed_input(input)?;
        self.queue.push_update(update)
    }
}
