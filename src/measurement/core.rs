use crate::engine::core::{EngineCore, StreamEngine};
use crate::fence::{Remaining, WaitBudget};
use crate::logging::{self, LogLevel};
use crate::tag::{ChannelId, Tag, TagKind, Timestamp};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

pub type MeasurementId = u64;

/// Interval covered by one delivery, `[begin, end)`, plus the greatest fence
/// whose effect is fully visible within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub begin: Timestamp,
    pub end: Timestamp,
    pub fence: u32,
}

/// Error surfaced by a measurement callback.
///
/// `Aborted` is the cooperative unwind requested through `abort()`: the
/// dispatcher detaches the measurement cleanly. Anything else is fatal to
/// that measurement alone; it is detached and the failure surfaced while the
/// dispatcher continues serving the others.
#[derive(Debug, Error)]
pub enum NextError {
    #[error("measurement aborted")]
    Aborted,
    #[error("{0}")]
    Fatal(String),
}

impl From<std::io::Error> for NextError {
    fn from(err: std::io::Error) -> Self {
        NextError::Fatal(err.to_string())
    }
}

/// Working view of the block shared by every consumer during fan-out.
///
/// Producers append virtual tags through `emit`; the dispatcher re-sorts the
/// working set when a callback reports modification, so consumers attached
/// after the producer observe the emitted tags in time order.
pub struct TagBatch<'a> {
    tags: &'a mut Vec<Tag>,
    aborting: &'a AtomicBool,
    stop_requested: bool,
}

impl<'a> TagBatch<'a> {
    pub(crate) fn new(tags: &'a mut Vec<Tag>, aborting: &'a AtomicBool) -> Self {
        Self {
            tags,
            aborting,
            stop_requested: false,
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Index access so callbacks may emit while scanning.
    pub fn get(&self, index: usize) -> Tag {
        self.tags[index]
    }

    pub fn tags(&self) -> &[Tag] {
        self.tags
    }

    /// Appends a produced tag to the working set. The callback must report
    /// modification so the dispatcher restores time order.
    pub fn emit(&mut self, tag: Tag) {
        self.tags.push(tag);
    }

    /// Safe point for the cooperative abort protocol. Call once per scan
    /// iteration in long-running callbacks.
    pub fn check_abort(&self) -> Result<(), NextError> {
        if self.aborting.load(Ordering::Relaxed) {
            return Err(NextError::Aborted);
        }
        Ok(())
    }

    /// Asks the framework to stop this measurement once the callback
    /// returns, as if `stop()` had been called.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

/// Processing hooks of a concrete measurement. Every hook runs under the
/// measurement's exclusive lock on the dispatcher thread.
pub trait Measurement: Send + 'static {
    /// Consumes the working tag set for `[window.begin, window.end)`.
    /// Successive calls cover abutting intervals. Returns true when the
    /// working set was modified (virtual tags emitted).
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError>;

    fn on_start(&mut self) {}

    fn on_stop(&mut self) {}

    /// Resets accumulated results; registration is preserved.
    fn clear(&mut self) {}
}

/// Synchronized lifecycle operation applied between two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupOp {
    Start,
    Stop,
    Clear,
    StartFor {
        duration: Timestamp,
        clear_first: bool,
    },
}

pub(crate) enum SlotOutcome {
    Skipped,
    Delivered { modified: bool, tags_seen: usize },
    Detach(DetachReason),
}

pub(crate) enum DetachReason {
    Aborted,
    Failed(String),
}

/// Lifecycle summary for the engine configuration report.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub id: MeasurementId,
    pub label: &'static str,
    pub running: bool,
    pub capture_duration: Timestamp,
}

/// Dispatcher-facing face of an attached measurement.
pub(crate) trait DispatchSlot: Send + Sync {
    fn id(&self) -> MeasurementId;
    fn label(&self) -> &'static str;
    fn deliver(&self, tags: &mut Vec<Tag>, window: BlockWindow) -> SlotOutcome;
    fn finish_stream(&self);
    fn apply(&self, op: GroupOp);
    fn mark_detached(&self);
    fn status(&self) -> SlotStatus;
    fn is_running(&self) -> bool;
    fn wait_until_finished(&self, timeout_ms: i64) -> bool;
}

#[derive(Debug)]
struct Lifecycle {
    running: bool,
    capture_duration: Timestamp,
    max_capture_duration: Option<Timestamp>,
    min_fence: u32,
    last_fence: u32,
    registered: BTreeSet<ChannelId>,
    virtual_out: Vec<ChannelId>,
    failure: Option<String>,
}

struct CellState<M> {
    meas: M,
    life: Lifecycle,
}

/// Shared state of one attached measurement: the processing hooks, the
/// lifecycle, the per-instance lock, and the cooperative abort flag.
pub(crate) struct MeasurementCell<M> {
    id: MeasurementId,
    label: &'static str,
    aborting: AtomicBool,
    detached: AtomicBool,
    state: Mutex<CellState<M>>,
    cv: Condvar,
}

impl<M: Measurement> MeasurementCell<M> {
    pub(crate) fn new(
        id: MeasurementId,
        label: &'static str,
        meas: M,
        registered: BTreeSet<ChannelId>,
        virtual_out: Vec<ChannelId>,
    ) -> Self {
        Self {
            id,
            label,
            aborting: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            state: Mutex::new(CellState {
                meas,
                life: Lifecycle {
                    running: false,
                    capture_duration: 0,
                    max_capture_duration: None,
                    min_fence: u32::MAX,
                    last_fence: 0,
                    registered,
                    virtual_out,
                    failure: None,
                },
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn set_min_fence(&self, fence: u32) {
        let mut st = self.state.lock().unwrap();
        st.life.min_fence = fence;
        st.life.last_fence = fence.saturating_sub(1);
    }

    pub(crate) fn start(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.life.running {
            st.life.running = true;
            st.meas.on_start();
        }
    }

    pub(crate) fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        if st.life.running {
            st.life.running = false;
            st.meas.on_stop();
            self.cv.notify_all();
        }
    }

    pub(crate) fn clear(&self) {
        let mut st = self.state.lock().unwrap();
        st.meas.clear();
        st.life.capture_duration = 0;
    }

    pub(crate) fn start_for(&self, duration: Timestamp, clear_first: bool) {
        let mut st = self.state.lock().unwrap();
        if clear_first {
            st.meas.clear();
            st.life.capture_duration = 0;
        }
        st.life.max_capture_duration = Some(st.life.capture_duration + duration);
        if !st.life.running {
            st.life.running = true;
            st.meas.on_start();
        }
    }

    pub(crate) fn wait_until_finished(&self, timeout_ms: i64) -> bool {
        let budget = WaitBudget::new(timeout_ms);
        let mut st = self.state.lock().unwrap();
        loop {
            if !st.life.running {
                return true;
            }
            if st.life.max_capture_duration.is_none() {
                logging::log(
                    LogLevel::Warning,
                    "wait_until_finished called on an indefinitely running measurement",
                );
                return false;
            }
            match budget.remaining() {
                Remaining::Expired => return false,
                Remaining::Unbounded => st = self.cv.wait(st).unwrap(),
                Remaining::Bounded(duration) => {
                    let (next, _) = self.cv.wait_timeout(st, duration).unwrap();
                    st = next;
                }
            }
        }
    }

    pub(crate) fn abort(&self) {
        self.aborting.store(true, Ordering::Relaxed);
    }

    pub(crate) fn capture_duration(&self) -> Timestamp {
        self.state.lock().unwrap().life.capture_duration
    }

    pub(crate) fn failure(&self) -> Option<String> {
        self.state.lock().unwrap().life.failure.clone()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        let st = self.state.lock().unwrap();
        f(&st.meas)
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        f(&mut st.meas)
    }

    pub(crate) fn registered_channels(&self) -> BTreeSet<ChannelId> {
        self.state.lock().unwrap().life.registered.clone()
    }

    pub(crate) fn virtual_channels(&self) -> Vec<ChannelId> {
        self.state.lock().unwrap().life.virtual_out.clone()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Blocks until the dispatcher acknowledged the detach. Falls back to a
    /// bounded poll so a vanished dispatcher cannot wedge a destructor.
    pub(crate) fn await_detached(&self, engine: &EngineCore) {
        let mut st = self.state.lock().unwrap();
        while !self.is_detached() {
            if !engine.dispatcher_alive() {
                return;
            }
            let (next, _) = self
                .cv
                .wait_timeout(st, std::time::Duration::from_millis(10))
                .unwrap();
            st = next;
        }
    }

    fn relevant_tags(life: &Lifecycle, tags: &[Tag]) -> usize {
        tags.iter()
            .filter(|t| match t.kind {
                TagKind::TimeTag | TagKind::MissedEvents => life.registered.contains(&t.channel),
                _ => true,
            })
            .count()
    }
}

impl<M: Measurement> DispatchSlot for MeasurementCell<M> {
    fn id(&self) -> MeasurementId {
        self.id
    }

    fn label(&self) -> &'static str {
        self.label
    }

    fn deliver(&self, tags: &mut Vec<Tag>, window: BlockWindow) -> SlotOutcome {
        if self.is_detached() {
            return SlotOutcome::Skipped;
        }
        let mut st = self.state.lock().unwrap();
        if window.fence < st.life.min_fence {
            return SlotOutcome::Skipped;
        }
        if !st.life.running {
            st.life.last_fence = st.life.last_fence.max(window.fence);
            return SlotOutcome::Skipped;
        }
        let fence_crossed = window.fence > st.life.last_fence;
        st.life.last_fence = window.fence;
        if window.end == window.begin && !fence_crossed {
            return SlotOutcome::Skipped;
        }
        // Framework-level safe point: an abort lands at the next block even
        // if the callback has no tags to scan.
        if self.aborting.load(Ordering::Relaxed) {
            st.meas.clear();
            st.life.capture_duration = 0;
            st.life.running = false;
            self.cv.notify_all();
            return SlotOutcome::Detach(DetachReason::Aborted);
        }

        let tags_seen = Self::relevant_tags(&st.life, tags);
        let mut modified = false;
        let mut stop_after = false;
        {
            let mut batch = TagBatch::new(tags, &self.aborting);
            match st.meas.next(&mut batch, window) {
                Ok(changed) => {
                    modified = changed;
                    stop_after = batch.stop_requested();
                }
                Err(NextError::Aborted) => {
                    st.meas.clear();
                    st.life.capture_duration = 0;
                    st.life.running = false;
                    self.cv.notify_all();
                    return SlotOutcome::Detach(DetachReason::Aborted);
                }
                Err(NextError::Fatal(message)) => {
                    st.life.failure = Some(message.clone());
                    st.life.running = false;
                    self.cv.notify_all();
                    return SlotOutcome::Detach(DetachReason::Failed(message));
                }
            }
        }

        let span = window.end - window.begin;
        if span > 0 {
            match st.life.max_capture_duration {
                Some(max) => {
                    let remaining = max - st.life.capture_duration;
                    if span >= remaining {
                        st.life.capture_duration = max;
                        st.life.max_capture_duration = None;
                        if st.life.running {
                            st.life.running = false;
                            st.meas.on_stop();
                        }
                        self.cv.notify_all();
                    } else {
                        st.life.capture_duration += span;
                    }
                }
                None => st.life.capture_duration += span,
            }
        }
        if stop_after && st.life.running {
            st.life.running = false;
            st.meas.on_stop();
            self.cv.notify_all();
        }
        SlotOutcome::Delivered {
            modified,
            tags_seen,
        }
    }

    fn finish_stream(&self) {
        self.stop();
    }

    fn apply(&self, op: GroupOp) {
        match op {
            GroupOp::Start => self.start(),
            GroupOp::Stop => self.stop(),
            GroupOp::Clear => self.clear(),
            GroupOp::StartFor {
                duration,
                clear_first,
            } => self.start_for(duration, clear_first),
        }
    }

    fn mark_detached(&self) {
        let _guard = self.state.lock().unwrap();
        self.detached.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    fn status(&self) -> SlotStatus {
        let st = self.state.lock().unwrap();
        SlotStatus {
            id: self.id,
            label: self.label,
            running: st.life.running,
            capture_duration: st.life.capture_duration,
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().life.running
    }

    fn wait_until_finished(&self, timeout_ms: i64) -> bool {
        MeasurementCell::wait_until_finished(self, timeout_ms)
    }
}

/// Registration request for a new measurement.
pub(crate) struct AttachSpec {
    pub label: &'static str,
    pub registered: BTreeSet<ChannelId>,
    pub virtual_out: Vec<ChannelId>,
}

/// Client-side handle of an attached measurement. Dropping the handle
/// detaches the measurement synchronously: the destructor waits for the
/// current delivery on this measurement to finish and refuses re-entry.
pub struct MeasurementHandle<M: Measurement> {
    cell: Arc<MeasurementCell<M>>,
    engine: Arc<EngineCore>,
}

impl<M: Measurement> MeasurementHandle<M> {
    /// Starts or continues data acquisition.
    pub fn start(&self) {
        self.cell.start();
    }

    /// Stops processing; `start` resumes it.
    pub fn stop(&self) {
        self.cell.stop();
    }

    /// Discards accumulated results while keeping the registration and the
    /// running state.
    pub fn clear(&self) {
        self.cell.clear();
    }

    /// Starts (optionally clearing first) and stops automatically once
    /// `duration` picoseconds of stream time have been captured.
    pub fn start_for(&self, duration: Timestamp, clear_first: bool) {
        self.cell.start_for(duration, clear_first);
    }

    /// Blocks until a `start_for` deadline has been reached. Negative
    /// timeout waits indefinitely, zero polls, positive bounds the wait in
    /// milliseconds; returns false on timeout.
    pub fn wait_until_finished(&self, timeout_ms: i64) -> bool {
        self.cell.wait_until_finished(timeout_ms)
    }

    pub fn is_running(&self) -> bool {
        DispatchSlot::is_running(self.cell.as_ref())
    }

    /// Stream time captured since creation or the last `clear`.
    pub fn capture_duration(&self) -> Timestamp {
        self.cell.capture_duration()
    }

    /// Requests a cooperative abort; the callback unwinds at its next safe
    /// point and the measurement is detached.
    pub fn abort(&self) {
        self.cell.abort();
    }

    /// Failure message of a fatally detached measurement, if any.
    pub fn failure(&self) -> Option<String> {
        self.cell.failure()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        self.cell.with(f)
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        self.cell.with_mut(f)
    }

    pub(crate) fn slot(&self) -> Arc<dyn DispatchSlot> {
        self.cell.clone()
    }
}

impl<M: Measurement> Drop for MeasurementHandle<M> {
    fn drop(&mut self) {
        self.engine.request_detach(self.cell.id());
        self.cell.await_detached(&self.engine);
        release_registration(&self.engine, self.cell.as_ref());
    }
}

fn release_registration<M: Measurement>(engine: &EngineCore, cell: &MeasurementCell<M>) {
    let mut reconfigure = false;
    for channel in cell.registered_channels() {
        if engine.registry().unregister(channel) {
            reconfigure = true;
        }
    }
    if reconfigure {
        engine.reconfigure_source();
    }
    for channel in cell.virtual_channels() {
        engine.allocator().release(channel);
    }
    engine.forget_slot(cell.id());
}

/// Attaches a user-defined measurement watching the given channels. The
/// measurement starts immediately; its hooks run on the dispatcher thread
/// under the measurement's lock, like those of the built-in measurements.
pub fn attach_custom<M: Measurement>(
    engine: &StreamEngine,
    meas: M,
    channels: BTreeSet<ChannelId>,
) -> MeasurementHandle<M> {
    attach_measurement(
        engine,
        meas,
        AttachSpec {
            label: "CustomMeasurement",
            registered: channels,
            virtual_out: Vec::new(),
        },
    )
}

/// Validates, registers, and attaches a measurement, returning its handle.
/// The measurement starts immediately and ignores in-flight blocks that
/// predate its registration fence.
pub(crate) fn attach_measurement<M: Measurement>(
    engine: &StreamEngine,
    meas: M,
    spec: AttachSpec,
) -> MeasurementHandle<M> {
    let core = engine.core().clone();
    let id = core.allocate_id();
    let cell = Arc::new(MeasurementCell::new(
        id,
        spec.label,
        meas,
        spec.registered.clone(),
        spec.virtual_out,
    ));

    let mut reconfigure = false;
    for channel in &spec.registered {
        if core.registry().register(*channel) {
            reconfigure = true;
        }
    }
    if reconfigure {
        core.reconfigure_source();
    }

    let fence = core.fences().request();
    cell.set_min_fence(fence);
    core.index_slot(cell.clone());
    core.request_attach(cell.clone());
    core.source().inject_config_fence(fence);
    cell.start();
    MeasurementHandle { cell, engine: core }
}
