use crate::engine::core::{EngineCore, StreamEngine};
use crate::fence::{Remaining, WaitBudget};
use crate::measurement::core::{DispatchSlot, GroupOp, Measurement, MeasurementHandle};
use crate::tag::Timestamp;
use std::sync::{Arc, Mutex};

/// Applies start/stop/clear/start_for across a set of measurements at a
/// single block boundary, so every member has processed the very same tags
/// when the operation lands.
pub struct SynchronizedMeasurements {
    core: Arc<EngineCore>,
    members: Mutex<Vec<Arc<dyn DispatchSlot>>>,
}

impl SynchronizedMeasurements {
    pub fn new(engine: &StreamEngine) -> Self {
        Self {
            core: engine.core().clone(),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Adds a measurement to the group. Further group operations include it.
    pub fn register<M: Measurement>(&self, measurement: &MeasurementHandle<M>) {
        let slot = measurement.slot();
        let mut members = self.members.lock().unwrap();
        if members.iter().all(|m| m.id() != slot.id()) {
            members.push(slot);
        }
    }

    /// Removes a measurement from the group; unknown members are ignored.
    pub fn unregister<M: Measurement>(&self, measurement: &MeasurementHandle<M>) {
        let id = measurement.slot().id();
        self.members.lock().unwrap().retain(|m| m.id() != id);
    }

    pub fn start(&self) {
        self.apply(GroupOp::Start);
    }

    pub fn stop(&self) {
        self.apply(GroupOp::Stop);
    }

    pub fn clear(&self) {
        self.apply(GroupOp::Clear);
    }

    pub fn start_for(&self, duration: Timestamp, clear_first: bool) {
        self.apply(GroupOp::StartFor {
            duration,
            clear_first,
        });
    }

    /// Waits until every member has reached its `start_for` deadline.
    pub fn wait_until_finished(&self, timeout_ms: i64) -> bool {
        let budget = WaitBudget::new(timeout_ms);
        let members = self.members.lock().unwrap().clone();
        for member in members {
            let slice = match budget.remaining() {
                Remaining::Unbounded => -1,
                Remaining::Bounded(duration) => duration.as_millis() as i64,
                Remaining::Expired => 0,
            };
            if !member.wait_until_finished(slice) {
                return false;
            }
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.members
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.is_running())
    }

    fn apply(&self, op: GroupOp) {
        let ids = {
            let members = self.members.lock().unwrap();
            members.iter().map(|m| m.id()).collect::<Vec<_>>()
        };
        if ids.is_empty() {
            return;
        }
        self.core.push_synchronized(ids, op);
        // The fence forces a prompt block boundary at which the queued
        // operation is applied to every member at once.
        self.core.publish_fence();
    }
}
