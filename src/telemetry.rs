use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Per-measurement dispatch accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementTelemetry {
    pub id: u64,
    pub label: &'static str,
    /// Registered-channel tags this measurement has seen.
    pub tags_processed: u64,
    /// Blocks delivered to the measurement callback.
    pub blocks_delivered: u64,
    /// Cumulative time spent inside the callback.
    pub busy: Duration,
}

/// Collects per-measurement counters on the dispatcher thread.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    entries: Mutex<BTreeMap<u64, MeasurementTelemetry>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, id: u64, label: &'static str, tags: usize, busy: Duration) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(id).or_insert(MeasurementTelemetry {
            id,
            label,
            tags_processed: 0,
            blocks_delivered: 0,
            busy: Duration::ZERO,
        });
        entry.tags_processed += tags as u64;
        entry.blocks_delivered += 1;
        entry.busy += busy;
    }

    pub(crate) fn forget(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    pub fn snapshot(&self) -> Vec<MeasurementTelemetry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}
