use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};

/// Cooperative ordering primitive for pipelined measurements.
///
/// `queue` hands out tickets with monotonically increasing instances. Work
/// under a ticket may run concurrently with work under later tickets;
/// `sync` blocks until the ticket's turn and then advances the cursor,
/// releasing the next ticket. Ordering of externally visible effects is
/// preserved by placing them after `sync`.
#[derive(Clone, Default)]
pub struct OrderedBarrier {
    inner: Arc<BarrierInner>,
}

#[derive(Default)]
struct BarrierInner {
    state: Mutex<BarrierState>,
    cv: Condvar,
}

#[derive(Default)]
struct BarrierState {
    accumulator: u64,
    current: u64,
    released: BTreeSet<u64>,
}

/// A position in the barrier's order.
pub struct OrderTicket {
    inner: Arc<BarrierInner>,
    instance: u64,
    consumed: bool,
}

impl OrderedBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next position in the order.
    pub fn queue(&self) -> OrderTicket {
        let mut state = self.inner.state.lock().unwrap();
        let instance = state.accumulator;
        state.accumulator += 1;
        OrderTicket {
            inner: self.inner.clone(),
            instance,
            consumed: false,
        }
    }

    /// Blocks until every queued ticket has synced or been released.
    pub fn wait_until_finished(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.current < state.accumulator {
            state = self.inner.cv.wait(state).unwrap();
        }
    }
}

impl OrderTicket {
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Waits for this ticket's turn, then advances the order.
    pub fn sync(mut self) {
        self.consumed = true;
        let mut state = self.inner.state.lock().unwrap();
        while state.current != self.instance {
            state = self.inner.cv.wait(state).unwrap();
        }
        advance(&mut state);
        self.inner.cv.notify_all();
    }

    /// Gives up this ticket's turn without waiting; used when the ordered
    /// work turned out to be discardable.
    pub fn release(mut self) {
        self.consumed = true;
        release_instance(&self.inner, self.instance);
    }
}

impl Drop for OrderTicket {
    fn drop(&mut self) {
        if !self.consumed {
            release_instance(&self.inner, self.instance);
        }
    }
}

fn release_instance(inner: &BarrierInner, instance: u64) {
    let mut state = inner.state.lock().unwrap();
    if state.current == instance {
        advance(&mut state);
        inner.cv.notify_all();
    } else {
        state.released.insert(instance);
    }
}

fn advance(state: &mut BarrierState) {
    state.current += 1;
    while state.released.remove(&state.current) {
        state.current += 1;
    }
}

/// Chain of ordered stages a measurement threads its offloaded work
/// through. The measurement queues a ticket per stage while holding its own
/// lock, drops the lock, and syncs the tickets as its results become
/// externally visible.
#[derive(Default)]
pub struct OrderedPipeline {
    stages: Mutex<Vec<OrderedBarrier>>,
}

impl OrderedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Barrier of the given stage, created on first use.
    pub fn stage(&self, index: usize) -> OrderedBarrier {
        let mut stages = self.stages.lock().unwrap();
        while stages.len() <= index {
            stages.push(OrderedBarrier::new());
        }
        stages[index].clone()
    }

    /// Drains every stage in order.
    pub fn wait_until_finished(&self) {
        let stages = self.stages.lock().unwrap().clone();
        for stage in stages {
            stage.wait_until_finished();
        }
    }
}
