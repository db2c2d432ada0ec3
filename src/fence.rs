use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Monotone configuration barrier shared by source, dispatcher, and clients.
///
/// `request` publishes a new fence at the earliest source stage; the
/// dispatcher reports progress through `observe`. When `wait(f)` returns
/// true, every configuration change that preceded the matching `request` is
/// active and every tag delivered before the fence has been processed by
/// every consumer.
#[derive(Debug, Default)]
pub struct FenceTracker {
    state: Mutex<FenceState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct FenceState {
    requested: u32,
    observed: u32,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next fence id.
    pub fn request(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.requested += 1;
        state.requested
    }

    /// The greatest fence requested so far; sources stamp blocks with it.
    pub fn latest(&self) -> u32 {
        self.state.lock().unwrap().requested
    }

    /// Records that the dispatcher delivered a block carrying `fence`.
    pub fn observe(&self, fence: u32) {
        let mut state = self.state.lock().unwrap();
        if fence > state.observed {
            state.observed = fence;
            self.cv.notify_all();
        }
    }

    pub fn observed(&self) -> u32 {
        self.state.lock().unwrap().observed
    }

    /// Blocks until a block with `fence_id >= fence` has been dispatched.
    ///
    /// A negative timeout waits indefinitely, zero polls, positive values
    /// bound the wait in milliseconds. Returns false on timeout.
    pub fn wait(&self, fence: u32, timeout_ms: i64) -> bool {
        let budget = WaitBudget::new(timeout_ms);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.observed >= fence {
                return true;
            }
            match budget.remaining() {
                Remaining::Expired => return false,
                Remaining::Unbounded => {
                    state = self.cv.wait(state).unwrap();
                }
                Remaining::Bounded(duration) => {
                    let (next, _) = self.cv.wait_timeout(state, duration).unwrap();
                    state = next;
                }
            }
        }
    }
}

/// Shared timeout convention of the blocking calls: negative = infinite,
/// zero = poll, positive = millisecond bound.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitBudget {
    deadline: Option<Instant>,
    unbounded: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Remaining {
    Unbounded,
    Bounded(Duration),
    Expired,
}

impl WaitBudget {
    pub(crate) fn new(timeout_ms: i64) -> Self {
        if timeout_ms < 0 {
            Self {
                deadline: None,
                unbounded: true,
            }
        } else {
            Self {
                deadline: Some(Instant::now() + Duration::from_millis(timeout_ms as u64)),
                unbounded: false,
            }
        }
    }

    pub(crate) fn remaining(&self) -> Remaining {
        if self.unbounded {
            return Remaining::Unbounded;
        }
        let deadline = self.deadline.expect("bounded budget carries a deadline");
        let now = Instant::now();
        if now >= deadline {
            Remaining::Expired
        } else {
            Remaining::Bounded(deadline - now)
        }
    }
}
