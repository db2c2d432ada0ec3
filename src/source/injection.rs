use crate::source::assembler::{BlockAssembler, BlockPolicy};
use crate::source::core::{Pull, Source, SourceError};
use crate::tag::{ChannelId, Tag, Timestamp};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Software-driven source: the producer role is played by whichever thread
/// calls `inject`. Deterministic test benches and in-process generators push
/// tags here and synchronize with the pipeline through fences.
#[derive(Clone)]
pub struct InjectionSource {
    shared: Arc<InjectShared>,
}

struct InjectShared {
    state: Mutex<InjectState>,
    cv: Condvar,
}

struct InjectState {
    assembler: BlockAssembler,
    ready: VecDeque<crate::tag::TagBlock>,
    closed: bool,
    transported: BTreeSet<ChannelId>,
}

impl InjectionSource {
    pub fn new(policy: BlockPolicy) -> Self {
        Self {
            shared: Arc::new(InjectShared {
                state: Mutex::new(InjectState {
                    assembler: BlockAssembler::new(policy),
                    ready: VecDeque::new(),
                    closed: false,
                    transported: BTreeSet::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Appends time-ordered tags to the stream. Tags must not precede the
    /// current stream cursor.
    pub fn inject(&self, tags: &[Tag]) -> Result<(), SourceError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(SourceError::Closed);
        }
        let mut produced = false;
        for tag in tags {
            if let Some(block) = state.assembler.push(*tag)? {
                state.ready.push_back(block);
                produced = true;
            }
        }
        if produced {
            self.shared.cv.notify_all();
        }
        Ok(())
    }

    /// Moves stream time forward to `to`, flushing the pending block. An
    /// empty block still advances fences and capture deadlines.
    pub fn advance(&self, to: Timestamp) -> Result<(), SourceError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(SourceError::Closed);
        }
        if let Some(block) = state.assembler.flush_at(to)? {
            state.ready.push_back(block);
            self.shared.cv.notify_all();
        }
        Ok(())
    }

    /// Cuts the pending block without advancing past its last tag.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(block) = state.assembler.flush() {
            state.ready.push_back(block);
            self.shared.cv.notify_all();
        }
    }

    /// Flushes and transitions to end of stream.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.closed {
            if let Some(block) = state.assembler.flush() {
                state.ready.push_back(block);
            }
            state.closed = true;
            self.shared.cv.notify_all();
        }
    }

    /// Channels the engine currently asks this source to transport.
    pub fn transported_channels(&self) -> BTreeSet<ChannelId> {
        self.shared.state.lock().unwrap().transported.clone()
    }
}

impl Source for InjectionSource {
    fn pull(&self, timeout: Duration) -> Pull {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(block) = state.ready.pop_front() {
                return Pull::Block(block);
            }
            if state.closed {
                return Pull::EndOfStream;
            }
            if state.assembler.stale() {
                if let Some(block) = state.assembler.flush() {
                    return Pull::Block(block);
                }
            }
            let (next, wait) = self.shared.cv.wait_timeout(state, timeout).unwrap();
            state = next;
            if wait.timed_out() {
                if state.assembler.stale() {
                    if let Some(block) = state.assembler.flush() {
                        return Pull::Block(block);
                    }
                }
                return Pull::Idle;
            }
        }
    }

    fn configure_channels(&self, channels: &BTreeSet<ChannelId>) {
        self.shared.state.lock().unwrap().transported = channels.clone();
    }

    fn inject_config_fence(&self, fence: u32) {
        let mut state = self.shared.state.lock().unwrap();
        for block in state.assembler.fence_flush(fence) {
            state.ready.push_back(block);
        }
        self.shared.cv.notify_all();
    }

    fn request_stop(&self) {
        self.close();
    }
}
