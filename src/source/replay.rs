use crate::fileio::codec::CodecError;
use crate::fileio::reader::FileReader;
use crate::logging::{self, LogLevel};
use crate::source::core::{Pull, Source};
use crate::tag::{TagBlock, Timestamp};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Replays a recorded stream with its original block boundaries.
///
/// A speed factor of 1.0 paces the replay against wall time; any factor
/// at or below zero replays as fast as possible (the default).
pub struct ReplaySource {
    state: Mutex<ReplayState>,
    started: AtomicBool,
    stopped: AtomicBool,
}

struct ReplayState {
    reader: FileReader,
    speed: f64,
    pending_fences: VecDeque<u32>,
    current_fence: u32,
    cursor: Timestamp,
    pace: Option<Pace>,
}

struct Pace {
    started_at: Instant,
    stream_origin: Timestamp,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        Self::open_many(vec![path.as_ref().to_path_buf()])
    }

    pub fn open_many(paths: Vec<PathBuf>) -> Result<Self, CodecError> {
        Ok(Self {
            state: Mutex::new(ReplayState {
                reader: FileReader::open_many(paths)?,
                speed: -1.0,
                pending_fences: VecDeque::new(),
                current_fence: 0,
                cursor: 0,
                pace: None,
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Releases the replay. Blocks are held back until this is called so
    /// measurements can be attached before the first tag flows.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Sets the ratio of replay speed to real time.
    pub fn set_replay_speed(&self, speed: f64) {
        let mut state = self.state.lock().unwrap();
        state.speed = speed;
        state.pace = None;
    }

    pub fn replay_speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }
}

impl Source for ReplaySource {
    fn pull(&self, timeout: Duration) -> Pull {
        if self.stopped.load(Ordering::Acquire) {
            return Pull::EndOfStream;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(fence) = state.pending_fences.pop_front() {
            state.current_fence = fence;
            return Pull::Block(TagBlock::keep_alive(state.cursor, fence));
        }
        if !self.started.load(Ordering::Acquire) {
            drop(state);
            std::thread::sleep(timeout);
            return Pull::Idle;
        }
        let block = match state.reader.read_block() {
            Ok(Some(block)) => block,
            Ok(None) => return Pull::EndOfStream,
            Err(err) => {
                logging::log(LogLevel::Error, &format!("replay failed: {err}"));
                return Pull::EndOfStream;
            }
        };
        state.cursor = block.end;
        let fence = state.current_fence;

        let sleep = if state.speed > 0.0 {
            let pace = state.pace.get_or_insert(Pace {
                started_at: Instant::now(),
                stream_origin: block.begin,
            });
            let stream_elapsed = (block.end - pace.stream_origin).max(0) as f64;
            let wall_target =
                pace.started_at + Duration::from_nanos((stream_elapsed / state.speed / 1e3) as u64);
            wall_target.checked_duration_since(Instant::now())
        } else {
            None
        };
        drop(state);
        if let Some(delay) = sleep {
            std::thread::sleep(delay);
        }

        Pull::Block(TagBlock {
            fence,
            ..block
        })
    }

    fn inject_config_fence(&self, fence: u32) {
        self.state
            .lock()
            .unwrap()
            .pending_fences
            .push_back(fence);
    }

    fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
