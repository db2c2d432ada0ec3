use crate::tag::{ChannelId, TagBlock, Timestamp};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// One pull from a source's block queue.
#[derive(Debug)]
pub enum Pull {
    Block(TagBlock),
    /// Nothing available within the timeout; the caller may drain its
    /// command queue and retry.
    Idle,
    /// Terminal: no further blocks will be produced.
    EndOfStream,
}

/// Producer edge of the engine.
///
/// A source owns its origin (device FIFO, replay file, network stream) and
/// the block-size policy, and delivers contiguous, time-ordered blocks. The
/// engine sees nothing but `TagBlock`s.
pub trait Source: Send + Sync + 'static {
    /// Blocks up to `timeout` for the next block.
    fn pull(&self, timeout: Duration) -> Pull;

    /// Updates the set of channels the source must transport. Sources
    /// without channel filtering ignore this.
    fn configure_channels(&self, _channels: &BTreeSet<ChannelId>) {}

    /// Publishes a configuration fence at the earliest pipeline stage: the
    /// source flushes its pending block (or emits a keep-alive) stamped with
    /// `fence`.
    fn inject_config_fence(&self, _fence: u32) {}

    /// Asks the producer to wind down; subsequent pulls drain and then
    /// report `EndOfStream`.
    fn request_stop(&self) {}
}

/// Errors surfaced by software-driven sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("tag at {time} ps precedes the stream cursor at {cursor} ps")]
    OutOfOrder { time: Timestamp, cursor: Timestamp },
    #[error("source is closed")]
    Closed,
}
