use crate::source::core::SourceError;
use crate::tag::{Tag, TagBlock, Timestamp};
use std::time::{Duration, Instant};

/// Block-size policy of a source.
#[derive(Debug, Clone, Copy)]
pub struct BlockPolicy {
    /// A block is cut before the pending tag count exceeds this.
    pub max_events: usize,
    /// A pending block is cut once it has aged past this bound.
    pub max_latency: Duration,
    /// Idle gap after which a pending block is cut without new tags.
    pub idle_flush: Duration,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            max_events: 131_072,
            max_latency: Duration::from_millis(20),
            idle_flush: Duration::from_millis(1),
        }
    }
}

/// Accumulates tags into contiguous blocks under a [`BlockPolicy`].
///
/// Emitted blocks abut: each begins at the previous block's end. The fence
/// stamped on a block is the greatest fence whose effect is fully visible
/// within it.
pub(crate) struct BlockAssembler {
    policy: BlockPolicy,
    pending: Vec<Tag>,
    cursor: Timestamp,
    current_fence: u32,
    first_pending_at: Option<Instant>,
    last_pending_at: Option<Instant>,
}

impl BlockAssembler {
    pub(crate) fn new(policy: BlockPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            cursor: 0,
            current_fence: 0,
            first_pending_at: None,
            last_pending_at: None,
        }
    }

    pub(crate) fn cursor(&self) -> Timestamp {
        self.cursor
    }

    /// Appends a tag; returns a finished block when the event bound is hit.
    pub(crate) fn push(&mut self, tag: Tag) -> Result<Option<TagBlock>, SourceError> {
        let floor = self.pending.last().map_or(self.cursor, |t| t.time);
        if tag.time < floor {
            return Err(SourceError::OutOfOrder {
                time: tag.time,
                cursor: floor,
            });
        }
        let now = Instant::now();
        if self.pending.is_empty() {
            self.first_pending_at = Some(now);
        }
        self.last_pending_at = Some(now);
        self.pending.push(tag);
        if self.pending.len() >= self.policy.max_events {
            return Ok(self.cut(None));
        }
        Ok(None)
    }

    /// Cuts the pending block with an explicit end, advancing stream time.
    pub(crate) fn flush_at(&mut self, end: Timestamp) -> Result<Option<TagBlock>, SourceError> {
        let floor = self.pending.last().map_or(self.cursor, |t| t.time + 1);
        if end < floor {
            return Err(SourceError::OutOfOrder {
                time: end,
                cursor: floor,
            });
        }
        if end == self.cursor && self.pending.is_empty() {
            return Ok(None);
        }
        Ok(self.cut(Some(end)))
    }

    /// Cuts the pending block, ending just past its last tag.
    pub(crate) fn flush(&mut self) -> Option<TagBlock> {
        if self.pending.is_empty() {
            return None;
        }
        self.cut(None)
    }

    /// Publishes `fence`. Tags pending at this point predate the fence, so
    /// they are flushed under the previous stamp; the fence itself rides on
    /// a zero-width keep-alive block.
    pub(crate) fn fence_flush(&mut self, fence: u32) -> Vec<TagBlock> {
        let mut blocks = Vec::new();
        if let Some(block) = self.flush() {
            blocks.push(block);
        }
        self.current_fence = fence;
        blocks.push(TagBlock::keep_alive(self.cursor, fence));
        blocks
    }

    /// True when the pending block aged past the latency bound or the
    /// stream has gone idle since the last tag.
    pub(crate) fn stale(&self) -> bool {
        let aged = self
            .first_pending_at
            .is_some_and(|at| at.elapsed() >= self.policy.max_latency);
        let idle = self
            .last_pending_at
            .is_some_and(|at| at.elapsed() >= self.policy.idle_flush);
        aged || idle
    }

    fn cut(&mut self, end: Option<Timestamp>) -> Option<TagBlock> {
        let tags = std::mem::take(&mut self.pending);
        self.first_pending_at = None;
        self.last_pending_at = None;
        let end = end.unwrap_or_else(|| tags.last().map_or(self.cursor, |t| t.time + 1));
        let block = TagBlock::new(tags, self.cursor, end, self.current_fence);
        self.cursor = end;
        Some(block)
    }
}
