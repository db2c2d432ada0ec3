use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, Tag, TagKind, Timestamp};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// First-in first-out delay: every input event reappears on a virtual
/// channel `delay` picoseconds later. One virtual channel is allocated per
/// input channel.
///
/// Shortening the delay drops queued tags whose new scheduled time already
/// lies in the past; they never surface on the virtual channel.
pub type DelayedChannel = MeasurementHandle<DelayedChannelState>;

pub struct DelayedChannelState {
    index_of: HashMap<ChannelId, usize>,
    outs: Vec<ChannelId>,
    delay: Timestamp,
    queue: VecDeque<(Timestamp, usize)>,
    cursor: Timestamp,
}

impl Measurement for DelayedChannelState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        let mut modified = false;
        // Release queued copies that fall into this interval.
        while let Some(&(origin, idx)) = self.queue.front() {
            let due = origin + self.delay;
            if due < window.end {
                batch.emit(Tag::event(due.max(window.begin), self.outs[idx]));
                self.queue.pop_front();
                modified = true;
            } else {
                break;
            }
        }
        let incoming = batch.len();
        for i in 0..incoming {
            batch.check_abort()?;
            let tag = batch.get(i);
            if tag.kind != TagKind::TimeTag {
                continue;
            }
            if let Some(&idx) = self.index_of.get(&tag.channel) {
                let due = tag.time + self.delay;
                if due < window.end {
                    batch.emit(Tag::event(due, self.outs[idx]));
                    modified = true;
                } else {
                    self.queue.push_back((tag.time, idx));
                }
            }
        }
        self.cursor = window.end;
        Ok(modified)
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}

impl DelayedChannelState {
    fn set_delay(&mut self, delay: Timestamp) {
        if delay < self.delay {
            let cursor = self.cursor;
            self.queue.retain(|(origin, _)| origin + delay >= cursor);
        }
        self.delay = delay;
    }
}

impl MeasurementHandle<DelayedChannelState> {
    pub fn new(
        engine: &StreamEngine,
        input_channel: ChannelId,
        delay: Timestamp,
    ) -> Result<DelayedChannel, ConfigError> {
        Self::new_many(engine, vec![input_channel], delay)
    }

    /// Delays several channels at once, each onto its own virtual channel.
    pub fn new_many(
        engine: &StreamEngine,
        input_channels: Vec<ChannelId>,
        delay: Timestamp,
    ) -> Result<DelayedChannel, ConfigError> {
        if delay < 0 {
            return Err(ConfigError::NegativeDelay { delay });
        }
        let mut registered = BTreeSet::new();
        for ch in &input_channels {
            validate_input(*ch, "DelayedChannel inputs")?;
            if !registered.insert(*ch) {
                return Err(ConfigError::DuplicateChannel {
                    channel: *ch,
                    what: "DelayedChannel inputs",
                });
            }
        }
        if registered.is_empty() {
            return Err(ConfigError::Invalid {
                what: "DelayedChannel",
                detail: "at least one input channel is required".into(),
            });
        }
        let allocator = engine.core().allocator();
        let outs: Vec<ChannelId> = input_channels.iter().map(|_| allocator.allocate()).collect();
        let index_of = input_channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (*ch, i))
            .collect();
        Ok(attach_measurement(
            engine,
            DelayedChannelState {
                index_of,
                outs: outs.clone(),
                delay,
                queue: VecDeque::new(),
                cursor: 0,
            },
            AttachSpec {
                label: "DelayedChannel",
                registered,
                virtual_out: outs,
            },
        ))
    }

    /// The first delayed virtual channel.
    pub fn channel(&self) -> ChannelId {
        self.with(|m| m.outs[0])
    }

    /// All delayed virtual channels, in input order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.with(|m| m.outs.clone())
    }

    /// Adjusts the delay. Shortening it flushes queued tags whose new
    /// scheduled time precedes the stream cursor.
    pub fn set_delay(&self, delay: Timestamp) -> Result<(), ConfigError> {
        if delay < 0 {
            return Err(ConfigError::NegativeDelay { delay });
        }
        self.with_mut(|m| m.set_delay(delay));
        Ok(())
    }

    pub fn delay(&self) -> Timestamp {
        self.with(|m| m.delay)
    }
}
