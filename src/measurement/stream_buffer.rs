use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, StreamBuffer, Tag, TagKind, Timestamp};
use std::collections::{BTreeSet, VecDeque};

/// Raw access to the delivered tag stream through a bounded ring buffer.
///
/// When the ring is full the oldest tags are dropped. `take` drains the
/// buffer atomically, so every retained tag is returned exactly once.
pub type TimeTagStream = MeasurementHandle<TimeTagStreamState>;

pub struct TimeTagStreamState {
    channels: BTreeSet<ChannelId>,
    capacity: usize,
    ring: VecDeque<Tag>,
    t_start: Timestamp,
    cursor: Timestamp,
    has_overflow: bool,
}

impl Measurement for TimeTagStreamState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        for i in 0..batch.len() {
            batch.check_abort()?;
            let tag = batch.get(i);
            let keep = match tag.kind {
                TagKind::TimeTag | TagKind::MissedEvents => self.channels.contains(&tag.channel),
                _ => true,
            };
            if !keep {
                continue;
            }
            if matches!(tag.kind, TagKind::OverflowBegin | TagKind::OverflowEnd) {
                self.has_overflow = true;
            }
            if self.ring.len() == self.capacity {
                self.ring.pop_front();
            }
            self.ring.push_back(tag);
        }
        self.cursor = window.end;
        Ok(false)
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.has_overflow = false;
        self.t_start = self.cursor;
    }
}

impl MeasurementHandle<TimeTagStreamState> {
    pub fn new(
        engine: &StreamEngine,
        n_max_events: usize,
        channels: Vec<ChannelId>,
    ) -> Result<TimeTagStream, ConfigError> {
        if n_max_events == 0 {
            return Err(ConfigError::NonPositive {
                what: "n_max_events",
                value: 0,
            });
        }
        let mut registered = BTreeSet::new();
        for ch in &channels {
            validate_input(*ch, "TimeTagStream channels")?;
            registered.insert(*ch);
        }
        Ok(attach_measurement(
            engine,
            TimeTagStreamState {
                channels: registered.clone(),
                capacity: n_max_events,
                ring: VecDeque::with_capacity(n_max_events),
                t_start: 0,
                cursor: 0,
                has_overflow: false,
            },
            AttachSpec {
                label: "TimeTagStream",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Number of tags currently buffered.
    pub fn counts(&self) -> usize {
        self.with(|m| m.ring.len())
    }

    /// Drains the buffer into a column-wise snapshot.
    pub fn take(&self) -> StreamBuffer {
        self.with_mut(|m| {
            let mut buffer = StreamBuffer {
                t_start: m.t_start,
                t_taken: m.cursor,
                has_overflow: m.has_overflow,
                ..StreamBuffer::default()
            };
            for tag in m.ring.drain(..) {
                buffer.push(&tag);
            }
            m.t_start = m.cursor;
            m.has_overflow = false;
            buffer
        })
    }
}
