use serde::{Deserialize, Serialize};

/// Timestamp in picoseconds.
pub type Timestamp = i64;

/// Identifier of a physical input edge or a virtual producer.
pub type ChannelId = i32;

/// Classifies a single entry of the tag stream.
///
/// - `TimeTag`: a regular event on an input or virtual channel
/// - `Error`: internal processing error, invalidates the global time base
/// - `OverflowBegin` / `OverflowEnd`: bracket an interval with dropped data
/// - `MissedEvents`: per-channel loss count inside an overflow interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagKind {
    TimeTag,
    Error,
    OverflowBegin,
    OverflowEnd,
    MissedEvents,
}

/// A single timestamped entry of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub kind: TagKind,
    pub channel: ChannelId,
    pub time: Timestamp,
    pub missed_events: u16,
}

impl Tag {
    /// Regular event on a channel.
    pub fn event(time: Timestamp, channel: ChannelId) -> Self {
        Self {
            kind: TagKind::TimeTag,
            channel,
            time,
            missed_events: 0,
        }
    }

    /// Stream marker without a channel association.
    pub fn marker(kind: TagKind, time: Timestamp) -> Self {
        Self {
            kind,
            channel: 0,
            time,
            missed_events: 0,
        }
    }

    /// Loss record for `channel` inside an overflow interval. The counts of
    /// repeated records for the same channel accumulate.
    pub fn missed(time: Timestamp, channel: ChannelId, count: u16) -> Self {
        Self {
            kind: TagKind::MissedEvents,
            channel,
            time,
            missed_events: count,
        }
    }

    pub fn is_event(&self) -> bool {
        self.kind == TagKind::TimeTag
    }
}

/// A contiguous, time-ordered batch of tags covering `[begin, end)`.
///
/// Tags are sorted non-decreasing by time with `begin <= tags[0].time` and
/// `tags[last].time < end`. Empty blocks are legal and serve as keep-alive
/// fences; such blocks may carry `begin == end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagBlock {
    pub tags: Vec<Tag>,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub fence: u32,
}

impl TagBlock {
    pub fn new(tags: Vec<Tag>, begin: Timestamp, end: Timestamp, fence: u32) -> Self {
        debug_assert!(tags.windows(2).all(|w| w[0].time <= w[1].time));
        debug_assert!(tags.first().map_or(true, |t| begin <= t.time));
        debug_assert!(tags.last().map_or(true, |t| t.time < end));
        Self {
            tags,
            begin,
            end,
            fence,
        }
    }

    /// Zero-width block whose only purpose is to publish a fence.
    pub fn keep_alive(at: Timestamp, fence: u32) -> Self {
        Self {
            tags: Vec::new(),
            begin: at,
            end: at,
            fence,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }
}

/// Column-wise snapshot of raw tags handed out by the streaming consumers
/// (`TimeTagStream::take`, `FileReader::read`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBuffer {
    pub timestamps: Vec<Timestamp>,
    pub channels: Vec<ChannelId>,
    pub kinds: Vec<TagKind>,
    pub missed_events: Vec<u16>,
    pub has_overflow: bool,
    /// Stream time when the buffer started filling.
    pub t_start: Timestamp,
    /// Stream time when the buffer was taken.
    pub t_taken: Timestamp,
}

impl StreamBuffer {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub(crate) fn push(&mut self, tag: &Tag) {
        self.timestamps.push(tag.time);
        self.channels.push(tag.channel);
        self.kinds.push(tag.kind);
        self.missed_events.push(tag.missed_events);
        if matches!(tag.kind, TagKind::OverflowBegin | TagKind::OverflowEnd) {
            self.has_overflow = true;
        }
    }

    /// Reassembles row-wise tags, the inverse of `push`.
    pub fn to_tags(&self) -> Vec<Tag> {
        (0..self.len())
            .map(|i| Tag {
                kind: self.kinds[i],
                channel: self.channels[i],
                time: self.timestamps[i],
                missed_events: self.missed_events[i],
            })
            .collect()
    }
}
