use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, Tag, TagKind, Timestamp};
use std::collections::{BTreeSet, HashMap};

/// Timestamp assigned to an emitted coincidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoincidenceTimestamp {
    /// Time of the event completing the coincidence.
    Last,
    /// Integer mean of all contributing times.
    Average,
    /// Time of the earliest contributing event.
    First,
    /// Time of the first channel listed in the group.
    ListedFirst,
}

/// Coincidence monitor over one or more channel groups.
///
/// A group fires when every member's most recent arrival lies within the
/// window of the group's newest arrival and none of those arrivals has
/// already contributed to a fire. Groups firing on the same event emit in
/// declaration order.
pub type Coincidences = MeasurementHandle<CoincidencesState>;

struct GroupState {
    members: Vec<ChannelId>,
    last: Vec<Option<Timestamp>>,
    consumed: Vec<bool>,
    out: ChannelId,
}

impl GroupState {
    fn reset(&mut self) {
        self.last.fill(None);
        self.consumed.fill(false);
    }
}

pub struct CoincidencesState {
    groups: Vec<GroupState>,
    by_channel: HashMap<ChannelId, Vec<usize>>,
    window: Timestamp,
    policy: CoincidenceTimestamp,
    in_overflow: bool,
}

impl CoincidencesState {
    fn on_event(&mut self, batch: &mut TagBatch<'_>, tag: Tag, floor: Timestamp) -> bool {
        let group_indices = match self.by_channel.get(&tag.channel) {
            Some(indices) => indices.clone(),
            None => return false,
        };
        let mut modified = false;
        for gi in group_indices {
            let group = &mut self.groups[gi];
            for (pos, member) in group.members.iter().enumerate() {
                if *member == tag.channel {
                    group.last[pos] = Some(tag.time);
                    group.consumed[pos] = false;
                }
            }
            let complete = group.last.iter().all(|l| l.is_some())
                && group.consumed.iter().all(|c| !c);
            if !complete {
                continue;
            }
            let times: Vec<Timestamp> = group.last.iter().map(|l| l.unwrap()).collect();
            let newest = *times.iter().max().unwrap();
            let oldest = *times.iter().min().unwrap();
            if newest - oldest > self.window {
                continue;
            }
            let stamp = match self.policy {
                CoincidenceTimestamp::Last => newest,
                CoincidenceTimestamp::First => oldest,
                CoincidenceTimestamp::Average => {
                    times.iter().sum::<Timestamp>() / times.len() as Timestamp
                }
                CoincidenceTimestamp::ListedFirst => times[0],
            };
            batch.emit(Tag::event(stamp.max(floor), group.out));
            group.consumed.fill(true);
            modified = true;
        }
        modified
    }
}

impl Measurement for CoincidencesState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        let mut modified = false;
        let incoming = batch.len();
        for i in 0..incoming {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if !self.in_overflow {
                        modified |= self.on_event(batch, tag, window.begin);
                    }
                }
                TagKind::OverflowBegin => {
                    self.in_overflow = true;
                    for group in &mut self.groups {
                        group.reset();
                    }
                }
                TagKind::OverflowEnd => self.in_overflow = false,
                TagKind::Error => {
                    for group in &mut self.groups {
                        group.reset();
                    }
                }
                TagKind::MissedEvents => {}
            }
        }
        Ok(modified)
    }

    fn clear(&mut self) {
        for group in &mut self.groups {
            group.reset();
        }
    }
}

impl MeasurementHandle<CoincidencesState> {
    pub fn new(
        engine: &StreamEngine,
        coincidence_groups: Vec<Vec<ChannelId>>,
        coincidence_window: Timestamp,
        timestamp: CoincidenceTimestamp,
    ) -> Result<Coincidences, ConfigError> {
        if coincidence_window <= 0 {
            return Err(ConfigError::NonPositive {
                what: "coincidence_window",
                value: coincidence_window,
            });
        }
        if coincidence_groups.is_empty() {
            return Err(ConfigError::Invalid {
                what: "Coincidences",
                detail: "at least one coincidence group is required".into(),
            });
        }
        let mut registered = BTreeSet::new();
        let mut groups = Vec::with_capacity(coincidence_groups.len());
        let mut by_channel: HashMap<ChannelId, Vec<usize>> = HashMap::new();
        let allocator = engine.core().allocator();
        let mut outs = Vec::new();
        for (gi, members) in coincidence_groups.into_iter().enumerate() {
            if members.len() < 2 {
                return Err(ConfigError::Invalid {
                    what: "Coincidences",
                    detail: format!("group {gi} needs at least two channels"),
                });
            }
            let mut seen = BTreeSet::new();
            for ch in &members {
                validate_input(*ch, "Coincidences group channel")?;
                if !seen.insert(*ch) {
                    return Err(ConfigError::DuplicateChannel {
                        channel: *ch,
                        what: "Coincidences group",
                    });
                }
                registered.insert(*ch);
                by_channel.entry(*ch).or_default().push(gi);
            }
            let out = allocator.allocate();
            outs.push(out);
            let width = members.len();
            groups.push(GroupState {
                members,
                last: vec![None; width],
                consumed: vec![false; width],
                out,
            });
        }
        Ok(attach_measurement(
            engine,
            CoincidencesState {
                groups,
                by_channel,
                window: coincidence_window,
                policy: timestamp,
                in_overflow: false,
            },
            AttachSpec {
                label: "Coincidences",
                registered,
                virtual_out: outs,
            },
        ))
    }

    /// Virtual channel per coincidence group, in declaration order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.with(|m| m.groups.iter().map(|g| g.out).collect())
    }

    /// Virtual channel of a single-group monitor.
    pub fn channel(&self) -> ChannelId {
        self.with(|m| m.groups[0].out)
    }

    pub fn set_window(&self, coincidence_window: Timestamp) -> Result<(), ConfigError> {
        if coincidence_window <= 0 {
            return Err(ConfigError::NonPositive {
                what: "coincidence_window",
                value: coincidence_window,
            });
        }
        self.with_mut(|m| m.window = coincidence_window);
        Ok(())
    }
}
