use crate::channel::{validate_input, VirtualChannelAllocator};
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, Tag, TagKind, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const MAX_MONITORED: usize = 16;

/// Detects maximal combinations: events on distinct monitored channels
/// within a rolling window, bracketed by event-free guard windows of the
/// same duration. The guard starts at the cluster's last event, so a
/// combination is confirmed (and its tag emitted) one window after it.
///
/// Each subset of channels has its own virtual channel, enabled lazily
/// through [`MeasurementHandle::channel`]; the k-th sum channel fires on
/// every k-fold combination. Repeated events on one channel count once.
pub type Combinations = MeasurementHandle<CombinationsState>;

pub struct CombinationsState {
    channels: Vec<ChannelId>,
    pos_of: HashMap<ChannelId, usize>,
    window: Timestamp,
    sum_channels: Vec<ChannelId>,
    combo_channels: HashMap<u32, ChannelId>,
    allocator: Arc<VirtualChannelAllocator>,
    cluster: Vec<(Timestamp, usize)>,
}

impl CombinationsState {
    fn flush_cluster(&mut self, batch: &mut TagBatch<'_>) -> bool {
        if self.cluster.is_empty() {
            return false;
        }
        let first = self.cluster.first().expect("cluster is nonempty").0;
        let last = self.cluster.last().expect("cluster is nonempty").0;
        let mut mask = 0u32;
        for (_, pos) in self.cluster.drain(..) {
            mask |= 1 << pos;
        }
        if last - first > self.window {
            return false;
        }
        let confirmed_at = last + self.window;
        let folds = mask.count_ones() as usize;
        batch.emit(Tag::event(confirmed_at, self.sum_channels[folds - 1]));
        if let Some(&out) = self.combo_channels.get(&mask) {
            batch.emit(Tag::event(confirmed_at, out));
        }
        true
    }
}

impl Measurement for CombinationsState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        let mut modified = false;
        let incoming = batch.len();
        for i in 0..incoming {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    let Some(&pos) = self.pos_of.get(&tag.channel) else {
                        continue;
                    };
                    if let Some(&(last, _)) = self.cluster.last() {
                        if tag.time - last > self.window {
                            modified |= self.flush_cluster(batch);
                        }
                    }
                    self.cluster.push((tag.time, pos));
                }
                TagKind::OverflowBegin | TagKind::Error => self.cluster.clear(),
                _ => {}
            }
        }
        // The guard is confirmed once stream time has passed one window
        // beyond the cluster's last event.
        if let Some(&(last, _)) = self.cluster.last() {
            if window.end > last + self.window {
                modified |= self.flush_cluster(batch);
            }
        }
        Ok(modified)
    }

    fn clear(&mut self) {
        self.cluster.clear();
    }
}

impl Drop for CombinationsState {
    fn drop(&mut self) {
        for channel in self.sum_channels.drain(..) {
            self.allocator.release(channel);
        }
        for (_, channel) in self.combo_channels.drain() {
            self.allocator.release(channel);
        }
    }
}

impl MeasurementHandle<CombinationsState> {
    pub fn new(
        engine: &StreamEngine,
        channels: Vec<ChannelId>,
        window_size: Timestamp,
    ) -> Result<Combinations, ConfigError> {
        if window_size <= 0 {
            return Err(ConfigError::NonPositive {
                what: "window_size",
                value: window_size,
            });
        }
        if channels.len() > MAX_MONITORED {
            return Err(ConfigError::TooManyChannels {
                what: "Combinations",
                count: channels.len(),
                limit: MAX_MONITORED,
            });
        }
        let mut registered = BTreeSet::new();
        for ch in &channels {
            validate_input(*ch, "Combinations channels")?;
            if !registered.insert(*ch) {
                return Err(ConfigError::DuplicateChannel {
                    channel: *ch,
                    what: "Combinations channels",
                });
            }
        }
        if registered.is_empty() {
            return Err(ConfigError::Invalid {
                what: "Combinations",
                detail: "at least one channel is required".into(),
            });
        }
        let allocator = engine.core().allocator().clone();
        let sum_channels: Vec<ChannelId> =
            channels.iter().map(|_| allocator.allocate()).collect();
        let pos_of = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (*ch, i))
            .collect();
        Ok(attach_measurement(
            engine,
            CombinationsState {
                channels,
                pos_of,
                window: window_size,
                sum_channels,
                combo_channels: HashMap::new(),
                allocator,
                cluster: Vec::new(),
            },
            AttachSpec {
                label: "Combinations",
                registered,
                // Channel lifetimes are managed by the state itself since
                // combination channels are enabled lazily.
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Virtual channel of the exclusive combination on `input_channels`,
    /// enabling it on first use.
    pub fn channel(&self, input_channels: &[ChannelId]) -> Result<ChannelId, ConfigError> {
        self.with_mut(|m| {
            let mut mask = 0u32;
            for ch in input_channels {
                match m.pos_of.get(ch) {
                    Some(&pos) => mask |= 1 << pos,
                    None => {
                        return Err(ConfigError::InvalidChannel {
                            channel: *ch,
                            what: "Combinations combination",
                        })
                    }
                }
            }
            if mask == 0 {
                return Err(ConfigError::Invalid {
                    what: "Combinations",
                    detail: "a combination needs at least one channel".into(),
                });
            }
            let allocator = &m.allocator;
            Ok(*m
                .combo_channels
                .entry(mask)
                .or_insert_with(|| allocator.allocate()))
        })
    }

    /// Virtual channel firing on every `n_channels`-fold combination.
    pub fn sum_channel(&self, n_channels: usize) -> Result<ChannelId, ConfigError> {
        self.with(|m| {
            m.sum_channels
                .get(n_channels.wrapping_sub(1))
                .copied()
                .ok_or(ConfigError::Invalid {
                    what: "Combinations",
                    detail: format!("no {n_channels}-fold sum channel"),
                })
        })
    }

    /// Input channels whose exclusive combination fires `virtual_channel`.
    pub fn combination(&self, virtual_channel: ChannelId) -> Option<Vec<ChannelId>> {
        self.with(|m| {
            m.combo_channels
                .iter()
                .find(|(_, out)| **out == virtual_channel)
                .map(|(mask, _)| {
                    m.channels
                        .iter()
                        .enumerate()
                        .filter(|(pos, _)| mask & (1 << pos) != 0)
                        .map(|(_, ch)| *ch)
                        .collect()
                })
        })
    }
}
