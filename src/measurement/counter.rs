use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, TagKind, Timestamp};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Time trace of the count rate on one or more channels.
///
/// Counts tags per channel within consecutive `binwidth` intervals and keeps
/// the most recent `n_values` completed bins in a circular buffer; the last
/// entry is always the most recent bin. Bins overlapping an overflow region
/// are marked invalid.
pub type Counter = MeasurementHandle<CounterState>;

struct BinSlot {
    counts: Vec<i32>,
    invalid: bool,
}

pub struct CounterState {
    channels: Vec<ChannelId>,
    index_of: HashMap<ChannelId, usize>,
    binwidth: Timestamp,
    n_values: usize,
    ring: VecDeque<BinSlot>,
    current: BinSlot,
    bin_end: Option<Timestamp>,
    totals: Vec<u64>,
    in_overflow: bool,
}

impl CounterState {
    fn new(channels: Vec<ChannelId>, binwidth: Timestamp, n_values: usize) -> Self {
        let index_of = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (*ch, i))
            .collect();
        let width = channels.len();
        Self {
            index_of,
            binwidth,
            n_values,
            ring: VecDeque::with_capacity(n_values),
            current: BinSlot {
                counts: vec![0; width],
                invalid: false,
            },
            bin_end: None,
            totals: vec![0; width],
            channels,
            in_overflow: false,
        }
    }

    /// Completes every bin whose end lies at or before `limit`.
    fn roll(&mut self, limit: Timestamp) {
        let Some(mut bin_end) = self.bin_end else {
            return;
        };
        if limit >= bin_end {
            let pending = (limit - bin_end) / self.binwidth + 1;
            if pending > self.n_values as i64 {
                // Long idle gap: the accumulating bin and everything in the
                // ring rotate out, so skip the intermediate rotations.
                for _ in 0..=self.n_values {
                    self.push_current();
                }
                bin_end += pending * self.binwidth;
            } else {
                for _ in 0..pending {
                    self.push_current();
                    bin_end += self.binwidth;
                }
            }
        }
        self.bin_end = Some(bin_end);
    }

    fn push_current(&mut self) {
        let width = self.channels.len();
        let finished = std::mem::replace(
            &mut self.current,
            BinSlot {
                counts: vec![0; width],
                invalid: self.in_overflow,
            },
        );
        if self.ring.len() == self.n_values {
            self.ring.pop_front();
        }
        self.ring.push_back(finished);
    }

    fn slots_oldest_first(&self) -> Vec<(&[i32], bool)> {
        let mut slots = Vec::with_capacity(self.n_values);
        for _ in self.ring.len()..self.n_values {
            slots.push((&[][..], false));
        }
        for bin in &self.ring {
            slots.push((bin.counts.as_slice(), bin.invalid));
        }
        slots
    }

    fn data(&self, rolling: bool) -> Vec<Vec<i32>> {
        let slots = self.slots_oldest_first();
        self.channels
            .iter()
            .enumerate()
            .map(|(ch_idx, _)| {
                let mut row: Vec<i32> = slots
                    .iter()
                    .map(|(counts, _)| counts.get(ch_idx).copied().unwrap_or(0))
                    .collect();
                if !rolling {
                    row.reverse();
                }
                row
            })
            .collect()
    }

    fn data_normalized(&self, rolling: bool) -> Vec<Vec<f64>> {
        let slots = self.slots_oldest_first();
        let scale = 1e12 / self.binwidth as f64;
        self.channels
            .iter()
            .enumerate()
            .map(|(ch_idx, _)| {
                let mut row: Vec<f64> = slots
                    .iter()
                    .map(|(counts, invalid)| {
                        if *invalid {
                            f64::NAN
                        } else {
                            counts.get(ch_idx).copied().unwrap_or(0) as f64 * scale
                        }
                    })
                    .collect();
                if !rolling {
                    row.reverse();
                }
                row
            })
            .collect()
    }
}

impl Measurement for CounterState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        if self.bin_end.is_none() {
            self.bin_end = Some(window.begin + self.binwidth);
        }
        for i in 0..batch.len() {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if let Some(&idx) = self.index_of.get(&tag.channel) {
                        self.roll(tag.time);
                        self.current.counts[idx] += 1;
                        self.totals[idx] += 1;
                    }
                }
                TagKind::OverflowBegin => {
                    self.roll(tag.time);
                    self.in_overflow = true;
                    self.current.invalid = true;
                }
                TagKind::OverflowEnd => {
                    self.roll(tag.time);
                    self.in_overflow = false;
                    self.current.invalid = true;
                }
                TagKind::MissedEvents => {
                    if let Some(&idx) = self.index_of.get(&tag.channel) {
                        self.totals[idx] += u64::from(tag.missed_events);
                    }
                }
                TagKind::Error => {
                    self.current.invalid = true;
                }
            }
        }
        // A bin is complete once stream time has reached its end.
        self.roll(window.end);
        Ok(false)
    }

    fn clear(&mut self) {
        let width = self.channels.len();
        self.ring.clear();
        self.current = BinSlot {
            counts: vec![0; width],
            invalid: self.in_overflow,
        };
        self.bin_end = None;
        self.totals = vec![0; width];
    }
}

impl MeasurementHandle<CounterState> {
    pub fn new(
        engine: &StreamEngine,
        channels: Vec<ChannelId>,
        binwidth: Timestamp,
        n_values: usize,
    ) -> Result<Counter, ConfigError> {
        if binwidth <= 0 {
            return Err(ConfigError::NonPositive {
                what: "binwidth",
                value: binwidth,
            });
        }
        if n_values == 0 {
            return Err(ConfigError::NonPositive {
                what: "n_values",
                value: 0,
            });
        }
        let mut registered = BTreeSet::new();
        for ch in &channels {
            validate_input(*ch, "Counter channels")?;
            if !registered.insert(*ch) {
                return Err(ConfigError::DuplicateChannel {
                    channel: *ch,
                    what: "Counter channels",
                });
            }
        }
        if registered.is_empty() {
            return Err(ConfigError::Invalid {
                what: "Counter",
                detail: "at least one channel is required".into(),
            });
        }
        Ok(attach_measurement(
            engine,
            CounterState::new(channels, binwidth, n_values),
            AttachSpec {
                label: "Counter",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Counts per channel and bin, oldest bin first.
    pub fn data(&self) -> Vec<Vec<i32>> {
        self.with(|c| c.data(true))
    }

    /// Counts per channel and bin; `rolling = false` puts the newest bin
    /// first.
    pub fn data_ordered(&self, rolling: bool) -> Vec<Vec<i32>> {
        self.with(|c| c.data(rolling))
    }

    /// Count rate in Hz per channel and bin; invalid bins are NaN.
    pub fn data_normalized(&self) -> Vec<Vec<f64>> {
        self.with(|c| c.data_normalized(true))
    }

    /// Total clicks per channel since creation or the last clear, missed
    /// events included.
    pub fn data_total_counts(&self) -> Vec<u64> {
        self.with(|c| c.totals.clone())
    }

    /// Relative start time of each returned bin.
    pub fn index(&self) -> Vec<Timestamp> {
        self.with(|c| (0..c.n_values as i64).map(|i| i * c.binwidth).collect())
    }
}
