use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, TagKind, Timestamp};
use std::collections::{BTreeSet, VecDeque};

/// Auto- and cross-correlation histogram.
///
/// Every click acts as both start and stop, so both signs of the time
/// difference `t(channel_1) - t(channel_2)` are accumulated. The histogram
/// spans `[-n_bins/2 * binwidth, +n_bins/2 * binwidth]`; differences on the
/// positive edge land in the last bin. Without a second channel the first
/// channel correlates with itself.
pub type Correlation = MeasurementHandle<CorrelationState>;

pub struct CorrelationState {
    channel_1: ChannelId,
    channel_2: ChannelId,
    binwidth: Timestamp,
    n_bins: usize,
    half_span: Timestamp,
    data: Vec<i32>,
    recent_1: VecDeque<Timestamp>,
    recent_2: VecDeque<Timestamp>,
    counts_1: u64,
    counts_2: u64,
    duration: Timestamp,
    in_overflow: bool,
}

impl CorrelationState {
    fn new(channel_1: ChannelId, channel_2: ChannelId, binwidth: Timestamp, n_bins: usize) -> Self {
        Self {
            channel_1,
            channel_2,
            binwidth,
            n_bins,
            half_span: binwidth * (n_bins as Timestamp) / 2,
            data: vec![0; n_bins],
            recent_1: VecDeque::new(),
            recent_2: VecDeque::new(),
            counts_1: 0,
            counts_2: 0,
            duration: 0,
            in_overflow: false,
        }
    }

    fn bin_for(&self, dt: Timestamp) -> Option<usize> {
        if dt < -self.half_span || dt > self.half_span {
            return None;
        }
        let index = ((dt + self.half_span) / self.binwidth) as usize;
        Some(index.min(self.n_bins - 1))
    }

    fn record(&mut self, dt: Timestamp) {
        if let Some(bin) = self.bin_for(dt) {
            self.data[bin] += 1;
        }
    }

    fn on_event(&mut self, channel: ChannelId, time: Timestamp) {
        if self.channel_1 == self.channel_2 {
            if channel != self.channel_1 {
                return;
            }
            self.counts_1 += 1;
            self.counts_2 += 1;
            prune(&mut self.recent_1, time, self.half_span);
            for idx in 0..self.recent_1.len() {
                let dt = time - self.recent_1[idx];
                self.record(dt);
                if dt != 0 {
                    self.record(-dt);
                }
            }
            self.recent_1.push_back(time);
            return;
        }
        if channel == self.channel_1 {
            self.counts_1 += 1;
            prune(&mut self.recent_2, time, self.half_span);
            for idx in 0..self.recent_2.len() {
                let dt = time - self.recent_2[idx];
                self.record(dt);
            }
            self.recent_1.push_back(time);
        }
        if channel == self.channel_2 {
            self.counts_2 += 1;
            prune(&mut self.recent_1, time, self.half_span);
            for idx in 0..self.recent_1.len() {
                let dt = self.recent_1[idx] - time;
                self.record(dt);
            }
            self.recent_2.push_back(time);
        }
    }
}

fn prune(queue: &mut VecDeque<Timestamp>, now: Timestamp, span: Timestamp) {
    while queue.front().is_some_and(|t| now - *t > span) {
        queue.pop_front();
    }
}

impl Measurement for CorrelationState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        for i in 0..batch.len() {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if !self.in_overflow {
                        self.on_event(tag.channel, tag.time);
                    }
                }
                TagKind::OverflowBegin => {
                    self.in_overflow = true;
                    self.recent_1.clear();
                    self.recent_2.clear();
                }
                TagKind::OverflowEnd => self.in_overflow = false,
                TagKind::Error => {
                    self.recent_1.clear();
                    self.recent_2.clear();
                }
                TagKind::MissedEvents => {}
            }
        }
        self.duration += window.end - window.begin;
        Ok(false)
    }

    fn clear(&mut self) {
        self.data.fill(0);
        self.recent_1.clear();
        self.recent_2.clear();
        self.counts_1 = 0;
        self.counts_2 = 0;
        self.duration = 0;
    }
}

impl MeasurementHandle<CorrelationState> {
    pub fn new(
        engine: &StreamEngine,
        channel_1: ChannelId,
        channel_2: Option<ChannelId>,
        binwidth: Timestamp,
        n_bins: usize,
    ) -> Result<Correlation, ConfigError> {
        validate_input(channel_1, "Correlation channel 1")?;
        if binwidth <= 0 {
            return Err(ConfigError::NonPositive {
                what: "binwidth",
                value: binwidth,
            });
        }
        if n_bins == 0 {
            return Err(ConfigError::NonPositive {
                what: "n_bins",
                value: 0,
            });
        }
        let channel_2 = match channel_2 {
            Some(ch) => validate_input(ch, "Correlation channel 2")?,
            None => channel_1,
        };
        let registered = BTreeSet::from([channel_1, channel_2]);
        Ok(attach_measurement(
            engine,
            CorrelationState::new(channel_1, channel_2, binwidth, n_bins),
            AttachSpec {
                label: "Correlation",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    pub fn data(&self) -> Vec<i32> {
        self.with(|m| m.data.clone())
    }

    /// Histogram normalized such that uncorrelated signals average to one:
    /// `g2(dt) = histogram(dt) * T / (binwidth * N1 * N2)`.
    pub fn data_normalized(&self) -> Vec<f64> {
        self.with(|m| {
            let n1 = m.counts_1 as f64;
            let n2 = m.counts_2 as f64;
            let norm = if n1 > 0.0 && n2 > 0.0 {
                m.duration as f64 / (m.binwidth as f64 * n1 * n2)
            } else {
                0.0
            };
            m.data.iter().map(|&c| c as f64 * norm).collect()
        })
    }

    /// Centers of the time bins, symmetric about zero.
    pub fn index(&self) -> Vec<Timestamp> {
        self.with(|m| {
            (0..m.n_bins as i64)
                .map(|i| -m.half_span + i * m.binwidth + m.binwidth / 2)
                .collect()
        })
    }
}
