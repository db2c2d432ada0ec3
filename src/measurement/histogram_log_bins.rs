use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, TagKind, Timestamp};
use std::collections::{BTreeSet, VecDeque};

/// Multiple-start multiple-stop histogram with logarithmic bin widths.
///
/// Bin edges run `10^exp_start` to `10^exp_stop` seconds. To avoid the
/// startup transient of the wide bins, accumulation only begins once the
/// full histogram duration has passed since start, clear, or the last
/// overflow.
pub type HistogramLogBins = MeasurementHandle<HistogramLogBinsState>;

pub struct HistogramLogBinsState {
    click_channel: ChannelId,
    start_channel: ChannelId,
    edges: Vec<Timestamp>,
    counts: Vec<u64>,
    starts: VecDeque<Timestamp>,
    warmup_until: Option<Timestamp>,
    in_overflow: bool,
}

impl HistogramLogBinsState {
    fn new(
        click_channel: ChannelId,
        start_channel: ChannelId,
        exp_start: f64,
        exp_stop: f64,
        n_bins: usize,
    ) -> Self {
        let edges = (0..=n_bins)
            .map(|i| {
                let exponent =
                    exp_start + i as f64 * (exp_stop - exp_start) / n_bins as f64;
                (10f64.powf(exponent) * 1e12).round() as Timestamp
            })
            .collect();
        Self {
            click_channel,
            start_channel,
            edges,
            counts: vec![0; n_bins],
            starts: VecDeque::new(),
            warmup_until: None,
            in_overflow: false,
        }
    }

    fn span(&self) -> Timestamp {
        *self.edges.last().expect("edges are never empty")
    }

    fn restart_warmup(&mut self, from: Timestamp) {
        self.warmup_until = Some(from + self.span());
    }
}

impl Measurement for HistogramLogBinsState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        if self.warmup_until.is_none() {
            self.restart_warmup(window.begin);
        }
        for i in 0..batch.len() {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if self.in_overflow {
                        continue;
                    }
                    if tag.channel == self.click_channel {
                        let warmed = self
                            .warmup_until
                            .is_some_and(|until| tag.time >= until);
                        while self
                            .starts
                            .front()
                            .is_some_and(|s| tag.time - *s >= self.span())
                        {
                            self.starts.pop_front();
                        }
                        if warmed {
                            for start in &self.starts {
                                if let Some(bin) = bin_lookup(&self.edges, tag.time - *start) {
                                    self.counts[bin] += 1;
                                }
                            }
                        }
                    }
                    if tag.channel == self.start_channel {
                        self.starts.push_back(tag.time);
                    }
                }
                TagKind::OverflowBegin => {
                    self.in_overflow = true;
                    self.starts.clear();
                }
                TagKind::OverflowEnd => {
                    self.in_overflow = false;
                    self.restart_warmup(tag.time);
                }
                TagKind::Error => self.starts.clear(),
                TagKind::MissedEvents => {}
            }
        }
        Ok(false)
    }

    fn clear(&mut self) {
        self.counts.fill(0);
        self.starts.clear();
        self.warmup_until = None;
    }
}

fn bin_lookup(edges: &[Timestamp], dt: Timestamp) -> Option<usize> {
    if dt < edges[0] || dt >= *edges.last().expect("edges are never empty") {
        return None;
    }
    let bin = match edges.binary_search(&dt) {
        Ok(i) => i,
        Err(i) => i - 1,
    };
    Some(bin.min(edges.len() - 2))
}

impl MeasurementHandle<HistogramLogBinsState> {
    pub fn new(
        engine: &StreamEngine,
        click_channel: ChannelId,
        start_channel: ChannelId,
        exp_start: f64,
        exp_stop: f64,
        n_bins: usize,
    ) -> Result<HistogramLogBins, ConfigError> {
        validate_input(click_channel, "HistogramLogBins click channel")?;
        validate_input(start_channel, "HistogramLogBins start channel")?;
        if n_bins == 0 {
            return Err(ConfigError::NonPositive {
                what: "n_bins",
                value: 0,
            });
        }
        if exp_stop <= exp_start {
            return Err(ConfigError::Invalid {
                what: "HistogramLogBins",
                detail: format!("exp_stop {exp_stop} must exceed exp_start {exp_start}"),
            });
        }
        let registered = BTreeSet::from([click_channel, start_channel]);
        Ok(attach_measurement(
            engine,
            HistogramLogBinsState::new(click_channel, start_channel, exp_start, exp_stop, n_bins),
            AttachSpec {
                label: "HistogramLogBins",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Absolute counts per bin.
    pub fn counts(&self) -> Vec<u64> {
        self.with(|m| m.counts.clone())
    }

    /// Counts normalized by the width of each bin.
    pub fn counts_per_ps(&self) -> Vec<f64> {
        self.with(|m| {
            m.counts
                .iter()
                .enumerate()
                .map(|(i, &c)| {
                    let width = (m.edges[i + 1] - m.edges[i]) as f64;
                    c as f64 / width
                })
                .collect()
        })
    }

    /// Bin edges in picoseconds, `n_bins + 1` values.
    pub fn bin_edges(&self) -> Vec<Timestamp> {
        self.with(|m| m.edges.clone())
    }
}
