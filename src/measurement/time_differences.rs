use crate::binning::FastBinning;
use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, TagKind, Timestamp};
use std::collections::{BTreeSet, VecDeque};

/// Multiple-start multiple-stop histogramming over one or more histograms.
///
/// Clicks are measured against every unmatched start within the histogram
/// range. A `next` channel advances the histogram index (wrapping counts as
/// a rollover), a `sync` channel resets it and gates accumulation.
pub type TimeDifferences = MeasurementHandle<TimeDifferencesState>;

/// Single multiple-start multiple-stop histogram; the special case of
/// [`TimeDifferences`] without index channels. Without a start channel the
/// click channel starts itself, yielding an autocorrelation.
pub type Histogram = MeasurementHandle<HistogramState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    WaitingSync,
    WaitingNext,
    Accumulating,
}

struct MultiStop {
    click_channel: ChannelId,
    start_channel: ChannelId,
    next_channel: Option<ChannelId>,
    sync_channel: Option<ChannelId>,
    binwidth: Timestamp,
    n_bins: usize,
    n_histograms: usize,
    binner: FastBinning,
    range: Timestamp,
    data: Vec<i32>,
    starts: VecDeque<Timestamp>,
    hist_index: usize,
    phase: SyncPhase,
    rollovers: u64,
    max_rollovers: Option<u64>,
    done: bool,
    in_overflow: bool,
}

impl MultiStop {
    fn new(
        click_channel: ChannelId,
        start_channel: ChannelId,
        next_channel: Option<ChannelId>,
        sync_channel: Option<ChannelId>,
        binwidth: Timestamp,
        n_bins: usize,
        n_histograms: usize,
    ) -> Self {
        let range = binwidth * n_bins as Timestamp;
        Self {
            click_channel,
            start_channel,
            next_channel,
            sync_channel,
            binwidth,
            n_bins,
            n_histograms,
            binner: FastBinning::new(binwidth as u64, (range - 1) as u64),
            range,
            data: vec![0; n_bins * n_histograms],
            starts: VecDeque::new(),
            hist_index: 0,
            phase: if sync_channel.is_some() {
                SyncPhase::WaitingSync
            } else {
                SyncPhase::Accumulating
            },
            rollovers: 0,
            max_rollovers: None,
            done: false,
            in_overflow: false,
        }
    }

    fn accumulating(&self) -> bool {
        self.phase == SyncPhase::Accumulating && !self.done
    }

    fn histogram_index(&self) -> i32 {
        match self.phase {
            SyncPhase::WaitingSync => -2,
            SyncPhase::WaitingNext => -1,
            SyncPhase::Accumulating => self.hist_index as i32,
        }
    }

    fn on_next(&mut self) {
        match self.phase {
            SyncPhase::WaitingNext => {
                self.hist_index = 0;
                self.phase = SyncPhase::Accumulating;
            }
            SyncPhase::Accumulating => {
                self.hist_index += 1;
                if self.hist_index == self.n_histograms {
                    self.hist_index = 0;
                    self.rollovers += 1;
                    if self.sync_channel.is_some() {
                        self.phase = SyncPhase::WaitingSync;
                    }
                    if self
                        .max_rollovers
                        .is_some_and(|max| self.rollovers >= max)
                    {
                        self.done = true;
                    }
                }
            }
            SyncPhase::WaitingSync => {}
        }
    }

    fn on_sync(&mut self) {
        self.phase = SyncPhase::WaitingNext;
    }

    fn on_click(&mut self, time: Timestamp) {
        if !self.accumulating() || self.in_overflow {
            return;
        }
        while self
            .starts
            .front()
            .is_some_and(|s| time - *s >= self.range)
        {
            self.starts.pop_front();
        }
        let base = self.hist_index * self.n_bins;
        for start in &self.starts {
            let dt = time - *start;
            if dt >= 0 && dt < self.range {
                let bin = self.binner.divide(dt as u64) as usize;
                self.data[base + bin] += 1;
            }
        }
    }

    fn process(&mut self, batch: &mut TagBatch<'_>) -> Result<(), NextError> {
        for i in 0..batch.len() {
            batch.check_abort()?;
            if self.done {
                batch.request_stop();
                return Ok(());
            }
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if Some(tag.channel) == self.sync_channel {
                        self.on_sync();
                    }
                    if Some(tag.channel) == self.next_channel {
                        self.on_next();
                    }
                    if tag.channel == self.click_channel {
                        self.on_click(tag.time);
                    }
                    if tag.channel == self.start_channel && !self.in_overflow {
                        self.starts.push_back(tag.time);
                    }
                }
                TagKind::OverflowBegin => {
                    self.in_overflow = true;
                    self.starts.clear();
                }
                TagKind::OverflowEnd => self.in_overflow = false,
                TagKind::Error => self.starts.clear(),
                TagKind::MissedEvents => {}
            }
        }
        if self.done {
            batch.request_stop();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.starts.clear();
        self.hist_index = 0;
        self.rollovers = 0;
        self.done = false;
        self.phase = if self.sync_channel.is_some() {
            SyncPhase::WaitingSync
        } else {
            SyncPhase::Accumulating
        };
    }

    fn index(&self) -> Vec<Timestamp> {
        (0..self.n_bins as i64).map(|i| i * self.binwidth).collect()
    }
}

pub struct TimeDifferencesState {
    core: MultiStop,
}

impl Measurement for TimeDifferencesState {
    fn next(&mut self, batch: &mut TagBatch<'_>, _window: BlockWindow) -> Result<bool, NextError> {
        self.core.process(batch)?;
        Ok(false)
    }

    fn clear(&mut self) {
        self.core.reset();
    }
}

pub struct HistogramState {
    core: MultiStop,
}

impl Measurement for HistogramState {
    fn next(&mut self, batch: &mut TagBatch<'_>, _window: BlockWindow) -> Result<bool, NextError> {
        self.core.process(batch)?;
        Ok(false)
    }

    fn clear(&mut self) {
        self.core.reset();
    }
}

fn validate_histogram_shape(binwidth: Timestamp, n_bins: usize) -> Result<(), ConfigError> {
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
    Ok(())
}

impl MeasurementHandle<TimeDifferencesState> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &StreamEngine,
        click_channel: ChannelId,
        start_channel: Option<ChannelId>,
        next_channel: Option<ChannelId>,
        sync_channel: Option<ChannelId>,
        binwidth: Timestamp,
        n_bins: usize,
        n_histograms: usize,
    ) -> Result<TimeDifferences, ConfigError> {
        validate_input(click_channel, "TimeDifferences click channel")?;
        validate_histogram_shape(binwidth, n_bins)?;
        if n_histograms == 0 {
            return Err(ConfigError::NonPositive {
                what: "n_histograms",
                value: 0,
            });
        }
        let start = match start_channel {
            Some(ch) => validate_input(ch, "TimeDifferences start channel")?,
            None => click_channel,
        };
        let mut registered = BTreeSet::from([click_channel, start]);
        for ch in next_channel.iter().chain(sync_channel.iter()) {
            validate_input(*ch, "TimeDifferences index channel")?;
            registered.insert(*ch);
        }
        Ok(attach_measurement(
            engine,
            TimeDifferencesState {
                core: MultiStop::new(
                    click_channel,
                    start,
                    next_channel,
                    sync_channel,
                    binwidth,
                    n_bins,
                    n_histograms,
                ),
            },
            AttachSpec {
                label: "TimeDifferences",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Histograms as `n_histograms` rows of `n_bins` counts.
    pub fn data(&self) -> Vec<Vec<i32>> {
        self.with(|m| {
            m.core
                .data
                .chunks(m.core.n_bins)
                .map(|row| row.to_vec())
                .collect()
        })
    }

    /// Time bins in picoseconds.
    pub fn index(&self) -> Vec<Timestamp> {
        self.with(|m| m.core.index())
    }

    /// Caps the number of histogram-index rollovers to integrate.
    pub fn set_max_counts(&self, max_counts: u64) {
        self.with_mut(|m| m.core.max_rollovers = Some(max_counts));
    }

    /// Number of rollovers so far.
    pub fn counts(&self) -> u64 {
        self.with(|m| m.core.rollovers)
    }

    /// Index of the histogram being filled, or -2/-1 while waiting for
    /// sync/next.
    pub fn histogram_index(&self) -> i32 {
        self.with(|m| m.core.histogram_index())
    }

    /// True once the rollover cap from `set_max_counts` has been reached.
    pub fn ready(&self) -> bool {
        self.with(|m| m.core.done)
    }
}

impl MeasurementHandle<HistogramState> {
    pub fn new(
        engine: &StreamEngine,
        click_channel: ChannelId,
        start_channel: Option<ChannelId>,
        binwidth: Timestamp,
        n_bins: usize,
    ) -> Result<Histogram, ConfigError> {
        validate_input(click_channel, "Histogram click channel")?;
        validate_histogram_shape(binwidth, n_bins)?;
        let start = match start_channel {
            Some(ch) => validate_input(ch, "Histogram start channel")?,
            None => click_channel,
        };
        let registered = BTreeSet::from([click_channel, start]);
        Ok(attach_measurement(
            engine,
            HistogramState {
                core: MultiStop::new(click_channel, start, None, None, binwidth, n_bins, 1),
            },
            AttachSpec {
                label: "Histogram",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    pub fn data(&self) -> Vec<i32> {
        self.with(|m| m.core.data.clone())
    }

    pub fn index(&self) -> Vec<Timestamp> {
        self.with(|m| m.core.index())
    }
}
