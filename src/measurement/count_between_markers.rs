use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, TagKind, Timestamp};
use std::collections::BTreeSet;

/// Counter whose bin edges are defined by marker signals.
///
/// A tag on the begin channel starts counting clicks; without an end
/// channel the next begin tag flushes the bin and restarts, with an end
/// channel the end tag flushes and counting pauses until the next begin.
/// The measurement stops itself once `n_values` bins are filled.
pub type CountBetweenMarkers = MeasurementHandle<CountBetweenMarkersState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitingBegin,
    Counting,
    Idle,
}

pub struct CountBetweenMarkersState {
    click_channel: ChannelId,
    begin_channel: ChannelId,
    end_channel: Option<ChannelId>,
    n_values: usize,
    phase: Phase,
    bin_begin: Timestamp,
    accumulating: i32,
    data: Vec<i32>,
    widths: Vec<Timestamp>,
    begins: Vec<Timestamp>,
}

impl CountBetweenMarkersState {
    fn new(
        click_channel: ChannelId,
        begin_channel: ChannelId,
        end_channel: Option<ChannelId>,
        n_values: usize,
    ) -> Self {
        Self {
            click_channel,
            begin_channel,
            end_channel,
            n_values,
            phase: Phase::WaitingBegin,
            bin_begin: 0,
            accumulating: 0,
            data: Vec::with_capacity(n_values),
            widths: Vec::with_capacity(n_values),
            begins: Vec::with_capacity(n_values),
        }
    }

    fn ready(&self) -> bool {
        self.data.len() == self.n_values
    }

    fn flush_bin(&mut self, at: Timestamp) {
        self.data.push(self.accumulating);
        self.widths.push(at - self.bin_begin);
        self.begins.push(self.bin_begin);
        self.accumulating = 0;
    }

    fn start_bin(&mut self, at: Timestamp) {
        self.phase = Phase::Counting;
        self.bin_begin = at;
        self.accumulating = 0;
    }
}

impl Measurement for CountBetweenMarkersState {
    fn next(&mut self, batch: &mut TagBatch<'_>, _window: BlockWindow) -> Result<bool, NextError> {
        for i in 0..batch.len() {
            batch.check_abort()?;
            if self.ready() {
                batch.request_stop();
                break;
            }
            let tag = batch.get(i);
            if tag.kind != TagKind::TimeTag {
                continue;
            }
            // Marker channels take precedence over clicks at equal times;
            // the stream order already reflects that.
            if tag.channel == self.begin_channel {
                match (self.phase, self.end_channel) {
                    (Phase::Counting, None) => {
                        self.flush_bin(tag.time);
                        if !self.ready() {
                            self.start_bin(tag.time);
                        } else {
                            self.phase = Phase::Idle;
                        }
                    }
                    (Phase::Counting, Some(_)) => {}
                    _ => self.start_bin(tag.time),
                }
                continue;
            }
            if Some(tag.channel) == self.end_channel {
                if self.phase == Phase::Counting {
                    self.flush_bin(tag.time);
                    self.phase = Phase::Idle;
                }
                continue;
            }
            if tag.channel == self.click_channel && self.phase == Phase::Counting {
                self.accumulating += 1;
            }
        }
        if self.ready() {
            batch.request_stop();
        }
        Ok(false)
    }

    fn clear(&mut self) {
        self.phase = Phase::WaitingBegin;
        self.accumulating = 0;
        self.data.clear();
        self.widths.clear();
        self.begins.clear();
    }
}

impl MeasurementHandle<CountBetweenMarkersState> {
    pub fn new(
        engine: &StreamEngine,
        click_channel: ChannelId,
        begin_channel: ChannelId,
        end_channel: Option<ChannelId>,
        n_values: usize,
    ) -> Result<CountBetweenMarkers, ConfigError> {
        validate_input(click_channel, "CountBetweenMarkers click channel")?;
        validate_input(begin_channel, "CountBetweenMarkers begin channel")?;
        if let Some(end) = end_channel {
            validate_input(end, "CountBetweenMarkers end channel")?;
        }
        if n_values == 0 {
            return Err(ConfigError::NonPositive {
                what: "n_values",
                value: 0,
            });
        }
        let mut registered = BTreeSet::from([click_channel, begin_channel]);
        registered.extend(end_channel);
        Ok(attach_measurement(
            engine,
            CountBetweenMarkersState::new(click_channel, begin_channel, end_channel, n_values),
            AttachSpec {
                label: "CountBetweenMarkers",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// True once all `n_values` bins are filled.
    pub fn ready(&self) -> bool {
        self.with(|m| m.ready())
    }

    /// Acquired counter values, zero-padded to `n_values`.
    pub fn data(&self) -> Vec<i32> {
        self.with(|m| {
            let mut data = m.data.clone();
            data.resize(m.n_values, 0);
            data
        })
    }

    /// Accumulation time of each filled bin.
    pub fn bin_widths(&self) -> Vec<Timestamp> {
        self.with(|m| m.widths.clone())
    }

    /// Starting time of each filled bin.
    pub fn index(&self) -> Vec<Timestamp> {
        self.with(|m| m.begins.clone())
    }
}
