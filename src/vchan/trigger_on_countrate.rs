use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, Tag, TagKind, Timestamp};
use std::collections::{BTreeSet, VecDeque};

/// Injects trigger events when the rolling-window count rate crosses a
/// reference value.
///
/// The `above` channel fires when the rate rises to
/// `reference + hysteresis` coming from below, the `below` channel when it
/// falls to `reference - hysteresis` coming from above. Trigger tags are
/// placed at the trailing edge of the integration window; the very first
/// tag reflects the state once one full window has elapsed.
pub type TriggerOnCountrate = MeasurementHandle<TriggerOnCountrateState>;

pub struct TriggerOnCountrateState {
    input: ChannelId,
    reference: f64,
    hysteresis: f64,
    window: Timestamp,
    above_out: ChannelId,
    below_out: ChannelId,
    events: VecDeque<Timestamp>,
    above: Option<bool>,
    anchor: Option<Timestamp>,
    inject_requested: bool,
    in_overflow: bool,
}

impl TriggerOnCountrateState {
    fn rate(&self) -> f64 {
        self.events.len() as f64 / (self.window as f64 * 1e-12)
    }

    fn out_for(&self, above: bool) -> ChannelId {
        if above {
            self.above_out
        } else {
            self.below_out
        }
    }

    /// Emits the initial state tag once a full window has elapsed.
    fn settle_initial(&mut self, batch: &mut TagBatch<'_>, up_to: Timestamp, floor: Timestamp) -> bool {
        if self.above.is_some() {
            return false;
        }
        let Some(anchor) = self.anchor else {
            return false;
        };
        let ready_at = anchor + self.window;
        if up_to < ready_at {
            return false;
        }
        while self
            .events
            .front()
            .is_some_and(|t| *t < ready_at - self.window)
        {
            self.events.pop_front();
        }
        let above = self.rate() >= self.reference;
        self.above = Some(above);
        batch.emit(Tag::event(ready_at.max(floor), self.out_for(above)));
        true
    }

    /// Drops events that left the window ending at `edge`, emitting a
    /// falling trigger at the moment the rate crossed the threshold.
    fn evict(&mut self, batch: &mut TagBatch<'_>, edge: Timestamp, floor: Timestamp) -> bool {
        let mut modified = false;
        while self
            .events
            .front()
            .is_some_and(|t| *t < edge - self.window)
        {
            let left = self.events.pop_front().expect("front was present");
            if self.above == Some(true) && self.rate() <= self.reference - self.hysteresis {
                self.above = Some(false);
                batch.emit(Tag::event((left + self.window).max(floor), self.below_out));
                modified = true;
            }
        }
        modified
    }
}

impl Measurement for TriggerOnCountrateState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        if self.anchor.is_none() {
            self.anchor = Some(window.begin);
        }
        let mut modified = false;
        if self.inject_requested {
            self.inject_requested = false;
            if let Some(above) = self.above {
                if !self.in_overflow {
                    batch.emit(Tag::event(window.begin, self.out_for(above)));
                    modified = true;
                }
            }
        }
        let incoming = batch.len();
        for i in 0..incoming {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag if tag.channel == self.input => {
                    modified |= self.settle_initial(batch, tag.time, window.begin);
                    modified |= self.evict(batch, tag.time, window.begin);
                    self.events.push_back(tag.time);
                    if self.above == Some(false)
                        && self.rate() >= self.reference + self.hysteresis
                    {
                        self.above = Some(true);
                        batch.emit(Tag::event(tag.time, self.above_out));
                        modified = true;
                    }
                }
                TagKind::OverflowBegin => {
                    self.in_overflow = true;
                    self.events.clear();
                }
                TagKind::OverflowEnd => self.in_overflow = false,
                TagKind::Error => self.events.clear(),
                _ => {}
            }
        }
        if window.end > window.begin {
            modified |= self.settle_initial(batch, window.end - 1, window.begin);
            modified |= self.evict(batch, window.end - 1, window.begin);
        }
        Ok(modified)
    }

    fn clear(&mut self) {
        self.events.clear();
        self.above = None;
        self.anchor = None;
        self.inject_requested = false;
    }
}

impl MeasurementHandle<TriggerOnCountrateState> {
    pub fn new(
        engine: &StreamEngine,
        input_channel: ChannelId,
        reference_countrate: f64,
        hysteresis: f64,
        time_window: Timestamp,
    ) -> Result<TriggerOnCountrate, ConfigError> {
        validate_input(input_channel, "TriggerOnCountrate input")?;
        if time_window <= 0 {
            return Err(ConfigError::NonPositive {
                what: "time_window",
                value: time_window,
            });
        }
        if reference_countrate < 0.0 || hysteresis < 0.0 {
            return Err(ConfigError::Invalid {
                what: "TriggerOnCountrate",
                detail: "reference countrate and hysteresis must not be negative".into(),
            });
        }
        let allocator = engine.core().allocator();
        let above_out = allocator.allocate();
        let below_out = allocator.allocate();
        Ok(attach_measurement(
            engine,
            TriggerOnCountrateState {
                input: input_channel,
                reference: reference_countrate,
                hysteresis,
                window: time_window,
                above_out,
                below_out,
                events: VecDeque::new(),
                above: None,
                anchor: None,
                inject_requested: false,
                in_overflow: false,
            },
            AttachSpec {
                label: "TriggerOnCountrate",
                registered: BTreeSet::from([input_channel]),
                virtual_out: vec![above_out, below_out],
            },
        ))
    }

    pub fn channel_above(&self) -> ChannelId {
        self.with(|m| m.above_out)
    }

    pub fn channel_below(&self) -> ChannelId {
        self.with(|m| m.below_out)
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.with(|m| vec![m.above_out, m.below_out])
    }

    pub fn is_above(&self) -> bool {
        self.with(|m| m.above == Some(true))
    }

    pub fn is_below(&self) -> bool {
        self.with(|m| m.above == Some(false))
    }

    /// Count rate within the current integration window, in Hz.
    pub fn current_countrate(&self) -> f64 {
        self.with(|m| m.rate())
    }

    /// Requests a tag reflecting the current state. Returns false while the
    /// state is still undetermined or the stream is in overflow.
    pub fn inject_current_state(&self) -> bool {
        self.with_mut(|m| {
            if m.above.is_some() && !m.in_overflow {
                m.inject_requested = true;
                true
            } else {
                false
            }
        })
    }
}
