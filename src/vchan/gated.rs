use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, Tag, TagKind};
use std::collections::BTreeSet;

/// Initial state of a [`GatedChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateInitial {
    Closed,
    Open,
}

/// Edge-sensitive gate: input events pass to the virtual channel only while
/// the gate is open. A start edge on an already open gate has no effect,
/// likewise a stop edge on a closed one.
pub type GatedChannel = MeasurementHandle<GatedChannelState>;

pub struct GatedChannelState {
    input: ChannelId,
    gate_start: ChannelId,
    gate_stop: ChannelId,
    initial: GateInitial,
    open: bool,
    out: ChannelId,
}

impl Measurement for GatedChannelState {
    fn next(&mut self, batch: &mut TagBatch<'_>, _window: BlockWindow) -> Result<bool, NextError> {
        let mut modified = false;
        let incoming = batch.len();
        for i in 0..incoming {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if tag.channel == self.gate_start {
                        self.open = true;
                    }
                    if tag.channel == self.gate_stop && tag.channel != self.gate_start {
                        self.open = false;
                    }
                    if tag.channel == self.input && self.open {
                        batch.emit(Tag::event(tag.time, self.out));
                        modified = true;
                    }
                }
                TagKind::Error => self.open = self.initial == GateInitial::Open,
                _ => {}
            }
        }
        Ok(modified)
    }

    fn clear(&mut self) {
        self.open = self.initial == GateInitial::Open;
    }
}

impl MeasurementHandle<GatedChannelState> {
    pub fn new(
        engine: &StreamEngine,
        input_channel: ChannelId,
        gate_start_channel: ChannelId,
        gate_stop_channel: ChannelId,
        initial: GateInitial,
    ) -> Result<GatedChannel, ConfigError> {
        validate_input(input_channel, "GatedChannel input")?;
        validate_input(gate_start_channel, "GatedChannel gate start")?;
        validate_input(gate_stop_channel, "GatedChannel gate stop")?;
        let registered = BTreeSet::from([input_channel, gate_start_channel, gate_stop_channel]);
        let out = engine.core().allocator().allocate();
        Ok(attach_measurement(
            engine,
            GatedChannelState {
                input: input_channel,
                gate_start: gate_start_channel,
                gate_stop: gate_stop_channel,
                initial,
                open: initial == GateInitial::Open,
                out,
            },
            AttachSpec {
                label: "GatedChannel",
                registered,
                virtual_out: vec![out],
            },
        ))
    }

    /// The gated virtual channel.
    pub fn channel(&self) -> ChannelId {
        self.with(|m| m.out)
    }
}
