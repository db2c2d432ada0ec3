use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, Tag, TagKind};
use std::collections::{BTreeSet, HashMap};

/// Merges several channels into one virtual channel that ticks for every
/// tag on any input, at the input's timestamp.
pub type Combiner = MeasurementHandle<CombinerState>;

pub struct CombinerState {
    index_of: HashMap<ChannelId, usize>,
    out: ChannelId,
    counts: Vec<i64>,
}

impl Measurement for CombinerState {
    fn next(&mut self, batch: &mut TagBatch<'_>, _window: BlockWindow) -> Result<bool, NextError> {
        let mut modified = false;
        let incoming = batch.len();
        for i in 0..incoming {
            batch.check_abort()?;
            let tag = batch.get(i);
            if tag.kind != TagKind::TimeTag {
                continue;
            }
            if let Some(&idx) = self.index_of.get(&tag.channel) {
                self.counts[idx] += 1;
                batch.emit(Tag::event(tag.time, self.out));
                modified = true;
            }
        }
        Ok(modified)
    }

    fn clear(&mut self) {
        self.counts.fill(0);
    }
}

impl MeasurementHandle<CombinerState> {
    pub fn new(engine: &StreamEngine, channels: Vec<ChannelId>) -> Result<Combiner, ConfigError> {
        let mut registered = BTreeSet::new();
        for ch in &channels {
            validate_input(*ch, "Combiner channels")?;
            if !registered.insert(*ch) {
                return Err(ConfigError::DuplicateChannel {
                    channel: *ch,
                    what: "Combiner channels",
                });
            }
        }
        if registered.is_empty() {
            return Err(ConfigError::Invalid {
                what: "Combiner",
                detail: "at least one channel is required".into(),
            });
        }
        let out = engine.core().allocator().allocate();
        let index_of = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (*ch, i))
            .collect();
        let counts = vec![0; channels.len()];
        Ok(attach_measurement(
            engine,
            CombinerState {
                index_of,
                out,
                counts,
            },
            AttachSpec {
                label: "Combiner",
                registered,
                virtual_out: vec![out],
            },
        ))
    }

    /// The merged virtual channel.
    pub fn channel(&self) -> ChannelId {
        self.with(|m| m.out)
    }

    /// Ticks contributed per input channel.
    pub fn channel_counts(&self) -> Vec<i64> {
        self.with(|m| m.counts.clone())
    }
}
