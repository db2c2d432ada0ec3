//! Block-oriented time-tag stream engine.
//!
//! A [`source::Source`] produces contiguous, time-ordered [`tag::TagBlock`]s;
//! the engine's dispatcher thread fans every block out to the attached
//! measurements in registration order, merging virtual-channel output back
//! into the stream so later consumers observe it. Fences synchronize
//! configuration changes with the data path.

pub mod binning;
pub mod channel;
pub mod config;
pub mod fence;
pub mod logging;
pub mod tag;
pub mod telemetry;

pub mod source {
    pub mod assembler;
    pub mod core;
    pub mod injection;
    pub mod replay;

    pub use assembler::*;
    pub use injection::*;
    pub use replay::*;
    pub use self::core::*;
}

pub mod fileio {
    pub mod codec;
    pub mod reader;

    pub use codec::{CodecError, FileHeader};
    pub use reader::*;
}

pub mod engine {
    pub mod barrier;
    pub mod core;
    pub mod dispatcher;
    pub mod sync_group;

    pub use barrier::*;
    pub use self::core::*;
    pub use sync_group::*;
}

pub mod measurement {
    pub mod core;
    pub mod count_between_markers;
    pub mod counter;
    pub mod correlation;
    pub mod file_writer;
    pub mod flim;
    pub mod histogram_log_bins;
    pub mod stream_buffer;
    pub mod time_differences;

    pub use self::core::{
        attach_custom, BlockWindow, Measurement, MeasurementHandle, NextError, SlotStatus,
        TagBatch,
    };
    pub use correlation::*;
    pub use count_between_markers::*;
    pub use counter::*;
    pub use file_writer::*;
    pub use flim::*;
    pub use histogram_log_bins::*;
    pub use stream_buffer::*;
    pub use time_differences::*;
}

pub mod vchan {
    pub mod coincidences;
    pub mod combinations;
    pub mod combiner;
    pub mod delayed;
    pub mod gated;
    pub mod trigger_on_countrate;

    pub use coincidences::*;
    pub use combinations::*;
    pub use combiner::*;
    pub use delayed::*;
    pub use gated::*;
    pub use trigger_on_countrate::*;
}

pub use binning::{BinningMode, FastBinning};
pub use channel::{
    is_unused, is_virtual, unused_channel, ChannelRegistry, ChannelScheme,
    VirtualChannelAllocator, UNUSED_CHANNEL, UNUSED_CHANNEL_LEGACY, VIRTUAL_CHANNEL_BASE,
};
pub use config::{channel_scheme, set_channel_scheme, ConfigError, CHANNEL_SCHEME_ENV};
pub use engine::barrier::{OrderedBarrier, OrderedPipeline, OrderTicket};
pub use engine::core::{EngineConfig, StreamEngine};
pub use engine::sync_group::SynchronizedMeasurements;
pub use fence::FenceTracker;
pub use fileio::codec::CodecError;
pub use fileio::reader::FileReader;
pub use logging::{set_logger, LogLevel, LoggerCallback};
pub use measurement::core::{
    attach_custom, BlockWindow, Measurement, MeasurementHandle, NextError, SlotStatus, TagBatch,
};
pub use measurement::correlation::Correlation;
pub use measurement::count_between_markers::CountBetweenMarkers;
pub use measurement::counter::Counter;
pub use measurement::file_writer::FileWriter;
pub use measurement::flim::{Flim, FlimConfig, FlimFrame, FrameCallback};
pub use measurement::histogram_log_bins::HistogramLogBins;
pub use measurement::stream_buffer::TimeTagStream;
pub use measurement::time_differences::{Histogram, TimeDifferences};
pub use source::assembler::BlockPolicy;
pub use source::core::{Pull, Source, SourceError};
pub use source::injection::InjectionSource;
pub use source::replay::ReplaySource;
pub use tag::{ChannelId, StreamBuffer, Tag, TagBlock, TagKind, Timestamp};
pub use telemetry::{MeasurementTelemetry, TelemetryStore};
pub use vchan::coincidences::{CoincidenceTimestamp, Coincidences};
pub use vchan::combinations::Combinations;
pub use vchan::combiner::Combiner;
pub use vchan::delayed::DelayedChannel;
pub use vchan::gated::{GateInitial, GatedChannel};
pub use vchan::trigger_on_countrate::TriggerOnCountrate;
