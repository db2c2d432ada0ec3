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

/// Fluorescence-lifetime imaging: one histogram per pixel, pixels advanced
/// by marker channels.
///
/// `pixel_begin` opens (or advances to) a pixel, `pixel_end` closes it,
/// `frame_begin` resets the pixel index and publishes the finished frame
/// through the frame callback. Clicks are binned relative to the most
/// recent start event.
pub type Flim = MeasurementHandle<FlimState>;

/// Construction parameters of a [`Flim`] measurement.
#[derive(Debug, Clone)]
pub struct FlimConfig {
    pub start_channel: ChannelId,
    pub click_channel: ChannelId,
    pub pixel_begin_channel: ChannelId,
    pub n_pixels: usize,
    pub n_bins: usize,
    pub binwidth: Timestamp,
    pub pixel_end_channel: Option<ChannelId>,
    pub frame_begin_channel: Option<ChannelId>,
    /// Stop after this many frames; zero keeps acquiring with one stored
    /// frame.
    pub finish_after_frames: u32,
}

/// A completed (or in-progress) frame of pixel histograms.
#[derive(Debug, Clone)]
pub struct FlimFrame {
    pub frame_number: u32,
    pub n_pixels: usize,
    pub n_bins: usize,
    /// Row-major `n_pixels` by `n_bins` histogram counts.
    pub histograms: Vec<u32>,
    pub pixel_begins: Vec<Timestamp>,
    pub pixel_ends: Vec<Timestamp>,
    /// Pixels acquired within this frame.
    pub pixel_position: u32,
    pub begin_time: Timestamp,
    pub end_time: Timestamp,
}

/// Callback invoked on the dispatcher thread whenever a frame completes.
pub type FrameCallback = Box<dyn FnMut(&FlimFrame) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelPhase {
    FrameIdle,
    PixelActive,
    PixelGap,
}

pub struct FlimState {
    config: FlimConfig,
    binner: FastBinning,
    time_window: Timestamp,
    phase: PixelPhase,
    pixel_index: usize,
    last_start: Option<Timestamp>,
    histograms: Vec<u32>,
    pixel_begins: Vec<Timestamp>,
    pixel_ends: Vec<Timestamp>,
    frame_begin_time: Timestamp,
    frames_completed: u32,
    stored: VecDeque<FlimFrame>,
    summed: Vec<u64>,
    acquiring: bool,
    callback: Option<FrameCallback>,
    in_overflow: bool,
}

impl FlimState {
    fn new(config: FlimConfig, callback: Option<FrameCallback>) -> Self {
        let time_window = config.binwidth * config.n_bins as Timestamp;
        let cells = config.n_pixels * config.n_bins;
        Self {
            binner: FastBinning::new(config.binwidth as u64, (time_window - 1) as u64),
            time_window,
            phase: PixelPhase::FrameIdle,
            pixel_index: 0,
            last_start: None,
            histograms: vec![0; cells],
            pixel_begins: vec![0; config.n_pixels],
            pixel_ends: vec![0; config.n_pixels],
            frame_begin_time: 0,
            frames_completed: 0,
            stored: VecDeque::new(),
            summed: vec![0; cells],
            acquiring: true,
            callback,
            in_overflow: false,
            config,
        }
    }

    fn stored_capacity(&self) -> usize {
        self.config.finish_after_frames.max(1) as usize
    }

    fn snapshot_frame(&self, end_time: Timestamp) -> FlimFrame {
        FlimFrame {
            frame_number: self.frames_completed,
            n_pixels: self.config.n_pixels,
            n_bins: self.config.n_bins,
            histograms: self.histograms.clone(),
            pixel_begins: self.pixel_begins.clone(),
            pixel_ends: self.pixel_ends.clone(),
            pixel_position: self.pixel_index as u32,
            begin_time: self.frame_begin_time,
            end_time,
        }
    }

    fn complete_frame(&mut self, at: Timestamp) -> bool {
        let frame = self.snapshot_frame(at);
        for (sum, &count) in self.summed.iter_mut().zip(&frame.histograms) {
            *sum += u64::from(count);
        }
        if let Some(callback) = self.callback.as_mut() {
            callback(&frame);
        }
        if self.stored.len() == self.stored_capacity() {
            self.stored.pop_front();
        }
        self.stored.push_back(frame);
        self.frames_completed += 1;
        self.histograms.fill(0);
        self.pixel_begins.fill(0);
        self.pixel_ends.fill(0);
        self.pixel_index = 0;
        self.phase = PixelPhase::FrameIdle;
        self.frame_begin_time = at;
        if self.config.finish_after_frames > 0
            && self.frames_completed >= self.config.finish_after_frames
        {
            self.acquiring = false;
            return true;
        }
        false
    }

    fn close_pixel(&mut self, at: Timestamp) {
        if self.phase == PixelPhase::PixelActive {
            self.pixel_ends[self.pixel_index] = at;
            self.pixel_index += 1;
            self.phase = PixelPhase::PixelGap;
        }
    }

    fn on_pixel_begin(&mut self, at: Timestamp) -> bool {
        if !self.acquiring {
            return false;
        }
        // Without a dedicated end channel the next pixel begin closes the
        // current pixel.
        if self.phase == PixelPhase::PixelActive && self.config.pixel_end_channel.is_none() {
            self.close_pixel(at);
        }
        let mut finished = false;
        if self.pixel_index >= self.config.n_pixels {
            if self.config.frame_begin_channel.is_none() {
                finished = self.complete_frame(at);
            } else {
                // Extra pixels before the frame marker are dropped.
                return false;
            }
        }
        if self.phase != PixelPhase::PixelActive && self.acquiring {
            if self.phase == PixelPhase::FrameIdle {
                self.frame_begin_time = at;
            }
            self.pixel_begins[self.pixel_index] = at;
            self.phase = PixelPhase::PixelActive;
        }
        finished
    }

    fn on_frame_begin(&mut self, at: Timestamp) -> bool {
        if !self.acquiring {
            return false;
        }
        self.close_pixel(at);
        self.complete_frame(at)
    }

    fn on_click(&mut self, at: Timestamp) {
        if self.phase != PixelPhase::PixelActive || self.in_overflow {
            return;
        }
        let Some(start) = self.last_start else {
            return;
        };
        let dt = at - start;
        if dt >= 0 && dt < self.time_window {
            let bin = self.binner.divide(dt as u64) as usize;
            self.histograms[self.pixel_index * self.config.n_bins + bin] += 1;
        }
    }
}

impl Measurement for FlimState {
    fn next(&mut self, batch: &mut TagBatch<'_>, _window: BlockWindow) -> Result<bool, NextError> {
        let mut stop = false;
        for i in 0..batch.len() {
            batch.check_abort()?;
            let tag = batch.get(i);
            match tag.kind {
                TagKind::TimeTag => {
                    if tag.channel == self.config.start_channel {
                        self.last_start = Some(tag.time);
                    }
                    if tag.channel == self.config.pixel_begin_channel {
                        stop |= self.on_pixel_begin(tag.time);
                    }
                    if Some(tag.channel) == self.config.pixel_end_channel {
                        self.close_pixel(tag.time);
                        if self.pixel_index >= self.config.n_pixels
                            && self.config.frame_begin_channel.is_none()
                        {
                            stop |= self.complete_frame(tag.time);
                        }
                    }
                    if Some(tag.channel) == self.config.frame_begin_channel {
                        stop |= self.on_frame_begin(tag.time);
                    }
                    if tag.channel == self.config.click_channel {
                        self.on_click(tag.time);
                    }
                }
                TagKind::OverflowBegin => {
                    self.in_overflow = true;
                    self.last_start = None;
                }
                TagKind::OverflowEnd => self.in_overflow = false,
                TagKind::Error => self.last_start = None,
                TagKind::MissedEvents => {}
            }
        }
        if stop {
            batch.request_stop();
        }
        Ok(false)
    }

    fn clear(&mut self) {
        let cells = self.config.n_pixels * self.config.n_bins;
        self.phase = PixelPhase::FrameIdle;
        self.pixel_index = 0;
        self.last_start = None;
        self.histograms = vec![0; cells];
        self.pixel_begins = vec![0; self.config.n_pixels];
        self.pixel_ends = vec![0; self.config.n_pixels];
        self.frames_completed = 0;
        self.stored.clear();
        self.summed = vec![0; cells];
        self.acquiring = true;
    }
}

impl MeasurementHandle<FlimState> {
    pub fn new(engine: &StreamEngine, config: FlimConfig) -> Result<Flim, ConfigError> {
        Self::with_callback(engine, config, None)
    }

    /// Variant with a frame-completion callback, invoked on the dispatcher
    /// thread; keep it fast and non-blocking.
    pub fn with_callback(
        engine: &StreamEngine,
        config: FlimConfig,
        callback: Option<FrameCallback>,
    ) -> Result<Flim, ConfigError> {
        validate_input(config.start_channel, "Flim start channel")?;
        validate_input(config.click_channel, "Flim click channel")?;
        validate_input(config.pixel_begin_channel, "Flim pixel begin channel")?;
        if config.binwidth <= 0 {
            return Err(ConfigError::NonPositive {
                what: "binwidth",
                value: config.binwidth,
            });
        }
        if config.n_bins == 0 || config.n_pixels == 0 {
            return Err(ConfigError::Invalid {
                what: "Flim",
                detail: "n_pixels and n_bins must be nonzero".into(),
            });
        }
        let mut registered = BTreeSet::from([
            config.start_channel,
            config.click_channel,
            config.pixel_begin_channel,
        ]);
        for ch in config
            .pixel_end_channel
            .iter()
            .chain(config.frame_begin_channel.iter())
        {
            validate_input(*ch, "Flim marker channel")?;
            registered.insert(*ch);
        }
        Ok(attach_measurement(
            engine,
            FlimState::new(config, callback),
            AttachSpec {
                label: "Flim",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Frames completed since creation or the last clear.
    pub fn frames_acquired(&self) -> u32 {
        self.with(|m| m.frames_completed)
    }

    /// False once the configured frame budget has been filled.
    pub fn is_acquiring(&self) -> bool {
        self.with(|m| m.acquiring)
    }

    /// A stored completed frame; `None` index selects the most recent.
    pub fn ready_frame(&self, index: Option<usize>) -> Option<FlimFrame> {
        self.with(|m| match index {
            Some(i) => m
                .stored
                .iter()
                .find(|frame| frame.frame_number == i as u32)
                .cloned(),
            None => m.stored.back().cloned(),
        })
    }

    /// Snapshot of the frame currently being acquired.
    pub fn current_frame(&self) -> FlimFrame {
        self.with(|m| m.snapshot_frame(m.frame_begin_time))
    }

    /// Per-pixel histograms summed over all completed frames.
    pub fn summed_frames(&self) -> Vec<u64> {
        self.with(|m| m.summed.clone())
    }

    /// Time bins of each pixel histogram in picoseconds.
    pub fn index(&self) -> Vec<Timestamp> {
        self.with(|m| {
            (0..m.config.n_bins as i64)
                .map(|i| i * m.config.binwidth)
                .collect()
        })
    }
}
