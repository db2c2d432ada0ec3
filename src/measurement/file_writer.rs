use crate::channel::validate_input;
use crate::config::ConfigError;
use crate::engine::core::StreamEngine;
use crate::fileio::codec::{split_path, write_record, BlockRecord, FileHeader, Record};
use crate::measurement::core::{
    attach_measurement, AttachSpec, BlockWindow, Measurement, MeasurementHandle, NextError,
    TagBatch,
};
use crate::tag::{ChannelId, TagKind};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// Persists the delivered stream as consecutive block records.
///
/// Block boundaries are written verbatim so a later replay reproduces the
/// recorded delivery. Files are split automatically once they grow past the
/// configured size; the limit is rough, a file may exceed it by one block.
pub type FileWriter = MeasurementHandle<FileWriterState>;

pub struct FileWriterState {
    channels: BTreeSet<ChannelId>,
    base_path: PathBuf,
    out: BufWriter<File>,
    split_seq: u32,
    bytes_current: u64,
    max_file_size: u64,
    total_events: u64,
    total_bytes: u64,
    pending_marker: Option<String>,
}

impl FileWriterState {
    fn create(path: PathBuf, channels: BTreeSet<ChannelId>) -> Result<Self, std::io::Error> {
        let mut state = Self {
            channels,
            out: BufWriter::new(File::create(&path)?),
            base_path: path,
            split_seq: 0,
            bytes_current: 0,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            total_events: 0,
            total_bytes: 0,
            pending_marker: None,
        };
        state.write_header()?;
        Ok(state)
    }

    fn write_header(&mut self) -> Result<(), std::io::Error> {
        let header = Record::Header(FileHeader::new(
            self.channels.iter().copied().collect(),
            self.split_seq,
        ));
        let written = write_record(&mut self.out, &header).map_err(io_like)?;
        self.bytes_current += written;
        self.total_bytes += written;
        Ok(())
    }

    fn split_to(&mut self, path: Option<PathBuf>) -> Result<(), std::io::Error> {
        self.out.flush()?;
        match path {
            Some(path) => {
                self.base_path = path;
                self.split_seq = 0;
            }
            None => self.split_seq += 1,
        }
        let next = split_path(&self.base_path, self.split_seq);
        self.out = BufWriter::new(File::create(next)?);
        self.bytes_current = 0;
        self.write_header()
    }
}

fn io_like(err: crate::fileio::codec::CodecError) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

impl Measurement for FileWriterState {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        if window.end == window.begin {
            return Ok(false);
        }
        if let Some(text) = self.pending_marker.take() {
            let written =
                write_record(&mut self.out, &Record::Marker { text }).map_err(io_like)?;
            self.bytes_current += written;
            self.total_bytes += written;
        }
        let tags: Vec<_> = batch
            .tags()
            .iter()
            .filter(|t| match t.kind {
                TagKind::TimeTag | TagKind::MissedEvents => self.channels.contains(&t.channel),
                _ => true,
            })
            .copied()
            .collect();
        self.total_events += tags.len() as u64;
        let record = Record::Block(BlockRecord {
            begin: window.begin,
            end: window.end,
            fence: window.fence,
            tags,
        });
        let written = write_record(&mut self.out, &record).map_err(io_like)?;
        self.bytes_current += written;
        self.total_bytes += written;
        if self.bytes_current >= self.max_file_size {
            self.split_to(None)?;
        }
        Ok(false)
    }

    fn on_stop(&mut self) {
        let _ = self.out.flush();
    }
}

impl MeasurementHandle<FileWriterState> {
    pub fn new(
        engine: &StreamEngine,
        path: impl AsRef<Path>,
        channels: Vec<ChannelId>,
    ) -> Result<FileWriter, ConfigError> {
        let mut registered = BTreeSet::new();
        for ch in &channels {
            validate_input(*ch, "FileWriter channels")?;
            registered.insert(*ch);
        }
        let state = FileWriterState::create(path.as_ref().to_path_buf(), registered.clone())
            .map_err(|err| ConfigError::Invalid {
                what: "FileWriter",
                detail: err.to_string(),
            })?;
        Ok(attach_measurement(
            engine,
            state,
            AttachSpec {
                label: "FileWriter",
                registered,
                virtual_out: Vec::new(),
            },
        ))
    }

    /// Closes the current file and continues in a new one; with `None` the
    /// split chain of the current name is extended.
    pub fn split(&self, new_path: Option<PathBuf>) -> Result<(), ConfigError> {
        self.with_mut(|m| m.split_to(new_path)).map_err(|err| {
            ConfigError::Invalid {
                what: "FileWriter split",
                detail: err.to_string(),
            }
        })
    }

    /// Rough per-file size limit in bytes for automatic splitting.
    pub fn set_max_file_size(&self, bytes: u64) {
        self.with_mut(|m| m.max_file_size = bytes.max(1));
    }

    pub fn max_file_size(&self) -> u64 {
        self.with(|m| m.max_file_size)
    }

    /// Tags persisted across all files so far.
    pub fn total_events(&self) -> u64 {
        self.with(|m| m.total_events)
    }

    /// Bytes persisted across all files so far.
    pub fn total_size(&self) -> u64 {
        self.with(|m| m.total_bytes)
    }

    /// Queues a marker record; the reader exposes the last one seen.
    pub fn set_marker(&self, marker: impl Into<String>) {
        self.with_mut(|m| m.pending_marker = Some(marker.into()));
    }

    /// Flushes buffered records to disk.
    pub fn flush(&self) -> Result<(), ConfigError> {
        self.with_mut(|m| m.out.flush()).map_err(|err| {
            ConfigError::Invalid {
                what: "FileWriter flush",
                detail: err.to_string(),
            }
        })
    }
}
