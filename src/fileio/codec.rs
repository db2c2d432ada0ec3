use crate::tag::{ChannelId, Tag, Timestamp};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub(crate) const DUMP_FORMAT: &str = "tagstream-dump";
pub(crate) const DUMP_VERSION: u32 = 1;

/// Errors of the on-disk block codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{path}: not a tagstream dump")]
    BadHeader { path: PathBuf },
}

/// First record of every dump file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub format: String,
    pub version: u32,
    /// Channels the writer was configured to persist.
    pub channels: Vec<ChannelId>,
    /// Position of this file within a split chain, starting at zero.
    pub split_seq: u32,
}

impl FileHeader {
    pub(crate) fn new(channels: Vec<ChannelId>, split_seq: u32) -> Self {
        Self {
            format: DUMP_FORMAT.into(),
            version: DUMP_VERSION,
            channels,
            split_seq,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.format == DUMP_FORMAT && self.version == DUMP_VERSION
    }
}

/// One persisted block. Boundaries are kept verbatim so a replay reproduces
/// the recorded delivery exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BlockRecord {
    pub begin: Timestamp,
    pub end: Timestamp,
    pub fence: u32,
    pub tags: Vec<Tag>,
}

/// JSON-line record stream of a dump file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Record {
    Header(FileHeader),
    Block(BlockRecord),
    Marker { text: String },
}

/// Serializes one record as a JSON line, returning the bytes written.
pub(crate) fn write_record(out: &mut impl Write, record: &Record) -> Result<u64, CodecError> {
    let line = serde_json::to_string(record)?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(line.len() as u64 + 1)
}

pub(crate) fn parse_record(line: &str) -> Result<Record, CodecError> {
    Ok(serde_json::from_str(line)?)
}

/// Path of the `seq`-th file of a split chain.
pub(crate) fn split_path(base: &Path, seq: u32) -> PathBuf {
    if seq == 0 {
        base.to_path_buf()
    } else {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!(".{seq}"));
        PathBuf::from(name)
    }
}
