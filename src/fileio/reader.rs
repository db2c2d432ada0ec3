use crate::fileio::codec::{parse_record, BlockRecord, CodecError, FileHeader, Record};
use crate::tag::{ChannelId, StreamBuffer, TagBlock};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Reads dump files produced by `FileWriter`.
///
/// Split chains are followed automatically; explicitly listed files are read
/// in order, each with its own chain. The pull interface mirrors the
/// streamer: every tag is returned exactly once.
pub struct FileReader {
    queue: VecDeque<PathBuf>,
    current: Option<CurrentFile>,
    header: Option<FileHeader>,
    last_marker: Option<String>,
    buffered: Option<BlockRecord>,
}

struct CurrentFile {
    lines: std::io::Lines<BufReader<File>>,
    base: PathBuf,
    seq: u32,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        Self::open_many(vec![path.as_ref().to_path_buf()])
    }

    /// Reads multiple recordings back to back.
    pub fn open_many(paths: Vec<PathBuf>) -> Result<Self, CodecError> {
        let mut reader = Self {
            queue: paths.into(),
            current: None,
            header: None,
            last_marker: None,
            buffered: None,
        };
        reader.advance_file()?;
        Ok(reader)
    }

    /// Channels recorded in the most recent file header.
    pub fn channel_list(&self) -> Vec<ChannelId> {
        self.header
            .as_ref()
            .map(|h| h.channels.clone())
            .unwrap_or_default()
    }

    /// Last marker record encountered so far.
    pub fn last_marker(&self) -> Option<String> {
        self.last_marker.clone()
    }

    /// True while more tags can be read.
    pub fn has_data(&mut self) -> Result<bool, CodecError> {
        if self.buffered.is_none() {
            self.buffered = self.next_block_record()?;
        }
        Ok(self.buffered.is_some())
    }

    /// Next recorded block with its original boundaries, or `None` at the
    /// end of all files.
    pub fn read_block(&mut self) -> Result<Option<TagBlock>, CodecError> {
        let record = match self.buffered.take() {
            Some(record) => record,
            None => match self.next_block_record()? {
                Some(record) => record,
                None => return Ok(None),
            },
        };
        Ok(Some(TagBlock::new(
            record.tags,
            record.begin,
            record.end,
            record.fence,
        )))
    }

    /// Fetches up to `n` tags. A short buffer signals the end of the files.
    pub fn read(&mut self, n: usize) -> Result<StreamBuffer, CodecError> {
        let mut buffer = StreamBuffer::default();
        while buffer.len() < n {
            let record = match self.buffered.take() {
                Some(record) => record,
                None => match self.next_block_record()? {
                    Some(record) => record,
                    None => break,
                },
            };
            if buffer.is_empty() {
                buffer.t_start = record.begin;
            }
            buffer.t_taken = record.end;
            let mut tags = record.tags.into_iter();
            for tag in tags.by_ref() {
                buffer.push(&tag);
                if buffer.len() == n {
                    break;
                }
            }
            let rest: Vec<_> = tags.collect();
            if !rest.is_empty() {
                // Partially consumed block: keep the remainder buffered.
                self.buffered = Some(BlockRecord {
                    begin: rest[0].time,
                    end: record.end,
                    fence: record.fence,
                    tags: rest,
                });
                break;
            }
        }
        Ok(buffer)
    }

    fn next_block_record(&mut self) -> Result<Option<BlockRecord>, CodecError> {
        loop {
            let current = match self.current.as_mut() {
                Some(current) => current,
                None => return Ok(None),
            };
            match current.lines.next() {
                Some(line) => match parse_record(&line?)? {
                    Record::Header(header) => self.header = Some(header),
                    Record::Marker { text } => self.last_marker = Some(text),
                    Record::Block(record) => return Ok(Some(record)),
                },
                None => {
                    // Follow the split chain before falling back to the
                    // next explicitly listed file.
                    let base = current.base.clone();
                    let seq = current.seq + 1;
                    let next = crate::fileio::codec::split_path(&base, seq);
                    if next.exists() {
                        self.open_file(next, base, seq)?;
                    } else {
                        self.current = None;
                        self.advance_file()?;
                        if self.current.is_none() {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    fn advance_file(&mut self) -> Result<(), CodecError> {
        if let Some(path) = self.queue.pop_front() {
            self.open_file(path.clone(), path, 0)?;
        }
        Ok(())
    }

    fn open_file(&mut self, path: PathBuf, base: PathBuf, seq: u32) -> Result<(), CodecError> {
        let file = File::open(&path)?;
        let mut lines = BufReader::new(file).lines();
        match lines.next() {
            Some(line) => match parse_record(&line?)? {
                Record::Header(header) if header.is_valid() => self.header = Some(header),
                _ => return Err(CodecError::BadHeader { path }),
            },
            None => return Err(CodecError::BadHeader { path }),
        }
        self.current = Some(CurrentFile { lines, base, seq });
        Ok(())
    }
}
