//! Producer side: serializes records, compresses them as one zstd stream and
//! slices the compressed output into fixed-size bunches.

use crate::error::{Result, TransferError};
use crate::sources::SourceFile;
use crate::streaming::record::{encode_header, RecordKey, WORK_BUFFER_SIZE};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Read};
use zstd::stream::raw::{Encoder, InBuffer, Operation, OutBuffer};

/// Default compressed bytes per bunch.
pub const DEFAULT_BUNCH_SIZE: usize = 1024;

/// Default zstd compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// One transport message: a slice of the compressed stream and its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bunch {
    pub index: u32,
    pub payload: Bytes,
}

impl Bunch {
    pub fn new(index: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Packer configuration
#[derive(Debug, Clone)]
pub struct PackerConfig {
    /// Compressed bytes per bunch (the last bunch may be shorter)
    pub bunch_size: usize,
    /// zstd compression level
    pub level: i32,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            bunch_size: DEFAULT_BUNCH_SIZE,
            level: DEFAULT_LEVEL,
        }
    }
}

/// Producer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackStats {
    pub records: u64,
    pub content_bytes: u64,
    pub compressed_bytes: u64,
    pub bunches: u32,
}

/// Streams records through a zstd encoder into bunches.
pub struct Packer {
    encoder: Option<Encoder<'static>>,
    bunch_size: usize,
    /// Current output bunch, filled up to `out_pos`.
    out: Vec<u8>,
    out_pos: usize,
    next_index: u32,
    bunches: Vec<Bunch>,
    stats: PackStats,
    /// Set once a record was cut short inside the compressed stream.
    failed: bool,
}

impl Packer {
    pub fn new(config: PackerConfig) -> Result<Self> {
        if config.bunch_size == 0 {
            return Err(TransferError::Config("bunch size must be at least 1".into()));
        }
        if u32::try_from(config.bunch_size).is_err() {
            return Err(TransferError::Config(format!(
                "bunch size {} does not fit the 32-bit length field",
                config.bunch_size
            )));
        }
        let encoder = Encoder::new(config.level)
            .map_err(|e| TransferError::compression("encoder initialization", e))?;

        Ok(Self {
            encoder: Some(encoder),
            bunch_size: config.bunch_size,
            out: vec![0u8; config.bunch_size],
            out_pos: 0,
            next_index: 0,
            bunches: Vec::new(),
            stats: PackStats::default(),
            failed: false,
        })
    }

    /// Add a record whose content is already in memory.
    pub fn add_record(&mut self, owner: &str, path: &str, content: &[u8]) -> Result<()> {
        self.add_reader(owner, path, content.len() as u64, content)
    }

    /// Add a record of `len` bytes read from `reader` in working-buffer chunks.
    ///
    /// Header errors (oversized names or content) leave the packer usable.
    /// Any failure after the header entered the compressed stream is
    /// terminal: every later call fails and no bunches are handed out.
    pub fn add_reader<R: Read>(
        &mut self,
        owner: &str,
        path: &str,
        len: u64,
        reader: R,
    ) -> Result<()> {
        self.ensure_open()?;
        let header = encode_header(owner, path, len)?;

        let result = self.stream_record(owner, path, &header, len, reader);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Add a file collected from disk. Exactly `source.len` bytes are read.
    pub fn add_source(&mut self, source: &SourceFile) -> Result<()> {
        let file =
            File::open(&source.disk_path).map_err(|e| TransferError::io(&source.disk_path, e))?;
        self.add_reader(&source.owner, &source.path, source.len, BufReader::new(file))
    }

    /// Flush the encoder to the end of the frame, emit the final partial
    /// bunch and release the encoder. Returns the total bunch count.
    pub fn finish(&mut self) -> Result<u32> {
        if self.failed {
            return Err(failed_error());
        }
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| TransferError::protocol("Packer already finished"))?;

        if let Err(e) = self.flush_frame(&mut encoder) {
            self.fail(&e);
            return Err(e);
        }
        self.out = Vec::new();

        tracing::debug!(
            "Packed {} records into {} bunches ({} -> {} bytes)",
            self.stats.records,
            self.stats.bunches,
            self.stats.content_bytes,
            self.stats.compressed_bytes
        );
        Ok(self.next_index)
    }

    pub fn is_finished(&self) -> bool {
        self.encoder.is_none() && !self.failed
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Move out the bunches emitted so far. Empty once the packer failed.
    pub fn take_bunches(&mut self) -> Vec<Bunch> {
        std::mem::take(&mut self.bunches)
    }

    /// Remaining bunches of a finished packer.
    pub fn into_bunches(self) -> Result<Vec<Bunch>> {
        if self.failed {
            return Err(failed_error());
        }
        if !self.is_finished() {
            return Err(TransferError::protocol(
                "Packer must be finished before its bunches are final",
            ));
        }
        Ok(self.bunches)
    }

    pub fn stats(&self) -> &PackStats {
        &self.stats
    }

    fn ensure_open(&self) -> Result<()> {
        if self.failed {
            return Err(failed_error());
        }
        if self.encoder.is_none() {
            return Err(TransferError::protocol("Cannot add records after finish"));
        }
        Ok(())
    }

    fn fail(&mut self, cause: &TransferError) {
        tracing::warn!("Packer failed, discarding bundle: {}", cause);
        self.failed = true;
        self.encoder = None;
        self.bunches.clear();
        self.out = Vec::new();
        self.out_pos = 0;
    }

    fn stream_record<R: Read>(
        &mut self,
        owner: &str,
        path: &str,
        header: &[u8],
        len: u64,
        mut reader: R,
    ) -> Result<()> {
        self.compress(header)?;

        let mut buf = vec![0u8; WORK_BUFFER_SIZE];
        let mut left = len;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).map_err(|e| {
                TransferError::io(RecordKey::new(owner, path).to_string(), e)
            })?;
            if n == 0 {
                return Err(TransferError::io(
                    RecordKey::new(owner, path).to_string(),
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("content ended {} bytes early", left),
                    ),
                ));
            }
            self.compress(&buf[..n])?;
            left -= n as u64;
        }

        self.stats.records += 1;
        self.stats.content_bytes += len;
        tracing::debug!("Packed {}:{} ({} bytes)", owner, path, len);
        Ok(())
    }

    fn flush_frame(&mut self, encoder: &mut Encoder<'static>) -> Result<()> {
        loop {
            let mut output = OutBuffer::around_pos(&mut self.out[..], self.out_pos);
            let remaining = encoder
                .finish(&mut output, true)
                .map_err(|e| TransferError::compression("final flush", e))?;
            self.out_pos = output.pos();

            if self.out_pos == self.bunch_size {
                self.emit();
            }
            if remaining == 0 {
                break;
            }
        }
        if self.out_pos > 0 {
            self.emit();
        }
        Ok(())
    }

    /// Feed `data` to the encoder, emitting a bunch whenever the output fills.
    fn compress(&mut self, data: &[u8]) -> Result<()> {
        let mut input = InBuffer::around(data);
        while input.pos() < data.len() {
            let encoder = self
                .encoder
                .as_mut()
                .ok_or_else(|| TransferError::protocol("Cannot add records after finish"))?;
            let mut output = OutBuffer::around_pos(&mut self.out[..], self.out_pos);
            encoder
                .run(&mut input, &mut output)
                .map_err(|e| TransferError::compression("compression step", e))?;
            self.out_pos = output.pos();

            if self.out_pos == self.bunch_size {
                self.emit();
            }
        }
        Ok(())
    }

    fn emit(&mut self) {
        let payload = Bytes::copy_from_slice(&self.out[..self.out_pos]);
        tracing::trace!("Emitting bunch {} ({} bytes)", self.next_index, payload.len());
        self.stats.compressed_bytes += payload.len() as u64;
        self.stats.bunches += 1;
        self.bunches.push(Bunch::new(self.next_index, payload));
        self.next_index += 1;
        self.out_pos = 0;
    }
}

fn failed_error() -> TransferError {
    TransferError::protocol("Packer failed earlier; the bundle is incomplete")
}
