//! Record wire format and the incremental record parser.
//!
//! Decompressed stream layout, repeated until the last bunch is drained:
//!
//! ```text
//! owner_len:u8 | owner | path_len:u8 | path | content_len:u32 (big-endian) | content
//! ```
//!
//! There is no end marker. The parser never assumes a chunk boundary lines up
//! with a field boundary: it keeps partial fields across calls and only moves
//! to the next phase once a field is complete.

use crate::error::{Result, TransferError};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Largest owner tag or relative path the 1-byte length prefix can describe.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Largest record content the 4-byte length prefix can describe.
pub const MAX_CONTENT_LEN: u64 = u32::MAX as u64;

/// Size of the working buffer used when pulling content out of the decoder,
/// and of the chunks read from content sources on the producer side.
pub const WORK_BUFFER_SIZE: usize = 1024;

/// Identifies one record: the owner tag (mod name) and its relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub owner: String,
    pub path: String,
}

impl RecordKey {
    pub fn new(owner: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.path)
    }
}

/// Encode the header that precedes a record's content bytes.
pub fn encode_header(owner: &str, path: &str, content_len: u64) -> Result<BytesMut> {
    check_name("owner tag", owner)?;
    check_name("relative path", path)?;
    if content_len > MAX_CONTENT_LEN {
        return Err(TransferError::ContentTooLarge {
            key: RecordKey::new(owner, path).to_string(),
            len: content_len,
            max: MAX_CONTENT_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(1 + owner.len() + 1 + path.len() + 4);
    buf.put_u8(owner.len() as u8);
    buf.put_slice(owner.as_bytes());
    buf.put_u8(path.len() as u8);
    buf.put_slice(path.as_bytes());
    buf.put_u32(content_len as u32);
    Ok(buf)
}

fn check_name(field: &'static str, value: &str) -> Result<()> {
    if value.len() > MAX_NAME_LEN {
        return Err(TransferError::NameTooLong {
            field,
            value: value.to_string(),
            len: value.len(),
        });
    }
    Ok(())
}

// =============================================================================
// Parser
// =============================================================================

/// Which field of the current record the parser is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    OwnerLen,
    OwnerBytes,
    PathLen,
    PathBytes,
    ContentLen,
    ContentBytes,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::OwnerLen => "owner length",
            Phase::OwnerBytes => "owner",
            Phase::PathLen => "path length",
            Phase::PathBytes => "path",
            Phase::ContentLen => "content length",
            Phase::ContentBytes => "content",
        };
        f.write_str(name)
    }
}

/// Receives parsed records as they stream out of the parser.
pub trait RecordSink {
    /// A record header is complete. `len` is the declared content length.
    fn begin(&mut self, key: &RecordKey, len: u32) -> Result<()>;

    /// Next slice of the current record's content.
    fn content(&mut self, key: &RecordKey, data: &[u8]) -> Result<()>;

    /// The current record's content is complete.
    fn end(&mut self, key: &RecordKey) -> Result<()>;
}

/// Incremental parser for the decompressed record stream.
#[derive(Debug)]
pub struct RecordParser {
    phase: Phase,
    /// Bytes still missing before the current phase completes.
    remaining: usize,
    /// Partial length prefix or name bytes.
    field: Vec<u8>,
    owner: String,
    current: Option<RecordKey>,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::OwnerLen,
            remaining: 1,
            field: Vec::with_capacity(MAX_NAME_LEN),
            owner: String::new(),
            current: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True when no record is partially parsed.
    pub fn at_record_boundary(&self) -> bool {
        self.phase == Phase::OwnerLen && self.field.is_empty()
    }

    /// Number of bytes the parser wants next, capped at `cap`.
    ///
    /// Asking the decoder for exactly this much keeps every decoder call
    /// inside one field. Never zero: empty fields are consumed eagerly.
    pub fn want(&self, cap: usize) -> usize {
        self.remaining.min(cap)
    }

    /// Feed decompressed bytes. Any length is accepted; bytes spanning several
    /// fields or records are split internally.
    pub fn accept<S: RecordSink>(&mut self, mut data: &[u8], sink: &mut S) -> Result<()> {
        while !data.is_empty() {
            let take = self.remaining.min(data.len());
            let (chunk, rest) = data.split_at(take);
            data = rest;

            if self.phase == Phase::ContentBytes {
                let key = self.current_key()?;
                sink.content(key, chunk)?;
                self.remaining -= take;
                if self.remaining == 0 {
                    self.finish_record(sink)?;
                }
            } else {
                self.field.extend_from_slice(chunk);
                self.remaining -= take;
                if self.remaining == 0 {
                    self.complete_field(sink)?;
                }
            }
        }
        Ok(())
    }

    fn current_key(&self) -> Result<&RecordKey> {
        self.current.as_ref().ok_or_else(|| TransferError::Framing {
            phase: self.phase,
            message: "content without a record header".to_string(),
        })
    }

    fn enter(&mut self, phase: Phase, remaining: usize) {
        self.phase = phase;
        self.remaining = remaining;
        self.field.clear();
    }

    /// Close the field in `self.field` and move on. Zero-length successors
    /// (empty owner, empty path, empty content) complete in the same call.
    fn complete_field<S: RecordSink>(&mut self, sink: &mut S) -> Result<()> {
        loop {
            match self.phase {
                Phase::OwnerLen => {
                    let len = self.field[0] as usize;
                    self.enter(Phase::OwnerBytes, len);
                }
                Phase::OwnerBytes => {
                    self.owner = self.take_string()?;
                    self.enter(Phase::PathLen, 1);
                }
                Phase::PathLen => {
                    let len = self.field[0] as usize;
                    self.enter(Phase::PathBytes, len);
                }
                Phase::PathBytes => {
                    let path = self.take_string()?;
                    self.current = Some(RecordKey::new(std::mem::take(&mut self.owner), path));
                    self.enter(Phase::ContentLen, 4);
                }
                Phase::ContentLen => {
                    let len = u32::from_be_bytes([
                        self.field[0],
                        self.field[1],
                        self.field[2],
                        self.field[3],
                    ]);
                    let key = self.current_key()?;
                    sink.begin(key, len)?;
                    if len == 0 {
                        self.finish_record(sink)?;
                        return Ok(());
                    }
                    self.enter(Phase::ContentBytes, len as usize);
                }
                Phase::ContentBytes => {
                    return Err(TransferError::Framing {
                        phase: self.phase,
                        message: "content phase has no length field".to_string(),
                    });
                }
            }
            if self.remaining > 0 {
                return Ok(());
            }
        }
    }

    fn finish_record<S: RecordSink>(&mut self, sink: &mut S) -> Result<()> {
        if let Some(key) = self.current.take() {
            sink.end(&key)?;
        }
        self.enter(Phase::OwnerLen, 1);
        Ok(())
    }

    fn take_string(&mut self) -> Result<String> {
        let bytes = std::mem::take(&mut self.field);
        String::from_utf8(bytes).map_err(|e| TransferError::Framing {
            phase: self.phase,
            message: format!("invalid UTF-8: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        begun: Vec<(RecordKey, u32)>,
        files: Vec<(RecordKey, Vec<u8>)>,
        current: Vec<u8>,
    }

    impl RecordSink for Collect {
        fn begin(&mut self, key: &RecordKey, len: u32) -> Result<()> {
            self.begun.push((key.clone(), len));
            self.current.clear();
            Ok(())
        }

        fn content(&mut self, _key: &RecordKey, data: &[u8]) -> Result<()> {
            self.current.extend_from_slice(data);
            Ok(())
        }

        fn end(&mut self, key: &RecordKey) -> Result<()> {
            self.files.push((key.clone(), std::mem::take(&mut self.current)));
            Ok(())
        }
    }

    fn stream(records: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (owner, path, content) in records {
            let header = encode_header(owner, path, content.len() as u64).unwrap();
            out.extend_from_slice(&header);
            out.extend_from_slice(content);
        }
        out
    }

    #[test]
    fn test_header_layout() {
        let header = encode_header("modA", "init.lua", 0x0102).unwrap();
        assert_eq!(header[0], 4);
        assert_eq!(&header[1..5], b"modA");
        assert_eq!(header[5], 8);
        assert_eq!(&header[6..14], b"init.lua");
        assert_eq!(&header[14..18], &[0, 0, 1, 2]);
    }

    #[test]
    fn test_header_rejects_long_names() {
        let long = "x".repeat(256);
        let err = encode_header(&long, "init.lua", 1).unwrap_err();
        assert!(matches!(err, TransferError::NameTooLong { len: 256, .. }));

        let err = encode_header("modA", &long, 1).unwrap_err();
        assert!(matches!(err, TransferError::NameTooLong { .. }));

        let max = "y".repeat(255);
        assert!(encode_header(&max, &max, 1).is_ok());
    }

    #[test]
    fn test_header_rejects_oversized_content() {
        let err = encode_header("modA", "big", MAX_CONTENT_LEN + 1).unwrap_err();
        assert!(matches!(err, TransferError::ContentTooLarge { .. }));
    }

    #[test]
    fn test_parse_whole_stream() {
        let data = stream(&[("modA", "init.lua", b"print(1)"), ("modB", "x.lua", b"y")]);
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        parser.accept(&data, &mut sink).unwrap();

        assert!(parser.at_record_boundary());
        assert_eq!(sink.files.len(), 2);
        assert_eq!(sink.files[0].0, RecordKey::new("modA", "init.lua"));
        assert_eq!(sink.files[0].1, b"print(1)");
        assert_eq!(sink.files[1].0.to_string(), "modB:x.lua");
    }

    #[test]
    fn test_parse_byte_at_a_time() {
        let content = vec![7u8; 3000];
        let data = stream(&[("modA", "a.lua", &content), ("", "b.lua", b"")]);
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        for byte in &data {
            parser.accept(std::slice::from_ref(byte), &mut sink).unwrap();
        }

        assert_eq!(sink.files.len(), 2);
        assert_eq!(sink.files[0].1, content);
        assert_eq!(sink.files[1].0, RecordKey::new("", "b.lua"));
        assert!(sink.files[1].1.is_empty());
    }

    #[test]
    fn test_zero_length_content_skips_content_phase() {
        let data = stream(&[("modA", "empty.lua", b"")]);
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        parser.accept(&data, &mut sink).unwrap();

        assert_eq!(sink.begun, vec![(RecordKey::new("modA", "empty.lua"), 0)]);
        assert_eq!(sink.files.len(), 1);
        assert_eq!(parser.phase(), Phase::OwnerLen);
        assert!(parser.at_record_boundary());
    }

    #[test]
    fn test_empty_owner_and_path() {
        let data = stream(&[("", "", b"abc")]);
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        parser.accept(&data, &mut sink).unwrap();
        assert_eq!(sink.files[0].0, RecordKey::new("", ""));
        assert_eq!(sink.files[0].1, b"abc");
    }

    #[test]
    fn test_want_tracks_phase() {
        let data = stream(&[("modA", "f", &[1u8; 5000])]);
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        assert_eq!(parser.want(WORK_BUFFER_SIZE), 1);

        parser.accept(&data[..1], &mut sink).unwrap();
        assert_eq!(parser.phase(), Phase::OwnerBytes);
        assert_eq!(parser.want(WORK_BUFFER_SIZE), 4);

        // owner, path_len, path, content_len
        parser.accept(&data[1..11], &mut sink).unwrap();
        assert_eq!(parser.phase(), Phase::ContentBytes);
        assert_eq!(parser.want(WORK_BUFFER_SIZE), WORK_BUFFER_SIZE);
        assert!(!parser.at_record_boundary());
    }

    #[test]
    fn test_partial_header_is_not_a_boundary() {
        let data = stream(&[("modA", "f", b"x")]);
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        parser.accept(&data[..3], &mut sink).unwrap();
        assert_eq!(parser.phase(), Phase::OwnerBytes);
        assert!(!parser.at_record_boundary());
    }

    #[test]
    fn test_invalid_utf8_path() {
        let data = [0u8, 2, 0xff, 0xfe, 0, 0, 0, 0];
        let mut parser = RecordParser::new();
        let mut sink = Collect::default();
        let err = parser.accept(&data, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Framing {
                phase: Phase::PathBytes,
                ..
            }
        ));
    }
}
