//! Frame messages that carry a bundle over a byte stream.
//!
//! Unidirectional: the producer writes HELLO, every BUNCH, then DONE.
//! Bunches may be written in any order.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::streaming::packer::Bunch;

/// Bundle protocol version (owner-tagged records)
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Frame format: len:u32 | type:u8 | payload (len counts payload bytes)

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Bunch = 0x02,
    Done = 0x03,
    Fatal = 0x04,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Bunch),
            0x03 => Some(Self::Done),
            0x04 => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Hello Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFlags: u32 {
        /// Every record starts with an owner tag.
        const OWNER_TAGS = 1 << 0;
    }
}

fn frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
    pub total_bunches: u32,
}

impl Hello {
    pub fn new(total_bunches: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: HelloFlags::OWNER_TAGS,
            total_bunches,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Hello, 10);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        buf.put_u32(self.total_bunches);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 10 {
            anyhow::bail!("Hello payload too short");
        }
        Ok(Self {
            version: payload.get_u16(),
            flags: HelloFlags::from_bits_truncate(payload.get_u32()),
            total_bunches: payload.get_u32(),
        })
    }
}

// =============================================================================
// BUNCH (0x02)
// =============================================================================

pub fn encode_bunch(bunch: &Bunch) -> Bytes {
    let mut buf = frame(MessageType::Bunch, 8 + bunch.payload.len());
    buf.put_u32(bunch.index);
    buf.put_u32(bunch.payload.len() as u32);
    buf.put_slice(&bunch.payload);
    buf.freeze()
}

pub fn decode_bunch(mut payload: Bytes) -> Result<Bunch> {
    if payload.remaining() < 8 {
        anyhow::bail!("Bunch payload too short");
    }
    let index = payload.get_u32();
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "Bunch {} truncated: expected {} bytes, got {}",
            index,
            len,
            payload.remaining()
        );
    }
    Ok(Bunch::new(index, payload.copy_to_bytes(len)))
}

// =============================================================================
// DONE (0x03)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub records: u64,
    pub content_bytes: u64,
}

impl Done {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Done, 16);
        buf.put_u64(self.records);
        buf.put_u64(self.content_bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            anyhow::bail!("Done payload too short");
        }
        Ok(Self {
            records: payload.get_u64(),
            content_bytes: payload.get_u64(),
        })
    }
}

// =============================================================================
// FATAL (0x04)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub fn encode(&self) -> Bytes {
        let msg = self.message.as_bytes();
        let msg = &msg[..msg.len().min(u16::MAX as usize)];
        let mut buf = frame(MessageType::Fatal, 4 + msg.len());
        buf.put_u16(self.code);
        buf.put_u16(msg.len() as u16);
        buf.put_slice(msg);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            anyhow::bail!("Fatal payload too short");
        }
        let code = payload.get_u16();
        let len = payload.get_u16() as usize;
        if payload.remaining() < len {
            anyhow::bail!("Fatal message truncated");
        }
        let message = String::from_utf8_lossy(&payload.copy_to_bytes(len)).into_owned();
        Ok(Self { code, message })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version and record variant are supported
    Supported(u16),
    /// Version is too old
    TooOld { peer: u16, min_supported: u16 },
    /// Version is too new
    TooNew { peer: u16, max_supported: u16 },
    /// Peer sends records without owner tags
    UntaggedRecords,
}

/// Check whether a peer's HELLO describes a stream we can parse.
pub fn negotiate(hello: &Hello) -> VersionNegotiationResult {
    if hello.version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            peer: hello.version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if hello.version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            peer: hello.version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else if !hello.flags.contains(HelloFlags::OWNER_TAGS) {
        VersionNegotiationResult::UntaggedRecords
    } else {
        VersionNegotiationResult::Supported(hello.version)
    }
}

// =============================================================================
// Tests
// =============================================================================
