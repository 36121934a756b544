//! Bundle transfer pipeline.
//!
//! Builds a bundle from source files, writes it as frames, and reads it back
//! into a destination store.

use crate::sources::SourceFile;
use crate::streaming::{
    packer::{Bunch, PackStats, Packer, PackerConfig},
    protocol::{
        decode_bunch, encode_bunch, negotiate, read_frame, write_frame, Done, Fatal, Hello,
        MessageType, VersionNegotiationResult,
    },
    store::DestinationStore,
    unpacker::Unpacker,
};
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Pack every source file into one bundle.
pub fn pack_sources(
    sources: &[SourceFile],
    config: PackerConfig,
) -> Result<(Vec<Bunch>, PackStats)> {
    let mut packer = Packer::new(config)?;
    for source in sources {
        packer
            .add_source(source)
            .with_context(|| format!("Failed to pack {}", source.disk_path.display()))?;
    }
    let total = packer.finish()?;
    let stats = packer.stats().clone();
    let bunches = packer.into_bunches()?;
    tracing::info!(
        "Packed {} records ({} bytes) into {} bunches ({} bytes compressed)",
        stats.records,
        stats.content_bytes,
        total,
        stats.compressed_bytes
    );
    Ok((bunches, stats))
}

/// Write a finished bundle: HELLO, every bunch in slice order, DONE.
pub async fn send_bundle<W>(writer: &mut W, bunches: &[Bunch], stats: &PackStats) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total = u32::try_from(bunches.len()).context("Too many bunches")?;

    write_frame(writer, &Hello::new(total).encode()).await?;
    for bunch in bunches {
        write_frame(writer, &encode_bunch(bunch)).await?;
    }
    let done = Done {
        records: stats.records,
        content_bytes: stats.content_bytes,
    };
    write_frame(writer, &done.encode()).await?;
    writer.flush().await?;

    tracing::debug!("Sent {} bunches", total);
    Ok(())
}

/// Report a failure to the peer before giving up.
pub async fn send_fatal<W>(writer: &mut W, code: u16, message: impl Into<String>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let fatal = Fatal {
        code,
        message: message.into(),
    };
    write_frame(writer, &fatal.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a bundle from `reader` into `store`.
///
/// The trailing DONE is checked against what was actually materialized.
/// Returns the completed unpacker.
pub async fn receive_bundle<R, S>(reader: &mut R, store: S, quota: u64) -> Result<Unpacker<S>>
where
    R: AsyncRead + Unpin,
    S: DestinationStore,
{
    // 1. HELLO
    let (msg_type, payload) = read_frame(reader).await?;
    let hello = match msg_type {
        MessageType::Hello => Hello::decode(payload)?,
        MessageType::Fatal => {
            let fatal = Fatal::decode(payload)?;
            anyhow::bail!("Remote fatal error: {}", fatal.message);
        }
        other => anyhow::bail!("Expected Hello, got {:?}", other),
    };
    match negotiate(&hello) {
        VersionNegotiationResult::Supported(_) => {}
        VersionNegotiationResult::TooOld {
            peer,
            min_supported,
        } => anyhow::bail!(
            "Peer protocol version {} is older than {}",
            peer,
            min_supported
        ),
        VersionNegotiationResult::TooNew {
            peer,
            max_supported,
        } => anyhow::bail!(
            "Peer protocol version {} is newer than {}",
            peer,
            max_supported
        ),
        VersionNegotiationResult::UntaggedRecords => {
            anyhow::bail!("Peer sends records without owner tags")
        }
    }

    let mut unpacker = Unpacker::new(hello.total_bunches, store, quota)?;
    tracing::debug!("Receiving {} bunches", hello.total_bunches);

    // 2. BUNCH frames until DONE
    loop {
        let (msg_type, payload) = read_frame(reader).await?;
        match msg_type {
            MessageType::Bunch => {
                let bunch = decode_bunch(payload)?;
                unpacker.submit_bunch(bunch.index, bunch.payload)?;
            }
            MessageType::Done => {
                let done = Done::decode(payload)?;
                if !unpacker.is_complete() {
                    anyhow::bail!(
                        "Stream ended before bunch {} of {}",
                        unpacker.next_index(),
                        unpacker.total_bunches()
                    );
                }
                let stats = unpacker.stats();
                if done.records != stats.records || done.content_bytes != stats.content_bytes {
                    anyhow::bail!(
                        "Bundle totals mismatch: sender reported {} records / {} bytes, \
                         received {} / {}",
                        done.records,
                        done.content_bytes,
                        stats.records,
                        stats.content_bytes
                    );
                }
                break;
            }
            MessageType::Fatal => {
                let fatal = Fatal::decode(payload)?;
                anyhow::bail!("Remote fatal error: {}", fatal.message);
            }
            MessageType::Hello => {
                anyhow::bail!("Unexpected Hello after transfer started");
            }
        }
    }

    let stats = unpacker.stats();
    tracing::info!(
        "Received {} records ({} bytes) in {} bunches, {} duplicates",
        stats.records,
        stats.content_bytes,
        stats.bunches,
        stats.duplicates
    );
    Ok(unpacker)
}
