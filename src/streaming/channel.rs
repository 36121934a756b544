//! Bounded bunch channel.
//!
//! Bunches may arrive from several network callbacks at once, but an
//! [`Unpacker`] must be driven from one place. Producers clone the sender;
//! one task owns the receiver and the unpacker.

use crate::streaming::packer::Bunch;
use crate::streaming::store::DestinationStore;
use crate::streaming::unpacker::Unpacker;
use anyhow::Result;
use tokio::sync::mpsc;

/// Channel size for network callbacks -> unpacker task
pub const BUNCH_CHANNEL_SIZE: usize = 64;

/// Sender half handed to whatever receives bunches off the network
pub type BunchSender = mpsc::Sender<Bunch>;

/// Receiver half owned by the unpacker task
pub type BunchReceiver = mpsc::Receiver<Bunch>;

/// Create a bounded channel for bunch delivery
pub fn bunch_channel() -> (BunchSender, BunchReceiver) {
    mpsc::channel(BUNCH_CHANNEL_SIZE)
}

/// Feed bunches from `rx` into `unpacker` until the bundle is complete.
///
/// Returns the completed unpacker. If every sender is dropped first, the
/// transfer is reported as incomplete.
pub async fn drive_unpacker<S: DestinationStore>(
    mut rx: BunchReceiver,
    mut unpacker: Unpacker<S>,
) -> Result<Unpacker<S>> {
    while let Some(bunch) = rx.recv().await {
        if unpacker.submit_bunch(bunch.index, bunch.payload)? {
            return Ok(unpacker);
        }
    }
    anyhow::bail!(
        "Bunch channel closed with the transfer incomplete: waiting for bunch {} of {} \
         ({} buffered, {} bytes)",
        unpacker.next_index(),
        unpacker.total_bunches(),
        unpacker.pending_bunches(),
        unpacker.buffered_bytes()
    )
}
