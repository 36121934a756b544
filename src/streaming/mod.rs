//! Bundle streaming for bunchsync.
//!
//! A bundle is a sequence of records compressed as one zstd stream and cut
//! into fixed-size bunches. Bunches may be delivered in any order; the
//! consumer reorders them and materializes records as soon as the bytes are
//! in sequence.
//!
//! # Architecture
//!
//! ```text
//! +--------------+     +--------------+     +--------------+     +-------------+
//! |    Packer    | --> |   Bunches    | --> |   Unpacker   | --> |    Store    |
//! | (records ->  |     | (any order,  |     | (reorder,    |     | (memory or  |
//! |  zstd frame) |     |  frames/mpsc)|     |  decode)     |     |  directory) |
//! +--------------+     +--------------+     +--------------+     +-------------+
//! ```
//!
//! # Record format
//!
//! ```text
//! ownerLen:u8 owner pathLen:u8 path contentLen:u32 (big-endian) content
//! ```

pub mod channel;
pub mod packer;
pub mod pipeline;
pub mod protocol;
pub mod record;
pub mod reorder;
pub mod store;
pub mod unpacker;

pub use channel::{bunch_channel, drive_unpacker, BunchReceiver, BunchSender, BUNCH_CHANNEL_SIZE};
pub use packer::{Bunch, PackStats, Packer, PackerConfig, DEFAULT_BUNCH_SIZE, DEFAULT_LEVEL};
pub use pipeline::{pack_sources, receive_bundle, send_bundle, send_fatal};
pub use protocol::{
    negotiate, read_frame, write_frame, Done, Fatal, Hello, HelloFlags, MessageType,
    VersionNegotiationResult, MAX_FRAME_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
pub use record::{Phase, RecordKey, RecordSink, MAX_NAME_LEN, WORK_BUFFER_SIZE};
pub use store::{DestinationStore, DirStore, MemoryStore};
pub use unpacker::{UnpackStats, Unpacker, DEFAULT_QUOTA};
