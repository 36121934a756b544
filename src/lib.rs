//! bunchsync: compressed, out-of-order tolerant transfer of small file bundles.

pub mod config;
pub mod error;
pub mod sources;
pub mod streaming;

pub use config::Config;
pub use error::{ErrorCategory, Result, TransferError};
pub use sources::{collect_bundle, collect_dir, discover_owners, SourceFile, BUILTIN_OWNER};
pub use streaming::{
    Bunch, DestinationStore, DirStore, MemoryStore, PackStats, Packer, PackerConfig,
    UnpackStats, Unpacker,
};
