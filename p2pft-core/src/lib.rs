//! p2pft protocol core: wire codec, checksum, chunk arithmetic, piece tracking.
//! No sockets; the node crate drives I/O and calls into these modules.

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod stall;
pub mod tracker;
pub mod wire;

pub use catalog::{Catalog, FileAddress, FileItem};
pub use chunk::{FragmentName, MissingRange};
pub use config::{ConfigError, TransferConfig, DEFAULT_CHUNK_SIZE};
pub use protocol::{ControlMessage, FileLookup, PeerEndpoint, ProtocolError, SharedFile};
pub use stall::{ProgressSample, StallDetector};
pub use tracker::{ChunkReceiveResult, PieceTracker, ReviewOutcome, TrackerError};
pub use wire::{decode_chunk_frame, encode_chunk_frame, ChunkFrame, FrameDecodeError, Inbound, StreamDecoder};
