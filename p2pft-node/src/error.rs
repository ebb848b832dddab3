//! Node error taxonomy. Only `BindExhausted` (and failing to listen at all) is fatal.

use std::io;

use p2pft_core::{ConfigError, TrackerError};

use crate::connection::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("could not connect to {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("could not bind a listening port in {base}..{end}")]
    BindExhausted { base: u16, end: u32 },
    #[error("connection table full ({capacity} connections)")]
    TableFull { capacity: usize },
    #[error("incomplete write: {written} of {expected} bytes")]
    IncompleteWrite { written: usize, expected: usize },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("no connection named {0:?}")]
    UnknownName(String),
    #[error("node already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
