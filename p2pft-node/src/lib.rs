//! p2pft peer node: owns the sockets, runs the reactor, streams and receives chunks, and
//! watches active downloads. Protocol logic lives in `p2pft_core`.

pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod node;
pub mod transfer;

pub use config::Config;
pub use connection::{ConnectionId, ConnectionInfo, ConnectionRole, ConnectionTable, LISTENER_ID};
pub use error::NodeError;
pub use monitor::{MonitorReport, TransferMonitor};
pub use node::{PeerNode, QueuedMessage};
pub use transfer::SendJob;
