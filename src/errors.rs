//! RelayStore errors.

use std::time::Duration;
use thiserror::Error;

/// Errors encountered by a RelayStore node.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    SQLiteError(#[from] sqlite::Error),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Consensus transport error.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// A message could not be decoded.
    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),
    /// A peer address is not a valid endpoint URI.
    #[error("invalid endpoint: {0}")]
    InvalidUri(#[from] tonic::codegen::http::uri::InvalidUri),
    /// The peer closed the connection in the middle of a protocol exchange.
    #[error("connection closed by {0}")]
    ConnectionClosed(String),
    /// The stream layer is closed.
    #[error("stream layer closed")]
    Closed,
    /// The same dial code was registered twice with a multiplexer.
    #[error("dial code {0} registered more than once")]
    DuplicateDialCode(u8),
    /// A command name with no registered executor.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    /// The command executor returned an error.
    #[error("command `{name}` failed: {error:#}")]
    CommandFailed {
        /// Name of the failed command.
        name: String,
        /// Error returned by the executor.
        error: anyhow::Error,
    },
    /// The command was cancelled before it was applied.
    #[error("command cancelled")]
    Cancelled,
    /// The operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The consensus module dropped the proposal.
    #[error("proposal abandoned by the consensus module")]
    Abandoned,
    /// No leader is currently known.
    #[error("no leader elected")]
    NoLeader,
    /// The leader could not be reached.
    #[error("couldn't connect to leader at {addr}: {source}")]
    LeaderUnreachable {
        /// Address of the leader.
        addr: String,
        /// Underlying error.
        source: Box<StoreError>,
    },
    /// No leader was observed during startup.
    #[error("timed out with no leader elected after {0:?}")]
    ElectionTimeout(Duration),
    /// A peer address could not be resolved.
    #[error("couldn't resolve peer address {addr}: {source}")]
    PeerResolution {
        /// The unresolvable address.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The local address is missing from the peer set.
    #[error("local address {addr} not included in peers {peers:?}")]
    NotInPeers {
        /// Local address.
        addr: String,
        /// Configured peers.
        peers: Vec<String>,
    },
    /// The peer is not a member of the cluster.
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    /// A node cannot remove itself from the cluster.
    #[error("node {0} cannot remove itself")]
    RemoveSelf(String),
    /// The node is shutting down.
    #[error("node is shut down")]
    Shutdown,
}
