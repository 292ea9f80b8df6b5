//! RelayStore node configuration.

use crate::commands::Command;
use crate::mux::{Dialer, TcpDialer};
use derivative::Derivative;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const LEADER_WAIT: Duration = Duration::from_secs(60);
const LEADER_POLL: Duration = Duration::from_secs(1);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);
const MIN_ELECTION_TIMEOUT: Duration = Duration::from_millis(750);
const MAX_ELECTION_TIMEOUT: Duration = Duration::from_millis(950);
const SNAPSHOT_DELTA: usize = 1000;
const ACCEPT_BACKLOG: usize = 64;

/// RelayStore node configuration.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Config {
    /// Addresses of every member of the cluster, including this node.
    pub peers: Vec<String>,
    /// Directory holding the consensus state and the store.
    pub data_dir: PathBuf,
    /// Caller-supplied commands; they win over built-ins of the same name.
    #[derivative(Debug = "ignore")]
    pub commands: HashMap<String, Command>,
    /// Opens physical connections to other nodes.
    #[derivative(Debug = "ignore")]
    pub dialer: Arc<dyn Dialer>,
    /// How long a command may take from submission to result.
    pub command_timeout: Duration,
    /// Timeout for dialing other nodes.
    pub dial_timeout: Duration,
    /// How long startup waits for a leader to be elected.
    pub leader_wait: Duration,
    /// Polling interval while waiting for a leader.
    pub leader_poll: Duration,
    /// Raft heartbeat interval.
    pub heartbeat: Duration,
    /// Range the Raft election timeout is drawn from.
    pub election_timeout: (Duration, Duration),
    /// Applied entries between Raft snapshots; zero disables them.
    pub snapshot_delta: usize,
    /// Connections each stream layer queues before they are accepted.
    pub accept_backlog: usize,
}

impl Config {
    /// Configuration with default timeouts for a node of the cluster `peers`.
    pub fn new<P, S>(peers: P, data_dir: impl Into<PathBuf>) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Config {
            peers: peers.into_iter().map(Into::into).collect(),
            data_dir: data_dir.into(),
            commands: HashMap::new(),
            dialer: Arc::new(TcpDialer),
            command_timeout: COMMAND_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            leader_wait: LEADER_WAIT,
            leader_poll: LEADER_POLL,
            heartbeat: HEARTBEAT_TIMEOUT,
            election_timeout: (MIN_ELECTION_TIMEOUT, MAX_ELECTION_TIMEOUT),
            snapshot_delta: SNAPSHOT_DELTA,
            accept_backlog: ACCEPT_BACKLOG,
        }
    }

    /// Registers a command executor under `name`.
    pub fn command(mut self, name: impl Into<String>, executor: Command) -> Self {
        self.commands.insert(name.into(), executor);
        self
    }
}
