//! RelayStore node API.

use crate::commands::{
    reply_flag, CommandRegistry, COMPARE_AND_SWAP, NOOP, PUT_IF_ABSENT, REMOVE, SET,
};
use crate::config::Config;
use crate::errors::StoreError;
use crate::forward::{FollowerServer, LeaderForwarder};
use crate::mux::{MultiStream, DIAL_CODE_RAFT, DIAL_CODE_RPC};
use crate::raft::{Consensus, RaftConsensus, RaftSettings, Role};
use crate::state::{encode_entry, CommandCallback, CommandResult, StateMachine};
use crate::store::{ReadTxn, Store};
use log::{info, warn};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, ToSocketAddrs};

/// Consensus state directory, relative to the data directory.
pub const RAFT_DIR: &str = "raft";
/// Store directory, relative to the data directory.
pub const STORE_DIR: &str = "store";

/// The result of a submitted command.
///
/// Either waits for the command's callback or carries the error that kept
/// the command from being dispatched at all.
#[derive(Debug)]
pub struct Pending {
    inner: PendingInner,
}

#[derive(Debug)]
enum PendingInner {
    Waiting(CommandCallback),
    Failed(Option<StoreError>),
}

impl Pending {
    fn waiting(callback: CommandCallback) -> Self {
        Pending {
            inner: PendingInner::Waiting(callback),
        }
    }

    fn failed(error: StoreError) -> Self {
        Pending {
            inner: PendingInner::Failed(Some(error)),
        }
    }

    /// Cancels the command's callback. Returns `false` if it was already
    /// resolved.
    pub fn cancel(&self) -> bool {
        match &self.inner {
            PendingInner::Waiting(callback) => callback.cancel(),
            PendingInner::Failed(_) => false,
        }
    }
}

impl Future for Pending {
    type Output = CommandResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Waiting(callback) => Pin::new(callback).poll(cx),
            PendingInner::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(StoreError::Shutdown)))
            }
        }
    }
}

/// A member of a RelayStore cluster.
///
/// Commands can be issued on any node; followers relay them to the leader.
/// Every node applies every committed command to its own store.
#[derive(Debug)]
pub struct Node {
    addr: String,
    command_timeout: Duration,
    state: Arc<StateMachine>,
    consensus: Arc<RaftConsensus>,
    forwarder: LeaderForwarder,
    followers: async_mutex::Mutex<Option<FollowerServer>>,
    mux: MultiStream,
}

impl Node {
    /// Bind `addr` and start a node on it.
    pub async fn bind<A: ToSocketAddrs>(config: Config, addr: A) -> Result<Self, StoreError> {
        let listener = TcpListener::bind(addr).await?;
        Node::start(config, listener).await
    }

    /// Start a node serving on `listener` and wait until the cluster has a
    /// leader.
    ///
    /// The listener's local address must be one of the configured peers.
    /// The store keeps its contents across restarts. Entries the cluster
    /// replays to a restarted node are skipped if the store already holds
    /// them.
    pub async fn start(config: Config, listener: TcpListener) -> Result<Self, StoreError> {
        let addr = listener.local_addr()?.to_string();
        let raft_dir = config.data_dir.join(RAFT_DIR);
        let store_dir = config.data_dir.join(STORE_DIR);
        tokio::fs::create_dir_all(&raft_dir).await?;
        tokio::fs::create_dir_all(&store_dir).await?;
        let peers = resolve_peers(&config.peers).await?;

        let commands = CommandRegistry::new(&config.commands);
        let store = Store::open(&store_dir)?;
        let state = Arc::new(StateMachine::new(addr.clone(), store, commands)?);

        let mux = MultiStream::new(
            listener,
            config.dialer.clone(),
            &[DIAL_CODE_RAFT, DIAL_CODE_RPC],
            config.accept_backlog,
        )?;
        let raft_layer = mux.layer(DIAL_CODE_RAFT).ok_or(StoreError::Closed)?;
        let rpc_layer = mux.layer(DIAL_CODE_RPC).ok_or(StoreError::Closed)?;
        let settings = RaftSettings {
            heartbeat: config.heartbeat,
            election_timeout: config.election_timeout,
            snapshot_delta: config.snapshot_delta,
            dial_timeout: config.dial_timeout,
        };
        let consensus = Arc::new(RaftConsensus::start(
            &addr,
            peers,
            &raft_dir,
            raft_layer,
            state.clone(),
            settings,
        )?);
        let followers = FollowerServer::start(
            rpc_layer.clone(),
            consensus.clone(),
            config.command_timeout,
        );
        let forwarder = LeaderForwarder::new(addr.clone(), rpc_layer, config.dial_timeout);
        let node = Node {
            addr,
            command_timeout: config.command_timeout,
            state,
            consensus,
            forwarder,
            followers: async_mutex::Mutex::new(Some(followers)),
            mux,
        };

        match node
            .consensus
            .wait_for_leader(config.leader_wait, config.leader_poll)
            .await
        {
            Ok(leader) => {
                info!("node {} started, leader is {}", node.addr, leader);
                Ok(node)
            }
            Err(e) => {
                if let Err(close) = node.close().await {
                    warn!("couldn't shut down node {}: {}", node.addr, close);
                }
                Err(e)
            }
        }
    }

    /// Address other nodes know this node by.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Dispatch a command without waiting for its result.
    ///
    /// On the leader the command is proposed directly; on a follower it is
    /// relayed to the leader. A dispatch failure is reported through the
    /// returned [`Pending`].
    pub async fn submit(&self, name: &str, args: &[Vec<u8>]) -> Pending {
        if self.is_leader() {
            let callback = self.state.new_command();
            let entry = encode_entry(&self.addr, callback.request_no(), name, args);
            let applied = self.consensus.apply(entry, self.command_timeout);
            let canceller = callback.canceller();
            tokio::task::spawn(async move {
                if let Err(e) = applied.await {
                    canceller.fail(e);
                }
            });
            return Pending::waiting(callback);
        }
        match self
            .forwarder
            .dispatch(&*self.consensus, &self.state, name, args)
            .await
        {
            Ok(callback) => Pending::waiting(callback),
            Err(e) => Pending::failed(e),
        }
    }

    /// Execute a command on the cluster and wait for its result.
    pub async fn command(&self, name: &str, args: &[Vec<u8>]) -> CommandResult {
        let pending = self.submit(name, args).await;
        match tokio::time::timeout(self.command_timeout, pending).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }

    /// Begin a read-only transaction over this node's applied state.
    ///
    /// Reads may be stale; call [`Node::rsync`] first to observe every
    /// command committed before the call.
    pub fn read(&self) -> Result<ReadTxn, StoreError> {
        self.state.read_txn()
    }

    /// Address of the current leader, if one is known.
    pub fn leader(&self) -> Option<String> {
        self.consensus.leader()
    }

    /// Whether this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.consensus.role() == Role::Leader
    }

    /// Stop replicating to `addr`.
    ///
    /// Only the leader changes membership; on any other node this does
    /// nothing.
    pub async fn remove_peer(&self, addr: &str) -> Result<(), StoreError> {
        if !self.is_leader() {
            return Ok(());
        }
        self.consensus.remove_peer(addr).await
    }

    /// Wait until every command committed before this call has been applied
    /// on this node.
    pub async fn rsync(&self) -> Result<(), StoreError> {
        self.command(NOOP, &[]).await?;
        Ok(())
    }

    /// Shut the node down.
    pub async fn close(&self) -> Result<(), StoreError> {
        let result = self.consensus.shutdown().await;
        let followers = self.followers.lock().await.take();
        if let Some(followers) = followers {
            followers.close().await;
        }
        self.mux.close();
        self.state.shutdown();
        info!("node {} closed", self.addr);
        result
    }

    /// Store `value` under `key`.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.command(SET, &[key.to_vec(), value.to_vec()]).await?;
        Ok(())
    }

    /// Read `key` from this node's applied state.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.read()?.get(key)
    }

    /// Remove `key`, returning its previous value.
    ///
    /// An empty previous value is indistinguishable from a missing key.
    pub async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let previous = self.command(REMOVE, &[key.to_vec()]).await?;
        Ok(Some(previous).filter(|value| !value.is_empty()))
    }

    /// Store `value` under `key` unless the key exists. Returns whether the
    /// value was stored.
    pub async fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let reply = self
            .command(PUT_IF_ABSENT, &[key.to_vec(), value.to_vec()])
            .await?;
        Ok(reply_flag(&reply))
    }

    /// Replace the value of `key` with `new` if it currently equals
    /// `expected`. Returns whether the swap happened.
    pub async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, StoreError> {
        let reply = self
            .command(
                COMPARE_AND_SWAP,
                &[key.to_vec(), expected.to_vec(), new.to_vec()],
            )
            .await?;
        Ok(reply_flag(&reply))
    }
}

async fn resolve_peers(peers: &[String]) -> Result<Vec<String>, StoreError> {
    let mut resolved = Vec::with_capacity(peers.len());
    for peer in peers {
        let mut addrs = lookup_host(peer.as_str())
            .await
            .map_err(|source| StoreError::PeerResolution {
                addr: peer.clone(),
                source,
            })?;
        let addr = addrs.next().ok_or_else(|| StoreError::PeerResolution {
            addr: peer.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        })?;
        resolved.push(addr.to_string());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_peers() {
        let peers = vec!["127.0.0.1:7000".to_string(), "localhost:7001".to_string()];
        let resolved = resolve_peers(&peers).await.unwrap();
        assert_eq!(resolved[0], "127.0.0.1:7000");
        assert!(resolved[1].ends_with(":7001"));
    }

    #[tokio::test]
    async fn test_unresolvable_peer() {
        let peers = vec!["not an address".to_string()];
        let err = resolve_peers(&peers).await.unwrap_err();
        assert!(matches!(err, StoreError::PeerResolution { .. }));
    }

    #[tokio::test]
    async fn test_start_rejects_foreign_peer_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(vec!["127.0.0.1:1"], dir.path());
        let err = Node::bind(config, "127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, StoreError::NotInPeers { .. }));
        assert!(dir.path().join(RAFT_DIR).is_dir());
        assert!(dir.path().join(STORE_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_failed_pending_reports_error() {
        let pending = Pending::failed(StoreError::NoLeader);
        assert!(!pending.cancel());
        assert!(matches!(pending.await, Err(StoreError::NoLeader)));
    }
}
