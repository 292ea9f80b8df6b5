//! RelayStore consensus module.
//!
//! [`RaftConsensus`] drives a [Little Raft][1] replica on a blocking thread
//! and exposes it to the rest of the node through the [`Consensus`] trait.
//! Committed entries are handed to the [`StateMachine`] in log order.
//!
//! [1]: https://github.com/andreev-io/little-raft

use crate::errors::StoreError;
use crate::mux::StreamLayer;
use crate::rpc::proto::rpc_server::RpcServer;
use crate::rpc::{RpcService, RpcTransport};
use crate::state::StateMachine;
use async_notify::Notify;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel as channel;
use crossbeam_channel::Sender;
use derivative::Derivative;
use futures::future::BoxFuture;
use little_raft::{
    cluster::Cluster,
    message::Message,
    replica::{Replica, ReplicaID},
    state_machine::{
        Snapshot, StateMachine as RaftStateMachine, StateMachineTransition, TransitionState,
    },
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Name of the peer registry file inside the consensus directory.
pub const PEERS_FILE: &str = "peers";

/// Raft role of the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This replica is the leader.
    Leader,
    /// Another replica is the leader.
    Follower,
    /// No leader is known; an election may be in progress.
    Candidate,
}

/// Completion of a proposal: resolves once the entry has been applied locally.
pub type ApplyFuture = BoxFuture<'static, Result<(), StoreError>>;

/// What the node needs from its consensus module.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Propose `entry` for replication.
    ///
    /// The proposal is queued before this returns; the future only reports
    /// its outcome.
    fn apply(&self, entry: Bytes, timeout: Duration) -> ApplyFuture;

    /// Address of the current leader, if one is known.
    fn leader(&self) -> Option<String>;

    /// Role of the local replica.
    fn role(&self) -> Role;

    /// Stop replicating to the peer at `addr`.
    async fn remove_peer(&self, addr: &str) -> Result<(), StoreError>;

    /// Stop the replica and its transport.
    async fn shutdown(&self) -> Result<(), StoreError>;
}

/// Identifies a proposal by the replica that proposed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProposalId {
    /// Replica that proposed the entry.
    pub replica: usize,
    /// Per-replica proposal sequence number.
    pub seq: u64,
}

/// A replicated log entry.
#[derive(Clone, Debug)]
pub struct Proposal {
    /// Unique ID of this proposal.
    pub id: ProposalId,
    /// Encoded command; empty for the Raft no-op.
    pub data: Bytes,
}

impl StateMachineTransition for Proposal {
    type TransitionID = ProposalId;

    fn get_id(&self) -> Self::TransitionID {
        self.id
    }
}

/// Proposer of the no-op a new leader appends. Its sequence number carries
/// the id of the log the replica started.
const NOOP_REPLICA: usize = usize::MAX;

/// A fresh log id, distinct across restarts.
fn new_log_id(this_id: usize) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ (this_id as u64).rotate_right(16)) | 1
}

#[derive(Derivative)]
#[derivative(Debug)]
struct RaftState {
    /// ID of the local replica.
    this_id: usize,
    leader: Option<usize>,
    /// Log index of the last entry handed to the state machine.
    applied_index: usize,
    removed: HashSet<usize>,
    waiters: Vec<Arc<Notify>>,
    #[derivative(Debug = "ignore")]
    pending_messages: Vec<Message<Proposal, Bytes>>,
    transport: RpcTransport,
    halt: bool,
    #[derivative(Debug = "ignore")]
    state: Arc<StateMachine>,
    pending_transitions: Vec<Proposal>,
    #[derivative(Debug = "ignore")]
    proposals: HashMap<ProposalId, oneshot::Sender<Result<(), StoreError>>>,
    #[derivative(Debug = "ignore")]
    snapshot: Option<Snapshot<Bytes>>,
}

impl RaftStateMachine<Proposal, Bytes> for RaftState {
    fn register_transition_state(&mut self, transition_id: ProposalId, state: TransitionState) {
        let result = match state {
            TransitionState::Applied => Ok(()),
            TransitionState::Abandoned(_) => {
                debug!("proposal {:?} abandoned", transition_id);
                Err(StoreError::Abandoned)
            }
            _ => return,
        };
        if let Some(proposal) = self.proposals.remove(&transition_id) {
            let _ = proposal.send(result);
        }
    }

    fn apply_transition(&mut self, transition: Proposal) {
        self.applied_index += 1;
        let index = self.applied_index as u64;
        if transition.id.replica == NOOP_REPLICA {
            if index == 1 {
                self.state.begin_log(transition.id.seq);
            }
            return;
        }
        self.state.apply(index, &transition.data);
    }

    fn get_pending_transitions(&mut self) -> Vec<Proposal> {
        std::mem::take(&mut self.pending_transitions)
    }

    fn get_snapshot(&mut self) -> Option<Snapshot<Bytes>> {
        self.snapshot.clone()
    }

    fn create_snapshot(&mut self, index: usize, term: usize) -> Snapshot<Bytes> {
        let data = match self.state.snapshot() {
            Ok(data) => data,
            Err(e) => {
                error!("couldn't snapshot store at index {}: {}", index, e);
                self.snapshot
                    .as_ref()
                    .map(|s| s.data.clone())
                    .unwrap_or_default()
            }
        };
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            data,
        };
        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    fn set_snapshot(&mut self, snapshot: Snapshot<Bytes>) {
        info!(
            "installing snapshot up to index {}",
            snapshot.last_included_index
        );
        if let Err(e) = self
            .state
            .restore(snapshot.last_included_index as u64, &snapshot.data)
        {
            error!("couldn't restore snapshot: {}", e);
        }
        self.applied_index = snapshot.last_included_index;
        self.snapshot = Some(snapshot);
    }
}

impl Cluster<Proposal, Bytes> for RaftState {
    fn register_leader(&mut self, leader_id: Option<ReplicaID>) {
        if self.leader != leader_id {
            match leader_id {
                Some(id) if id == self.this_id => info!("replica {} is now the leader", id),
                Some(id) => info!("replica {} follows leader {}", self.this_id, id),
                None => info!("replica {} lost its leader", self.this_id),
            }
        }
        self.leader = leader_id;
        for waiter in std::mem::take(&mut self.waiters) {
            waiter.notify();
        }
    }

    fn send_message(&mut self, to_id: usize, message: Message<Proposal, Bytes>) {
        if self.removed.contains(&to_id) {
            return;
        }
        self.transport.send(to_id, message);
    }

    fn receive_messages(&mut self) -> Vec<Message<Proposal, Bytes>> {
        std::mem::take(&mut self.pending_messages)
    }

    fn halt(&self) -> bool {
        self.halt
    }
}

/// Messages received from other replicas, waiting for the replica loop.
#[derive(Debug)]
pub struct Inbox {
    state: Arc<Mutex<RaftState>>,
    notifier: Sender<()>,
}

impl Inbox {
    /// Queue a message for the local replica.
    pub fn push(&self, msg: Message<Proposal, Bytes>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.halt || state.removed.contains(&sender(&msg)) {
                return;
            }
            state.pending_messages.push(msg);
        }
        let _ = self.notifier.send(());
    }
}

fn sender(msg: &Message<Proposal, Bytes>) -> usize {
    match msg {
        Message::AppendEntryRequest { from_id, .. }
        | Message::AppendEntryResponse { from_id, .. }
        | Message::VoteRequest { from_id, .. }
        | Message::VoteResponse { from_id, .. }
        | Message::InstallSnapshotRequest { from_id, .. }
        | Message::InstallSnapshotResponse { from_id, .. } => *from_id,
    }
}

/// Raft tuning knobs.
#[derive(Debug, Clone)]
pub struct RaftSettings {
    /// Leader heartbeat interval.
    pub heartbeat: Duration,
    /// Range the randomized election timeout is drawn from.
    pub election_timeout: (Duration, Duration),
    /// Applied entries between snapshots; zero disables snapshotting.
    pub snapshot_delta: usize,
    /// Timeout for dialing other replicas.
    pub dial_timeout: Duration,
}

type ProposalReplica = Replica<RaftState, RaftState, Proposal, Bytes>;

/// Little Raft backed consensus module.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RaftConsensus {
    this_id: usize,
    peers: Arc<Vec<String>>,
    registry: PathBuf,
    next_seq: AtomicU64,
    state: Arc<Mutex<RaftState>>,
    #[derivative(Debug = "ignore")]
    message_notifier: Sender<()>,
    #[derivative(Debug = "ignore")]
    transition_notifier: Sender<()>,
    replica: async_mutex::Mutex<Option<JoinHandle<()>>>,
    server: async_mutex::Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl RaftConsensus {
    /// Start a replica as member `this_addr` of the cluster formed by `peers`.
    ///
    /// `peers` must be identical on every member: replica ids are positions
    /// in the sorted list. The peer registry is written to `dir`, Raft
    /// traffic is served and dialed on `layer`, and committed entries are
    /// applied to `state`.
    pub fn start(
        this_addr: &str,
        peers: Vec<String>,
        dir: &Path,
        layer: Arc<StreamLayer>,
        state: Arc<StateMachine>,
        settings: RaftSettings,
    ) -> Result<Self, StoreError> {
        let mut peers = peers;
        peers.sort();
        peers.dedup();
        let this_id = peers
            .iter()
            .position(|peer| peer == this_addr)
            .ok_or_else(|| StoreError::NotInPeers {
                addr: this_addr.to_string(),
                peers: peers.clone(),
            })?;
        let registry = dir.join(PEERS_FILE);
        std::fs::write(&registry, peers.join("\n"))?;
        let peers = Arc::new(peers);

        let transport = RpcTransport::new(peers.clone(), layer.clone(), settings.dial_timeout);
        let raft_state = Arc::new(Mutex::new(RaftState {
            this_id,
            leader: None,
            applied_index: 0,
            removed: HashSet::new(),
            waiters: Vec::new(),
            pending_messages: Vec::new(),
            transport,
            halt: false,
            state,
            pending_transitions: Vec::new(),
            proposals: HashMap::new(),
            snapshot: None,
        }));
        let (message_notifier_tx, message_notifier_rx) = channel::unbounded();
        let (transition_notifier_tx, transition_notifier_rx) = channel::unbounded();
        let peer_ids = (0..peers.len()).filter(|id| *id != this_id).collect();
        let noop = Proposal {
            id: ProposalId {
                replica: NOOP_REPLICA,
                seq: new_log_id(this_id),
            },
            data: Bytes::new(),
        };
        let mut replica: ProposalReplica = Replica::new(
            this_id,
            peer_ids,
            raft_state.clone(),
            raft_state.clone(),
            settings.snapshot_delta,
            noop,
            settings.heartbeat,
            settings.election_timeout,
        );
        let replica = tokio::task::spawn_blocking(move || {
            replica.start(message_notifier_rx, transition_notifier_rx);
        });

        let closed = CancellationToken::new();
        let inbox = Arc::new(Inbox {
            state: raft_state.clone(),
            notifier: message_notifier_tx.clone(),
        });
        let server = {
            let closed = closed.clone();
            tokio::task::spawn(async move {
                let rpc = RpcService::new(inbox);
                let ret = tonic::transport::Server::builder()
                    .add_service(RpcServer::new(rpc))
                    .serve_with_incoming_shutdown(layer.clone().incoming(), closed.cancelled())
                    .await;
                if let Err(e) = ret {
                    error!("consensus transport on {} failed: {}", layer.addr(), e);
                }
            })
        };
        info!(
            "replica {} started at {} with peers {:?}",
            this_id, this_addr, peers
        );

        Ok(RaftConsensus {
            this_id,
            peers,
            registry,
            next_seq: AtomicU64::new(1),
            state: raft_state,
            message_notifier: message_notifier_tx,
            transition_notifier: transition_notifier_tx,
            replica: async_mutex::Mutex::new(Some(replica)),
            server: async_mutex::Mutex::new(Some(server)),
            closed,
        })
    }

    /// Wait until a leader is known, polling every `poll`.
    pub async fn wait_for_leader(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> Result<String, StoreError> {
        let wait = async {
            loop {
                let notify = {
                    let mut state = self.state.lock().unwrap();
                    if let Some(leader) = state.leader {
                        return self.peers[leader].clone();
                    }
                    let notify = Arc::new(Notify::new());
                    state.waiters.push(notify.clone());
                    notify
                };
                // Re-check at least every `poll`.
                let _ = tokio::time::timeout(poll, notify.notified()).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StoreError::ElectionTimeout(timeout))
    }

    /// Peers this replica still replicates to, including itself.
    pub fn peers(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        self.peers
            .iter()
            .enumerate()
            .filter(|(id, _)| !state.removed.contains(id))
            .map(|(_, peer)| peer.clone())
            .collect()
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    fn apply(&self, entry: Bytes, timeout: Duration) -> ApplyFuture {
        let id = ProposalId {
            replica: self.this_id,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.halt {
                return Box::pin(async { Err(StoreError::Shutdown) });
            }
            state.proposals.insert(id, tx);
            state.pending_transitions.push(Proposal { id, data: entry });
        }
        let _ = self.transition_notifier.send(());
        let state = self.state.clone();
        Box::pin(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(StoreError::Shutdown),
                Err(_) => {
                    state.lock().unwrap().proposals.remove(&id);
                    Err(StoreError::Timeout(timeout))
                }
            }
        })
    }

    fn leader(&self) -> Option<String> {
        let leader = self.state.lock().unwrap().leader;
        leader.map(|id| self.peers[id].clone())
    }

    fn role(&self) -> Role {
        match self.state.lock().unwrap().leader {
            Some(id) if id == self.this_id => Role::Leader,
            Some(_) => Role::Follower,
            None => Role::Candidate,
        }
    }

    async fn remove_peer(&self, addr: &str) -> Result<(), StoreError> {
        let id = self
            .peers
            .iter()
            .position(|peer| peer == addr)
            .ok_or_else(|| StoreError::UnknownPeer(addr.to_string()))?;
        if id == self.this_id {
            return Err(StoreError::RemoveSelf(addr.to_string()));
        }
        let newly_removed = self.state.lock().unwrap().removed.insert(id);
        if newly_removed {
            warn!("removed peer {}; quorum size is unchanged", addr);
            tokio::fs::write(&self.registry, self.peers().join("\n")).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        let abandoned = {
            let mut state = self.state.lock().unwrap();
            state.halt = true;
            state.waiters.drain(..).for_each(|w| w.notify());
            std::mem::take(&mut state.proposals)
        };
        for (_, proposal) in abandoned {
            let _ = proposal.send(Err(StoreError::Shutdown));
        }
        let _ = self.message_notifier.send(());
        let _ = self.transition_notifier.send(());
        let replica = self.replica.lock().await.take();
        if let Some(replica) = replica {
            if let Err(e) = replica.await {
                error!("replica {} loop failed: {}", self.this_id, e);
            }
        }
        self.closed.cancel();
        let server = self.server.lock().await.take();
        if let Some(server) = server {
            server.abort();
            let _ = server.await;
        }
        info!("replica {} shut down", self.this_id);
        Ok(())
    }
}

impl Drop for RaftConsensus {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.halt = true;
        }
        self.closed.cancel();
    }
}
