//! RelayStore RPC module.
//!
//! Carries Raft messages between replicas as one-way tonic calls over the
//! consensus stream layer.

use crate::errors::StoreError;
use crate::mux::StreamLayer;
use crate::raft::{Inbox, Proposal, ProposalId};
use crate::rpc::proto::rpc_server::Rpc;
use async_mutex::Mutex;
use bytes::Bytes;
use derivative::Derivative;
use little_raft::message::{LogEntry as RaftLogEntry, Message};
use log::debug;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Response, Status};

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("proto");
}

use proto::rpc_client::RpcClient;
use proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, Void, VoteRequest, VoteResponse,
};

type Client = RpcClient<Channel>;

/// Open a tonic channel to `addr` through the consensus stream layer.
async fn connect(
    layer: Arc<StreamLayer>,
    addr: String,
    timeout: Duration,
) -> Result<Client, StoreError> {
    let endpoint = Endpoint::from_shared(format!("http://{}", addr))?;
    let channel = endpoint
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let layer = layer.clone();
            let addr = addr.clone();
            async move {
                layer
                    .dial(&addr, timeout)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            }
        }))
        .await?;
    Ok(RpcClient::new(channel))
}

#[derive(Debug, Clone)]
struct Connections(Arc<Mutex<HashMap<String, Client>>>);

impl Connections {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(HashMap::new())))
    }

    async fn connection(
        &self,
        layer: &Arc<StreamLayer>,
        addr: &str,
        timeout: Duration,
    ) -> Result<Client, StoreError> {
        if let Some(client) = self.0.lock().await.get(addr) {
            return Ok(client.clone());
        }
        let client = connect(layer.clone(), addr.to_string(), timeout).await?;
        self.0
            .lock()
            .await
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    async fn invalidate(&self, addr: &str) {
        let mut conns = self.0.lock().await;
        conns.remove(addr);
    }
}

/// A Raft message converted to its wire form.
#[derive(Debug)]
enum Outgoing {
    Vote(VoteRequest),
    RespondToVote(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    RespondToAppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    RespondToInstallSnapshot(InstallSnapshotResponse),
}

impl Outgoing {
    async fn deliver(self, client: &mut Client) -> Result<(), Status> {
        match self {
            Outgoing::Vote(msg) => client.vote(Request::new(msg)).await?,
            Outgoing::RespondToVote(msg) => client.respond_to_vote(Request::new(msg)).await?,
            Outgoing::AppendEntries(msg) => client.append_entries(Request::new(msg)).await?,
            Outgoing::RespondToAppendEntries(msg) => {
                client.respond_to_append_entries(Request::new(msg)).await?
            }
            Outgoing::InstallSnapshot(msg) => client.install_snapshot(Request::new(msg)).await?,
            Outgoing::RespondToInstallSnapshot(msg) => {
                client.respond_to_install_snapshot(Request::new(msg)).await?
            }
        };
        Ok(())
    }
}

impl From<Message<Proposal, Bytes>> for Outgoing {
    fn from(msg: Message<Proposal, Bytes>) -> Self {
        match msg {
            Message::AppendEntryRequest {
                from_id,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => {
                let entries = entries
                    .into_iter()
                    .map(|entry| LogEntry {
                        replica: entry.transition.id.replica as u64,
                        seq: entry.transition.id.seq,
                        data: entry.transition.data.to_vec(),
                        index: entry.index as u64,
                        term: entry.term as u64,
                    })
                    .collect();
                Outgoing::AppendEntries(AppendEntriesRequest {
                    from_id: from_id as u64,
                    term: term as u64,
                    prev_log_index: prev_log_index as u64,
                    prev_log_term: prev_log_term as u64,
                    entries,
                    commit_index: commit_index as u64,
                })
            }
            Message::AppendEntryResponse {
                from_id,
                term,
                success,
                last_index,
                mismatch_index,
            } => Outgoing::RespondToAppendEntries(AppendEntriesResponse {
                from_id: from_id as u64,
                term: term as u64,
                success,
                last_index: last_index as u64,
                has_mismatch_index: mismatch_index.is_some(),
                mismatch_index: mismatch_index.unwrap_or_default() as u64,
            }),
            Message::VoteRequest {
                from_id,
                term,
                last_log_index,
                last_log_term,
            } => Outgoing::Vote(VoteRequest {
                from_id: from_id as u64,
                term: term as u64,
                last_log_index: last_log_index as u64,
                last_log_term: last_log_term as u64,
            }),
            Message::VoteResponse {
                from_id,
                term,
                vote_granted,
            } => Outgoing::RespondToVote(VoteResponse {
                from_id: from_id as u64,
                term: term as u64,
                vote_granted,
            }),
            Message::InstallSnapshotRequest {
                from_id,
                term,
                last_included_index,
                last_included_term,
                offset,
                data,
                done,
            } => Outgoing::InstallSnapshot(InstallSnapshotRequest {
                from_id: from_id as u64,
                term: term as u64,
                last_included_index: last_included_index as u64,
                last_included_term: last_included_term as u64,
                offset: offset as _,
                data: data.to_vec(),
                done,
            }),
            Message::InstallSnapshotResponse {
                from_id,
                term,
                last_included_index,
            } => Outgoing::RespondToInstallSnapshot(InstallSnapshotResponse {
                from_id: from_id as u64,
                term: term as u64,
                last_included_index: last_included_index as u64,
            }),
        }
    }
}

/// RPC transport.
///
/// Replica ids are positions in the shared peer list.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RpcTransport {
    peers: Arc<Vec<String>>,
    #[derivative(Debug = "ignore")]
    layer: Arc<StreamLayer>,
    dial_timeout: Duration,
    connections: Connections,
    #[derivative(Debug = "ignore")]
    runtime: tokio::runtime::Handle,
}

impl RpcTransport {
    /// Creates a new RPC transport dialing peers through `layer`.
    ///
    /// Must be called from within a tokio runtime; sends are spawned on it.
    pub fn new(peers: Arc<Vec<String>>, layer: Arc<StreamLayer>, dial_timeout: Duration) -> Self {
        RpcTransport {
            peers,
            layer,
            dial_timeout,
            connections: Connections::new(),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Send `msg` to replica `to_id` without waiting for delivery.
    pub fn send(&self, to_id: usize, msg: Message<Proposal, Bytes>) {
        let peer = match self.peers.get(to_id) {
            Some(peer) => peer.clone(),
            None => {
                debug!("dropping message to unknown replica {}", to_id);
                return;
            }
        };
        let outgoing = Outgoing::from(msg);
        let pool = self.connections.clone();
        let layer = self.layer.clone();
        let timeout = self.dial_timeout;
        self.runtime.spawn(async move {
            match pool.connection(&layer, &peer, timeout).await {
                Ok(mut client) => {
                    if let Err(e) = outgoing.deliver(&mut client).await {
                        debug!("sending to {} failed: {}", peer, e);
                        pool.invalidate(&peer).await
                    }
                }
                Err(e) => debug!("couldn't connect to {}: {}", peer, e),
            }
        });
    }
}

/// RPC service.
#[derive(Debug)]
pub struct RpcService {
    inbox: Arc<Inbox>,
}

impl RpcService {
    /// Creates a new RPC service delivering messages to `inbox`.
    pub fn new(inbox: Arc<Inbox>) -> Self {
        Self { inbox }
    }
}

#[tonic::async_trait]
impl Rpc for RpcService {
    async fn vote(&self, request: Request<VoteRequest>) -> Result<Response<Void>, Status> {
        let msg = request.into_inner();
        self.inbox.push(Message::VoteRequest {
            from_id: msg.from_id as usize,
            term: msg.term as usize,
            last_log_index: msg.last_log_index as usize,
            last_log_term: msg.last_log_term as usize,
        });
        Ok(Response::new(Void {}))
    }

    async fn respond_to_vote(
        &self,
        request: Request<VoteResponse>,
    ) -> Result<Response<Void>, Status> {
        let msg = request.into_inner();
        self.inbox.push(Message::VoteResponse {
            from_id: msg.from_id as usize,
            term: msg.term as usize,
            vote_granted: msg.vote_granted,
        });
        Ok(Response::new(Void {}))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<Void>, Status> {
        let msg = request.into_inner();
        let entries: Vec<RaftLogEntry<Proposal>> = msg
            .entries
            .into_iter()
            .map(|entry| RaftLogEntry {
                transition: Proposal {
                    id: ProposalId {
                        replica: entry.replica as usize,
                        seq: entry.seq,
                    },
                    data: Bytes::from(entry.data),
                },
                index: entry.index as usize,
                term: entry.term as usize,
            })
            .collect();
        self.inbox.push(Message::AppendEntryRequest {
            from_id: msg.from_id as usize,
            term: msg.term as usize,
            prev_log_index: msg.prev_log_index as usize,
            prev_log_term: msg.prev_log_term as usize,
            entries,
            commit_index: msg.commit_index as usize,
        });
        Ok(Response::new(Void {}))
    }

    async fn respond_to_append_entries(
        &self,
        request: Request<AppendEntriesResponse>,
    ) -> Result<Response<Void>, Status> {
        let msg = request.into_inner();
        let mismatch_index = if msg.has_mismatch_index {
            Some(msg.mismatch_index as usize)
        } else {
            None
        };
        self.inbox.push(Message::AppendEntryResponse {
            from_id: msg.from_id as usize,
            term: msg.term as usize,
            success: msg.success,
            last_index: msg.last_index as usize,
            mismatch_index,
        });
        Ok(Response::new(Void {}))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<Void>, Status> {
        let msg = request.into_inner();
        self.inbox.push(Message::InstallSnapshotRequest {
            from_id: msg.from_id as usize,
            term: msg.term as usize,
            last_included_index: msg.last_included_index as usize,
            last_included_term: msg.last_included_term as usize,
            offset: msg.offset as _,
            data: Bytes::from(msg.data),
            done: msg.done,
        });
        Ok(Response::new(Void {}))
    }

    async fn respond_to_install_snapshot(
        &self,
        request: Request<InstallSnapshotResponse>,
    ) -> Result<Response<Void>, Status> {
        let msg = request.into_inner();
        self.inbox.push(Message::InstallSnapshotResponse {
            from_id: msg.from_id as usize,
            term: msg.term as usize,
            last_included_index: msg.last_included_index as usize,
        });
        Ok(Response::new(Void {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(replica: usize, seq: u64, data: &'static [u8]) -> Proposal {
        Proposal {
            id: ProposalId { replica, seq },
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_append_entries_carries_proposals() {
        let msg = Message::AppendEntryRequest {
            from_id: 2,
            term: 7,
            prev_log_index: 3,
            prev_log_term: 6,
            entries: vec![RaftLogEntry {
                transition: proposal(2, 11, b"entry"),
                index: 4,
                term: 7,
            }],
            commit_index: 3,
        };
        match Outgoing::from(msg) {
            Outgoing::AppendEntries(request) => {
                assert_eq!(request.from_id, 2);
                assert_eq!(request.entries.len(), 1);
                let entry = &request.entries[0];
                assert_eq!((entry.replica, entry.seq), (2, 11));
                assert_eq!(entry.data, b"entry".to_vec());
                assert_eq!((entry.index, entry.term), (4, 7));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_missing_mismatch_index_is_flagged() {
        let msg: Message<Proposal, Bytes> = Message::AppendEntryResponse {
            from_id: 1,
            term: 2,
            success: true,
            last_index: 5,
            mismatch_index: None,
        };
        match Outgoing::from(msg) {
            Outgoing::RespondToAppendEntries(response) => {
                assert!(!response.has_mismatch_index);
                assert_eq!(response.last_index, 5);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
