//! RelayStore leader forwarding.
//!
//! Followers relay commands to the leader over the application RPC stream
//! layer. A connection carries length-delimited protobuf frames: one
//! [`Hello`] naming the follower, then any number of [`ForwardedCommand`]s.
//! The leader never answers on this connection. The follower learns the
//! outcome by applying the committed entry itself, which resolves the
//! callback registered under its own address.

use crate::errors::StoreError;
use crate::mux::StreamLayer;
use crate::raft::Consensus;
use crate::rpc::proto::{ForwardedCommand, Hello};
use crate::state::{encode_entry, CommandCallback, StateMachine};
use async_mutex::Mutex;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct LeaderConnection {
    leader: String,
    frames: FramedWrite<TcpStream, LengthDelimitedCodec>,
}

impl LeaderConnection {
    async fn open(
        layer: &StreamLayer,
        leader: &str,
        origin: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let stream = layer.dial(leader, timeout).await?;
        let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());
        let hello = Hello {
            origin: origin.to_string(),
        };
        frames.send(Bytes::from(hello.encode_to_vec())).await?;
        Ok(LeaderConnection {
            leader: leader.to_string(),
            frames,
        })
    }

    async fn forward(&mut self, command: ForwardedCommand) -> Result<(), StoreError> {
        self.frames.send(Bytes::from(command.encode_to_vec())).await?;
        Ok(())
    }
}

/// Relays commands from a follower to the current leader.
///
/// Holds at most one connection, rebuilt under a single lock whenever the
/// reported leader changes.
#[derive(Debug)]
pub struct LeaderForwarder {
    origin: String,
    layer: Arc<StreamLayer>,
    dial_timeout: Duration,
    conn: Mutex<Option<LeaderConnection>>,
}

impl LeaderForwarder {
    /// Creates a forwarder announcing itself as `origin`.
    pub fn new(origin: String, layer: Arc<StreamLayer>, dial_timeout: Duration) -> Self {
        LeaderForwarder {
            origin,
            layer,
            dial_timeout,
            conn: Mutex::new(None),
        }
    }

    /// Send a command to the leader and return the callback its local
    /// application will resolve.
    ///
    /// Nothing is retried: if the write fails the callback is cancelled, the
    /// connection dropped and the error returned.
    pub async fn dispatch(
        &self,
        consensus: &dyn Consensus,
        state: &StateMachine,
        name: &str,
        args: &[Vec<u8>],
    ) -> Result<CommandCallback, StoreError> {
        let mut conn = self.conn.lock().await;
        let leader = consensus.leader().ok_or(StoreError::NoLeader)?;
        let live = match conn.take() {
            Some(live) if live.leader == leader => live,
            stale => {
                if let Some(stale) = stale {
                    info!(
                        "leader moved from {} to {}, reconnecting",
                        stale.leader, leader
                    );
                }
                LeaderConnection::open(&self.layer, &leader, &self.origin, self.dial_timeout)
                    .await
                    .map_err(|e| StoreError::LeaderUnreachable {
                        addr: leader.clone(),
                        source: Box::new(e),
                    })?
            }
        };
        let live = conn.insert(live);

        let callback = state.new_command();
        let command = ForwardedCommand {
            name: name.to_string(),
            args: args.to_vec(),
            request_no: callback.request_no(),
        };
        if let Err(e) = live.forward(command).await {
            callback.cancel();
            *conn = None;
            return Err(StoreError::LeaderUnreachable {
                addr: leader,
                source: Box::new(e),
            });
        }
        Ok(callback)
    }
}

/// Accepts forwarded commands on the leader.
#[derive(Debug)]
pub struct FollowerServer {
    task: JoinHandle<()>,
    closed: CancellationToken,
}

impl FollowerServer {
    /// Serve followers connecting on `layer`, proposing their commands
    /// through `consensus` with `timeout`.
    pub fn start(
        layer: Arc<StreamLayer>,
        consensus: Arc<dyn Consensus>,
        timeout: Duration,
    ) -> Self {
        let closed = CancellationToken::new();
        let task = tokio::task::spawn(accept_followers(layer, consensus, timeout, closed.clone()));
        FollowerServer { task, closed }
    }

    /// Stop accepting and drop every follower connection.
    pub async fn close(self) {
        self.closed.cancel();
        let _ = self.task.await;
    }
}

async fn accept_followers(
    layer: Arc<StreamLayer>,
    consensus: Arc<dyn Consensus>,
    timeout: Duration,
    closed: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = closed.cancelled() => break,
            accepted = layer.accept() => match accepted {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };
        let consensus = consensus.clone();
        let closed = closed.clone();
        tokio::task::spawn(async move {
            let remote = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default();
            tokio::select! {
                _ = closed.cancelled() => {}
                served = serve_follower(stream, &remote, consensus, timeout) => {
                    if let Err(e) = served {
                        warn!("dropping follower connection from {}: {}", remote, e);
                    }
                }
            }
        });
    }
    debug!("follower server on {} stopped", layer.addr());
}

async fn serve_follower(
    stream: TcpStream,
    remote: &str,
    consensus: Arc<dyn Consensus>,
    timeout: Duration,
) -> Result<(), StoreError> {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    let hello = match frames.next().await {
        Some(frame) => Hello::decode(frame?)?,
        None => return Err(StoreError::ConnectionClosed(remote.to_string())),
    };
    debug!("follower {} connected from {}", hello.origin, remote);
    while let Some(frame) = frames.next().await {
        let command = ForwardedCommand::decode(frame?)?;
        let entry = encode_entry(
            &hello.origin,
            command.request_no,
            &command.name,
            &command.args,
        );
        let applied = consensus.apply(entry, timeout);
        let origin = hello.origin.clone();
        tokio::task::spawn(async move {
            if let Err(e) = applied.await {
                warn!(
                    "forwarded command {} from {}#{} failed: {}",
                    command.name, origin, command.request_no, e
                );
            }
        });
    }
    debug!("follower {} disconnected", hello.origin);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandRegistry, SET};
    use crate::mux::{MultiStream, TcpDialer, DIAL_CODE_RPC};
    use crate::raft::{ApplyFuture, Role};
    use crate::rpc::proto::CommandEntry;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct FakeConsensus {
        leader: std::sync::Mutex<Option<String>>,
        proposed: mpsc::UnboundedSender<CommandEntry>,
    }

    #[async_trait]
    impl Consensus for FakeConsensus {
        fn apply(&self, entry: Bytes, _timeout: Duration) -> ApplyFuture {
            let entry = CommandEntry::decode(entry).unwrap();
            self.proposed.send(entry).unwrap();
            Box::pin(async { Ok(()) })
        }

        fn leader(&self) -> Option<String> {
            self.leader.lock().unwrap().clone()
        }

        fn role(&self) -> Role {
            Role::Follower
        }

        async fn remove_peer(&self, _addr: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct Leader {
        mux: MultiStream,
        server: FollowerServer,
        proposed: mpsc::UnboundedReceiver<CommandEntry>,
    }

    async fn leader() -> Leader {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mux = MultiStream::new(listener, Arc::new(TcpDialer), &[DIAL_CODE_RPC], 4).unwrap();
        let (tx, proposed) = mpsc::unbounded_channel();
        let consensus = Arc::new(FakeConsensus {
            leader: std::sync::Mutex::new(None),
            proposed: tx,
        });
        let layer = mux.layer(DIAL_CODE_RPC).unwrap();
        let server = FollowerServer::start(layer, consensus, Duration::from_secs(1));
        Leader {
            mux,
            server,
            proposed,
        }
    }

    fn follower(
        origin: &str,
        mux: &MultiStream,
        leader: Option<String>,
    ) -> (tempfile::TempDir, StateMachine, FakeConsensus, LeaderForwarder) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let state = StateMachine::new(
            origin.to_string(),
            store,
            CommandRegistry::new(&HashMap::new()),
        )
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let consensus = FakeConsensus {
            leader: std::sync::Mutex::new(leader),
            proposed: tx,
        };
        let forwarder = LeaderForwarder::new(
            origin.to_string(),
            mux.layer(DIAL_CODE_RPC).unwrap(),
            Duration::from_secs(1),
        );
        (dir, state, consensus, forwarder)
    }

    fn leader_addr(leader: &Leader) -> String {
        leader.mux.layer(DIAL_CODE_RPC).unwrap().addr().to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forwarded_command_keeps_origin() {
        let mut leader = leader().await;
        let (_dir, state, consensus, forwarder) =
            follower("10.0.0.9:4000", &leader.mux, Some(leader_addr(&leader)));

        let args = vec![b"k".to_vec(), b"v".to_vec()];
        let callback = forwarder
            .dispatch(&consensus, &state, SET, &args)
            .await
            .unwrap();
        let entry = leader.proposed.recv().await.unwrap();
        assert_eq!(entry.origin, "10.0.0.9:4000");
        assert_eq!(entry.request_no, callback.request_no());
        assert_eq!(entry.name, SET);
        assert_eq!(entry.args, args);

        // Later commands reuse the same connection.
        let second = forwarder
            .dispatch(&consensus, &state, SET, &args)
            .await
            .unwrap();
        let entry = leader.proposed.recv().await.unwrap();
        assert_eq!(entry.request_no, second.request_no());
        leader.server.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnects_when_leader_changes() {
        let mut first = leader().await;
        let mut second = leader().await;
        let (_dir, state, consensus, forwarder) =
            follower("10.0.0.9:4000", &first.mux, Some(leader_addr(&first)));

        let one = forwarder.dispatch(&consensus, &state, SET, &[]).await.unwrap();
        assert_eq!(first.proposed.recv().await.unwrap().request_no, one.request_no());

        *consensus.leader.lock().unwrap() = Some(leader_addr(&second));
        let two = forwarder.dispatch(&consensus, &state, SET, &[]).await.unwrap();
        assert_eq!(second.proposed.recv().await.unwrap().request_no, two.request_no());
        assert!(first.proposed.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_without_leader() {
        let leader = leader().await;
        let (_dir, state, consensus, forwarder) = follower("10.0.0.9:4000", &leader.mux, None);
        let err = forwarder
            .dispatch(&consensus, &state, SET, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoLeader));
        assert_eq!(state.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_leader_leaves_nothing_pending() {
        let leader = leader().await;
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gone_addr = gone.local_addr().unwrap().to_string();
        drop(gone);
        let (_dir, state, consensus, forwarder) =
            follower("10.0.0.9:4000", &leader.mux, Some(gone_addr.clone()));
        let err = forwarder
            .dispatch(&consensus, &state, SET, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaderUnreachable { addr, .. } if addr == gone_addr));
        assert_eq!(state.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_write_cancels_and_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mux = MultiStream::new(listener, Arc::new(TcpDialer), &[DIAL_CODE_RPC], 4).unwrap();
        let layer = mux.layer(DIAL_CODE_RPC).unwrap();
        let addr = layer.addr().to_string();
        // Takes the hello and one command, then resets the connection.
        let reset = tokio::task::spawn(async move {
            let stream = layer.accept().await.unwrap();
            stream.set_linger(Some(Duration::from_secs(0))).unwrap();
            let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
            frames.next().await.unwrap().unwrap();
            frames.next().await.unwrap().unwrap();
        });

        let (_dir, state, consensus, forwarder) =
            follower("10.0.0.9:4000", &mux, Some(addr.clone()));
        let first = forwarder.dispatch(&consensus, &state, SET, &[]).await.unwrap();
        drop(first);
        reset.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = forwarder
            .dispatch(&consensus, &state, SET, &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::LeaderUnreachable { addr: ref failed, .. } if *failed == addr
        ));
        assert_eq!(state.pending_len(), 0);
        assert!(forwarder.conn.lock().await.is_none());
    }
}
