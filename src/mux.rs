//! RelayStore stream multiplexer.
//!
//! A [`MultiStream`] splits one physical TCP listener into several logical
//! [`StreamLayer`]s. Every dialed connection starts with a single byte, the
//! [`DialCode`], which tells the accepting side which layer the connection
//! belongs to. Everything after that byte is opaque to the multiplexer.

use crate::errors::StoreError;
use async_trait::async_trait;
use derivative::Derivative;
use futures::stream::{self, Stream};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tag written as the first byte of every dialed connection.
pub type DialCode = u8;

/// Dial code of the consensus transport layer.
pub const DIAL_CODE_RAFT: DialCode = 0;

/// Dial code of the application RPC layer used for leader forwarding.
pub const DIAL_CODE_RPC: DialCode = 1;

/// How long an accepted connection may take to send its dial code.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before accepting again after running out of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// ENOMEM, ENFILE and EMFILE; the numbering is shared by Linux and the BSDs.
const EXHAUSTION_ERRNOS: [i32; 3] = [12, 23, 24];

/// Opens physical connections for the multiplexer.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, giving up after `timeout`.
    async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dialing {} timed out", addr),
            )),
        }
    }
}

/// One logical connection-oriented service on top of a shared listener.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StreamLayer {
    code: DialCode,
    local_addr: SocketAddr,
    #[derivative(Debug = "ignore")]
    incoming: async_mutex::Mutex<mpsc::Receiver<TcpStream>>,
    #[derivative(Debug = "ignore")]
    dialer: Arc<dyn Dialer>,
    closed: CancellationToken,
}

impl StreamLayer {
    /// Wait for the next connection dialed with this layer's code.
    pub async fn accept(&self) -> Result<TcpStream, StoreError> {
        if self.closed.is_cancelled() {
            return Err(StoreError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StoreError::Closed),
            stream = incoming.recv() => stream.ok_or(StoreError::Closed),
        }
    }

    /// Open a connection to the same layer on the node at `addr`.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> Result<TcpStream, StoreError> {
        if self.closed.is_cancelled() {
            return Err(StoreError::Closed);
        }
        let mut stream = self.dialer.dial(addr, timeout).await?;
        stream.write_all(&[self.code]).await?;
        Ok(stream)
    }

    /// Local address of the shared listener.
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial code of this layer.
    pub fn code(&self) -> DialCode {
        self.code
    }

    /// Stop accepting connections on this layer.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Accepted connections as a stream, ending when the layer closes.
    pub fn incoming(
        self: Arc<Self>,
    ) -> impl Stream<Item = io::Result<TcpStream>> + Send + Unpin + 'static {
        Box::pin(stream::unfold(self, |layer| async move {
            match layer.accept().await {
                Ok(stream) => Some((Ok(stream), layer)),
                Err(_) => None,
            }
        }))
    }
}

/// A set of stream layers sharing one physical listener.
#[derive(Debug)]
pub struct MultiStream {
    layers: HashMap<DialCode, Arc<StreamLayer>>,
    accept_loop: JoinHandle<()>,
    closed: CancellationToken,
}

impl MultiStream {
    /// Start multiplexing `listener` into one layer per dial code.
    ///
    /// Each layer queues at most `backlog` connections that have not been
    /// accepted yet.
    pub fn new(
        listener: TcpListener,
        dialer: Arc<dyn Dialer>,
        codes: &[DialCode],
        backlog: usize,
    ) -> Result<Self, StoreError> {
        let local_addr = listener.local_addr()?;
        let closed = CancellationToken::new();
        let mut senders = HashMap::new();
        let mut layers = HashMap::new();
        for &code in codes {
            if senders.contains_key(&code) {
                return Err(StoreError::DuplicateDialCode(code));
            }
            let (tx, rx) = mpsc::channel(backlog.max(1));
            senders.insert(code, tx);
            layers.insert(
                code,
                Arc::new(StreamLayer {
                    code,
                    local_addr,
                    incoming: async_mutex::Mutex::new(rx),
                    dialer: dialer.clone(),
                    closed: closed.child_token(),
                }),
            );
        }
        let accept_loop =
            tokio::task::spawn(accept_loop(listener, Arc::new(senders), closed.clone()));
        Ok(MultiStream {
            layers,
            accept_loop,
            closed,
        })
    }

    /// The layer registered for `code`.
    pub fn layer(&self, code: DialCode) -> Option<Arc<StreamLayer>> {
        self.layers.get(&code).cloned()
    }

    /// Stop the accept loop, release the listener and close every layer.
    pub fn close(&self) {
        self.closed.cancel();
        self.accept_loop.abort();
    }
}

impl Drop for MultiStream {
    fn drop(&mut self) {
        self.close();
    }
}

type Senders = Arc<HashMap<DialCode, mpsc::Sender<TcpStream>>>;

async fn accept_loop(listener: TcpListener, senders: Senders, closed: CancellationToken) {
    let local_addr = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            _ = closed.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                tokio::task::spawn(route(stream, remote, senders.clone(), closed.clone()));
            }
            Err(e) => match accept_failure(&e) {
                AcceptFailure::Connection => {
                    debug!("dropped a connection on {:?} during accept: {}", local_addr, e);
                }
                AcceptFailure::Exhausted => {
                    warn!("accepting on {:?} failed, retrying: {}", local_addr, e);
                    tokio::select! {
                        _ = closed.cancelled() => return,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                AcceptFailure::Permanent => {
                    error!("accepting on {:?} failed, closing all layers: {}", local_addr, e);
                    closed.cancel();
                    return;
                }
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the connection being accepted is affected.
    Connection,
    /// The process is out of resources for now.
    Exhausted,
    /// The listener is unusable.
    Permanent,
}

fn accept_failure(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptFailure::Connection,
        _ => match e.raw_os_error() {
            Some(errno) if EXHAUSTION_ERRNOS.contains(&errno) => AcceptFailure::Exhausted,
            _ => AcceptFailure::Permanent,
        },
    }
}

async fn route(
    mut stream: TcpStream,
    remote: SocketAddr,
    senders: Senders,
    closed: CancellationToken,
) {
    let mut code = [0u8; 1];
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut code)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!("connection from {} closed before dial code: {}", remote, e);
            return;
        }
        Err(_) => {
            warn!("connection from {} sent no dial code, closing", remote);
            return;
        }
    }
    match senders.get(&code[0]) {
        Some(layer) => {
            let delivered = tokio::select! {
                _ = closed.cancelled() => false,
                sent = layer.send(stream) => sent.is_ok(),
            };
            if !delivered {
                debug!("layer {} is closed, dropping connection from {}", code[0], remote);
            }
        }
        None => {
            warn!("unrecognized dial code {} from {}, closing connection", code[0], remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_failures() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ] {
            assert_eq!(accept_failure(&kind.into()), AcceptFailure::Connection);
        }
        for errno in EXHAUSTION_ERRNOS {
            let e = io::Error::from_raw_os_error(errno);
            assert_eq!(accept_failure(&e), AcceptFailure::Exhausted);
        }
        let e = io::Error::new(io::ErrorKind::InvalidInput, "bad listener");
        assert_eq!(accept_failure(&e), AcceptFailure::Permanent);
    }

    async fn multi_stream(codes: &[DialCode]) -> MultiStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        MultiStream::new(listener, Arc::new(TcpDialer), codes, 4).unwrap()
    }

    #[tokio::test]
    async fn test_connections_reach_their_own_layer() {
        let mux = multi_stream(&[DIAL_CODE_RAFT, DIAL_CODE_RPC]).await;
        let raft = mux.layer(DIAL_CODE_RAFT).unwrap();
        let rpc = mux.layer(DIAL_CODE_RPC).unwrap();
        let addr = rpc.addr().to_string();

        let mut dialed = rpc.dial(&addr, Duration::from_secs(1)).await.unwrap();
        dialed.write_all(b"ping").await.unwrap();

        let mut accepted = rpc.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let nothing = tokio::time::timeout(Duration::from_millis(200), raft.accept()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_unknown_dial_code_is_closed() {
        let mux = multi_stream(&[DIAL_CODE_RAFT, DIAL_CODE_RPC]).await;
        let raft = mux.layer(DIAL_CODE_RAFT).unwrap();
        let addr = raft.addr();

        let mut stray = TcpStream::connect(addr).await.unwrap();
        stray.write_all(&[42]).await.unwrap();
        let mut buf = [0u8; 1];
        let n = stray.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        // The other layers keep working.
        let _dialed = raft.dial(&addr.to_string(), Duration::from_secs(1)).await.unwrap();
        assert!(raft.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let mux = multi_stream(&[DIAL_CODE_RPC]).await;
        let rpc = mux.layer(DIAL_CODE_RPC).unwrap();
        let waiter = {
            let rpc = rpc.clone();
            tokio::task::spawn(async move { rpc.accept().await })
        };
        mux.close();
        assert!(matches!(waiter.await.unwrap(), Err(StoreError::Closed)));
        assert!(matches!(
            rpc.dial("127.0.0.1:1", Duration::from_millis(10)).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_dial_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = MultiStream::new(listener, Arc::new(TcpDialer), &[1, 1], 4).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDialCode(1)));
    }
}
