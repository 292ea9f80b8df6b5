//! RelayStore state machine.
//!
//! Every replica applies every committed entry to its own store. The node
//! that originated a command additionally holds a [`CommandCallback`] in its
//! pending table, keyed by (origin address, request number); applying the
//! entry resolves that callback. On every other node the lookup misses and
//! only the side effect remains.

use crate::commands::CommandRegistry;
use crate::errors::StoreError;
use crate::rpc::proto::CommandEntry;
use crate::store::{LogPosition, ReadTxn, Store};
use anyhow::anyhow;
use bytes::Bytes;
use log::{debug, error, info, warn};
use prost::Message;
use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// Outcome of a command.
pub type CommandResult = Result<Vec<u8>, StoreError>;

/// Identifies one command invocation across the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CallbackKey {
    pub(crate) origin: String,
    pub(crate) request_no: u64,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Callbacks waiting for their command to be applied locally.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    callbacks: Mutex<HashMap<CallbackKey, oneshot::Sender<CommandResult>>>,
}

impl PendingTable {
    fn register(&self, key: CallbackKey) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().unwrap().insert(key, tx);
        rx
    }

    /// Delivers `result` if `key` is still pending. Returns whether it was.
    fn resolve(&self, key: &CallbackKey, result: CommandResult) -> bool {
        let waiter = self.callbacks.lock().unwrap().remove(key);
        match waiter {
            Some(tx) => {
                // The receiver may be gone already; the entry is resolved either way.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn forget(&self, key: &CallbackKey) {
        self.callbacks.lock().unwrap().remove(key);
    }

    fn drain(&self) -> Vec<oneshot::Sender<CommandResult>> {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.drain().map(|(_, tx)| tx).collect()
    }

    fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }
}

/// A command waiting for its result.
///
/// Resolves exactly once: when the command is applied on this node, or when
/// it is cancelled, whichever happens first. Dropping the callback
/// unregisters it.
#[derive(Debug)]
pub struct CommandCallback {
    key: CallbackKey,
    result: oneshot::Receiver<CommandResult>,
    table: Arc<PendingTable>,
}

impl CommandCallback {
    /// Address of the node that issued the command.
    pub fn origin(&self) -> &str {
        &self.key.origin
    }

    /// Request number of the command.
    pub fn request_no(&self) -> u64 {
        self.key.request_no
    }

    /// Resolves the callback with [`StoreError::Cancelled`].
    ///
    /// Returns `false` if the callback had already been resolved, in which
    /// case nothing changes.
    pub fn cancel(&self) -> bool {
        self.canceller().fail(StoreError::Cancelled)
    }

    /// A handle that can fail this callback from elsewhere.
    pub(crate) fn canceller(&self) -> Canceller {
        Canceller {
            key: self.key.clone(),
            table: self.table.clone(),
        }
    }
}

impl Future for CommandCallback {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(StoreError::Shutdown)))
    }
}

impl Drop for CommandCallback {
    fn drop(&mut self) {
        self.table.forget(&self.key);
    }
}

/// Fails a pending callback without owning it.
#[derive(Clone, Debug)]
pub(crate) struct Canceller {
    key: CallbackKey,
    table: Arc<PendingTable>,
}

impl Canceller {
    pub(crate) fn fail(&self, error: StoreError) -> bool {
        self.table.resolve(&self.key, Err(error))
    }
}

/// Encodes a command into a replicated log entry.
pub(crate) fn encode_entry(origin: &str, request_no: u64, name: &str, args: &[Vec<u8>]) -> Bytes {
    let entry = CommandEntry {
        origin: origin.to_string(),
        request_no,
        name: name.to_string(),
        args: args.to_vec(),
    };
    Bytes::from(entry.encode_to_vec())
}

/// Where the store stands relative to the replicated log.
#[derive(Debug, Default)]
struct Progress {
    /// Log the store is following; zero until the log identifies itself.
    log: u64,
    /// Entries up to this index are already reflected in the store.
    skip_through: u64,
    /// Position found in the store at startup.
    recovered: Option<LogPosition>,
}

/// A restarted node must not reuse request numbers that may still be in the
/// replicated log, so numbering starts from the wall clock.
fn first_request_no() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(1)
}

/// Applies committed commands to the local store.
#[derive(Debug)]
pub struct StateMachine {
    addr: String,
    next_request_no: AtomicU64,
    commands: CommandRegistry,
    store: Store,
    progress: Mutex<Progress>,
    pending: Arc<PendingTable>,
}

impl StateMachine {
    /// Creates a state machine for the node advertised as `addr`.
    ///
    /// The store keeps whatever it already holds. Entries of the log it was
    /// built from are skipped when they are replayed.
    pub fn new(
        addr: String,
        store: Store,
        commands: CommandRegistry,
    ) -> Result<Self, StoreError> {
        let recovered = store.applied()?;
        if let Some(position) = recovered {
            info!(
                "store holds log {:016x} through index {}",
                position.log, position.index
            );
        }
        Ok(StateMachine {
            addr,
            next_request_no: AtomicU64::new(first_request_no()),
            commands,
            store,
            progress: Mutex::new(Progress {
                recovered,
                ..Progress::default()
            }),
            pending: Arc::new(PendingTable::default()),
        })
    }

    /// Address this state machine registers its callbacks under.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Registers a callback for a new command issued by this node.
    pub fn new_command(&self) -> CommandCallback {
        let key = CallbackKey {
            origin: self.addr.clone(),
            request_no: self.next_request_no.fetch_add(1, Ordering::SeqCst),
        };
        let result = self.pending.register(key.clone());
        CommandCallback {
            key,
            result,
            table: self.pending.clone(),
        }
    }

    /// Starts following the log identified by `log`, whose first entry
    /// has just been committed.
    ///
    /// If the store was built from that same log, the entries it already
    /// holds are skipped on replay. Otherwise the log is new and every entry
    /// is applied on top of the recovered contents.
    pub fn begin_log(&self, log: u64) {
        let mut progress = self.progress.lock().unwrap();
        progress.log = log;
        progress.skip_through = 0;
        match progress.recovered.take() {
            Some(recovered) if recovered.log == log => {
                info!(
                    "replaying log {:016x}, skipping entries through {}",
                    log, recovered.index
                );
                progress.skip_through = recovered.index;
                return;
            }
            Some(recovered) => info!(
                "log {:016x} replaces log {:016x}; keeping the store's contents",
                log, recovered.log
            ),
            None => {}
        }
        if let Err(e) = self.store.mark_applied(LogPosition { log, index: 1 }) {
            error!("couldn't record the start of log {:016x}: {}", log, e);
        }
    }

    /// Applies the committed log entry at `index`.
    ///
    /// The command always runs against the store. Resolving a local callback
    /// is a separate step that does nothing for commands issued elsewhere.
    pub fn apply(&self, index: u64, entry: &[u8]) {
        let log = {
            let progress = self.progress.lock().unwrap();
            if index <= progress.skip_through {
                debug!("entry {} is already in the store", index);
                return;
            }
            progress.log
        };
        let entry = match CommandEntry::decode(entry) {
            Ok(entry) => entry,
            Err(e) => {
                error!("skipping undecodable log entry: {}", e);
                return;
            }
        };
        let result = self.execute(LogPosition { log, index }, &entry.name, &entry.args);
        if let Err(e) = &result {
            warn!(
                "command {} from {}#{} failed: {}",
                entry.name, entry.origin, entry.request_no, e
            );
        }
        let key = CallbackKey {
            origin: entry.origin,
            request_no: entry.request_no,
        };
        self.pending.resolve(&key, result);
    }

    fn execute(&self, position: LogPosition, name: &str, args: &[Vec<u8>]) -> CommandResult {
        let executor = self
            .commands
            .get(name)
            .ok_or_else(|| StoreError::UnknownCommand(name.to_string()))?;
        self.store.transact(|txn| {
            // A panicking executor must not unwind into the consensus loop.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor(args, txn)))
                .unwrap_or_else(|payload| {
                    Err(anyhow!("executor panicked: {}", panic_message(&*payload)))
                });
            let reply = outcome.map_err(|error| StoreError::CommandFailed {
                name: name.to_string(),
                error,
            })?;
            txn.mark_applied(position)?;
            Ok(reply)
        })
    }

    /// Begins a read-only transaction over the locally applied state.
    pub fn read_txn(&self) -> Result<ReadTxn, StoreError> {
        self.store.read()
    }

    /// Serializes the applied state.
    pub fn snapshot(&self) -> Result<Bytes, StoreError> {
        self.store.snapshot()
    }

    /// Replaces the applied state with a snapshot taken at log index `index`.
    pub fn restore(&self, index: u64, snapshot: &[u8]) -> Result<(), StoreError> {
        self.store.restore(snapshot, index)?;
        let position = self.store.applied()?.unwrap_or(LogPosition { log: 0, index });
        *self.progress.lock().unwrap() = Progress {
            log: position.log,
            skip_through: position.index,
            recovered: None,
        };
        Ok(())
    }

    /// Fails every pending callback with [`StoreError::Shutdown`].
    pub fn shutdown(&self) {
        for waiter in self.pending.drain() {
            let _ = waiter.send(Err(StoreError::Shutdown));
        }
    }

    /// Number of callbacks still waiting for a result.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
