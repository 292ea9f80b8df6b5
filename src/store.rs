//! RelayStore embedded store.
//!
//! Committed commands are applied to a SQLite database holding a single
//! key/value table. Writes go through one connection inside scoped
//! transactions; reads check out their own connection from a pool so they
//! never wait behind the writer.

use crate::errors::StoreError;
use crate::rpc::proto::{KeyValue, StoreSnapshot};
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use derivative::Derivative;
use log::warn;
use prost::Message;
use sqlite::{Connection, OpenFlags, State};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Name of the database file inside the store directory.
const DB_FILE: &str = "store.db";

/// Idle read connections kept around for reuse.
const READER_POOL_SIZE: usize = 16;

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL);
CREATE TABLE IF NOT EXISTS applied (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    log INTEGER NOT NULL,
    position INTEGER NOT NULL
);";

/// The last log entry whose effects the store holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LogPosition {
    /// Identifies the replicated log; a cluster that lost its log starts a new one.
    pub(crate) log: u64,
    pub(crate) index: u64,
}

/// SQLite-backed key/value store.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Store {
    path: PathBuf,
    #[derivative(Debug = "ignore")]
    writer: Mutex<Connection>,
    #[derivative(Debug = "ignore")]
    readers: Arc<ArrayQueue<Connection>>,
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::new()
        .set_read_write()
        .set_create()
        .set_no_mutex();
    let mut conn = Connection::open_with_flags(path, flags)?;
    conn.set_busy_timeout(5000)?;
    Ok(conn)
}

impl Store {
    /// Opens (creating if needed) the store kept in directory `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let path = dir.as_ref().join(DB_FILE);
        let writer = open_connection(&path)?;
        writer.execute(SCHEMA)?;
        Ok(Store {
            path,
            writer: Mutex::new(writer),
            readers: Arc::new(ArrayQueue::new(READER_POOL_SIZE)),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` inside a read-write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back on every
    /// other exit path, including a panic inside `f`.
    pub fn transact<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<R, StoreError>,
    {
        // A panicking executor leaves the lock poisoned, but its transaction
        // was already rolled back by `WriteTxn::drop`.
        let conn = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.execute("BEGIN IMMEDIATE")?;
        let mut txn = WriteTxn {
            conn: &*conn,
            finished: false,
        };
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Begins a read-only transaction over the committed state.
    pub fn read(&self) -> Result<ReadTxn, StoreError> {
        let conn = match self.readers.pop() {
            Some(conn) => conn,
            None => open_connection(&self.path)?,
        };
        conn.execute("BEGIN")?;
        Ok(ReadTxn {
            conn: Some(conn),
            pool: self.readers.clone(),
        })
    }

    /// Position recorded by the last write that marked one.
    pub(crate) fn applied(&self) -> Result<Option<LogPosition>, StoreError> {
        let txn = self.read()?;
        applied(txn.conn())
    }

    /// Records `position` without touching the key space.
    pub(crate) fn mark_applied(&self, position: LogPosition) -> Result<(), StoreError> {
        self.transact(|txn| txn.mark_applied(position))
    }

    /// Serializes the whole key space together with the log it came from.
    pub fn snapshot(&self) -> Result<Bytes, StoreError> {
        let txn = self.read()?;
        let position = applied(txn.conn())?.unwrap_or(LogPosition { log: 0, index: 0 });
        let pairs = txn
            .scan(&[])?
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect();
        let snapshot = StoreSnapshot {
            pairs,
            log: position.log,
            index: position.index,
        };
        Ok(Bytes::from(snapshot.encode_to_vec()))
    }

    /// Replaces the whole key space with the contents of a snapshot taken
    /// at log index `index`.
    ///
    /// A snapshot may reflect entries past `index`; the recorded position is
    /// the later of the two.
    pub fn restore(&self, snapshot: &[u8], index: u64) -> Result<(), StoreError> {
        let snapshot = StoreSnapshot::decode(snapshot)?;
        self.transact(|txn| {
            txn.conn.execute("DELETE FROM kv")?;
            for pair in &snapshot.pairs {
                txn.put(&pair.key, &pair.value)?;
            }
            txn.mark_applied(LogPosition {
                log: snapshot.log,
                index: index.max(snapshot.index),
            })
        })
    }
}

/// Read-write transaction handed to command executors.
pub struct WriteTxn<'c> {
    conn: &'c Connection,
    finished: bool,
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("finished", &self.finished)
            .finish()
    }
}

impl WriteTxn<'_> {
    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        get(self.conn, key)
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")?;
        stmt.bind(1, key)?;
        stmt.bind(2, value)?;
        while stmt.next()? != State::Done {}
        Ok(())
    }

    /// Removes `key`, returning its previous value.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let previous = get(self.conn, key)?;
        if previous.is_some() {
            let mut stmt = self.conn.prepare("DELETE FROM kv WHERE key = ?")?;
            stmt.bind(1, key)?;
            while stmt.next()? != State::Done {}
        }
        Ok(previous)
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        scan(self.conn, prefix)
    }

    pub(crate) fn mark_applied(&mut self, position: LogPosition) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare("INSERT OR REPLACE INTO applied (id, log, position) VALUES (0, ?, ?)")?;
        stmt.bind(1, position.log as i64)?;
        stmt.bind(2, position.index as i64)?;
        while stmt.next()? != State::Done {}
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn.execute("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.conn.execute("ROLLBACK") {
            warn!("rollback failed: {}", e);
        }
        self.finished = true;
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

/// Read-only transaction over the committed state of the local replica.
///
/// Reads are not linearizable against writes still in flight; call
/// `Node::rsync` first to catch up with the cluster.
pub struct ReadTxn {
    conn: Option<Connection>,
    pool: Arc<ArrayQueue<Connection>>,
}

impl std::fmt::Debug for ReadTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTxn").finish()
    }
}

impl ReadTxn {
    fn conn(&self) -> &Connection {
        // Only `drop` takes the connection out.
        self.conn.as_ref().expect("read transaction already finished")
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        get(self.conn(), key)
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        scan(self.conn(), prefix)
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.execute("ROLLBACK").is_ok() {
                let _ = self.pool.push(conn);
            }
        }
    }
}

fn get(conn: &Connection, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
    let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?")?;
    stmt.bind(1, key)?;
    match stmt.next()? {
        State::Row => Ok(Some(stmt.read::<Vec<u8>>(0)?)),
        State::Done => Ok(None),
    }
}

fn applied(conn: &Connection) -> Result<Option<LogPosition>, StoreError> {
    let mut stmt = conn.prepare("SELECT log, position FROM applied WHERE id = 0")?;
    match stmt.next()? {
        State::Row => Ok(Some(LogPosition {
            log: stmt.read::<i64>(0)? as u64,
            index: stmt.read::<i64>(1)? as u64,
        })),
        State::Done => Ok(None),
    }
}

fn scan(conn: &Connection, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE key >= ? ORDER BY key")?;
    stmt.bind(1, prefix)?;
    let mut pairs = vec![];
    while let State::Row = stmt.next()? {
        let key = stmt.read::<Vec<u8>>(0)?;
        if !key.starts_with(prefix) {
            break;
        }
        let value = stmt.read::<Vec<u8>>(1)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = open();
        store
            .transact(|txn| {
                txn.put(b"a", b"1")?;
                txn.put(b"b", b"2")?;
                txn.put(b"a", b"3")?;
                Ok(())
            })
            .unwrap();
        let txn = store.read().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(txn.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(txn.get(b"c").unwrap(), None);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let (_dir, store) = open();
        let result: Result<(), StoreError> = store.transact(|txn| {
            txn.put(b"k", b"v")?;
            Err(StoreError::Cancelled)
        });
        assert!(result.is_err());
        assert_eq!(store.read().unwrap().get(b"k").unwrap(), None);

        // The writer is usable again afterwards.
        store.transact(|txn| txn.put(b"k", b"w")).unwrap();
        assert_eq!(store.read().unwrap().get(b"k").unwrap(), Some(b"w".to_vec()));
    }

    #[test]
    fn test_delete_and_scan() {
        let (_dir, store) = open();
        store
            .transact(|txn| {
                txn.put(b"user/1", b"ann")?;
                txn.put(b"user/2", b"bob")?;
                txn.put(b"zone/1", b"eu")?;
                Ok(())
            })
            .unwrap();
        let removed = store.transact(|txn| txn.delete(b"user/1")).unwrap();
        assert_eq!(removed, Some(b"ann".to_vec()));
        let missing = store.transact(|txn| txn.delete(b"user/9")).unwrap();
        assert_eq!(missing, None);

        let users = store.read().unwrap().scan(b"user/").unwrap();
        assert_eq!(users, vec![(b"user/2".to_vec(), b"bob".to_vec())]);
    }

    #[test]
    fn test_readers_are_isolated() {
        let (_dir, store) = open();
        store.transact(|txn| txn.put(b"k", b"old")).unwrap();
        let first = store.read().unwrap();
        assert_eq!(first.get(b"k").unwrap(), Some(b"old".to_vec()));
        store.transact(|txn| txn.put(b"k", b"new")).unwrap();
        assert_eq!(first.get(b"k").unwrap(), Some(b"old".to_vec()));
        drop(first);
        assert_eq!(store.read().unwrap().get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_snapshot_restore() {
        let (_dir, source) = open();
        source
            .transact(|txn| {
                txn.put(b"x", b"1")?;
                txn.put(b"y", b"2")?;
                Ok(())
            })
            .unwrap();
        source
            .mark_applied(LogPosition { log: 7, index: 40 })
            .unwrap();
        let snapshot = source.snapshot().unwrap();

        let (_other, target) = open();
        target.transact(|txn| txn.put(b"stale", b"!")).unwrap();
        target.restore(&snapshot, 41).unwrap();
        assert_eq!(
            target.applied().unwrap(),
            Some(LogPosition { log: 7, index: 41 })
        );
        // A snapshot that already reflects later entries keeps its own position.
        target.restore(&snapshot, 30).unwrap();
        assert_eq!(
            target.applied().unwrap(),
            Some(LogPosition { log: 7, index: 40 })
        );
        let pairs = target.read().unwrap().scan(&[]).unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"x".to_vec(), b"1".to_vec()),
                (b"y".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            assert_eq!(store.applied().unwrap(), None);
            store
                .transact(|txn| {
                    txn.put(b"k", b"v")?;
                    txn.mark_applied(LogPosition { log: 3, index: 12 })
                })
                .unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.read().unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(
            store.applied().unwrap(),
            Some(LogPosition { log: 3, index: 12 })
        );
    }
}
