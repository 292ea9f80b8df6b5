//! RelayStore is an embeddable, replicated command-execution service for
//! Rust, powered by [Little Raft][1] and [SQLite][2].
//!
//! ## Getting Started
//!
//! A RelayStore cluster is a fixed set of nodes. Applications issue
//! *commands* on any node: a command is a name plus a list of byte-string
//! arguments, executed inside a write transaction against a local key/value
//! store. The cluster agrees on the order of commands with the Raft
//! consensus protocol and every node applies every command, so all stores
//! hold the same contents.
//!
//! Commands issued on a follower are relayed to the leader over the same
//! TCP listener the Raft traffic uses. The result is delivered on the node
//! that issued the command once that node has applied it, so a caller never
//! needs to know which node is the leader.
//!
//! Reads go to the local store and may be stale. Call [`Node::rsync`] before
//! reading to observe every command committed so far.
//!
//! Besides the built-in `Set`, `Remove`, `PutIfAbsent` and `CompareAndSwap`
//! commands, applications can register their own executors. They must be
//! deterministic.
//!
//! ```no_run
//! use anyhow::Result;
//! use relaystore::{command, Config, Node};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let peers = vec!["127.0.0.1:50001", "127.0.0.1:50002", "127.0.0.1:50003"];
//!     let config = Config::new(peers, "/tmp/relaystore-1").command(
//!         "Append",
//!         command(|args, txn| {
//!             let mut value = txn.get(&args[0])?.unwrap_or_default();
//!             value.extend_from_slice(&args[1]);
//!             txn.put(&args[0], &value)?;
//!             Ok(value)
//!         }),
//!     );
//!     let node = Node::bind(config, "127.0.0.1:50001").await?;
//!     node.set(b"greeting", b"hello").await?;
//!     node.command("Append", &[b"greeting".to_vec(), b", world".to_vec()])
//!         .await?;
//!     node.rsync().await?;
//!     assert_eq!(node.get(b"greeting")?, Some(b"hello, world".to_vec()));
//!     node.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! [1]: https://github.com/andreev-io/little-raft
//! [2]: https://www.sqlite.org/index.html

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod commands;
pub mod config;
pub mod errors;
pub mod forward;
pub mod mux;
pub mod node;
pub mod raft;
pub mod rpc;
pub mod state;
pub mod store;

pub use commands::{command, Command};
pub use config::Config;
pub use errors::StoreError;
pub use node::{Node, Pending};
pub use raft::{Consensus, Role};
pub use state::{CommandCallback, CommandResult};
pub use store::{ReadTxn, WriteTxn};
