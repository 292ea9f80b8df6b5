//! RelayStore commands.
//!
//! A command is a named executor that runs inside a write transaction on
//! every replica once the cluster has committed it. Executors must be
//! deterministic: the same arguments applied to the same state have to
//! produce the same writes on every node.

use crate::store::WriteTxn;
use anyhow::{bail, ensure};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// Command executor.
///
/// Receives the command arguments and a write transaction, returns the value
/// delivered to the caller. An error rolls the transaction back and is
/// delivered to the caller instead.
pub type Command =
    Arc<dyn Fn(&[Vec<u8>], &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Wraps a closure into a [`Command`].
pub fn command<F>(f: F) -> Command
where
    F: Fn(&[Vec<u8>], &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Does nothing; used as a synchronization barrier.
pub const NOOP: &str = "Noop";
/// `Set(key, value)`.
pub const SET: &str = "Set";
/// `Remove(key)`, returns the removed value or nothing.
pub const REMOVE: &str = "Remove";
/// `PutIfAbsent(key, value)`, returns `[1]` if the value was stored.
pub const PUT_IF_ABSENT: &str = "PutIfAbsent";
/// `CompareAndSwap(key, expected, new)`, returns `[1]` if the swap happened.
pub const COMPARE_AND_SWAP: &str = "CompareAndSwap";

const TRUE: u8 = 1;
const FALSE: u8 = 0;

fn noop(_args: &[Vec<u8>], _txn: &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> {
    Ok(vec![])
}

fn set(args: &[Vec<u8>], txn: &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> {
    ensure!(args.len() == 2, "{} expects 2 arguments, got {}", SET, args.len());
    txn.put(&args[0], &args[1])?;
    Ok(vec![])
}

fn remove(args: &[Vec<u8>], txn: &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> {
    ensure!(args.len() == 1, "{} expects 1 argument, got {}", REMOVE, args.len());
    Ok(txn.delete(&args[0])?.unwrap_or_default())
}

fn put_if_absent(args: &[Vec<u8>], txn: &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> {
    ensure!(
        args.len() == 2,
        "{} expects 2 arguments, got {}",
        PUT_IF_ABSENT,
        args.len()
    );
    if txn.get(&args[0])?.is_some() {
        return Ok(vec![FALSE]);
    }
    txn.put(&args[0], &args[1])?;
    Ok(vec![TRUE])
}

fn compare_and_swap(args: &[Vec<u8>], txn: &mut WriteTxn<'_>) -> anyhow::Result<Vec<u8>> {
    let (key, expected, new) = match args {
        [key, expected, new] => (key, expected, new),
        _ => bail!(
            "{} expects 3 arguments, got {}",
            COMPARE_AND_SWAP,
            args.len()
        ),
    };
    match txn.get(key)? {
        Some(current) if current == *expected => {
            txn.put(key, new)?;
            Ok(vec![TRUE])
        }
        _ => Ok(vec![FALSE]),
    }
}

/// Interprets the boolean reply of `PutIfAbsent` and `CompareAndSwap`.
pub fn reply_flag(reply: &[u8]) -> bool {
    reply == [TRUE]
}

fn default_commands() -> HashMap<String, Command> {
    let mut commands: HashMap<String, Command> = HashMap::new();
    commands.insert(NOOP.to_string(), command(noop));
    commands.insert(SET.to_string(), command(set));
    commands.insert(REMOVE.to_string(), command(remove));
    commands.insert(PUT_IF_ABSENT.to_string(), command(put_if_absent));
    commands.insert(COMPARE_AND_SWAP.to_string(), command(compare_and_swap));
    commands
}

/// The commands a node executes, fixed at startup.
#[derive(Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .finish()
    }
}

impl CommandRegistry {
    /// Built-in commands overridden by `custom` ones of the same name.
    pub fn new(custom: &HashMap<String, Command>) -> Self {
        let mut commands = default_commands();
        for (name, executor) in custom {
            if commands.contains_key(name) {
                warn!("overriding command {} with user-defined command", name);
            }
            commands.insert(name.clone(), executor.clone());
        }
        CommandRegistry { commands }
    }

    /// Executor registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn run(store: &Store, registry: &CommandRegistry, name: &str, args: &[&[u8]]) -> Vec<u8> {
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
        let executor = registry.get(name).unwrap().clone();
        store
            .transact(|txn| {
                executor(&args, txn).map_err(|error| crate::StoreError::CommandFailed {
                    name: name.to_string(),
                    error,
                })
            })
            .unwrap()
    }

    #[test]
    fn test_custom_command_overrides_default() {
        let mut custom = HashMap::new();
        custom.insert(
            SET.to_string(),
            command(|_args: &[Vec<u8>], _txn: &mut WriteTxn<'_>| Ok(b"custom".to_vec())),
        );
        custom.insert(
            "Echo".to_string(),
            command(|args: &[Vec<u8>], _txn: &mut WriteTxn<'_>| Ok(args.concat())),
        );
        let registry = CommandRegistry::new(&custom);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert_eq!(run(&store, &registry, SET, &[b"k", b"v"]), b"custom".to_vec());
        assert_eq!(store.read().unwrap().get(b"k").unwrap(), None);
        assert_eq!(run(&store, &registry, "Echo", &[b"a", b"b"]), b"ab".to_vec());
        assert!(registry.get(NOOP).is_some());
    }

    #[test]
    fn test_conditional_writes() {
        let registry = CommandRegistry::new(&HashMap::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(reply_flag(&run(&store, &registry, PUT_IF_ABSENT, &[b"k", b"1"])));
        assert!(!reply_flag(&run(&store, &registry, PUT_IF_ABSENT, &[b"k", b"2"])));
        assert!(!reply_flag(&run(&store, &registry, COMPARE_AND_SWAP, &[b"k", b"2", b"3"])));
        assert!(reply_flag(&run(&store, &registry, COMPARE_AND_SWAP, &[b"k", b"1", b"3"])));
        assert_eq!(store.read().unwrap().get(b"k").unwrap(), Some(b"3".to_vec()));
        assert_eq!(run(&store, &registry, REMOVE, &[b"k"]), b"3".to_vec());
        assert_eq!(run(&store, &registry, REMOVE, &[b"k"]), Vec::<u8>::new());
    }
}
