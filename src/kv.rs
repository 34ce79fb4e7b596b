use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::StateMachine;

/// Commands for the replicated key-value store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
}

/// Result of applying a command to the KV store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResult {
    /// A Set landed.
    Written,
    /// Whether a Delete found its key.
    Removed(bool),
    /// What a Get observed.
    Value(Option<String>),
}

/// In-memory map that every replica rebuilds by replaying the committed
/// log. Reads ride the log like writes do, so a Get observes every write
/// committed before it — the determinism the `StateMachine` contract asks
/// for comes free with a plain map.
#[derive(Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine<KvCommand> for KvStore {
    type Output = KvResult;

    fn apply(&mut self, command: KvCommand) -> KvResult {
        match command {
            KvCommand::Get { key } => KvResult::Value(self.data.get(&key).cloned()),
            KvCommand::Set { key, value } => {
                self.data.insert(key, value);
                KvResult::Written
            }
            KvCommand::Delete { key } => KvResult::Removed(self.data.remove(&key).is_some()),
        }
    }
}
