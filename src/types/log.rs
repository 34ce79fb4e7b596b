use serde::{Deserialize, Serialize};

use crate::membership::Membership;

use super::primitives::Term;

/// What a log entry carries: an opaque state-machine command, or a cluster
/// configuration. Configurations ride the log like any other entry but take
/// effect when appended, not when committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload<Cmd> {
    Command(Cmd),
    Config(Membership),
}

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<Cmd> {
    pub term: Term,
    pub payload: EntryPayload<Cmd>,
}

impl<Cmd> LogEntry<Cmd> {
    pub fn command(term: Term, command: Cmd) -> Self {
        Self {
            term,
            payload: EntryPayload::Command(command),
        }
    }

    pub fn config(term: Term, config: Membership) -> Self {
        Self {
            term,
            payload: EntryPayload::Config(config),
        }
    }

    pub fn as_config(&self) -> Option<&Membership> {
        match &self.payload {
            EntryPayload::Config(config) => Some(config),
            EntryPayload::Command(_) => None,
        }
    }
}
