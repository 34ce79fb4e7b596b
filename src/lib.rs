//! Raft consensus core with joint-consensus membership changes.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation (membership changes, ch. 4)
//!
//! The `node` module holds the per-replica state machine; everything around
//! it (timers, storage, transport, client API) stays outside so the core can
//! be driven deterministically in tests — see `cluster`.

pub mod client_api;
pub mod cluster;
pub mod command;
pub mod file_storage;
pub mod kv;
pub mod membership;
pub mod node;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;
pub mod types;

pub use command::Command;
pub use membership::Membership;
pub use node::{Committed, Node, Role, Submit};
pub use runtime::{Applied, ClientError, ClientReply, Event, Runtime, StateMachine, TimerConfig};
pub use storage::{MemoryStorage, Storage};
pub use types::{
    AppendEntries, AppendEntriesResponse, EntryPayload, LogEntry, LogIndex, Message, NodeId,
    RequestVote, RequestVoteResponse, Term,
};
