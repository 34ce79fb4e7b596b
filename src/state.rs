use std::collections::BTreeMap;

use crate::types::{LogIndex, NodeId};

/// Follower state - passive, responds to RPCs.
pub struct Follower {
    /// The leader that last sent us a consistent AppendEntries, if any.
    pub leader_id: Option<NodeId>,
}

/// Candidate state - actively seeking votes.
pub struct Candidate {
    /// Per-peer ballot: granted or denied. The candidate's own vote is
    /// recorded here too.
    pub votes: BTreeMap<NodeId, bool>,
}

/// Leader state - manages replication.
pub struct Leader {
    /// Next log index to send to each voting peer.
    pub next_index: BTreeMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each voting peer.
    pub match_index: BTreeMap<NodeId, LogIndex>,
}

impl Leader {
    /// A fresh leader assumes every peer is caught up to its own log and
    /// walks next_index back on rejection.
    pub fn new<I: IntoIterator<Item = NodeId>>(peers: I, last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers
                .into_iter()
                .map(|id| (id, last_log_index.next()))
                .collect(),
            match_index: BTreeMap::new(),
        }
    }

    /// Reconcile the replication maps with the current voting peers, after a
    /// configuration entry is appended or adopted. New peers start at
    /// `last_log_index + 1`; departed peers are dropped.
    pub fn sync_peers<I: IntoIterator<Item = NodeId>>(
        &mut self,
        peers: I,
        last_log_index: LogIndex,
    ) {
        let peers: std::collections::BTreeSet<NodeId> = peers.into_iter().collect();
        self.next_index.retain(|id, _| peers.contains(id));
        self.match_index.retain(|id, _| peers.contains(id));
        for id in peers {
            self.next_index.entry(id).or_insert(last_log_index.next());
        }
    }
}
