//! Cluster membership and quorum arithmetic.
//!
//! A configuration is either blank (no servers assigned), stable, or
//! transitional — the joint-consensus phase of a membership change, during
//! which every quorum decision must be satisfied by a majority of the old
//! server set *and* a majority of the new one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, NodeId};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    /// No servers assigned yet. Cannot win an election.
    #[default]
    Blank,
    /// Normal operation.
    Stable { servers: BTreeSet<NodeId> },
    /// Joint consensus: quorum is required in both `old` and `new`.
    Transitional {
        old: BTreeSet<NodeId>,
        new: BTreeSet<NodeId>,
    },
}

impl Membership {
    pub fn stable<I: IntoIterator<Item = NodeId>>(servers: I) -> Self {
        Membership::Stable {
            servers: servers.into_iter().collect(),
        }
    }

    /// All servers with a vote: the union of both groups while transitional.
    pub fn voters(&self) -> BTreeSet<NodeId> {
        match self {
            Membership::Blank => BTreeSet::new(),
            Membership::Stable { servers } => servers.clone(),
            Membership::Transitional { old, new } => old.union(new).copied().collect(),
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, Membership::Transitional { .. })
    }

    /// A change may start from a blank config, or from a stable config when
    /// the proposed server set actually differs. A change during a change is
    /// rejected.
    pub fn allow_change(&self, proposed: &BTreeSet<NodeId>) -> bool {
        match self {
            Membership::Blank => true,
            Membership::Stable { servers } => servers != proposed,
            Membership::Transitional { .. } => false,
        }
    }

    /// Enter joint consensus towards `proposed`.
    pub fn begin_change(&self, proposed: BTreeSet<NodeId>) -> Membership {
        let old = match self {
            Membership::Stable { servers } => servers.clone(),
            Membership::Blank | Membership::Transitional { .. } => BTreeSet::new(),
        };
        Membership::Transitional { old, new: proposed }
    }

    /// The stable configuration a transitional one resolves to.
    pub fn stabilized(&self) -> Option<Membership> {
        match self {
            Membership::Transitional { new, .. } => Some(Membership::Stable {
                servers: new.clone(),
            }),
            Membership::Blank | Membership::Stable { .. } => None,
        }
    }

    /// Does `votes` (peer → granted) carry the election? Transitional configs
    /// need a majority of each group.
    pub fn has_vote_quorum(&self, votes: &BTreeMap<NodeId, bool>) -> bool {
        match self {
            Membership::Blank => false,
            Membership::Stable { servers } => group_has_majority(servers, votes),
            Membership::Transitional { old, new } => {
                group_has_majority(old, votes) && group_has_majority(new, votes)
            }
        }
    }

    /// The greatest log index replicated on a quorum: per group, sort the
    /// members' match indexes descending and take the majority'th one; a
    /// transitional config takes the minimum across its two groups.
    ///
    /// `last_log_index` stands in for the leader's own match index.
    pub fn quorum_min(
        &self,
        me: NodeId,
        last_log_index: LogIndex,
        matches: &BTreeMap<NodeId, LogIndex>,
    ) -> LogIndex {
        match self {
            Membership::Blank => LogIndex::default(),
            Membership::Stable { servers } => {
                group_quorum_index(servers, me, last_log_index, matches)
            }
            Membership::Transitional { old, new } => {
                group_quorum_index(old, me, last_log_index, matches)
                    .min(group_quorum_index(new, me, last_log_index, matches))
            }
        }
    }
}

fn group_has_majority(group: &BTreeSet<NodeId>, votes: &BTreeMap<NodeId, bool>) -> bool {
    if group.is_empty() {
        return false;
    }
    let granted = group
        .iter()
        .filter(|id| votes.get(id).copied().unwrap_or(false))
        .count();
    granted * 2 > group.len()
}

fn group_quorum_index(
    group: &BTreeSet<NodeId>,
    me: NodeId,
    last_log_index: LogIndex,
    matches: &BTreeMap<NodeId, LogIndex>,
) -> LogIndex {
    if group.is_empty() {
        return LogIndex::default();
    }
    let mut indexes: Vec<LogIndex> = group
        .iter()
        .map(|&id| {
            if id == me {
                last_log_index
            } else {
                matches.get(&id).copied().unwrap_or_default()
            }
        })
        .collect();
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    // With the indexes in descending order, the entry at position
    // majority-1 is replicated on at least a majority of the group.
    let majority = group.len() / 2 + 1;
    indexes[majority - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> BTreeSet<NodeId> {
        raw.iter().map(|&v| NodeId::from(v)).collect()
    }

    fn votes(raw: &[(u64, bool)]) -> BTreeMap<NodeId, bool> {
        raw.iter().map(|&(v, g)| (NodeId::from(v), g)).collect()
    }

    #[test]
    fn blank_never_has_quorum() {
        let config = Membership::Blank;
        assert!(!config.has_vote_quorum(&votes(&[(1, true), (2, true)])));
        assert_eq!(
            config.quorum_min(NodeId::from(1), LogIndex::from(9), &BTreeMap::new()),
            LogIndex::default()
        );
    }

    #[test]
    fn stable_vote_quorum_is_simple_majority() {
        let config = Membership::stable(ids(&[1, 2, 3]));
        assert!(!config.has_vote_quorum(&votes(&[(1, true)])));
        assert!(config.has_vote_quorum(&votes(&[(1, true), (2, true)])));
        // Denied votes do not count.
        assert!(!config.has_vote_quorum(&votes(&[(1, true), (2, false), (3, false)])));
        // Votes from servers outside the config do not count.
        assert!(!config.has_vote_quorum(&votes(&[(1, true), (9, true)])));
    }

    #[test]
    fn transitional_vote_quorum_needs_both_groups() {
        let config = Membership::Transitional {
            old: ids(&[1, 2, 3]),
            new: ids(&[1, 4, 5]),
        };
        // Majority of old only.
        assert!(!config.has_vote_quorum(&votes(&[(1, true), (2, true)])));
        // Majority of both.
        assert!(config.has_vote_quorum(&votes(&[(1, true), (2, true), (4, true)])));
    }

    #[test]
    fn allow_change_rules() {
        let proposed = ids(&[1, 2]);
        assert!(Membership::Blank.allow_change(&proposed));
        assert!(Membership::stable(ids(&[1, 2, 3])).allow_change(&proposed));
        // Same server set: nothing to change.
        assert!(!Membership::stable(ids(&[1, 2])).allow_change(&proposed));
        let transitional = Membership::Transitional {
            old: ids(&[1, 2, 3]),
            new: ids(&[1, 2]),
        };
        assert!(!transitional.allow_change(&proposed));
    }

    #[test]
    fn begin_change_carries_old_servers() {
        let stable = Membership::stable(ids(&[1, 2, 3]));
        let joint = stable.begin_change(ids(&[1, 2, 4]));
        assert_eq!(
            joint,
            Membership::Transitional {
                old: ids(&[1, 2, 3]),
                new: ids(&[1, 2, 4]),
            }
        );
        assert_eq!(joint.voters(), ids(&[1, 2, 3, 4]));
        assert_eq!(joint.stabilized(), Some(Membership::stable(ids(&[1, 2, 4]))));
    }

    #[test]
    fn quorum_min_stable() {
        let config = Membership::stable(ids(&[1, 2, 3]));
        let me = NodeId::from(1);
        // Only the leader has the entry: no quorum past 0.
        assert_eq!(
            config.quorum_min(me, LogIndex::from(5), &BTreeMap::new()),
            LogIndex::default()
        );
        // One follower acked index 3: majority at 3.
        let matches = [(NodeId::from(2), LogIndex::from(3))].into_iter().collect();
        assert_eq!(
            config.quorum_min(me, LogIndex::from(5), &matches),
            LogIndex::from(3)
        );
    }

    #[test]
    fn quorum_min_transitional_takes_group_minimum() {
        let config = Membership::Transitional {
            old: ids(&[1, 2, 3]),
            new: ids(&[1, 4, 5]),
        };
        let me = NodeId::from(1);
        let matches: BTreeMap<NodeId, LogIndex> = [
            (NodeId::from(2), LogIndex::from(7)),
            (NodeId::from(3), LogIndex::from(7)),
            (NodeId::from(4), LogIndex::from(2)),
        ]
        .into_iter()
        .collect();
        // Old group reaches 7, new group only 2.
        assert_eq!(
            config.quorum_min(me, LogIndex::from(7), &matches),
            LogIndex::from(2)
        );
    }

    #[test]
    fn single_server_quorum_is_itself() {
        let config = Membership::stable(ids(&[1]));
        assert!(config.has_vote_quorum(&votes(&[(1, true)])));
        assert_eq!(
            config.quorum_min(NodeId::from(1), LogIndex::from(4), &BTreeMap::new()),
            LogIndex::from(4)
        );
    }
}
