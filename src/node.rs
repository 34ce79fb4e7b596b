use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info};

use crate::command::Command;
use crate::membership::Membership;
use crate::state::{Candidate, Follower, Leader};
use crate::storage::Storage;
use crate::types::{
    AppendEntries, AppendEntriesResponse, EntryPayload, LogEntry, LogIndex, Message, NodeId,
    RequestVote, RequestVoteResponse, Term,
};

/// Server role with associated state.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// A log entry that has committed, handed to the runtime in log order.
pub enum Committed<C> {
    /// A state-machine command ready to apply.
    Command {
        index: LogIndex,
        term: Term,
        command: C,
    },
    /// A committed configuration entry with no further leader work: a stable
    /// config, or any config seen from the follower side.
    Config {
        index: LogIndex,
        term: Term,
        config: Membership,
    },
    /// A transitional config committed on the leader. The follow-up stable
    /// entry was appended at `moved_to`; the client request waiting on
    /// `index` under the entry's own `term` is answered once `moved_to`
    /// commits.
    ConfigStaged {
        index: LogIndex,
        term: Term,
        moved_to: LogIndex,
    },
}

/// Outcome of a client submission.
pub enum Submit<C> {
    /// Entry appended; the commands trigger an immediate replication round.
    Accepted {
        index: LogIndex,
        term: Term,
        commands: Vec<Command<C>>,
    },
    /// This node is not the leader; `leader` is the best redirect hint.
    NotLeader { leader: Option<NodeId> },
    /// The configuration does not permit the change right now.
    ChangeRejected,
}

/// A Raft consensus node: one per replica, driven entirely by discrete
/// events (timer expiries, peer RPCs, client submissions). Each handler runs
/// to completion, mutates durable state through the storage façade, and
/// returns the messages and timer directives to carry out. No I/O happens
/// here.
pub struct Node<C, S: Storage<C>> {
    pub id: NodeId,
    pub role: Role,
    storage: S,
    /// Mirror of the durable current term.
    term: Term,
    /// Mirror of the durable vote.
    voted_for: Option<NodeId>,
    /// Current cluster configuration. Tracks the latest config entry in the
    /// log (append-time visibility), or the bootstrap server set.
    config: Membership,
    commit_index: LogIndex,
    /// Entries committed but not yet drained by the runtime.
    committed: VecDeque<Committed<C>>,
}

impl<C: Clone, S: Storage<C>> Node<C, S> {
    /// Create a node for a statically configured cluster: the config starts
    /// stable over `peers` plus the node itself.
    pub fn new(id: NodeId, peers: Vec<NodeId>, storage: S) -> Self {
        let mut servers: BTreeSet<NodeId> = peers.into_iter().collect();
        servers.insert(id);
        Self {
            id,
            role: Role::Follower(Follower { leader_id: None }),
            storage,
            term: Term::default(),
            voted_for: None,
            config: Membership::Stable { servers },
            commit_index: LogIndex::default(),
            committed: VecDeque::new(),
        }
    }

    /// Reconstruct a node after a crash. Term, vote and log come back from
    /// storage; the last config entry found in the log overrides the
    /// bootstrap server set. The node restarts as a follower with commit
    /// index 0 — the next leader's heartbeats re-drive commitment.
    pub fn from_storage(id: NodeId, peers: Vec<NodeId>, storage: S) -> Result<Self, S::Error> {
        let mut node = Self::new(id, peers, storage);
        node.term = node.storage.current_term()?;
        node.voted_for = node.storage.voted_for()?;

        let last = node.storage.last_log_index()?;
        let mut index = LogIndex::default();
        while index < last {
            index = index.next();
            if let Some(config) = node.storage.entry(index)?.and_then(|e| e.as_config().cloned())
            {
                node.config = config;
            }
        }
        Ok(node)
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn config(&self) -> &Membership {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    /// Where a client should send its request: us if leading, the last
    /// observed leader if following, nobody during an election.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader(_) => Some(self.id),
            Role::Follower(follower) => follower.leader_id,
            Role::Candidate(_) => None,
        }
    }

    pub fn last_log_index(&self) -> Result<LogIndex, S::Error> {
        self.storage.last_log_index()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Pop the next committed entry, in log order.
    pub fn take_committed(&mut self) -> Option<Committed<C>> {
        self.committed.pop_front()
    }

    /// Called when the election timer fires. Leaders ignore it; everyone else
    /// starts a new election.
    pub fn election_timeout(&mut self) -> Result<Vec<Command<C>>, S::Error> {
        match self.role {
            Role::Leader(_) => Ok(Vec::new()),
            Role::Follower(_) | Role::Candidate(_) => self.start_election(),
        }
    }

    /// Called when the heartbeat timer fires. Sends every voting peer an
    /// AppendEntries at its next_index — the entry there if one exists,
    /// empty otherwise.
    pub fn heartbeat_timeout(&mut self) -> Result<Vec<Command<C>>, S::Error> {
        match self.role {
            Role::Leader(_) => {
                let mut commands = vec![Command::ResetHeartbeatTimer];
                commands.extend(self.broadcast_append()?);
                Ok(commands)
            }
            Role::Follower(_) | Role::Candidate(_) => Ok(Vec::new()),
        }
    }

    fn start_election(&mut self) -> Result<Vec<Command<C>>, S::Error> {
        let term = self.term.increment();
        self.storage.set_vote_state(term, Some(self.id))?;
        self.term = term;
        self.voted_for = Some(self.id);

        let mut votes = BTreeMap::new();
        votes.insert(self.id, true);
        self.role = Role::Candidate(Candidate { votes });

        info!(me = %self.id, term = %term, "election timeout, becoming candidate");

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.storage.last_log_index()?,
            last_log_term: self.storage.last_log_term()?,
        };

        let mut commands = vec![Command::ResetElectionTimer];
        for peer in self.voting_peers() {
            commands.push(Command::Send {
                to: peer,
                message: Message::RequestVote(request.clone()),
            });
        }

        // A single-server cluster carries the vote on the spot.
        let quorum = matches!(&self.role, Role::Candidate(c) if self.config.has_vote_quorum(&c.votes));
        if quorum {
            commands.extend(self.become_leader()?);
        }
        Ok(commands)
    }

    fn become_leader(&mut self) -> Result<Vec<Command<C>>, S::Error> {
        let last = self.storage.last_log_index()?;
        self.role = Role::Leader(Leader::new(self.voting_peers(), last));

        info!(me = %self.id, term = %self.term, "won election, becoming leader");

        let mut commands = vec![Command::ResetHeartbeatTimer];
        commands.extend(self.broadcast_append()?);
        Ok(commands)
    }

    /// Every voting server except us, per the current configuration (the
    /// union of both groups while transitional).
    fn voting_peers(&self) -> Vec<NodeId> {
        self.config
            .voters()
            .into_iter()
            .filter(|&id| id != self.id)
            .collect()
    }

    /// Persist a new term with the vote cleared, one durable write.
    fn set_term(&mut self, term: Term) -> Result<(), S::Error> {
        self.storage.set_vote_state(term, None)?;
        self.term = term;
        self.voted_for = None;
        Ok(())
    }

    /// Fall back to follower, adopting `term` if it is newer. Keeps the vote
    /// when the term is unchanged — a candidate abandoning an election has
    /// already voted for itself in this term.
    fn step_down(&mut self, term: Term) -> Result<(), S::Error> {
        if term > self.term {
            self.set_term(term)?;
        }
        if !matches!(self.role, Role::Follower(_)) {
            info!(me = %self.id, term = %self.term, "stepping down to follower");
        }
        self.role = Role::Follower(Follower { leader_id: None });
        Ok(())
    }

    /// Install a configuration the moment its entry is appended, and bring
    /// a leader's replication maps in line with the new voter set.
    fn adopt_config(&mut self, config: Membership) -> Result<(), S::Error> {
        debug!(me = %self.id, ?config, "adopting configuration");
        self.config = config;
        let last = self.storage.last_log_index()?;
        let me = self.id;
        let voters = self.config.voters();
        if let Role::Leader(leader) = &mut self.role {
            leader.sync_peers(voters.into_iter().filter(|&id| id != me), last);
        }
        Ok(())
    }

    pub fn handle_request_vote(&mut self, req: RequestVote) -> Result<Vec<Command<C>>, S::Error> {
        let mut commands = Vec::new();
        if req.term > self.term {
            self.step_down(req.term)?;
            commands.push(Command::ResetElectionTimer);
        }

        let granted = match self.role {
            // Same term, no conflicting vote, and the candidate's log is at
            // least as up to date as ours.
            Role::Follower(_) if req.term == self.term => {
                (self.voted_for.is_none() || self.voted_for == Some(req.candidate_id))
                    && self.candidate_up_to_date(&req)?
            }
            // Stale term, or we are a candidate/leader in this term.
            _ => false,
        };

        if granted {
            self.storage
                .set_vote_state(self.term, Some(req.candidate_id))?;
            self.voted_for = Some(req.candidate_id);
            commands.push(Command::ResetElectionTimer);
            debug!(me = %self.id, term = %self.term, candidate = %req.candidate_id, "granting vote");
        }

        commands.push(Command::Send {
            to: req.candidate_id,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: self.term,
                vote_granted: granted,
            }),
        });
        Ok(commands)
    }

    /// A candidate's log is up to date iff its last term is greater than
    /// ours, or terms are equal and its last index is at least ours.
    fn candidate_up_to_date(&self, req: &RequestVote) -> Result<bool, S::Error> {
        let last_term = self.storage.last_log_term()?;
        let last_index = self.storage.last_log_index()?;
        Ok(req.last_log_term > last_term
            || (req.last_log_term == last_term && req.last_log_index >= last_index))
    }

    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
    ) -> Result<Vec<Command<C>>, S::Error> {
        if resp.term > self.term {
            self.step_down(resp.term)?;
            return Ok(vec![Command::ResetElectionTimer]);
        }
        if resp.term < self.term {
            return Ok(Vec::new());
        }

        let quorum = {
            let Role::Candidate(candidate) = &mut self.role else {
                // Stale response; the election is already over.
                return Ok(Vec::new());
            };
            candidate.votes.insert(from, resp.vote_granted);
            resp.vote_granted && self.config.has_vote_quorum(&candidate.votes)
        };

        if quorum {
            self.become_leader()
        } else {
            Ok(Vec::new())
        }
    }

    pub fn handle_append_entries(
        &mut self,
        req: AppendEntries<C>,
    ) -> Result<Vec<Command<C>>, S::Error> {
        if req.term < self.term {
            // Stale leader: answer with our term so it steps down. The
            // election timer keeps running.
            return Ok(vec![Command::Send {
                to: req.leader_id,
                message: Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: None,
                }),
            }]);
        }

        match self.role {
            // A live leader exists for this term or a newer one. Step down
            // and drop the message; the leader's retry finds us a follower.
            Role::Candidate(_) | Role::Leader(_) => {
                self.step_down(req.term)?;
                Ok(vec![Command::ResetElectionTimer])
            }
            Role::Follower(_) => {
                if req.term > self.term {
                    self.set_term(req.term)?;
                }
                let mut commands = vec![Command::ResetElectionTimer];
                commands.extend(self.append_from_leader(req)?);
                Ok(commands)
            }
        }
    }

    /// The follower half of replication: consistency check, suffix
    /// truncation, append, config adoption, commit advancement.
    fn append_from_leader(&mut self, req: AppendEntries<C>) -> Result<Vec<Command<C>>, S::Error> {
        // Index 0 always passes (term_at(0) reads as term 0).
        let consistent = self.storage.term_at(req.prev_log_index)? == Some(req.prev_log_term);
        if !consistent {
            return Ok(vec![Command::Send {
                to: req.leader_id,
                message: Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: None,
                }),
            }]);
        }

        // Anything after the match point diverges from the leader, even when
        // no entries follow.
        self.storage.truncate_after(req.prev_log_index)?;

        let mut last = req.prev_log_index;
        let mut new_config = None;
        for entry in req.entries {
            if let Some(config) = entry.as_config() {
                new_config = Some(config.clone());
            }
            last = self.storage.append(entry)?;
        }
        if let Some(config) = new_config {
            // Configurations take effect at append time, not commit time.
            self.adopt_config(config)?;
        }

        let mut commands = self.advance_commit_to(req.leader_commit.min(last))?;

        if let Role::Follower(follower) = &mut self.role {
            follower.leader_id = Some(req.leader_id);
        }

        commands.push(Command::Send {
            to: req.leader_id,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index: Some(last),
            }),
        });
        Ok(commands)
    }

    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
    ) -> Result<Vec<Command<C>>, S::Error> {
        if resp.term > self.term {
            self.step_down(resp.term)?;
            return Ok(vec![Command::ResetElectionTimer]);
        }
        if !matches!(self.role, Role::Leader(_)) {
            return Ok(Vec::new());
        }

        if !resp.success {
            // Walk next_index back (floor 1) and probe again immediately.
            // The reply term is not inspected; a stale rejection costs one
            // redundant round trip.
            let next = {
                let Role::Leader(leader) = &mut self.role else {
                    return Ok(Vec::new());
                };
                let Some(next) = leader.next_index.get_mut(&from) else {
                    return Ok(Vec::new());
                };
                *next = next.prev_floor_one();
                *next
            };
            return Ok(vec![self.append_for(from, next)?]);
        }

        if resp.term < self.term {
            // An ack from one of our earlier terms proves nothing about the
            // peer's log under this term.
            return Ok(Vec::new());
        }
        let Some(index) = resp.match_index else {
            return Ok(Vec::new());
        };

        let next = {
            let Role::Leader(leader) = &mut self.role else {
                return Ok(Vec::new());
            };
            if !leader.next_index.contains_key(&from) {
                // The peer left the configuration.
                return Ok(Vec::new());
            }
            let recorded = leader.match_index.get(&from).copied().unwrap_or_default();
            if index <= recorded {
                // Duplicate or reordered ack.
                return Ok(Vec::new());
            }
            leader.match_index.insert(from, index);
            leader.next_index.insert(from, index.next());
            index.next()
        };

        let mut commands = self.try_advance_commit()?;
        if self.storage.entry(next)?.is_some() {
            commands.push(self.append_for(from, next)?);
        }
        Ok(commands)
    }

    /// Leader-side client command: append, replicate immediately.
    pub fn submit(&mut self, command: C) -> Result<Submit<C>, S::Error> {
        if !self.is_leader() {
            return Ok(Submit::NotLeader {
                leader: self.leader_hint(),
            });
        }
        let index = self
            .storage
            .append(LogEntry::command(self.term, command))?;
        let mut commands = self.broadcast_append()?;
        // A cluster of one commits on append.
        commands.extend(self.try_advance_commit()?);
        Ok(Submit::Accepted {
            index,
            term: self.term,
            commands,
        })
    }

    /// Leader-side membership change: enter joint consensus towards
    /// `servers`. Rejected while another change is in flight or when the
    /// proposed set equals the current one.
    pub fn submit_config(&mut self, servers: BTreeSet<NodeId>) -> Result<Submit<C>, S::Error> {
        if !self.is_leader() {
            return Ok(Submit::NotLeader {
                leader: self.leader_hint(),
            });
        }
        if !self.config.allow_change(&servers) {
            return Ok(Submit::ChangeRejected);
        }

        let joint = self.config.begin_change(servers);
        info!(me = %self.id, config = ?joint, "starting membership change");
        let index = self
            .storage
            .append(LogEntry::config(self.term, joint.clone()))?;
        self.adopt_config(joint)?;

        let mut commands = self.broadcast_append()?;
        commands.extend(self.try_advance_commit()?);
        Ok(Submit::Accepted {
            index,
            term: self.term,
            commands,
        })
    }

    /// One AppendEntries per voting peer, each at that peer's next_index.
    fn broadcast_append(&mut self) -> Result<Vec<Command<C>>, S::Error> {
        let targets: Vec<(NodeId, LogIndex)> = match &self.role {
            Role::Leader(leader) => leader
                .next_index
                .iter()
                .map(|(&id, &next)| (id, next))
                .collect(),
            Role::Follower(_) | Role::Candidate(_) => return Ok(Vec::new()),
        };
        let mut commands = Vec::with_capacity(targets.len());
        for (peer, next) in targets {
            commands.push(self.append_for(peer, next)?);
        }
        Ok(commands)
    }

    /// Build the AppendEntries for one peer: the entry at `next` if one
    /// exists, otherwise an empty heartbeat.
    fn append_for(&self, peer: NodeId, next: LogIndex) -> Result<Command<C>, S::Error> {
        let prev_log_index = next.prev().unwrap_or_default();
        let prev_log_term = self.storage.term_at(prev_log_index)?.unwrap_or_default();
        let entries = match self.storage.entry(next)? {
            Some(entry) => vec![entry],
            None => Vec::new(),
        };
        Ok(Command::Send {
            to: peer,
            message: Message::AppendEntries(AppendEntries {
                term: self.term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            }),
        })
    }

    /// Advance the commit index to the greatest quorum-replicated index, if
    /// that entry is from our own term (the commit-rule restriction: an
    /// earlier-term entry only commits alongside a current-term one). Loops
    /// because stabilizing a config appends a new entry that may itself be
    /// instantly committable in a small cluster.
    fn try_advance_commit(&mut self) -> Result<Vec<Command<C>>, S::Error> {
        let mut commands = Vec::new();
        loop {
            let target = {
                let Role::Leader(leader) = &self.role else {
                    break;
                };
                let last = self.storage.last_log_index()?;
                self.config.quorum_min(self.id, last, &leader.match_index)
            };
            if target <= self.commit_index || self.storage.term_at(target)? != Some(self.term) {
                break;
            }
            let before = self.commit_index;
            commands.extend(self.advance_commit_to(target)?);
            if self.commit_index == before {
                break;
            }
        }
        Ok(commands)
    }

    /// Commit entries one index at a time so nested effects (config
    /// stabilization appending to the log) observe the current commit index.
    fn advance_commit_to(&mut self, target: LogIndex) -> Result<Vec<Command<C>>, S::Error> {
        let mut commands = Vec::new();
        while self.commit_index < target {
            let index = self.commit_index.next();
            let Some(entry) = self.storage.entry(index)? else {
                break;
            };
            self.commit_index = index;

            match entry.payload {
                EntryPayload::Command(command) => {
                    self.committed.push_back(Committed::Command {
                        index,
                        term: entry.term,
                        command,
                    });
                }
                EntryPayload::Config(config) => {
                    // A transitional config committing under dual quorum is
                    // the leader's cue to land the stable one. The guard on
                    // the current config keeps a re-elected leader from
                    // appending a second stable entry for a change that
                    // already completed.
                    if self.is_leader() && self.config == config {
                        if let Some(stable) = config.stabilized() {
                            info!(me = %self.id, config = ?stable, "membership change committed, stabilizing");
                            let moved_to = self
                                .storage
                                .append(LogEntry::config(self.term, stable.clone()))?;
                            self.adopt_config(stable)?;
                            self.committed.push_back(Committed::ConfigStaged {
                                index,
                                term: entry.term,
                                moved_to,
                            });
                            commands.extend(self.broadcast_append()?);
                            continue;
                        }
                    }
                    self.committed.push_back(Committed::Config {
                        index,
                        term: entry.term,
                        config,
                    });
                }
            }
        }
        Ok(commands)
    }
}
