use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::command::Command;
use crate::membership::Membership;
use crate::node::{Committed, Node, Submit};
use crate::storage::Storage;
use crate::types::{LogIndex, Message, NodeId, Term};

/// Trait for state machines that can apply commands. `apply` must be
/// deterministic: every replica applies the same committed commands in the
/// same order and must end up in the same state.
pub trait StateMachine<Cmd> {
    type Output;
    fn apply(&mut self, command: Cmd) -> Self::Output;
}

/// Events that drive the runtime.
pub enum Event<Cmd> {
    ElectionTimeout,
    HeartbeatTimeout,
    /// An outstanding client request passed its deadline.
    ClientTimeout(u64),
    Message { from: NodeId, message: Message<Cmd> },
}

/// Timer configuration.
pub struct TimerConfig {
    /// Election timeouts are sampled uniformly from [min, max) so nodes
    /// time out at different moments, preventing repeated split votes.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// How long a client request may wait for its entry to commit.
    pub client_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(75),
            client_timeout: Duration::from_millis(2000),
        }
    }
}

/// Why a client request failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("no leader elected yet")]
    ElectionInProgress,
    #[error("not the leader, retry at {0}")]
    NotLeader(NodeId),
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,
    #[error("request did not commit before its deadline")]
    Timeout,
}

/// What a successful client request produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied<O> {
    /// State-machine output of a committed command.
    Command(O),
    /// The stable configuration a membership change resolved to.
    Config(Membership),
}

/// Resolution of one client request. Issued exactly once per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientReply<O> {
    pub id: u64,
    pub result: Result<Applied<O>, ClientError>,
}

/// A client request waiting for its log entry to commit. Requests share one
/// timeout, so arrival order is deadline order and a FIFO replaces a timer
/// per request.
struct PendingRequest {
    id: u64,
    index: LogIndex,
    term: Term,
    deadline: Instant,
}

/// Runtime that wraps a consensus node with timer management, client-request
/// tracking and state-machine application. The node decides; the runtime
/// keeps the clocks and hands committed commands to the state machine.
pub struct Runtime<Cmd, M: StateMachine<Cmd>, S: Storage<Cmd>> {
    node: Node<Cmd, S>,
    state_machine: M,
    config: TimerConfig,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    pending: VecDeque<PendingRequest>,
    /// Outputs produced by applying committed entries, in log order.
    /// Drained by the caller via take_outputs after each handle() call.
    outputs: Vec<(LogIndex, M::Output)>,
    /// Client replies ready to deliver, in commit order.
    replies: Vec<ClientReply<M::Output>>,
}

impl<Cmd, M, S> Runtime<Cmd, M, S>
where
    Cmd: Clone,
    M: StateMachine<Cmd>,
    M::Output: Clone,
    S: Storage<Cmd>,
{
    pub fn new(node: Node<Cmd, S>, state_machine: M, config: TimerConfig) -> Self {
        let now = Instant::now();
        Self {
            node,
            state_machine,
            election_deadline: now + config.election_timeout_max,
            heartbeat_deadline: now + config.heartbeat_interval,
            config,
            pending: VecDeque::new(),
            outputs: Vec::new(),
            replies: Vec::new(),
        }
    }

    /// Reconstruct a runtime after a crash by loading persistent state from
    /// storage. The node restarts as a follower. The caller supplies a fresh
    /// state machine; committed entries are re-applied once the next leader
    /// drives the commit index forward again. Replies for requests that were
    /// in flight when the process died are never re-delivered.
    pub fn from_storage(
        id: NodeId,
        peers: Vec<NodeId>,
        state_machine: M,
        storage: S,
        config: TimerConfig,
    ) -> Result<Self, S::Error> {
        let node = Node::from_storage(id, peers, storage)?;
        Ok(Self::new(node, state_machine, config))
    }

    pub fn node(&self) -> &Node<Cmd, S> {
        &self.node
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    pub fn state_machine_mut(&mut self) -> &mut M {
        &mut self.state_machine
    }

    /// The leader to direct clients at, as far as this node knows.
    pub fn leader(&self) -> Option<NodeId> {
        self.node.leader_hint()
    }

    /// Process one event, update timers, and apply whatever committed.
    /// Returns the outbound commands for the caller to dispatch.
    pub fn handle(&mut self, event: Event<Cmd>) -> Result<Vec<Command<Cmd>>, S::Error> {
        let commands = match event {
            Event::ElectionTimeout => self.node.election_timeout()?,
            Event::HeartbeatTimeout => self.node.heartbeat_timeout()?,
            Event::ClientTimeout(id) => {
                self.expire_client(id);
                Vec::new()
            }
            Event::Message { from, message } => self.handle_message(from, message)?,
        };

        self.process_commands(&commands);
        self.drain_committed();
        Ok(commands)
    }

    /// Which timer fired, if any. Client deadlines come last so a commit
    /// racing a deadline resolves the request first.
    pub fn poll_timers(&self) -> Option<Event<Cmd>> {
        let now = Instant::now();

        if self.node.is_leader() {
            if now >= self.heartbeat_deadline {
                return Some(Event::HeartbeatTimeout);
            }
        } else if now >= self.election_deadline {
            return Some(Event::ElectionTimeout);
        }

        if let Some(pending) = self.pending.front() {
            if now >= pending.deadline {
                return Some(Event::ClientTimeout(pending.id));
            }
        }
        None
    }

    /// Time until the next timer fires.
    pub fn next_deadline(&self) -> Instant {
        let role_deadline = if self.node.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        };
        match self.pending.front() {
            Some(pending) => role_deadline.min(pending.deadline),
            None => role_deadline,
        }
    }

    /// Submit a client command under `id`. Non-leaders answer immediately
    /// with a redirect; on the leader the reply arrives through
    /// take_replies once the entry commits or the deadline passes.
    pub fn submit(&mut self, id: u64, command: Cmd) -> Result<Vec<Command<Cmd>>, S::Error> {
        let outcome = self.node.submit(command)?;
        Ok(self.register(id, outcome))
    }

    /// Submit a membership change under `id`. The reply carries the final
    /// stable configuration.
    pub fn submit_config(
        &mut self,
        id: u64,
        servers: BTreeSet<NodeId>,
    ) -> Result<Vec<Command<Cmd>>, S::Error> {
        let outcome = self.node.submit_config(servers)?;
        Ok(self.register(id, outcome))
    }

    fn register(&mut self, id: u64, outcome: Submit<Cmd>) -> Vec<Command<Cmd>> {
        match outcome {
            Submit::Accepted {
                index,
                term,
                commands,
            } => {
                self.pending.push_back(PendingRequest {
                    id,
                    index,
                    term,
                    deadline: Instant::now() + self.config.client_timeout,
                });
                self.process_commands(&commands);
                // A single-server cluster commits on append.
                self.drain_committed();
                commands
            }
            Submit::NotLeader { leader } => {
                let error = match leader {
                    Some(leader) => ClientError::NotLeader(leader),
                    None => ClientError::ElectionInProgress,
                };
                self.replies.push(ClientReply {
                    id,
                    result: Err(error),
                });
                Vec::new()
            }
            Submit::ChangeRejected => {
                self.replies.push(ClientReply {
                    id,
                    result: Err(ClientError::ConfigChangeInProgress),
                });
                Vec::new()
            }
        }
    }

    /// Drain all state machine outputs accumulated since the last call.
    /// Each entry is (log_index, output) in application order.
    pub fn take_outputs(&mut self) -> Vec<(LogIndex, M::Output)> {
        std::mem::take(&mut self.outputs)
    }

    /// Drain client replies resolved since the last call, in commit order.
    pub fn take_replies(&mut self) -> Vec<ClientReply<M::Output>> {
        std::mem::take(&mut self.replies)
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        message: Message<Cmd>,
    ) -> Result<Vec<Command<Cmd>>, S::Error> {
        match message {
            Message::RequestVote(req) => self.node.handle_request_vote(req),
            Message::RequestVoteResponse(resp) => {
                self.node.handle_request_vote_response(from, resp)
            }
            Message::AppendEntries(req) => self.node.handle_append_entries(req),
            Message::AppendEntriesResponse(resp) => {
                self.node.handle_append_entries_response(from, resp)
            }
        }
    }

    fn process_commands(&mut self, commands: &[Command<Cmd>]) {
        for command in commands {
            match command {
                Command::ResetElectionTimer => {
                    let base = self.config.election_timeout_min;
                    let spread = self
                        .config
                        .election_timeout_max
                        .saturating_sub(base)
                        .as_millis()
                        .max(1) as u64;
                    let jitter = rand::rng().random_range(0..spread);
                    self.election_deadline =
                        Instant::now() + base + Duration::from_millis(jitter);
                }
                Command::ResetHeartbeatTimer => {
                    self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
                }
                Command::Send { .. } => {
                    // Sending is handled by caller.
                }
            }
        }
    }

    /// Apply committed commands to the state machine and settle the client
    /// requests waiting on them.
    fn drain_committed(&mut self) {
        while let Some(committed) = self.node.take_committed() {
            match committed {
                Committed::Command {
                    index,
                    term,
                    command,
                } => {
                    let output = self.state_machine.apply(command);
                    self.outputs.push((index, output.clone()));
                    self.resolve(index, term, Applied::Command(output));
                }
                Committed::Config {
                    index,
                    term,
                    config,
                } => {
                    // Only a stable config answers a client. A transitional
                    // one can commit here after leadership moved on; the
                    // request it belonged to falls to its deadline.
                    if !config.is_transitional() {
                        self.resolve(index, term, Applied::Config(config));
                    }
                }
                Committed::ConfigStaged {
                    index,
                    term,
                    moved_to,
                } => {
                    // The change's client request now waits on the stable
                    // entry, which was appended in the current term. Both
                    // index and term must match, exactly as in resolve():
                    // the slot may hold another leader's entry by now.
                    let new_term = self.node.term();
                    if let Some(pending) = self
                        .pending
                        .iter_mut()
                        .find(|p| p.index == index && p.term == term)
                    {
                        pending.index = moved_to;
                        pending.term = new_term;
                    }
                }
            }
        }
    }

    /// Settle the request parked at `index`, if any. The term must match:
    /// if another leader overwrote the slot, the waiting request can only
    /// time out.
    fn resolve(&mut self, index: LogIndex, term: Term, applied: Applied<M::Output>) {
        let Some(pos) = self
            .pending
            .iter()
            .position(|p| p.index == index && p.term == term)
        else {
            return;
        };
        if let Some(pending) = self.pending.remove(pos) {
            self.replies.push(ClientReply {
                id: pending.id,
                result: Ok(applied),
            });
        }
    }

    /// A request's deadline fired. A request resolved just before its
    /// timeout is simply gone; that race is a no-op here.
    fn expire_client(&mut self, id: u64) {
        let Some(pos) = self.pending.iter().position(|p| p.id == id) else {
            return;
        };
        if let Some(pending) = self.pending.remove(pos) {
            self.replies.push(ClientReply {
                id: pending.id,
                result: Err(ClientError::Timeout),
            });
        }
    }
}
