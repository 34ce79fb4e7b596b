use std::collections::{BTreeSet, VecDeque};
use std::convert::Infallible;

use crate::command::Command;
use crate::node::Node;
use crate::runtime::{ClientReply, Event, Runtime, StateMachine, TimerConfig};
use crate::storage::MemoryStorage;
use crate::types::{Message, NodeId};

/// A message in flight between nodes.
struct InFlight<C> {
    from: NodeId,
    to: NodeId,
    message: Message<C>,
}

/// Simulated cluster for testing: in-memory storage, an explicit message
/// queue instead of a network, and timers that fire only when a test says
/// so. Node ids are 1-based; indexes into the cluster are 0-based.
pub struct Cluster<C: Clone, S: StateMachine<C>> {
    runtimes: Vec<Runtime<C, S, MemoryStorage<C>>>,
    messages: VecDeque<InFlight<C>>,
    /// Nodes cut off from the network; traffic to and from them is dropped.
    isolated: BTreeSet<NodeId>,
}

/// MemoryStorage cannot fail; unwrap the Result without a panic path.
fn ok<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

impl<C, S> Cluster<C, S>
where
    C: Clone,
    S: StateMachine<C> + Default,
    S::Output: Clone,
{
    /// Create a cluster with the given number of nodes.
    pub fn new(size: usize) -> Self {
        let ids: Vec<NodeId> = (1..=size).map(|i| NodeId::from(i as u64)).collect();

        let runtimes = ids
            .iter()
            .map(|&id| {
                let peers: Vec<NodeId> = ids.iter().filter(|&&p| p != id).copied().collect();
                let node = Node::new(id, peers, MemoryStorage::new());
                Runtime::new(node, S::default(), TimerConfig::default())
            })
            .collect();

        Self {
            runtimes,
            messages: VecDeque::new(),
            isolated: BTreeSet::new(),
        }
    }

    /// Add a fresh node outside the current configuration. It joins the
    /// cluster only once a membership change replicates a config to it; its
    /// timers never fire in simulation.
    pub fn add_node(&mut self, id: u64) {
        let id = NodeId::from(id);
        let peers: Vec<NodeId> = self.runtimes.iter().map(|rt| rt.node().id).collect();
        let node = Node::new(id, peers, MemoryStorage::new());
        self.runtimes
            .push(Runtime::new(node, S::default(), TimerConfig::default()));
    }

    /// Get a reference to a node's runtime by index (0-based).
    pub fn runtime(&self, index: usize) -> &Runtime<C, S, MemoryStorage<C>> {
        &self.runtimes[index]
    }

    /// Get a mutable reference to a node's runtime by index (0-based).
    pub fn runtime_mut(&mut self, index: usize) -> &mut Runtime<C, S, MemoryStorage<C>> {
        &mut self.runtimes[index]
    }

    /// Cut a node off from the network, simulating a crash or partition.
    pub fn isolate(&mut self, index: usize) {
        self.isolated.insert(self.runtimes[index].node().id);
    }

    /// Trigger election timeout on a specific node.
    pub fn election_timeout(&mut self, index: usize) {
        let commands = ok(self.runtimes[index].handle(Event::ElectionTimeout));
        self.queue_commands(index, commands);
    }

    /// Trigger heartbeat timeout on a specific node.
    pub fn heartbeat_timeout(&mut self, index: usize) {
        let commands = ok(self.runtimes[index].handle(Event::HeartbeatTimeout));
        self.queue_commands(index, commands);
    }

    /// Submit a client command to a node.
    pub fn submit(&mut self, index: usize, id: u64, command: C) {
        let commands = ok(self.runtimes[index].submit(id, command));
        self.queue_commands(index, commands);
    }

    /// Submit a membership change to a node.
    pub fn set_config(&mut self, index: usize, id: u64, servers: &[u64]) {
        let servers: BTreeSet<NodeId> = servers.iter().map(|&s| NodeId::from(s)).collect();
        let commands = ok(self.runtimes[index].submit_config(id, servers));
        self.queue_commands(index, commands);
    }

    /// Drain a node's resolved client replies.
    pub fn take_replies(&mut self, index: usize) -> Vec<ClientReply<S::Output>> {
        self.runtimes[index].take_replies()
    }

    /// Deliver all pending messages, including any sent in response.
    pub fn deliver_all(&mut self) {
        while let Some(msg) = self.messages.pop_front() {
            self.deliver(msg);
        }
    }

    /// Deliver a single message and queue any responses.
    fn deliver(&mut self, inflight: InFlight<C>) {
        if self.isolated.contains(&inflight.from) || self.isolated.contains(&inflight.to) {
            return;
        }
        if let Some(index) = self.node_index(inflight.to) {
            let commands = ok(self.runtimes[index].handle(Event::Message {
                from: inflight.from,
                message: inflight.message,
            }));
            self.queue_commands(index, commands);
        }
    }

    /// Queue outgoing commands from a node.
    fn queue_commands(&mut self, from_index: usize, commands: Vec<Command<C>>) {
        let from_id = self.runtimes[from_index].node().id;
        for command in commands {
            if let Command::Send { to, message } = command {
                self.messages.push_back(InFlight {
                    from: from_id,
                    to,
                    message,
                });
            }
        }
    }

    /// Find runtime index by node ID.
    fn node_index(&self, id: NodeId) -> Option<usize> {
        self.runtimes.iter().position(|rt| rt.node().id == id)
    }

    /// Find the current leader, if any.
    pub fn leader(&self) -> Option<usize> {
        self.runtimes
            .iter()
            .position(|rt| rt.node().is_leader())
    }

    /// Count nodes in each role.
    pub fn role_counts(&self) -> (usize, usize, usize) {
        use crate::node::Role;

        let mut followers = 0;
        let mut candidates = 0;
        let mut leaders = 0;

        for rt in &self.runtimes {
            match rt.node().role {
                Role::Follower(_) => followers += 1,
                Role::Candidate(_) => candidates += 1,
                Role::Leader(_) => leaders += 1,
            }
        }

        (followers, candidates, leaders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvCommand, KvResult, KvStore};
    use crate::membership::Membership;
    use crate::runtime::Applied;
    use crate::storage::Storage;
    use crate::types::{LogIndex, Term};

    type KvCluster = Cluster<KvCommand, KvStore>;

    fn set(key: &str, value: &str) -> KvCommand {
        KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn single_node_becomes_leader() {
        let mut cluster: KvCluster = Cluster::new(1);

        cluster.election_timeout(0);

        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.runtime(0).node().term(), Term::from(1));
    }

    #[test]
    fn three_node_leader_election() {
        let mut cluster: KvCluster = Cluster::new(3);

        // Node 0 starts election.
        cluster.election_timeout(0);
        assert_eq!(cluster.role_counts(), (2, 1, 0));

        // Deliver vote requests and responses.
        cluster.deliver_all();

        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.role_counts(), (2, 0, 1));
    }

    #[test]
    fn competing_candidates_elect_at_most_one_leader() {
        let mut cluster: KvCluster = Cluster::new(3);

        cluster.election_timeout(0);
        cluster.election_timeout(1);
        cluster.deliver_all();

        let (_, _, leaders) = cluster.role_counts();
        assert!(leaders <= 1);

        // The survivor's heartbeats pull the losing candidate down.
        if let Some(leader) = cluster.leader() {
            cluster.heartbeat_timeout(leader);
            cluster.deliver_all();
            assert_eq!(cluster.role_counts(), (2, 0, 1));
        }
    }

    #[test]
    fn leader_replicates_and_answers_client() {
        let mut cluster: KvCluster = Cluster::new(3);

        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));

        cluster.submit(0, 1, set("x", "1"));
        cluster.deliver_all();

        // Every log ends with the entry, and the leader has committed it.
        for i in 0..3 {
            assert_eq!(
                cluster.runtime(i).node().last_log_index().unwrap(),
                LogIndex::from(1)
            );
        }
        assert_eq!(cluster.runtime(0).node().commit_index(), LogIndex::from(1));

        let replies = cluster.take_replies(0);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 1);
        assert_eq!(replies[0].result, Ok(Applied::Command(KvResult::Written)));

        // Followers learn the commit index from the next heartbeat.
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        for i in 1..3 {
            assert_eq!(cluster.runtime(i).node().commit_index(), LogIndex::from(1));
        }
    }

    #[test]
    fn new_leader_emerges_with_committed_entry_after_crash() {
        let mut cluster: KvCluster = Cluster::new(3);

        cluster.election_timeout(0);
        cluster.deliver_all();
        cluster.submit(0, 1, set("x", "1"));
        cluster.deliver_all();
        assert_eq!(cluster.runtime(0).node().commit_index(), LogIndex::from(1));

        // Leader gone; a follower times out and takes over. The old leader
        // still believes it leads — it simply cannot be heard.
        cluster.isolate(0);
        cluster.election_timeout(1);
        cluster.deliver_all();

        let new_leader = cluster.runtime(1).node();
        assert!(new_leader.is_leader());
        assert!(new_leader.term() >= Term::from(2));
        assert_eq!(new_leader.last_log_index().unwrap(), LogIndex::from(1));
        assert_eq!(
            new_leader.storage().term_at(LogIndex::from(1)).unwrap(),
            Some(Term::from(1))
        );
    }

    #[test]
    fn followers_commit_on_leader_heartbeat() {
        let mut cluster: KvCluster = Cluster::new(3);

        cluster.election_timeout(0);
        cluster.deliver_all();

        cluster.submit(0, 1, set("y", "2"));

        // First round: replicate the entry. Second round: propagate commit.
        cluster.deliver_all();
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        for i in 1..3 {
            assert_eq!(cluster.runtime(i).node().commit_index(), LogIndex::from(1));
        }
    }

    #[test]
    fn joint_consensus_adds_a_server() {
        let mut cluster: KvCluster = Cluster::new(3);

        cluster.election_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.leader(), Some(0));

        // Server 4 exists but holds no vote until the change commits.
        cluster.add_node(4);
        cluster.set_config(0, 9, &[1, 2, 4]);

        // The transitional entry needs a majority of {1,2,3} and of {1,2,4};
        // once it commits the leader appends the stable config, which
        // commits in turn.
        cluster.deliver_all();

        let replies = cluster.take_replies(0);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 9);
        assert_eq!(
            replies[0].result,
            Ok(Applied::Config(Membership::stable(
                [1, 2, 4].map(NodeId::from)
            )))
        );

        assert_eq!(
            *cluster.runtime(0).node().config(),
            Membership::stable([1, 2, 4].map(NodeId::from))
        );

        // The new server replicated both config entries.
        assert_eq!(
            cluster.runtime(3).node().last_log_index().unwrap(),
            LogIndex::from(2)
        );
        assert_eq!(
            *cluster.runtime(3).node().config(),
            Membership::stable([1, 2, 4].map(NodeId::from))
        );
    }

    #[test]
    fn removed_server_stops_receiving_entries() {
        let mut cluster: KvCluster = Cluster::new(3);

        cluster.election_timeout(0);
        cluster.deliver_all();

        cluster.set_config(0, 5, &[1, 2]);
        cluster.deliver_all();
        assert_eq!(
            *cluster.runtime(0).node().config(),
            Membership::stable([1, 2].map(NodeId::from))
        );

        let before = cluster.runtime(2).node().last_log_index().unwrap();
        cluster.submit(0, 6, set("z", "9"));
        cluster.deliver_all();

        // Node 3 is out of the configuration and sees no new entries.
        assert_eq!(cluster.runtime(2).node().last_log_index().unwrap(), before);
        assert_eq!(
            cluster.runtime(0).node().last_log_index().unwrap(),
            LogIndex::from(3)
        );
        assert_eq!(cluster.runtime(0).node().commit_index(), LogIndex::from(3));
    }

    #[test]
    fn terms_never_decrease_across_elections() {
        let mut cluster: KvCluster = Cluster::new(3);

        let mut last_terms = vec![Term::default(); 3];
        for round in 0..3 {
            cluster.election_timeout(round % 3);
            cluster.deliver_all();
            for i in 0..3 {
                let term = cluster.runtime(i).node().term();
                assert!(term >= last_terms[i]);
                last_terms[i] = term;
            }
        }
    }
}
