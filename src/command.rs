use crate::types::{Message, NodeId};

/// Effects that the node asks its runtime to carry out. The node itself
/// performs no I/O and holds no clock.
pub enum Command<C> {
    /// Send a message to a specific peer.
    Send { to: NodeId, message: Message<C> },
    /// Re-arm the election timer with a fresh randomized duration.
    ResetElectionTimer,
    /// Re-arm the heartbeat timer (leader only).
    ResetHeartbeatTimer,
}
