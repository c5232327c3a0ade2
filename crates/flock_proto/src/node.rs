//! See [`Node`].

use std::collections::BTreeMap;

use web_time::Instant;

use crate::{
    msg::{JoinMessage, LeaveMessage},
    peer::PeerId,
};

/// Everything one peer tracks about another peer (or itself).
///
/// # Insertion policy
///
/// A record is created on first contact: at session creation for the local
/// peer, and when a frame from an unknown source arrives for everyone else.
///
/// # Removal policy
///
/// Records with `installed == false` are erased when the session closes and
/// after each view installation.
#[derive(Debug)]
pub struct Node {
    /// Whether this peer is believed to be alive and participating.
    pub operational: bool,
    /// Whether this peer has acknowledged the pending view installation.
    pub installed: bool,
    /// When we last saw reception progress from this peer.
    pub tstamp: Instant,
    /// Latest join message received from this peer, if any.
    pub join_msg: Option<JoinMessage>,
    /// Leave message received from this peer, if any. First one wins.
    pub leave_msg: Option<LeaveMessage>,
    /// Highest membership ordering counter seen from this peer; membership
    /// frames at or below it are stale and dropped.
    pub fifo_seq: i64,
}

impl Node {
    /// Creates a record for a peer first seen at `now`.
    #[must_use]
    pub const fn new(now: Instant) -> Self {
        Self {
            operational: true,
            installed: false,
            tstamp: now,
            join_msg: None,
            leave_msg: None,
            fifo_seq: -1,
        }
    }
}

/// All peers known to a session, keyed and iterated by identity.
///
/// Iteration order is protocol-visible: the representative is the first
/// operational entry.
pub type NodeMap = BTreeMap<PeerId, Node>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_operational() {
        let node = Node::new(Instant::now());
        assert!(node.operational);
        assert!(!node.installed);
        assert_eq!(-1, node.fifo_seq);
        assert!(node.join_msg.is_none());
        assert!(node.leave_msg.is_none());
    }
}
