//! Consistency predicates over membership snapshots, and the consensus test
//! that gates view installation.
//!
//! Two peers are consistent when they agree on who is proceeding into the
//! next view, who partitioned, who is leaving, and on the aru/safe frontiers
//! and received ranges for the current view. Consensus holds on a peer once
//! its own join is self-consistent and every operational peer's join is
//! consistent with it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::Session;
use crate::{
    msg::Membership,
    peer::PeerId,
    seq::SeqRange,
};

impl Session {
    /// Gets whether `uuid` is the install representative: the smallest
    /// operational identity in the node table.
    pub(super) fn is_representative(&self, uuid: PeerId) -> bool {
        self.known
            .iter()
            .find(|(_, node)| node.operational)
            .is_some_and(|(id, _)| *id == uuid)
    }

    /// Gets whether consensus holds on this peer: its own join exists and is
    /// self-consistent, and every operational peer has a consistent join.
    pub(super) fn is_consensus(&self) -> bool {
        let Some(my_join) = self
            .known
            .get(&self.self_id)
            .and_then(|node| node.join_msg.as_ref())
        else {
            debug!("no own join message");
            return false;
        };
        if !self.is_consistent_same_view(my_join) {
            debug!("own join message is not consistent");
            return false;
        }

        for (id, node) in &self.known {
            if !node.operational {
                continue;
            }
            let Some(join) = node.join_msg.as_ref() else {
                debug!(%id, "no join message");
                return false;
            };
            if !self.is_consistent(join) {
                debug!(%id, "join message not consistent");
                return false;
            }
        }
        debug!("consensus reached");
        true
    }

    /// Gets whether a membership snapshot is consistent with local state,
    /// picking the same-view or joining comparison by the snapshot's view.
    pub(super) fn is_consistent<M: Membership>(&self, msg: &M) -> bool {
        if msg.source_view_id() == self.current_view.id {
            self.is_consistent_same_view(msg)
        } else {
            self.is_consistent_joining(msg)
        }
    }

    /// Consistency for a snapshot from our own current view: frontiers and
    /// the proceeding / partitioned / leaving splits must all agree.
    pub(super) fn is_consistent_same_view<M: Membership>(&self, msg: &M) -> bool {
        debug_assert_eq!(msg.source_view_id(), self.current_view.id);

        if self.im.aru_seq() != msg.aru_seq() {
            debug!(
                local = %self.im.aru_seq(),
                remote = %msg.aru_seq(),
                "aru seq not consistent",
            );
            return false;
        }
        if self.im.safe_seq() != msg.seq() {
            debug!(
                local = %self.im.safe_seq(),
                remote = %msg.seq(),
                "safe seq not consistent",
            );
            return false;
        }
        if !self.is_consistent_input_map(msg) {
            debug!("input map not consistent");
            return false;
        }
        if !self.is_consistent_partitioning(msg) {
            debug!("partitioning not consistent");
            return false;
        }
        if !self.is_consistent_leaving(msg) {
            debug!("leaving not consistent");
            return false;
        }
        true
    }

    /// Compares the received ranges of members proceeding in the current
    /// view.
    fn is_consistent_input_map<M: Membership>(&self, msg: &M) -> bool {
        debug_assert_eq!(msg.source_view_id(), self.current_view.id);

        let mut local = BTreeMap::<PeerId, SeqRange>::new();
        for (id, node) in &self.known {
            let join_in_view = node
                .join_msg
                .as_ref()
                .is_some_and(|jm| jm.source_view_id == self.current_view.id);
            if node.operational && join_in_view {
                local.insert(*id, self.im.range(*id));
            }
        }

        let mut remote = BTreeMap::<PeerId, SeqRange>::new();
        for (id, mnode) in msg.node_list() {
            if mnode.operational && !mnode.leaving && mnode.view_id == self.current_view.id {
                remote.insert(*id, mnode.im_range);
            }
        }

        local == remote
    }

    /// Compares the received ranges of current-view members that partitioned
    /// away (non-operational, not leaving).
    fn is_consistent_partitioning<M: Membership>(&self, msg: &M) -> bool {
        debug_assert_eq!(msg.source_view_id(), self.current_view.id);

        let mut local = BTreeMap::<PeerId, SeqRange>::new();
        for (id, node) in &self.known {
            if !node.operational
                && node.leave_msg.is_none()
                && self.current_view.members.contains(id)
            {
                local.insert(*id, self.im.range(*id));
            }
        }

        let mut remote = BTreeMap::<PeerId, SeqRange>::new();
        for (id, mnode) in msg.node_list() {
            if !mnode.operational && !mnode.leaving && mnode.view_id == self.current_view.id {
                remote.insert(*id, mnode.im_range);
            }
        }

        local == remote
    }

    /// Compares the received ranges of current-view members that are leaving
    /// gracefully.
    fn is_consistent_leaving<M: Membership>(&self, msg: &M) -> bool {
        debug_assert_eq!(msg.source_view_id(), self.current_view.id);

        let mut local = BTreeMap::<PeerId, SeqRange>::new();
        for (id, node) in &self.known {
            if !node.operational
                && self.has_leave(*id)
                && self.current_view.members.contains(id)
            {
                local.insert(*id, self.im.range(*id));
            }
        }

        let mut remote = BTreeMap::<PeerId, SeqRange>::new();
        for (id, mnode) in msg.node_list() {
            if !mnode.operational && mnode.leaving && mnode.view_id == self.current_view.id {
                remote.insert(*id, mnode.im_range);
            }
        }

        local == remote
    }

    /// Consistency for a snapshot from another view: the sets of operational
    /// identities must match, and where our stored joins come from the
    /// snapshot's view, their frontiers must agree with it.
    fn is_consistent_joining<M: Membership>(&self, msg: &M) -> bool {
        debug_assert_ne!(msg.source_view_id(), self.current_view.id);

        let mut local = BTreeSet::<PeerId>::new();
        for (id, node) in &self.known {
            if !node.operational {
                continue;
            }
            let Some(join) = node.join_msg.as_ref() else {
                return false;
            };
            if msg.source_view_id() == join.source_view_id {
                if msg.aru_seq() != join.aru_seq {
                    return false;
                }
                if msg.seq() != join.seq {
                    return false;
                }
            }
            local.insert(*id);
        }

        let remote: BTreeSet<PeerId> = msg
            .node_list()
            .iter()
            .filter(|(_, mnode)| mnode.operational)
            .map(|(id, _)| *id)
            .collect();

        local == remote
    }

    /// Gets whether `uuid` is known to be leaving: either we hold its leave
    /// message, or any stored join claims it is leaving.
    pub(super) fn has_leave(&self, uuid: PeerId) -> bool {
        if self
            .known
            .get(&uuid)
            .is_some_and(|node| node.leave_msg.is_some())
        {
            return true;
        }
        self.known.values().any(|node| {
            node.join_msg
                .as_ref()
                .and_then(|jm| jm.node_list.get(&uuid))
                .is_some_and(|mnode| mnode.leaving)
        })
    }
}
