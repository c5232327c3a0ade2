//! Receiving half of the [`Session`]: frame dispatch, the per-type
//! handlers, foreign-source discovery, and the state comparison that drives
//! recovery forward.

use bytes::Bytes;
use tracing::{debug, info, warn};
use web_time::Instant;

use super::{RecvError, Session, State};
use crate::{
    msg::{
        DelegateMessage, Flags, GapMessage, InstallMessage, JoinMessage, LeaveMessage, Message,
        UserMessage,
    },
    node::Node,
    peer::PeerId,
    seq::{SeqRange, Seqno},
};

impl Session {
    /// Feeds one inbound frame into the session.
    ///
    /// `source` is the sender as reported by the transport and must not be
    /// nil. Frames are dropped silently (with a log line) when the protocol
    /// decides they are stale, duplicated or otherwise unwanted; only
    /// undecodable input is reported back.
    ///
    /// # Errors
    ///
    /// Errors if the frame cannot be decoded or the transport violated its
    /// contract. The frame is dropped; the session stays usable.
    pub fn handle_frame(
        &mut self,
        source: PeerId,
        frame: Bytes,
        now: Instant,
    ) -> Result<(), RecvError> {
        if self.state == State::Closed {
            debug!("dropping frame in closed state");
            return Ok(());
        }
        if source.is_nil() {
            return Err(RecvError::NilSource);
        }
        if source == self.self_id {
            warn!("dropping self-originated frame");
            return Ok(());
        }

        let mut buf = frame;
        let msg = Message::decode(&mut buf, Some(source)).map_err(RecvError::Decode)?;
        self.handle_msg(msg, now);
        Ok(())
    }

    fn handle_msg(&mut self, msg: Message, now: Instant) {
        if self.state == State::Closed {
            debug!("dropping message in closed state");
            return;
        }
        let source = msg.source();

        if !self.known.contains_key(&source) {
            self.handle_foreign(msg, now);
            return;
        }

        if msg.is_membership() {
            // Membership frames are ordered by their fifo seq; anything at
            // or below what we already saw from this peer is stale.
            let fifo_seq = msg.fifo_seq().expect("membership frames carry a fifo seq");
            let node = self.known.get_mut(&source).expect("source is known");
            if node.fifo_seq >= fifo_seq {
                warn!(%source, "dropping non-fifo membership message");
                return;
            }
            node.fifo_seq = fifo_seq;
        } else if msg.source_view_id() != self.current_view.id {
            // Non-membership frames are accepted only from the current view
            // or from the view being installed.
            let from_install_view = self
                .install_message
                .as_ref()
                .is_some_and(|imsg| imsg.source_view_id == msg.source_view_id());
            if !from_install_view {
                return;
            }
        }

        match msg {
            Message::User(m) => self.handle_user(&m, now),
            Message::Delegate(m) => self.handle_delegate(&m, now),
            Message::Gap(m) => self.handle_gap(&m, now),
            Message::Join(m) => self.handle_join(&m, now),
            Message::Install(m) => self.handle_install(&m, now),
            Message::Leave(m) => self.handle_leave(&m, now),
        }
    }

    /// A frame from a peer we have never seen: register it and reorganize.
    fn handle_foreign(&mut self, msg: Message, now: Instant) {
        if matches!(msg, Message::Leave(_)) {
            // no point tracking a stranger that is already leaving
            return;
        }
        let source = msg.source();
        debug!(%source, "detected new source");
        self.known.insert(source, Node::new(now));

        if matches!(
            self.state,
            State::Joining | State::Recovery | State::Operational
        ) {
            debug!("shifting to recovery due to foreign frame");
            self.shift_to(State::Recovery, true, now);
        }

        // Store the join only after the shift: a first entry into recovery
        // wipes stored joins.
        if let Message::Join(jm) = msg {
            self.set_join(jm, source);
        }
    }

    fn handle_user(&mut self, msg: &UserMessage, now: Instant) {
        let source = msg.source;
        if msg.flags.contains(Flags::RETRANS) {
            debug!(%source, seq = %msg.seq, "user frame (retransmitted)");
        } else {
            debug!(%source, seq = %msg.seq, "user frame");
        }

        if matches!(self.state, State::Joining | State::Closed) {
            debug!("dropping user frame");
            return;
        }

        if msg.source_view_id != self.current_view.id {
            if self.state == State::Leaving {
                debug!("leaving, dropping user frame");
                return;
            }
            if self.msg_from_previous_view(msg.source_view_id) {
                debug!("user frame from previous view");
                return;
            }

            let (operational, installed) = {
                let node = &self.known[&source];
                (node.operational, node.installed)
            };
            if !operational {
                // probably a partition merge, see if it works out
                debug!(%source, "user frame from unoperational source");
                if let Some(node) = self.known.get_mut(&source) {
                    node.operational = true;
                }
                self.shift_to(State::Recovery, true, now);
                return;
            } else if !installed {
                let from_install_view = self
                    .install_message
                    .as_ref()
                    .is_some_and(|imsg| imsg.source_view_id == msg.source_view_id);
                if from_install_view {
                    debug_assert_eq!(State::Recovery, self.state);
                    debug!(%source, "user frame from view being installed");

                    // Others installed the view before us, so shifting to
                    // operational is safe once consensus still holds.
                    let ids: Vec<PeerId> = self
                        .install_message
                        .as_ref()
                        .expect("checked above")
                        .node_list
                        .keys()
                        .copied()
                        .collect();
                    for id in ids {
                        self.known
                            .get_mut(&id)
                            .expect("install list names unknown node")
                            .installed = true;
                    }
                    if self.is_consensus() {
                        self.shift_to(State::Operational, true, now);
                    } else {
                        self.shift_to(State::Recovery, true, now);
                        return;
                    }
                } else {
                    return;
                }
            } else {
                info!(%source, "user frame from unknown view");
                return;
            }
        }

        debug_assert_eq!(msg.source_view_id, self.current_view.id);

        let prev_aru = self.im.aru_seq();
        let prev_safe = self.im.safe_seq();
        let prev_range = self.im.range(source);
        let range = self.im.insert(source, msg.clone());

        if range.lu > prev_range.lu {
            if let Some(node) = self.known.get_mut(&source) {
                node.tstamp = now;
            }
        }

        // The frame's aru also tells us how far its sender has received;
        // recording it keeps the safe frontier moving without waiting for an
        // explicit ack.
        if !msg.aru_seq.is_none() {
            self.im.set_safe_seq(source, msg.aru_seq);
        }

        if range.hs.0 > range.lu.0 && !msg.flags.contains(Flags::RETRANS) {
            debug!(%source, %range, aru = %self.im.aru_seq(), "input map gap");
            if let Some(hole) = self.im.first_hole(source) {
                self.send_gap(source, self.current_view.id, hole, now);
            }
        }

        if self.output.is_empty()
            && !msg.flags.contains(Flags::MSG_MORE)
            && (self.last_sent.is_none() || self.last_sent.0 < range.hs.0)
        {
            // another peer moved the frontier past us; catch up with an
            // empty completion so the group aru can advance
            self.complete_user(range.hs);
        } else if (self.output.is_empty() && self.im.aru_seq() != prev_aru)
            || self.state == State::Leaving
        {
            debug!("sending empty gap");
            self.send_gap(PeerId::nil(), self.current_view.id, SeqRange::default(), now);
        }

        self.deliver();
        while !self.output.is_empty() {
            if self.send_from_output().is_err() {
                break;
            }
        }

        if self.state == State::Recovery
            && self.last_sent == self.im.aru_seq()
            && (prev_aru != self.im.aru_seq() || prev_safe != self.im.safe_seq())
        {
            debug_assert!(self.output.is_empty());
            let needs_join = self
                .known
                .get(&self.self_id)
                .and_then(|node| node.join_msg.as_ref())
                .map_or(true, |jm| !self.is_consistent(jm));
            if needs_join {
                self.send_join(true, now);
            }
        }
    }

    fn handle_delegate(&mut self, msg: &DelegateMessage, now: Instant) {
        let mut inner = msg.inner.clone();
        match Message::decode(&mut inner, None) {
            Ok(inner_msg) => self.handle_msg(inner_msg, now),
            Err(err) => warn!("failed to decode delegated frame: {err:?}"),
        }
    }

    pub(super) fn handle_gap(&mut self, msg: &GapMessage, now: Instant) {
        let source = msg.source;
        debug!(%source, range_uuid = %msg.range_uuid, "gap frame");

        if matches!(self.state, State::Joining | State::Closed) {
            return;
        }

        let from_install_view = self
            .install_message
            .as_ref()
            .is_some_and(|imsg| imsg.source_view_id == msg.source_view_id);
        if self.state == State::Recovery && from_install_view {
            // a self-addressed gap in the new view is the install ack
            info!(%source, "install gap");
            self.known
                .get_mut(&source)
                .expect("gap from unknown node")
                .installed = true;
            if self.is_all_installed() {
                self.shift_to(State::Operational, true, now);
            }
            return;
        }

        if msg.source_view_id != self.current_view.id {
            if self.msg_from_previous_view(msg.source_view_id) {
                debug!("gap from previous view");
                return;
            }
            let (operational, installed) = {
                let node = &self.known[&source];
                (node.operational, node.installed)
            };
            if !operational {
                // probably a partition merge, see if it works out
                if let Some(node) = self.known.get_mut(&source) {
                    node.operational = true;
                }
                self.shift_to(State::Recovery, true, now);
            } else if !installed {
                // partitioning during recovery; the coming reorganization
                // sorts it out, distrusting the source now would be too
                // harsh
            } else {
                debug!(%source, "gap from unknown view");
            }
            return;
        }

        let prev_safe = self.im.safe_seq();
        if !msg.aru_seq.is_none() {
            self.im.set_safe_seq(source, msg.aru_seq);
        }

        if msg.range_uuid == self.self_id {
            self.resend(source, msg.range);
        } else if self.state == State::Recovery
            && source != self.self_id
            && !msg.range_uuid.is_nil()
        {
            self.recover(source, msg.range_uuid, msg.range);
        }

        self.deliver();
        while self.state == State::Operational && !self.output.is_empty() {
            if self.send_from_output().is_err() {
                break;
            }
        }

        if self.state == State::Recovery
            && self.last_sent == self.im.aru_seq()
            && prev_safe != self.im.safe_seq()
        {
            debug_assert!(self.output.is_empty());
            let needs_join = self
                .known
                .get(&self.self_id)
                .and_then(|node| node.join_msg.as_ref())
                .map_or(true, |jm| !self.is_consistent(jm));
            if needs_join {
                self.send_join(true, now);
            }
        }
    }

    pub(super) fn handle_join(&mut self, msg: &JoinMessage, now: Instant) {
        let source = msg.source;
        debug!(%source, view = %self.current_view.id, "join frame");

        if self.state == State::Leaving {
            return;
        }
        if self.msg_from_previous_view(msg.source_view_id) {
            debug!("join from previous view");
            return;
        }
        if self.install_message.is_some() {
            debug!("install in flight, discarding join");
            return;
        }

        if let Some(node) = self.known.get_mut(&source) {
            node.tstamp = now;
        }

        let pre_consistent = self.is_consistent(msg);
        if self.state == State::Operational && pre_consistent {
            debug!("redundant join");
            return;
        }

        let mut send_join_p = false;
        if matches!(self.state, State::Joining | State::Operational) {
            send_join_p = true;
            self.shift_to(State::Recovery, false, now);
        }

        debug_assert!(!self.known[&source].installed);

        // a peer previously declared unoperational is audibly alive again
        if !self.known[&source].operational {
            if let Some(node) = self.known.get_mut(&source) {
                node.operational = true;
            }
            debug!(%source, "unoperational -> operational");
            send_join_p = true;
        }

        self.set_join(msg.clone(), source);

        if msg.source_view_id == self.current_view.id {
            let prev_safe = self.im.safe_seq();
            if !msg.aru_seq.is_none() {
                self.im.set_safe_seq(source, msg.aru_seq);
            }
            if prev_safe != self.im.safe_seq() {
                debug!(from = %prev_safe, to = %self.im.safe_seq(), "safe seq advanced");
            }

            if msg.aru_seq != self.im.aru_seq() {
                self.states_compare(msg, now);
                return;
            }
            if msg.seq != self.im.safe_seq() {
                self.states_compare(msg, now);
                return;
            }
        }

        // converge towards consensus
        if !msg.node_list.contains_key(&self.self_id) {
            // the source does not know about us yet; no point comparing
            // states
            debug!("not known by source yet");
            send_join_p = true;
        } else if self.current_view.id != msg.source_view_id {
            debug!(view = %msg.source_view_id, "join from different view");
            if !self.is_consistent(msg) {
                send_join_p = true;
            }
        } else if self.states_compare(msg, now) {
            send_join_p = true;
        }

        let self_join_consistent = self
            .known
            .get(&self.self_id)
            .and_then(|node| node.join_msg.as_ref())
            .is_some_and(|jm| self.is_consistent(jm));
        send_join_p = (!self_join_consistent && send_join_p) || !pre_consistent;

        let own = self.create_join();
        self.set_join(own, self.self_id);

        if self.is_consensus() {
            if self.is_representative(self.self_id) {
                info!("consensus reached as representative");
                self.send_install(now);
            } else if !pre_consistent {
                self.send_join(false, now);
            }
        } else if send_join_p && self.output.is_empty() {
            self.send_join(false, now);
        }
    }

    pub(super) fn handle_install(&mut self, msg: &InstallMessage, now: Instant) {
        let source = msg.source;
        if self.state == State::Leaving {
            debug!("dropping install while leaving");
            return;
        }

        info!(%source, view = %msg.source_view_id, "install frame");

        if matches!(self.state, State::Joining | State::Closed) {
            debug!(%source, "dropping install");
            return;
        }
        if !self.known[&source].operational {
            debug!(%source, "install from unoperational source");
            if let Some(node) = self.known.get_mut(&source) {
                node.operational = true;
            }
            self.shift_to(State::Recovery, true, now);
            return;
        }
        if self.msg_from_previous_view(msg.source_view_id) {
            debug!("install from previous view");
            return;
        }
        if self.install_message.is_some() {
            let same_install = self
                .install_message
                .as_ref()
                .is_some_and(|cur| cur.source_view_id == msg.source_view_id);
            if self.is_consistent(msg) && same_install {
                return;
            }
            debug!("conflicting install");
            self.shift_to(State::Recovery, true, now);
            return;
        }
        if self.known[&source].installed {
            debug!(%source, "install from already-installed source");
            self.shift_to(State::Recovery, true, now);
            return;
        }
        if !self.is_representative(source) {
            warn!(%source, "install from non-representative");
            self.shift_to(State::Recovery, true, now);
            return;
        }

        if self.is_consistent(msg) {
            self.install_message = Some(msg.clone());
            // answer with a self-addressed gap in the new view: the install
            // ack
            self.send_gap(self.self_id, msg.source_view_id, SeqRange::default(), now);
        } else {
            warn!(%source, "install not consistent with state");
            self.shift_to(State::Recovery, true, now);
        }
    }

    pub(super) fn handle_leave(&mut self, msg: &LeaveMessage, now: Instant) {
        let source = msg.source;
        info!(%source, "leave frame");
        self.set_leave(msg.clone(), source);

        if source == self.self_id {
            // drain pending payloads as local sends: they still claim
            // sequence numbers and deliver to ourselves, but nothing goes
            // out any more
            while let Some((payload, meta)) = self.output.pop_front() {
                self.send_user(payload, meta.user_type, meta.safety, 0, Seqno::NONE, true)
                    .expect("local sends are not flow controlled");
            }
            self.deliver();
            self.setall_installed(false);
            if let Some(node) = self.known.get_mut(&self.self_id) {
                node.installed = true;
            }
            self.deliver_trans_view(true);
            self.deliver_trans();
            self.deliver_empty_view();
            self.shift_to(State::Closed, false, now);
        } else {
            if self.msg_from_previous_view(msg.source_view_id) {
                debug!("leave from previous view");
                return;
            }
            if let Some(node) = self.known.get_mut(&source) {
                node.operational = false;
            }
            self.shift_to(State::Recovery, true, now);
            if self.is_consensus() && self.is_representative(self.self_id) {
                self.send_install(now);
            }
        }
    }

    /// Reconciles a join message's world view with ours, driving
    /// completions, retransmissions and cross-peer recovery. Returns whether
    /// we owe the group a fresh join broadcast.
    fn states_compare(&mut self, msg: &JoinMessage, now: Instant) -> bool {
        let mut send_join_p = false;

        for (id, mnode) in &msg.node_list {
            if let Some(local) = self.known.get_mut(id) {
                if local.operational != mnode.operational {
                    if local.operational && *id != self.self_id {
                        // only believe a demotion if the peer has also gone
                        // quiet on us, or is leaving
                        if local.tstamp + self.config.inactive_timeout < now || mnode.leaving {
                            debug!(%id, "marking unoperational");
                            local.operational = false;
                            send_join_p = true;
                        }
                    } else {
                        send_join_p = true;
                    }
                }
            } else {
                // wait for direct mutual contact before tracking it
                debug!(%id, "unknown node in join message");
            }

            if mnode.view_id == self.current_view.id {
                let local_safe = self.im.safe_seq_of(*id);
                let lift = (local_safe.is_none() && !mnode.safe_seq.is_none())
                    || (!local_safe.is_none()
                        && !mnode.safe_seq.is_none()
                        && local_safe < mnode.safe_seq);
                if lift {
                    self.im.set_safe_seq(*id, mnode.safe_seq);
                    send_join_p = true;
                }
            }
        }

        let same_view: Vec<(PeerId, SeqRange)> = msg
            .node_list
            .iter()
            .filter(|(_, mnode)| mnode.view_id == self.current_view.id)
            .map(|(id, mnode)| (*id, mnode.im_range))
            .collect();
        if same_view.is_empty() {
            return send_join_p;
        }

        let high_hs = same_view
            .iter()
            .map(|(_, range)| range.hs)
            .filter(|hs| !hs.is_none())
            .max()
            .unwrap_or(Seqno::NONE);
        let (low_uuid, low_lu) = same_view
            .iter()
            .map(|(id, range)| (*id, range.lu))
            .min_by_key(|(_, lu)| {
                // an unknown range sorts below every concrete one
                if lu.is_none() {
                    0u64
                } else {
                    u64::from(lu.0) + 1
                }
            })
            .expect("same_view is non-empty");

        debug_assert!(self.output.is_empty());

        if !high_hs.is_none() {
            let range_ok = !low_lu.is_none() && low_lu.0 <= high_hs.0;
            if self.last_sent.is_none() || self.last_sent.0 < high_hs.0 {
                self.complete_user(high_hs);
            } else if msg.source != self.self_id && msg.source == low_uuid && range_ok {
                self.resend(msg.source, SeqRange::new(low_lu, high_hs));
            }
            send_join_p = true;

            if msg.source != self.self_id && range_ok {
                let partitioned: Vec<PeerId> = self
                    .known
                    .iter()
                    .filter(|(id, node)| {
                        !node.operational && self.current_view.members.contains(*id)
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for id in partitioned {
                    self.recover(msg.source, id, SeqRange::new(low_lu, high_hs));
                }
            }
        }

        send_join_p
    }
}
