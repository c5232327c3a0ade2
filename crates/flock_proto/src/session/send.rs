//! Sending half of the [`Session`]: the user send path, completions,
//! control frames, retransmission and delegated recovery.

use bytes::Bytes;
use tracing::{debug, info, warn};
use web_time::Instant;

use super::{SendError, Session, State};
use crate::{
    msg::{
        DelegateMessage, Flags, GapMessage, InstallMessage, JoinMessage, LeaveMessage, Message,
        MessageNode, NodeList, SafetyPrefix, UserMessage, USER_TYPE_COMPLETE,
    },
    peer::PeerId,
    seq::{is_flow_control, SeqRange, Seqno},
    view::ViewId,
};

impl Session {
    pub(super) fn transmit(&mut self, msg: &Message) {
        self.transmits.push_back(msg.encode_frame());
    }

    /// Sends one user message.
    ///
    /// The message is inserted into the input map *before* the frame is
    /// stamped, so that the outgoing header claims the aru advanced by our
    /// own send. `up_to_seqno` batches a span of empty sequence numbers into
    /// one frame (completions); `local` assigns sequence numbers without
    /// emitting anything, used when draining the queue on a graceful leave.
    ///
    /// # Errors
    ///
    /// Errors with [`SendError::Backpressure`] when flow control refuses the
    /// send; only the operational state is subject to it.
    pub(super) fn send_user(
        &mut self,
        payload: Bytes,
        user_type: u8,
        safety: SafetyPrefix,
        win: u32,
        up_to_seqno: Seqno,
        local: bool,
    ) -> Result<(), SendError> {
        debug_assert!(matches!(
            self.state,
            State::Leaving | State::Recovery | State::Operational
        ));

        let seq = if self.last_sent.is_none() {
            Seqno(0)
        } else {
            self.last_sent + 1
        };

        // Flow control applies to operational sends only, so that recovery
        // and leave flushes can always drain the output queue.
        if !local
            && self.state == State::Operational
            && is_flow_control(seq, self.im.aru_seq(), win)
        {
            return Err(SendError::Backpressure);
        }

        #[allow(clippy::cast_possible_truncation)] // clamped to fit
        let seq_range = if up_to_seqno.is_none() {
            0u8
        } else {
            up_to_seqno.since(seq).min(0xff) as u8
        };
        let last_msg_seq = seq + u32::from(seq_range);

        let flags = if self.output.len() < 2
            || !up_to_seqno.is_none()
            || is_flow_control(last_msg_seq + 1, self.im.aru_seq(), win)
        {
            Flags::NONE
        } else {
            Flags::MSG_MORE
        };

        let msg = UserMessage {
            source: self.self_id,
            source_view_id: self.current_view.id,
            seq,
            aru_seq: self.im.aru_seq(),
            seq_range,
            safety,
            user_type,
            flags,
            payload,
        };
        let range = self.im.insert(self.self_id, msg.clone());
        self.last_sent = last_msg_seq;
        debug_assert_eq!(range.hs, self.last_sent);
        let aru_seq = self.im.aru_seq();
        self.im.set_safe_seq(self.self_id, aru_seq);

        if !local {
            self.transmit(&Message::User(msg.with_aru_seq(aru_seq)));
            self.stats.msgs_sent += 1;
        }

        if !self.delivering {
            self.deliver();
        }
        Ok(())
    }

    /// Sends the payload at the front of the output queue, popping it on
    /// success.
    pub(super) fn send_from_output(&mut self) -> Result<(), SendError> {
        let Some((payload, meta)) = self.output.front() else {
            return Ok(());
        };
        debug_assert!(matches!(
            self.state,
            State::Operational | State::Recovery
        ));
        let (payload, meta) = (payload.clone(), *meta);
        self.send_user(
            payload,
            meta.user_type,
            meta.safety,
            self.config.send_window,
            Seqno::NONE,
            false,
        )?;
        self.output.pop_front();
        Ok(())
    }

    /// Sends queued payloads until the queue empties or flow control pushes
    /// back.
    pub(super) fn flush_output(&mut self) {
        while !self.output.is_empty() {
            if self.send_from_output().is_err() {
                break;
            }
        }
    }

    /// Advances our own sequence numbers up to `high_seq` with one empty
    /// frame, so the group's frontier does not stall on a silent member.
    pub(super) fn complete_user(&mut self, high_seq: Seqno) {
        debug!(%high_seq, "completing seqno");
        if let Err(err) = self.send_user(
            Bytes::new(),
            USER_TYPE_COMPLETE,
            SafetyPrefix::Drop,
            self.config.send_window,
            high_seq,
            false,
        ) {
            warn!("failed to send completing message: {err}");
        }
    }

    fn send_delegate(&mut self, inner: Bytes) {
        let msg = DelegateMessage {
            source: self.self_id,
            source_view_id: self.current_view.id,
            flags: Flags::NONE,
            inner,
        };
        self.transmit(&Message::Delegate(msg));
    }

    /// Broadcasts a gap frame and loops it back through the local handler.
    ///
    /// A nil `range_uuid` is a pure ack; our own id requests retransmission
    /// from the receiver of the frame; any other id asks for delegated
    /// recovery of that peer's messages.
    pub(super) fn send_gap(
        &mut self,
        range_uuid: PeerId,
        source_view_id: ViewId,
        range: SeqRange,
        now: Instant,
    ) {
        debug!(%range_uuid, %range, "sending gap");
        let msg = GapMessage {
            source: self.self_id,
            source_view_id,
            seq: self.last_sent,
            aru_seq: self.im.aru_seq(),
            range_uuid,
            range,
            flags: Flags::NONE,
        };
        self.transmit(&Message::Gap(msg.clone()));
        self.stats.gaps_sent += 1;
        self.handle_gap(&msg, now);
    }

    /// Builds the per-peer state snapshot carried by join and install
    /// frames.
    fn populate_node_list(&self) -> NodeList {
        let mut list = NodeList::new();
        for (id, node) in &self.known {
            let in_current = self.current_view.members.contains(id);
            let view_id = node.join_msg.as_ref().map_or(
                if in_current {
                    self.current_view.id
                } else {
                    ViewId::nil()
                },
                |jm| jm.source_view_id,
            );
            let safe_seq = if in_current {
                self.im.safe_seq_of(*id)
            } else {
                Seqno::NONE
            };
            let im_range = if in_current {
                self.im.range(*id)
            } else {
                SeqRange::default()
            };
            list.insert(
                *id,
                MessageNode {
                    operational: node.operational,
                    leaving: self.has_leave(*id),
                    view_id,
                    safe_seq,
                    im_range,
                },
            );
        }
        list
    }

    /// Builds our join message from current state.
    ///
    /// # Panics
    ///
    /// Panics if the result is not consistent with the state it was built
    /// from; that is a protocol bug, not a remote anomaly.
    pub(super) fn create_join(&mut self) -> JoinMessage {
        self.fifo_seq += 1;
        let msg = JoinMessage {
            source: self.self_id,
            source_view_id: self.current_view.id,
            seq: self.im.safe_seq(),
            aru_seq: self.im.aru_seq(),
            fifo_seq: self.fifo_seq,
            node_list: self.populate_node_list(),
            flags: Flags::NONE,
        };
        assert!(
            self.is_consistent(&msg),
            "self-authored join message is inconsistent",
        );
        msg
    }

    pub(super) fn set_join(&mut self, msg: JoinMessage, source: PeerId) {
        self.known
            .get_mut(&source)
            .expect("join for unknown node")
            .join_msg = Some(msg);
    }

    pub(super) fn set_leave(&mut self, msg: LeaveMessage, source: PeerId) {
        let node = self
            .known
            .get_mut(&source)
            .expect("leave for unknown node");
        if let Some(old) = &node.leave_msg {
            warn!(
                %source,
                old_fifo = old.fifo_seq,
                new_fifo = msg.fifo_seq,
                "duplicate leave message",
            );
        } else {
            node.leave_msg = Some(msg);
        }
    }

    /// Broadcasts our join. With `handle` set the join is looped back
    /// through the local join handler (driving consensus forward on this
    /// peer too); otherwise it is only stored as our current join.
    pub(super) fn send_join(&mut self, handle: bool, now: Instant) {
        debug_assert!(self.output.is_empty());
        let msg = self.create_join();
        debug!(fifo_seq = msg.fifo_seq, "sending join");
        self.transmit(&Message::Join(msg.clone()));
        if handle {
            self.handle_join(&msg, now);
        } else {
            self.set_join(msg, self.self_id);
        }
    }

    /// Broadcasts our leave and loops it back, which drains the session and
    /// closes it.
    pub(super) fn send_leave(&mut self, now: Instant) {
        debug_assert_eq!(State::Leaving, self.state);
        debug!(last_sent = %self.last_sent, "sending leave");
        self.fifo_seq += 1;
        let msg = LeaveMessage {
            source: self.self_id,
            source_view_id: self.current_view.id,
            seq: self.last_sent,
            aru_seq: self.im.aru_seq(),
            fifo_seq: self.fifo_seq,
            flags: Flags::NONE,
        };
        self.transmit(&Message::Leave(msg.clone()));
        self.handle_leave(&msg, now);
    }

    /// Broadcasts the install message for the next view. Only the
    /// representative calls this, and only under consensus.
    pub(super) fn send_install(&mut self, now: Instant) {
        if self.installing {
            warn!("install already in flight");
            return;
        }
        assert!(
            self.is_consensus() && self.is_representative(self.self_id),
            "install without consensus",
        );

        let max_view_id = self
            .known
            .values()
            .filter_map(|node| node.join_msg.as_ref())
            .map(|jm| jm.source_view_id)
            .max()
            .expect("consensus implies at least one join message");
        let view_id = ViewId::new(self.self_id, max_view_id.seq + 1);

        self.fifo_seq += 1;
        let msg = InstallMessage {
            source: self.self_id,
            source_view_id: view_id,
            seq: self.im.safe_seq(),
            aru_seq: self.im.aru_seq(),
            fifo_seq: self.fifo_seq,
            node_list: self.populate_node_list(),
            flags: Flags::NONE,
        };
        info!(%view_id, "sending install");
        self.transmit(&Message::Install(msg.clone()));
        self.installing = true;
        self.handle_install(&msg, now);
    }

    /// Retransmits our own messages in `range`, as requested by
    /// `gap_source`.
    pub(super) fn resend(&mut self, gap_source: PeerId, range: SeqRange) {
        debug_assert_ne!(gap_source, self.self_id);
        debug_assert!(!range.lu.is_none() && !range.hs.is_none());
        debug_assert!(range.lu <= range.hs);

        if !self.im.safe_seq().is_none() && range.lu.0 <= self.im.safe_seq().0 {
            warn!(%range, safe = %self.im.safe_seq(), "resend request at or below safe seq");
            return;
        }
        debug!(%gap_source, %range, "resending");

        let mut seq = range.lu;
        while seq.0 <= range.hs.0 {
            let stored = self
                .im
                .recover(self.self_id, seq)
                .unwrap_or_else(|| panic!("own message {seq} not recoverable"))
                .clone();
            debug_assert_eq!(stored.source, self.self_id);
            let advance = u32::from(stored.seq_range) + 1;
            let msg = UserMessage {
                aru_seq: self.im.aru_seq(),
                flags: Flags::RETRANS,
                ..stored
            };
            self.transmit(&Message::User(msg));
            self.stats.retransmits += 1;
            seq = seq + advance;
        }
    }

    /// Retransmits `range_uuid`'s messages in `range` on behalf of
    /// `gap_source`, tunnelled in delegate envelopes so the receiver
    /// attributes them to the original sender.
    pub(super) fn recover(&mut self, gap_source: PeerId, range_uuid: PeerId, range: SeqRange) {
        debug_assert_ne!(gap_source, self.self_id);
        debug_assert!(!range.lu.is_none() && !range.hs.is_none());
        debug_assert!(range.lu <= range.hs);

        if !self.im.safe_seq().is_none() && range.lu.0 <= self.im.safe_seq().0 {
            warn!(%range, safe = %self.im.safe_seq(), "recover request at or below safe seq");
            return;
        }
        debug!(%gap_source, %range_uuid, %range, "recovering");

        let mut seq = range.lu;
        while seq.0 <= range.hs.0 {
            let stored = self
                .im
                .recover(range_uuid, seq)
                .unwrap_or_else(|| panic!("message {seq} from {range_uuid} not recoverable"))
                .clone();
            debug_assert_eq!(stored.source, range_uuid);
            let advance = u32::from(stored.seq_range) + 1;
            let msg = UserMessage {
                flags: Flags::SOURCE | Flags::RETRANS,
                ..stored
            };
            let inner = Message::User(msg).encode_frame();
            self.send_delegate(inner);
            self.stats.retransmits += 1;
            seq = seq + advance;
        }
    }
}
