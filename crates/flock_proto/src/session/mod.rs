//! See [`Session`].

mod consensus;
mod recv;
mod send;

use std::collections::VecDeque;

use bytes::Bytes;
use octs::BufTooShortOr;
use tracing::{debug, info, trace, warn};
use web_time::{Duration, Instant};

use crate::{
    input_map::InputMap,
    msg::{codec::FrameError, InstallMessage, SafetyPrefix},
    node::{Node, NodeMap},
    peer::PeerId,
    seq::Seqno,
    timer::{Timer, Timers},
    view::{View, ViewId, ViewKind},
};

/// How long a previous view id is remembered, to filter stale frames from
/// views this peer has already moved past.
const VIEW_RETENTION: Duration = Duration::from_secs(300);

/// Protocol state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Not participating; frames are dropped.
    Closed,
    /// Waiting to discover the group after [`Session::open`].
    Joining,
    /// Draining state after [`Session::leave`], on the way to [`Closed`].
    ///
    /// [`Closed`]: State::Closed
    Leaving,
    /// Converging on a new view with the other reachable peers.
    Recovery,
    /// Installed in an agreed view; normal sending and delivery.
    Operational,
}

const fn state_index(state: State) -> usize {
    match state {
        State::Closed => 0,
        State::Joining => 1,
        State::Leaving => 2,
        State::Recovery => 3,
        State::Operational => 4,
    }
}

const ALLOWED_TRANSITIONS: [[bool; 5]; 5] = [
    // CLOSED JOINING LEAVING RECOVERY OPERATIONAL
    [false, true, false, false, false],  // from CLOSED
    [false, false, true, true, false],   // from JOINING
    [true, false, false, false, false],  // from LEAVING
    [false, false, true, true, true],    // from RECOVERY
    [false, false, true, true, false],   // from OPERATIONAL
];

/// Configuration for a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Flow-control window, in messages: a send is admitted while its
    /// sequence number stays within this many messages of the group
    /// all-received-upto frontier. Zero refuses every operational send.
    pub send_window: u32,
    /// Maximum number of payloads buffered in the outbound queue before
    /// [`Session::send`] starts reporting backpressure.
    pub max_output_size: usize,
    /// How long a peer may stay silent before it is declared
    /// non-operational.
    pub inactive_timeout: Duration,
    /// How often silent peers are swept for.
    pub inactive_check_period: Duration,
    /// How long to wait for consensus in recovery before rebroadcasting the
    /// join.
    pub consensus_timeout: Duration,
    /// How often queued sends are retried while operational.
    pub resend_period: Duration,
    /// How often the join is rebroadcast while converging on a view.
    pub send_join_period: Duration,
    /// How often remembered previous views are garbage collected. The
    /// retention itself is fixed at five minutes.
    pub cleanup_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_window: 8,
            max_output_size: 128,
            inactive_timeout: Duration::from_secs(5),
            inactive_check_period: Duration::from_secs(1),
            consensus_timeout: Duration::from_secs(1),
            resend_period: Duration::from_secs(1),
            send_join_period: Duration::from_millis(300),
            cleanup_period: Duration::from_secs(30),
        }
    }
}

/// Metadata attached to a payload submitted via [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendMeta {
    /// Application-defined payload tag, handed back on delivery.
    /// [`crate::msg::USER_TYPE_COMPLETE`] is reserved.
    pub user_type: u8,
    /// Requested delivery guarantee.
    pub safety: SafetyPrefix,
}

/// Something the session wants to hand to the application, drained via
/// [`Session::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A user payload became deliverable.
    Delivery {
        /// Peer that originated the payload.
        source: PeerId,
        /// Application-defined payload tag.
        user_type: u8,
        /// Payload bytes.
        payload: Bytes,
    },
    /// A membership view is delivered. An empty regular view means the
    /// session has shut down after a graceful leave.
    View(View),
}

/// Error when submitting a payload via [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The session is not operational in a view; try again after the next
    /// regular view is delivered.
    #[error("not connected to a view")]
    NotConnected,
    /// The `user_type` is reserved for internal use.
    #[error("reserved user type")]
    ReservedUserType,
    /// Flow control or a full outbound queue refused the payload; retry
    /// later.
    #[error("backpressure")]
    Backpressure,
}

/// Error when feeding an inbound frame via [`Session::handle_frame`].
///
/// It is safe to ignore this error; the frame is dropped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecvError {
    /// The transport reported a nil sender, violating its contract.
    #[error("frame from nil source")]
    NilSource,
    /// The frame could not be decoded.
    #[error("failed to decode frame")]
    Decode(#[source] BufTooShortOr<FrameError>),
}

/// Counters gathered over the lifetime of a [`Session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// User frames sent, including completions and queued flushes.
    pub msgs_sent: u64,
    /// User payloads delivered upward.
    pub msgs_delivered: u64,
    /// Gap frames sent (acks and retransmission requests).
    pub gaps_sent: u64,
    /// User frames retransmitted, directly or by delegation.
    pub retransmits: u64,
    /// Regular views installed.
    pub views_installed: u64,
}

/// One peer's extended virtual synchrony protocol engine.
///
/// The session is sans-IO and single-threaded: every entry point takes
/// `&mut self` and the current time, performs no blocking work, and leaves
/// its outputs in queues drained by [`Session::poll_transmit`] (frames to
/// broadcast) and [`Session::poll_event`] (deliveries and views). Exclusive
/// access through `&mut self` is the critical section of the protocol.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    self_id: PeerId,
    state: State,
    /// Every peer we know about, ourselves included.
    known: NodeMap,
    /// Received-message windows for the current view.
    im: InputMap,
    current_view: View,
    /// The regular view preceding the current one; consulted when computing
    /// the joined set of the next regular view.
    previous_view: View,
    /// Recently left views with the time we left them, oldest first.
    ///
    /// # Insertion policy
    ///
    /// On view installation: the view being left, plus every view id named
    /// in the install message's node list.
    ///
    /// # Removal policy
    ///
    /// Swept from the front on every cleanup tick once older than
    /// [`VIEW_RETENTION`].
    previous_views: VecDeque<(ViewId, Instant)>,
    /// Install message in flight, if any.
    install_message: Option<InstallMessage>,
    /// Set while this peer, as representative, has an install of its own in
    /// flight.
    installing: bool,
    /// Membership frame ordering counter for frames we send.
    fifo_seq: i64,
    /// Highest sequence number this peer has claimed in the current view.
    last_sent: Seqno,
    /// Payloads accepted from the application but not yet sent.
    output: VecDeque<(Bytes, SendMeta)>,
    /// Guard against re-entrant delivery.
    delivering: bool,
    /// Guard against re-entrant state shifts.
    shift_depth: u8,
    timers: Timers,
    /// Encoded frames waiting to be broadcast by the caller.
    transmits: VecDeque<Bytes>,
    /// Deliveries and views waiting to be drained by the caller.
    events: VecDeque<Event>,
    stats: SessionStats,
}

impl Session {
    /// Creates a session for the peer `self_id`, in the [`State::Closed`]
    /// state.
    ///
    /// # Panics
    ///
    /// Panics if `self_id` is nil.
    #[must_use]
    pub fn new(self_id: PeerId, config: SessionConfig, now: Instant) -> Self {
        assert!(!self_id.is_nil(), "nil peer id");
        let mut known = NodeMap::new();
        known.insert(self_id, Node::new(now));
        let mut im = InputMap::new();
        im.insert_source(self_id);
        let mut current_view = View::new(ViewKind::Trans, ViewId::new(self_id, 0));
        current_view.members.insert(self_id);
        Self {
            config,
            self_id,
            state: State::Closed,
            known,
            im,
            current_view,
            previous_view: View::new(ViewKind::Trans, ViewId::nil()),
            previous_views: VecDeque::new(),
            install_message: None,
            installing: false,
            fifo_seq: -1,
            last_sent: Seqno::NONE,
            output: VecDeque::new(),
            delivering: false,
            shift_depth: 0,
            timers: Timers::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            stats: SessionStats::default(),
        }
    }

    /// Gets this peer's identity.
    #[must_use]
    pub const fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Gets the current protocol state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Gets the view this session currently considers itself in.
    #[must_use]
    pub const fn current_view(&self) -> &View {
        &self.current_view
    }

    /// Gets the counters gathered so far.
    #[must_use]
    pub const fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Starts participating: shifts from [`State::Closed`] to
    /// [`State::Joining`] and arms the periodic timers.
    ///
    /// # Panics
    ///
    /// Panics if not in [`State::Closed`].
    pub fn open(&mut self, now: Instant) {
        self.shift_to(State::Joining, false, now);
    }

    /// Starts converging on a view, broadcasting a join. Call once the
    /// transport is up; with no reachable peers the session will elect
    /// itself and install a singleton view.
    ///
    /// # Panics
    ///
    /// Panics if not in [`State::Joining`] or [`State::Recovery`].
    pub fn join(&mut self, now: Instant) {
        self.shift_to(State::Recovery, true, now);
    }

    /// Leaves the group gracefully: broadcasts a leave, drains pending
    /// payloads as local deliveries, delivers the closing transitional and
    /// empty views, and ends up [`State::Closed`].
    ///
    /// # Panics
    ///
    /// Panics if the session is [`State::Closed`].
    pub fn leave(&mut self, now: Instant) {
        self.shift_to(State::Leaving, false, now);
        self.send_leave(now);
    }

    /// Submits a payload for totally-ordered multicast in the current view.
    ///
    /// # Errors
    ///
    /// - [`SendError::NotConnected`] outside of a view.
    /// - [`SendError::ReservedUserType`] for the reserved `user_type`.
    /// - [`SendError::Backpressure`] while recovering or when flow control
    ///   and the outbound queue are both saturated; retry later.
    pub fn send(&mut self, payload: Bytes, meta: SendMeta) -> Result<(), SendError> {
        match self.state {
            State::Recovery => return Err(SendError::Backpressure),
            State::Operational => {}
            state => {
                warn!(?state, "user send while not connected");
                return Err(SendError::NotConnected);
            }
        }
        if meta.user_type == crate::msg::USER_TYPE_COMPLETE {
            return Err(SendError::ReservedUserType);
        }

        if self.output.is_empty() {
            let win = self.config.send_window / 2;
            match self.send_user(
                payload.clone(),
                meta.user_type,
                meta.safety,
                win,
                Seqno::NONE,
                false,
            ) {
                Ok(()) => Ok(()),
                // flow control refused a direct send; queue it instead
                Err(_) => {
                    self.output.push_back((payload, meta));
                    Ok(())
                }
            }
        } else if self.output.len() < self.config.max_output_size {
            self.output.push_back((payload, meta));
            Ok(())
        } else {
            Err(SendError::Backpressure)
        }
    }

    /// Fires every timer whose deadline has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.poll_expired(now) {
            match timer {
                Timer::Inactivity => {
                    self.check_inactive(now);
                    self.timers
                        .set(Timer::Inactivity, now + self.config.inactive_check_period);
                }
                Timer::Cleanup => {
                    self.cleanup_views(now);
                    self.timers
                        .set(Timer::Cleanup, now + self.config.cleanup_period);
                }
                Timer::Consensus => {
                    if self.state == State::Recovery {
                        debug!("consensus timeout, rebroadcasting join");
                        self.shift_to(State::Recovery, true, now);
                    }
                }
                Timer::Resend => {
                    if self.state == State::Operational {
                        self.flush_output();
                        self.timers
                            .set(Timer::Resend, now + self.config.resend_period);
                    }
                }
                Timer::SendJoin => {
                    if self.state == State::Recovery {
                        if self.output.is_empty() {
                            self.send_join(true, now);
                        } else {
                            self.flush_output();
                        }
                        if self.state == State::Recovery {
                            self.timers
                                .set(Timer::SendJoin, now + self.config.send_join_period);
                        }
                    }
                }
            }
        }
    }

    /// Gets when [`Session::handle_timeout`] next needs to be called.
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Takes the next encoded frame to broadcast to the group.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmits.pop_front()
    }

    /// Takes the next delivery or view change for the application.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    //
    // state machine
    //

    pub(super) fn shift_to(&mut self, to: State, send_j: bool, now: Instant) {
        assert_eq!(0, self.shift_depth, "re-entrant state shift");
        self.shift_depth += 1;

        assert!(
            ALLOWED_TRANSITIONS[state_index(self.state)][state_index(to)],
            "forbidden state transition: {:?} -> {to:?}",
            self.state,
        );
        if self.state != to {
            debug!(from = ?self.state, ?to, "state change");
        }

        match to {
            State::Closed => {
                self.timers.unset(Timer::Inactivity);
                self.timers.unset(Timer::Cleanup);
                self.timers.unset(Timer::Consensus);
                self.timers.unset(Timer::Resend);
                self.timers.unset(Timer::SendJoin);
                self.cleanup_unoperational();
                self.cleanup_views(now);
                self.output.clear();
                self.state = State::Closed;
            }
            State::Joining => {
                self.state = State::Joining;
                self.timers
                    .set(Timer::Inactivity, now + self.config.inactive_check_period);
                self.timers
                    .set(Timer::Cleanup, now + self.config.cleanup_period);
            }
            State::Leaving => {
                self.timers.unset(Timer::Consensus);
                self.state = State::Leaving;
            }
            State::Recovery => {
                self.timers.unset(Timer::Resend);
                self.timers.unset(Timer::SendJoin);
                self.timers
                    .set(Timer::SendJoin, now + self.config.send_join_period);
                if self.state != State::Recovery {
                    self.cleanup_joins();
                }
                self.setall_installed(false);
                self.install_message = None;
                self.installing = false;
                self.timers.unset(Timer::Consensus);
                self.timers
                    .set(Timer::Consensus, now + self.config.consensus_timeout);
                self.state = State::Recovery;
                debug!(queued = self.output.len(), "entering recovery, flushing output");
                self.flush_output();
                if send_j {
                    self.send_join(false, now);
                }
            }
            State::Operational => {
                assert!(self.output.is_empty(), "output not drained before installation");
                let imsg = self
                    .install_message
                    .clone()
                    .expect("no install message at installation");
                if self.is_representative(self.self_id) {
                    assert!(self.is_consistent(&imsg), "installing inconsistent view");
                }
                assert!(self.is_all_installed(), "installation before all peers answered");

                self.timers.unset(Timer::Consensus);
                self.timers.unset(Timer::SendJoin);

                self.deliver();
                self.deliver_trans_view(false);
                self.deliver_trans();

                self.im.clear();
                self.previous_view = self.current_view.clone();
                self.previous_views.push_back((self.current_view.id, now));
                for node in imsg.node_list.values() {
                    self.previous_views.push_back((node.view_id, now));
                }

                self.current_view = View::new(ViewKind::Reg, imsg.source_view_id);
                let installed: Vec<PeerId> = self
                    .known
                    .iter()
                    .filter(|(_, node)| node.installed)
                    .map(|(id, _)| *id)
                    .collect();
                for id in installed {
                    self.current_view.members.insert(id);
                    self.im.insert_source(id);
                }

                self.last_sent = Seqno::NONE;
                self.state = State::Operational;
                self.deliver_reg_view();
                self.cleanup_unoperational();
                self.cleanup_views(now);
                self.cleanup_joins();
                self.install_message = None;
                self.installing = false;
                debug!(view = %self.current_view, "new view");
                self.timers
                    .set(Timer::Resend, now + self.config.resend_period);
            }
        }

        self.shift_depth -= 1;
    }

    //
    // delivery engine
    //

    /// Delivers everything deliverable in the regular view, in the view's
    /// total order.
    pub(super) fn deliver(&mut self) {
        assert!(!self.delivering, "re-entrant delivery");
        assert!(
            matches!(
                self.state,
                State::Operational | State::Recovery | State::Leaving
            ),
            "delivery in state {:?}",
            self.state,
        );
        self.delivering = true;

        trace!(aru = %self.im.aru_seq(), safe = %self.im.safe_seq(), "delivering");

        let keys: Vec<(Seqno, PeerId)> = self.im.iter().map(|(key, _)| key).collect();
        for (seq, source) in keys {
            let Some(msg) = self.im.find(source, seq) else {
                continue;
            };
            assert_eq!(
                msg.source_view_id, self.current_view.id,
                "stored message from wrong view",
            );
            let (safety, user_type, payload) = (msg.safety, msg.user_type, msg.payload.clone());
            let deliver = match safety {
                SafetyPrefix::Drop => true,
                SafetyPrefix::Safe => self.im.is_safe(seq),
                SafetyPrefix::Agreed => self.im.is_agreed(seq),
                SafetyPrefix::Fifo => self.im.is_fifo(source, seq),
            };
            if deliver {
                if safety != SafetyPrefix::Drop {
                    self.stats.msgs_delivered += 1;
                    self.events.push_back(Event::Delivery {
                        source,
                        user_type,
                        payload,
                    });
                }
                self.im.erase(source, seq);
            }
        }

        self.delivering = false;
    }

    /// Delivers at the regular-to-transitional boundary.
    ///
    /// Everything FIFO within its source is delivered regardless of its
    /// nominal safety: messages from the continuing component qualify as
    /// agreed in the transitional configuration, and FIFO messages from a
    /// partitioned component are known recoverable as safe there. Anything
    /// left afterwards must be a non-FIFO tail from a partitioned peer.
    pub(super) fn deliver_trans(&mut self) {
        assert!(!self.delivering, "re-entrant delivery");
        assert!(
            matches!(self.state, State::Recovery | State::Leaving),
            "transitional delivery in state {:?}",
            self.state,
        );
        self.delivering = true;

        let keys: Vec<(Seqno, PeerId)> = self.im.iter().map(|(key, _)| key).collect();
        for (seq, source) in keys {
            let Some(msg) = self.im.find(source, seq) else {
                continue;
            };
            assert_eq!(
                msg.source_view_id, self.current_view.id,
                "stored message from wrong view",
            );
            let (safety, user_type, payload) = (msg.safety, msg.user_type, msg.payload.clone());
            let deliver = match safety {
                SafetyPrefix::Drop => true,
                SafetyPrefix::Safe | SafetyPrefix::Agreed | SafetyPrefix::Fifo => {
                    self.im.is_fifo(source, seq)
                }
            };
            if deliver {
                if safety != SafetyPrefix::Drop {
                    self.stats.msgs_delivered += 1;
                    self.events.push_back(Event::Delivery {
                        source,
                        user_type,
                        payload,
                    });
                }
                self.im.erase(source, seq);
            }
        }

        // Residue must be non-FIFO tails of partitioned peers; anything else
        // violates the self-delivery constraint.
        let residue: Vec<(Seqno, PeerId)> = self.im.iter().map(|(key, _)| key).collect();
        for (seq, source) in residue {
            let installed = self.known.get(&source).is_some_and(|node| node.installed);
            assert!(
                !installed,
                "transitional delivery residue from installed peer {source}",
            );
            assert!(
                !self.im.is_fifo(source, seq),
                "transitional delivery residue is FIFO from {source}",
            );
            self.im.erase(source, seq);
        }

        self.delivering = false;
    }

    /// Delivers the new regular view from the pending install message.
    pub(super) fn deliver_reg_view(&mut self) {
        let imsg = self
            .install_message
            .clone()
            .expect("no install message in regular view delivery");
        assert!(!self.previous_views.is_empty(), "no previous views");

        let mut view = View::new(ViewKind::Reg, imsg.source_view_id);
        let ids: Vec<PeerId> = self.known.keys().copied().collect();
        for id in ids {
            let installed = self.known[&id].installed;
            if installed {
                view.members.insert(id);
                if !self.previous_view.members.contains(&id) {
                    view.joined.insert(id);
                }
            } else {
                if let Some(mnode) = imsg.node_list.get(&id) {
                    if mnode.leaving {
                        view.left.insert(id);
                    } else {
                        view.partitioned.insert(id);
                    }
                }
                debug_assert_ne!(id, self.self_id);
                if let Some(node) = self.known.get_mut(&id) {
                    node.operational = false;
                }
            }
        }

        debug!(%view, "delivering regular view");
        self.stats.views_installed += 1;
        self.events.push_back(Event::View(view));
    }

    /// Delivers the transitional view bridging the current regular view to
    /// the next. `local` is set on the graceful-leave path, where there is
    /// no install message to consult.
    pub(super) fn deliver_trans_view(&mut self, local: bool) {
        assert!(
            local || self.install_message.is_some(),
            "no install message in transitional view delivery",
        );

        let mut view = View::new(ViewKind::Trans, self.current_view.id);
        for (id, node) in &self.known {
            let join_in_view = node
                .join_msg
                .as_ref()
                .is_some_and(|jm| jm.source_view_id == self.current_view.id);
            if node.installed
                && self.current_view.members.contains(id)
                && (local || join_in_view)
            {
                view.members.insert(*id);
            } else if !node.installed {
                if local {
                    // Others may or may not have seen our leave; assuming
                    // partitioned is the only safe call for a leaving node.
                    view.partitioned.insert(*id);
                } else if let Some(mnode) = self
                    .install_message
                    .as_ref()
                    .and_then(|imsg| imsg.node_list.get(id))
                {
                    if mnode.leaving {
                        view.left.insert(*id);
                    } else {
                        view.partitioned.insert(*id);
                    }
                }
            }
            // installed peers outside the current view are merging; they do
            // not show up in the transitional view at all
        }

        debug!(%view, "delivering transitional view");
        assert!(
            view.members.contains(&self.self_id),
            "transitional view without self",
        );
        self.events.push_back(Event::View(view));
    }

    /// Delivers the terminal empty view after a graceful leave.
    pub(super) fn deliver_empty_view(&mut self) {
        let view = View::new(ViewKind::Reg, ViewId::nil());
        debug!(%view, "delivering empty view");
        self.events.push_back(Event::View(view));
    }

    //
    // node table upkeep
    //

    pub(super) fn setall_installed(&mut self, installed: bool) {
        for node in self.known.values_mut() {
            node.installed = installed;
        }
    }

    pub(super) fn cleanup_joins(&mut self) {
        for node in self.known.values_mut() {
            node.join_msg = None;
        }
    }

    fn cleanup_unoperational(&mut self) {
        self.known.retain(|id, node| {
            if node.installed {
                true
            } else {
                debug!(%id, "erasing node");
                false
            }
        });
    }

    pub(super) fn is_all_installed(&self) -> bool {
        self.known
            .values()
            .all(|node| !node.operational || node.installed)
    }

    pub(super) fn msg_from_previous_view(&self, view_id: ViewId) -> bool {
        self.previous_views.iter().any(|(id, _)| *id == view_id)
    }

    fn check_inactive(&mut self, now: Instant) {
        let stale: Vec<PeerId> = self
            .known
            .iter()
            .filter(|(id, node)| {
                **id != self.self_id
                    && node.operational
                    && node.tstamp + self.config.inactive_timeout < now
            })
            .map(|(id, _)| *id)
            .collect();

        let has_inactive = !stale.is_empty();
        for id in stale {
            info!(%id, "detected inactive node");
            if let Some(node) = self.known.get_mut(&id) {
                node.operational = false;
            }
        }
        if has_inactive && self.state == State::Operational {
            self.shift_to(State::Recovery, true, now);
        }
    }

    fn cleanup_views(&mut self, now: Instant) {
        while let Some(&(view_id, left_at)) = self.previous_views.front() {
            if left_at + VIEW_RETENTION < now {
                info!(%view_id, "erasing previous view");
                self.previous_views.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn peer(n: u128) -> PeerId {
        PeerId::from_u128(n)
    }

    fn session() -> (Session, Instant) {
        let now = Instant::now();
        (Session::new(peer(1), SessionConfig::default(), now), now)
    }

    #[test]
    fn starts_closed_with_self_registered() {
        let (session, _) = session();
        assert_eq!(State::Closed, session.state());
        assert_eq!(peer(1), session.self_id());
        assert!(session.current_view().members.contains(&peer(1)));
        assert_eq!(None, session.poll_timeout());
    }

    #[test]
    fn open_arms_timers() {
        let (mut session, now) = session();
        session.open(now);
        assert_eq!(State::Joining, session.state());
        assert!(session.poll_timeout().is_some());
    }

    #[test]
    #[should_panic(expected = "forbidden state transition")]
    fn forbidden_transition_is_fatal() {
        let (mut session, now) = session();
        // CLOSED -> RECOVERY is not allowed; only CLOSED -> JOINING is
        session.join(now);
    }

    #[test]
    fn send_refused_outside_view() {
        let (mut session, now) = session();
        session.open(now);
        let err = session
            .send(
                Bytes::from_static(b"too early"),
                SendMeta {
                    user_type: 1,
                    safety: SafetyPrefix::Agreed,
                },
            )
            .unwrap_err();
        assert_matches!(err, SendError::NotConnected);
    }

    #[test]
    fn reserved_user_type_refused() {
        let (mut session, mut now) = session();
        session.open(now);
        session.join(now);
        now += Duration::from_millis(400);
        session.handle_timeout(now);
        assert_eq!(State::Operational, session.state());

        let err = session
            .send(
                Bytes::from_static(b"nope"),
                SendMeta {
                    user_type: crate::msg::USER_TYPE_COMPLETE,
                    safety: SafetyPrefix::Agreed,
                },
            )
            .unwrap_err();
        assert_matches!(err, SendError::ReservedUserType);
    }

    #[test]
    fn zero_window_blocks_operational_sends() {
        let config = SessionConfig {
            send_window: 0,
            max_output_size: 1,
            ..SessionConfig::default()
        };
        let mut now = Instant::now();
        let mut session = Session::new(peer(1), config, now);
        session.open(now);
        session.join(now);
        now += Duration::from_millis(400);
        session.handle_timeout(now);
        assert_eq!(State::Operational, session.state());

        let meta = SendMeta {
            user_type: 1,
            safety: SafetyPrefix::Fifo,
        };
        // first payload parks in the queue, second is refused outright
        session.send(Bytes::from_static(b"a"), meta).unwrap();
        let err = session.send(Bytes::from_static(b"b"), meta).unwrap_err();
        assert_matches!(err, SendError::Backpressure);
    }
}
