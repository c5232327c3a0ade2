//! End-to-end membership and delivery scenarios, driven through an in-test
//! message pump standing in for the broadcast transport.

use assert_matches::assert_matches;
use bytes::Bytes;
use flock_proto::{
    msg::{Flags, Message, SafetyPrefix},
    peer::PeerId,
    seq::{SeqRange, Seqno},
    session::{Event, SendError, SendMeta, Session, SessionConfig, State},
    view::{View, ViewKind},
};
use web_time::{Duration, Instant};

fn peer(n: u128) -> PeerId {
    PeerId::from_u128(n)
}

fn payload(bytes: &'static [u8]) -> Bytes {
    Bytes::from_static(bytes)
}

fn meta(safety: SafetyPrefix) -> SendMeta {
    SendMeta {
        user_type: 7,
        safety,
    }
}

fn drain_events(session: &mut Session) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = session.poll_event() {
        events.push(event);
    }
    events
}

fn drain_transmits(session: &mut Session) -> Vec<Bytes> {
    let mut frames = Vec::new();
    while let Some(frame) = session.poll_transmit() {
        frames.push(frame);
    }
    frames
}

fn deliveries(events: &[Event]) -> Vec<(PeerId, Bytes)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Delivery {
                source, payload, ..
            } => Some((*source, payload.clone())),
            Event::View(_) => None,
        })
        .collect()
}

fn views(events: &[Event], kind: ViewKind) -> Vec<View> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::View(view) if view.kind == kind => Some(view.clone()),
            _ => None,
        })
        .collect()
}

fn decode(frame: &Bytes, source: PeerId) -> Message {
    let mut buf = frame.clone();
    Message::decode(&mut buf, Some(source)).expect("invalid frame")
}

/// A broadcast network of sessions, delivering every transmitted frame to
/// every other peer.
struct Net {
    now: Instant,
    peers: Vec<Session>,
}

impl Net {
    fn new(count: u128) -> Self {
        let now = Instant::now();
        let peers = (1..=count)
            .map(|n| Session::new(peer(n), SessionConfig::default(), now))
            .collect();
        Self { now, peers }
    }

    fn peer(&mut self, n: u128) -> &mut Session {
        self.peers
            .iter_mut()
            .find(|session| session.self_id() == peer(n))
            .expect("no such peer")
    }

    fn open_join_all(&mut self) {
        let now = self.now;
        for session in &mut self.peers {
            session.open(now);
            session.join(now);
        }
    }

    /// Exchanges frames until the network goes quiet, delivering only over
    /// links that `allow` admits.
    fn pump_filtered(&mut self, allow: impl Fn(PeerId, PeerId) -> bool) {
        for _ in 0..1000 {
            let mut frames = Vec::new();
            for session in &mut self.peers {
                let src = session.self_id();
                while let Some(frame) = session.poll_transmit() {
                    frames.push((src, frame));
                }
            }
            if frames.is_empty() {
                return;
            }
            let now = self.now;
            for (src, frame) in frames {
                for session in &mut self.peers {
                    let dst = session.self_id();
                    if dst != src && allow(src, dst) {
                        session.handle_frame(src, frame.clone(), now).unwrap();
                    }
                }
            }
        }
        panic!("network never went quiet");
    }

    fn pump(&mut self) {
        self.pump_filtered(|_, _| true);
    }

    fn tick(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for session in &mut self.peers {
            session.handle_timeout(now);
        }
    }

    /// Pumps and ticks until every listed peer is operational.
    fn converge_filtered(&mut self, ids: &[u128], allow: impl Fn(PeerId, PeerId) -> bool) {
        for _ in 0..50 {
            self.pump_filtered(&allow);
            let done = ids
                .iter()
                .all(|n| self.peer(*n).state() == State::Operational);
            if done {
                return;
            }
            self.tick(Duration::from_millis(300));
        }
        panic!("group failed to converge");
    }

    fn converge(&mut self, ids: &[u128]) {
        self.converge_filtered(ids, |_, _| true);
    }

    fn events(&mut self, n: u128) -> Vec<Event> {
        drain_events(self.peer(n))
    }
}

#[test]
fn single_node_bring_up() {
    let mut now = Instant::now();
    let mut session = Session::new(peer(1), SessionConfig::default(), now);

    session.open(now);
    assert_eq!(State::Joining, session.state());

    // nothing installed yet: sends are refused
    let err = session
        .send(payload(b"too early"), meta(SafetyPrefix::Agreed))
        .unwrap_err();
    assert_eq!(SendError::NotConnected, err);

    session.join(now);
    assert_eq!(State::Recovery, session.state());

    // alone, the next join rebroadcast elects us and installs a singleton
    // view
    now += Duration::from_millis(400);
    session.handle_timeout(now);
    assert_eq!(State::Operational, session.state());

    let events = drain_events(&mut session);
    assert_matches!(
        &events[..],
        [Event::View(trans), Event::View(reg)] => {
            assert_eq!(ViewKind::Trans, trans.kind);
            assert!(trans.members.contains(&peer(1)));
            assert_eq!(ViewKind::Reg, reg.kind);
            assert_eq!(peer(1), reg.id.uuid);
            assert_eq!(1, reg.id.seq);
            assert!(reg.members.contains(&peer(1)));
            assert_eq!(1, reg.members.len());
        }
    );

    // an agreed payload round-trips through self-delivery
    session
        .send(payload(b"hello"), meta(SafetyPrefix::Agreed))
        .unwrap();
    let events = drain_events(&mut session);
    assert_eq!(vec![(peer(1), payload(b"hello"))], deliveries(&events));
}

#[test]
fn two_node_join() {
    let mut net = Net::new(2);
    net.open_join_all();
    net.converge(&[1, 2]);

    let a_events = net.events(1);
    let b_events = net.events(2);
    let a_reg = views(&a_events, ViewKind::Reg);
    let b_reg = views(&b_events, ViewKind::Reg);
    assert_eq!(1, a_reg.len());
    assert_eq!(1, b_reg.len());

    // the smaller identity is representative and names the view
    assert_eq!(a_reg[0].id, b_reg[0].id);
    assert_eq!(peer(1), a_reg[0].id.uuid);
    assert!(a_reg[0].members.contains(&peer(1)));
    assert!(a_reg[0].members.contains(&peer(2)));

    // a safe payload from B delivers identically on both peers
    net.peer(2)
        .send(payload(b"safe payload"), meta(SafetyPrefix::Safe))
        .unwrap();
    net.pump();

    let a = deliveries(&net.events(1));
    let b = deliveries(&net.events(2));
    assert_eq!(vec![(peer(2), payload(b"safe payload"))], a);
    assert_eq!(a, b);
}

#[test]
fn message_loss_gap_resend() {
    let mut net = Net::new(2);
    net.open_join_all();
    net.converge(&[1, 2]);
    net.events(1);
    net.events(2);

    let fifo = meta(SafetyPrefix::Fifo);
    net.peer(1).send(payload(b"m0"), fifo).unwrap();
    net.peer(1).send(payload(b"m1"), fifo).unwrap();
    net.peer(1).send(payload(b"m2"), fifo).unwrap();

    let a_frames = drain_transmits(net.peer(1));
    assert_eq!(3, a_frames.len());

    // frames 0 and 2 arrive at B; frame 1 is lost
    let now = net.now;
    net.peer(2).handle_frame(peer(1), a_frames[0].clone(), now).unwrap();
    net.peer(2).handle_frame(peer(1), a_frames[2].clone(), now).unwrap();

    // B noticed the hole and requested exactly the missing span from A
    let b_frames = drain_transmits(net.peer(2));
    let request = b_frames
        .iter()
        .find_map(|frame| match decode(frame, peer(2)) {
            Message::Gap(gap) if gap.range_uuid == peer(1) => Some(gap),
            _ => None,
        })
        .expect("no retransmission request");
    assert_eq!(SeqRange::new(Seqno(1), Seqno(1)), request.range);

    // B has delivered the FIFO prefix only
    assert_eq!(vec![(peer(1), payload(b"m0"))], deliveries(&net.events(2)));

    // A answers the request with a retransmission
    for frame in &b_frames {
        net.peer(1).handle_frame(peer(2), frame.clone(), now).unwrap();
    }
    let a_frames = drain_transmits(net.peer(1));
    let retrans = a_frames
        .iter()
        .find_map(|frame| match decode(frame, peer(1)) {
            Message::User(user) if user.flags.contains(Flags::RETRANS) => Some(user),
            _ => None,
        })
        .expect("no retransmission");
    assert_eq!(Seqno(1), retrans.seq);

    // the hole fills, B delivers the rest in order and advertises the
    // advanced aru on its next outgoing frame
    for frame in &a_frames {
        net.peer(2).handle_frame(peer(1), frame.clone(), now).unwrap();
    }
    assert_eq!(
        vec![(peer(1), payload(b"m1")), (peer(1), payload(b"m2"))],
        deliveries(&net.events(2)),
    );
    let b_frames = drain_transmits(net.peer(2));
    let ack = b_frames
        .iter()
        .find_map(|frame| match decode(frame, peer(2)) {
            Message::Gap(gap) if gap.range_uuid.is_nil() => Some(gap),
            _ => None,
        })
        .expect("no ack after fill");
    assert_eq!(Seqno(2), ack.aru_seq);
}

#[test]
fn inactive_peer_detected() {
    let mut net = Net::new(2);
    net.open_join_all();
    net.converge(&[1, 2]);
    net.events(1);
    net.events(2);

    // B goes silent: only A's clock advances, no frames flow
    for _ in 0..7 {
        net.now += Duration::from_secs(1);
        let now = net.now;
        net.peer(1).handle_timeout(now);
    }

    assert_eq!(State::Operational, net.peer(1).state());
    let events = net.events(1);

    let trans = views(&events, ViewKind::Trans);
    assert_eq!(1, trans.len());
    assert!(trans[0].members.contains(&peer(1)));
    assert!(trans[0].partitioned.contains(&peer(2)));

    let reg = views(&events, ViewKind::Reg);
    assert_eq!(1, reg.len());
    assert_eq!(peer(1), reg[0].id.uuid);
    assert_eq!(2, reg[0].id.seq);
    assert_eq!(1, reg[0].members.len());
    assert!(reg[0].members.contains(&peer(1)));
}

#[test]
fn graceful_leave() {
    let mut net = Net::new(2);
    net.open_join_all();
    net.converge(&[1, 2]);
    net.events(1);
    net.events(2);

    let now = net.now;
    net.peer(2).leave(now);
    assert_eq!(State::Closed, net.peer(2).state());

    // the leaver delivers its closing transitional view, then the terminal
    // empty view
    let b_events = net.events(2);
    let b_trans = views(&b_events, ViewKind::Trans);
    assert_eq!(1, b_trans.len());
    assert!(b_trans[0].members.contains(&peer(2)));
    assert!(b_trans[0].partitioned.contains(&peer(1)));
    let b_reg = views(&b_events, ViewKind::Reg);
    assert_eq!(1, b_reg.len());
    assert!(b_reg[0].is_empty());

    // A hears the leave, recovers alone, and installs a view with B listed
    // as left
    net.pump();
    assert_eq!(State::Operational, net.peer(1).state());
    let a_events = net.events(1);
    let a_trans = views(&a_events, ViewKind::Trans);
    assert_eq!(1, a_trans.len());
    assert!(a_trans[0].left.contains(&peer(2)));
    let a_reg = views(&a_events, ViewKind::Reg);
    assert_eq!(1, a_reg.len());
    assert!(a_reg[0].members.contains(&peer(1)));
    assert_eq!(1, a_reg[0].members.len());
    assert!(a_reg[0].left.contains(&peer(2)));
}

#[test]
fn partition_merge() {
    let mut net = Net::new(4);
    let left_side = |id: PeerId| id == peer(1) || id == peer(2);
    let same_side = move |src: PeerId, dst: PeerId| left_side(src) == left_side(dst);

    net.open_join_all();
    net.converge_filtered(&[1, 2, 3, 4], same_side);

    let ab_view = views(&net.events(1), ViewKind::Reg)[0].clone();
    let cd_view = views(&net.events(3), ViewKind::Reg)[0].clone();
    assert_ne!(ab_view.id, cd_view.id);
    assert_eq!(2, ab_view.members.len());
    assert_eq!(2, cd_view.members.len());
    net.events(2);
    net.events(4);

    // the network heals; a user frame from C reaches the other side and
    // triggers the merge
    net.peer(3)
        .send(payload(b"over the partition"), meta(SafetyPrefix::Agreed))
        .unwrap();
    net.converge(&[1, 2, 3, 4]);

    let mut merged_ids = Vec::new();
    for n in 1..=4 {
        let events = net.events(n);
        // each peer bridges out of its old component..
        let trans = views(&events, ViewKind::Trans);
        assert_eq!(1, trans.len(), "peer {n}");
        assert_eq!(2, trans[0].members.len(), "peer {n}");
        // ..into the one merged view
        let reg = views(&events, ViewKind::Reg);
        assert_eq!(1, reg.len(), "peer {n}");
        assert_eq!(4, reg[0].members.len(), "peer {n}");
        merged_ids.push(reg[0].id);
    }
    assert!(merged_ids.windows(2).all(|pair| pair[0] == pair[1]));

    // the merged view id exceeds everything either component observed
    let merged = merged_ids[0];
    assert!(merged.seq > ab_view.id.seq);
    assert!(merged.seq > cd_view.id.seq);
    assert_eq!(peer(1), merged.uuid);
}
