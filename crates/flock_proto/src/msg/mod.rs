//! Defines the structure of frames on the wire.
//!
//! This module only contains the type definitions themselves, to make it easy
//! to understand the whole protocol at a glance. The encoding and decoding
//! logic lives in [`codec`], the handling logic in [`crate::session`].
//!
//! Every frame starts with the same envelope:
//!
//! ```rust,ignore
//! struct Envelope {
//!     version: u8,
//!     kind: u8,
//!     flags: Flags,
//! }
//! ```
//!
//! followed by kind-specific fields. The sender identity is normally taken
//! from the transport layer; only frames with [`Flags::SOURCE`] set carry it
//! embedded (tunnelled retransmissions on behalf of a third peer).

pub mod codec;

use std::{collections::BTreeMap, fmt, ops::BitOr};

use arbitrary::Arbitrary;
use bytes::Bytes;

use crate::{
    peer::PeerId,
    seq::{SeqRange, Seqno},
    view::ViewId,
};

/// Protocol version spoken by this implementation.
pub const VERSION: u8 = 0;

/// `user_type` value reserved for internal completion messages; refused on
/// the application send path.
pub const USER_TYPE_COMPLETE: u8 = 0xff;

/// Bitset of per-frame flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Arbitrary)]
pub struct Flags(pub u8);

impl Flags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The frame carries its source identity embedded, overriding the
    /// transport-level sender.
    pub const SOURCE: Self = Self(1);
    /// The frame is a retransmission.
    pub const RETRANS: Self = Self(1 << 1);
    /// The sender has more messages queued right behind this one.
    pub const MSG_MORE: Self = Self(1 << 2);

    /// Gets whether every flag in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flags({:#04x})", self.0)
    }
}

/// Delivery guarantee requested for a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Arbitrary)]
pub enum SafetyPrefix {
    /// Never delivered upward; used for internal completion messages which
    /// only advance sequence numbers.
    Drop,
    /// Delivered once all prior messages from the same source have been.
    Fifo,
    /// Delivered once all messages up to it have been received from every
    /// source (total order within the view).
    Agreed,
    /// Delivered once every operational peer is known to have received it.
    Safe,
}

/// User payload frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    /// Originator of the payload.
    pub source: PeerId,
    /// View the message was sent in.
    pub source_view_id: ViewId,
    /// Sequence number of this message from `source`.
    pub seq: Seqno,
    /// Sender's all-received-upto sequence at send time.
    pub aru_seq: Seqno,
    /// How many additional sequence numbers this frame reserves: the frame
    /// covers `[seq, seq + seq_range]`, letting one frame acknowledge a burst
    /// without carrying payload for each.
    pub seq_range: u8,
    /// Requested delivery guarantee.
    pub safety: SafetyPrefix,
    /// Application-defined payload tag. [`USER_TYPE_COMPLETE`] is reserved.
    pub user_type: u8,
    /// Frame flags.
    pub flags: Flags,
    /// Payload bytes.
    pub payload: Bytes,
}

impl UserMessage {
    /// Gets a copy of this message with a different claimed aru.
    ///
    /// The send path stores the message first (which may advance the local
    /// aru) and then stamps the outgoing frame with the advanced value.
    #[must_use]
    pub fn with_aru_seq(&self, aru_seq: Seqno) -> Self {
        Self {
            aru_seq,
            ..self.clone()
        }
    }
}

/// Envelope tunnelling a recovered frame through a third peer.
///
/// The inner bytes are a complete encoded frame with [`Flags::SOURCE`] set,
/// so that the receiver attributes it to the original sender rather than to
/// the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateMessage {
    /// Peer performing the delegated retransmission.
    pub source: PeerId,
    /// Delegate's current view.
    pub source_view_id: ViewId,
    /// Frame flags.
    pub flags: Flags,
    /// Complete encoded inner frame.
    pub inner: Bytes,
}

/// Acknowledgement / retransmission request frame.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub struct GapMessage {
    /// Sender of the gap.
    pub source: PeerId,
    /// Sender's current view.
    pub source_view_id: ViewId,
    /// Sender's last sent sequence number.
    pub seq: Seqno,
    /// Sender's all-received-upto sequence.
    pub aru_seq: Seqno,
    /// Whose messages are requested: nil for a pure ack, the receiver's own
    /// id to request retransmission, any other id to request delegated
    /// recovery of a third peer's messages.
    pub range_uuid: PeerId,
    /// Requested sequence range.
    pub range: SeqRange,
    /// Frame flags.
    pub flags: Flags,
}

/// Per-peer entry in the node list of a [`JoinMessage`] or
/// [`InstallMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub struct MessageNode {
    /// Whether the sender considers this peer operational.
    pub operational: bool,
    /// Whether this peer is known to be leaving gracefully.
    pub leaving: bool,
    /// The view this peer is in, as far as the sender knows.
    pub view_id: ViewId,
    /// The sender's record of this peer's all-received-upto sequence.
    pub safe_seq: Seqno,
    /// The sender's received range for this peer's messages.
    pub im_range: SeqRange,
}

/// Per-peer state snapshot carried by membership frames.
///
/// Ordered by peer identity so the encoding, and therefore consensus
/// comparison across peers, is deterministic.
pub type NodeList = BTreeMap<PeerId, MessageNode>;

/// Membership proposal frame, broadcast while converging on a new view.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub struct JoinMessage {
    /// Sender of the join.
    pub source: PeerId,
    /// Sender's current view.
    pub source_view_id: ViewId,
    /// Sender's claimed group safe sequence.
    pub seq: Seqno,
    /// Sender's claimed all-received-upto sequence.
    pub aru_seq: Seqno,
    /// Strictly increasing per-sender counter ordering membership frames.
    pub fifo_seq: i64,
    /// Snapshot of every peer the sender knows about.
    pub node_list: NodeList,
    /// Frame flags.
    pub flags: Flags,
}

/// View installation frame, sent by the representative once consensus holds.
///
/// Carries the same content as a [`JoinMessage`] except that
/// `source_view_id` is the id of the view being installed.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub struct InstallMessage {
    /// Representative installing the view.
    pub source: PeerId,
    /// Identity of the view being installed.
    pub source_view_id: ViewId,
    /// Representative's claimed group safe sequence.
    pub seq: Seqno,
    /// Representative's claimed all-received-upto sequence.
    pub aru_seq: Seqno,
    /// Strictly increasing per-sender counter ordering membership frames.
    pub fifo_seq: i64,
    /// Snapshot of every peer the representative knows about.
    pub node_list: NodeList,
    /// Frame flags.
    pub flags: Flags,
}

/// Graceful departure announcement.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub struct LeaveMessage {
    /// Departing peer.
    pub source: PeerId,
    /// Departing peer's current view.
    pub source_view_id: ViewId,
    /// Departing peer's last sent sequence number.
    pub seq: Seqno,
    /// Departing peer's all-received-upto sequence.
    pub aru_seq: Seqno,
    /// Strictly increasing per-sender counter ordering membership frames.
    pub fifo_seq: i64,
    /// Frame flags.
    pub flags: Flags,
}

/// Any frame of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// See [`UserMessage`].
    User(UserMessage),
    /// See [`DelegateMessage`].
    Delegate(DelegateMessage),
    /// See [`GapMessage`].
    Gap(GapMessage),
    /// See [`JoinMessage`].
    Join(JoinMessage),
    /// See [`InstallMessage`].
    Install(InstallMessage),
    /// See [`LeaveMessage`].
    Leave(LeaveMessage),
}

impl Message {
    /// Gets the sender of this frame.
    #[must_use]
    pub const fn source(&self) -> PeerId {
        match self {
            Self::User(m) => m.source,
            Self::Delegate(m) => m.source,
            Self::Gap(m) => m.source,
            Self::Join(m) => m.source,
            Self::Install(m) => m.source,
            Self::Leave(m) => m.source,
        }
    }

    /// Gets the view this frame was sent in.
    #[must_use]
    pub const fn source_view_id(&self) -> ViewId {
        match self {
            Self::User(m) => m.source_view_id,
            Self::Delegate(m) => m.source_view_id,
            Self::Gap(m) => m.source_view_id,
            Self::Join(m) => m.source_view_id,
            Self::Install(m) => m.source_view_id,
            Self::Leave(m) => m.source_view_id,
        }
    }

    /// Gets the membership ordering counter, for membership frames.
    #[must_use]
    pub const fn fifo_seq(&self) -> Option<i64> {
        match self {
            Self::Join(m) => Some(m.fifo_seq),
            Self::Install(m) => Some(m.fifo_seq),
            Self::Leave(m) => Some(m.fifo_seq),
            _ => None,
        }
    }

    /// Gets whether this is a membership frame (join, install or leave).
    #[must_use]
    pub const fn is_membership(&self) -> bool {
        matches!(self, Self::Join(_) | Self::Install(_) | Self::Leave(_))
    }
}

/// Common accessors over the two membership snapshot frames, which the
/// consensus checks treat uniformly.
pub trait Membership {
    /// Sender of the frame.
    fn source(&self) -> PeerId;
    /// View the frame was sent in (for installs: the view being installed).
    fn source_view_id(&self) -> ViewId;
    /// Claimed group safe sequence.
    fn seq(&self) -> Seqno;
    /// Claimed all-received-upto sequence.
    fn aru_seq(&self) -> Seqno;
    /// Per-peer state snapshot.
    fn node_list(&self) -> &NodeList;
}

impl Membership for JoinMessage {
    fn source(&self) -> PeerId {
        self.source
    }

    fn source_view_id(&self) -> ViewId {
        self.source_view_id
    }

    fn seq(&self) -> Seqno {
        self.seq
    }

    fn aru_seq(&self) -> Seqno {
        self.aru_seq
    }

    fn node_list(&self) -> &NodeList {
        &self.node_list
    }
}

impl Membership for InstallMessage {
    fn source(&self) -> PeerId {
        self.source
    }

    fn source_view_id(&self) -> ViewId {
        self.source_view_id
    }

    fn seq(&self) -> Seqno {
        self.seq
    }

    fn aru_seq(&self) -> Seqno {
        self.aru_seq
    }

    fn node_list(&self) -> &NodeList {
        &self.node_list
    }
}
