//! Wire encoding and decoding of [`Message`]s.
//!
//! All multi-byte integers ride the `octs` primitive codecs. Frames are
//! self-delimiting: variable-length parts (payloads, node lists) carry an
//! explicit length prefix.

use std::convert::Infallible;

use bytes::Bytes;
use octs::{
    BufError, BufTooShortOr, BytesMut, Decode, Encode, EncodeLen, FixedEncodeLen, Read, Write,
};

use super::{
    DelegateMessage, Flags, GapMessage, InstallMessage, JoinMessage, LeaveMessage, Message,
    MessageNode, NodeList, SafetyPrefix, UserMessage, VERSION,
};
use crate::{peer::PeerId, seq::SeqRange, seq::Seqno, view::ViewId};

const KIND_USER: u8 = 1;
const KIND_DELEGATE: u8 = 2;
const KIND_GAP: u8 = 3;
const KIND_JOIN: u8 = 4;
const KIND_INSTALL: u8 = 5;
const KIND_LEAVE: u8 = 6;

const NODE_OPERATIONAL: u8 = 1;
const NODE_LEAVING: u8 = 1 << 1;

/// Error when decoding a [`Message`] from a frame, or encoding one which
/// cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame was produced by an incompatible protocol version.
    #[error("unsupported protocol version `{0}`")]
    UnsupportedVersion(u8),
    /// Frame kind tag is not one we know.
    #[error("invalid frame kind `{0}`")]
    InvalidKind(u8),
    /// Safety prefix tag is not one we know.
    #[error("invalid safety prefix `{0}`")]
    InvalidSafetyPrefix(u8),
    /// Frame does not embed its source, and the transport did not provide
    /// one.
    #[error("frame carries no source identity")]
    MissingSource,
    /// Payload is too long for its length prefix.
    #[error("payload too large - {0} bytes")]
    PayloadTooLarge(usize),
    /// Node list has too many entries for its length prefix.
    #[error("node list too large - {0} entries")]
    NodeListTooLarge(usize),
}

impl BufError for FrameError {}

impl From<Infallible> for FrameError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

impl FixedEncodeLen for Flags {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for Flags {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Flags {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

impl SafetyPrefix {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Drop => 0,
            Self::Fifo => 1,
            Self::Agreed => 2,
            Self::Safe => 3,
        }
    }
}

impl FixedEncodeLen for SafetyPrefix {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for SafetyPrefix {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.to_u8())
    }
}

impl Decode for SafetyPrefix {
    type Error = FrameError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        match src.read::<u8>()? {
            0 => Ok(Self::Drop),
            1 => Ok(Self::Fifo),
            2 => Ok(Self::Agreed),
            3 => Ok(Self::Safe),
            v => Err(FrameError::InvalidSafetyPrefix(v).into()),
        }
    }
}

impl FixedEncodeLen for MessageNode {
    const ENCODE_LEN: usize =
        u8::ENCODE_LEN + ViewId::ENCODE_LEN + Seqno::ENCODE_LEN + SeqRange::ENCODE_LEN;
}

impl Encode for MessageNode {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let mut bits = 0u8;
        if self.operational {
            bits |= NODE_OPERATIONAL;
        }
        if self.leaving {
            bits |= NODE_LEAVING;
        }
        dst.write(&bits)?;
        dst.write(&self.view_id)?;
        dst.write(&self.safe_seq)?;
        dst.write(&self.im_range)?;
        Ok(())
    }
}

impl Decode for MessageNode {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let bits = src.read::<u8>()?;
        Ok(Self {
            operational: bits & NODE_OPERATIONAL != 0,
            leaving: bits & NODE_LEAVING != 0,
            view_id: src.read()?,
            safe_seq: src.read()?,
            im_range: src.read()?,
        })
    }
}

const ENVELOPE_LEN: usize = u8::ENCODE_LEN * 2 + Flags::ENCODE_LEN;

fn write_envelope(
    dst: &mut impl Write,
    kind: u8,
    flags: Flags,
) -> Result<(), BufTooShortOr<FrameError>> {
    dst.write(&VERSION)?;
    dst.write(&kind)?;
    dst.write(&flags)?;
    Ok(())
}

fn write_source(
    dst: &mut impl Write,
    flags: Flags,
    source: PeerId,
) -> Result<(), BufTooShortOr<FrameError>> {
    if flags.contains(Flags::SOURCE) {
        dst.write(&source)?;
    }
    Ok(())
}

fn source_len(flags: Flags) -> usize {
    if flags.contains(Flags::SOURCE) {
        PeerId::ENCODE_LEN
    } else {
        0
    }
}

fn write_bytes(dst: &mut impl Write, bytes: &Bytes) -> Result<(), BufTooShortOr<FrameError>> {
    let len = u32::try_from(bytes.len()).map_err(|_| FrameError::PayloadTooLarge(bytes.len()))?;
    dst.write(&len)?;
    dst.write_from(bytes.clone())?;
    Ok(())
}

fn read_bytes(src: &mut impl Read) -> Result<Bytes, BufTooShortOr<FrameError>> {
    let len = src.read::<u32>()? as usize;
    Ok(src.read_next(len)?)
}

fn bytes_len(bytes: &Bytes) -> usize {
    u32::ENCODE_LEN + bytes.len()
}

fn write_node_list(
    dst: &mut impl Write,
    list: &NodeList,
) -> Result<(), BufTooShortOr<FrameError>> {
    let count = u16::try_from(list.len()).map_err(|_| FrameError::NodeListTooLarge(list.len()))?;
    dst.write(&count)?;
    for (uuid, node) in list {
        dst.write(uuid)?;
        dst.write(node)?;
    }
    Ok(())
}

fn read_node_list(src: &mut impl Read) -> Result<NodeList, BufTooShortOr<FrameError>> {
    let count = src.read::<u16>()?;
    let mut list = NodeList::new();
    for _ in 0..count {
        let uuid = src.read::<PeerId>()?;
        let node = src.read::<MessageNode>()?;
        list.insert(uuid, node);
    }
    Ok(list)
}

fn node_list_len(list: &NodeList) -> usize {
    u16::ENCODE_LEN + list.len() * (PeerId::ENCODE_LEN + MessageNode::ENCODE_LEN)
}

impl EncodeLen for UserMessage {
    fn encode_len(&self) -> usize {
        ENVELOPE_LEN
            + u8::ENCODE_LEN // user_type
            + SafetyPrefix::ENCODE_LEN
            + u8::ENCODE_LEN // seq_range
            + ViewId::ENCODE_LEN
            + source_len(self.flags)
            + Seqno::ENCODE_LEN * 2
            + bytes_len(&self.payload)
    }
}

impl Encode for UserMessage {
    type Error = FrameError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_envelope(&mut dst, KIND_USER, self.flags)?;
        dst.write(&self.user_type)?;
        dst.write(&self.safety)?;
        dst.write(&self.seq_range)?;
        dst.write(&self.source_view_id)?;
        write_source(&mut dst, self.flags, self.source)?;
        dst.write(&self.seq)?;
        dst.write(&self.aru_seq)?;
        write_bytes(&mut dst, &self.payload)?;
        Ok(())
    }
}

impl EncodeLen for DelegateMessage {
    fn encode_len(&self) -> usize {
        ENVELOPE_LEN + ViewId::ENCODE_LEN + source_len(self.flags) + bytes_len(&self.inner)
    }
}

impl Encode for DelegateMessage {
    type Error = FrameError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_envelope(&mut dst, KIND_DELEGATE, self.flags)?;
        dst.write(&self.source_view_id)?;
        write_source(&mut dst, self.flags, self.source)?;
        write_bytes(&mut dst, &self.inner)?;
        Ok(())
    }
}

impl EncodeLen for GapMessage {
    fn encode_len(&self) -> usize {
        ENVELOPE_LEN
            + ViewId::ENCODE_LEN
            + source_len(self.flags)
            + Seqno::ENCODE_LEN * 2
            + PeerId::ENCODE_LEN
            + SeqRange::ENCODE_LEN
    }
}

impl Encode for GapMessage {
    type Error = FrameError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_envelope(&mut dst, KIND_GAP, self.flags)?;
        dst.write(&self.source_view_id)?;
        write_source(&mut dst, self.flags, self.source)?;
        dst.write(&self.seq)?;
        dst.write(&self.aru_seq)?;
        dst.write(&self.range_uuid)?;
        dst.write(&self.range)?;
        Ok(())
    }
}

fn membership_len(flags: Flags, list: &NodeList) -> usize {
    ENVELOPE_LEN
        + ViewId::ENCODE_LEN
        + source_len(flags)
        + Seqno::ENCODE_LEN * 2
        + u64::ENCODE_LEN // fifo_seq
        + node_list_len(list)
}

#[allow(clippy::cast_sign_loss)] // bit-pattern round trip
fn write_membership(
    dst: &mut impl Write,
    kind: u8,
    flags: Flags,
    source: PeerId,
    source_view_id: ViewId,
    seq: Seqno,
    aru_seq: Seqno,
    fifo_seq: i64,
    node_list: &NodeList,
) -> Result<(), BufTooShortOr<FrameError>> {
    write_envelope(dst, kind, flags)?;
    dst.write(&source_view_id)?;
    write_source(dst, flags, source)?;
    dst.write(&seq)?;
    dst.write(&aru_seq)?;
    dst.write(&(fifo_seq as u64))?;
    write_node_list(dst, node_list)?;
    Ok(())
}

impl EncodeLen for JoinMessage {
    fn encode_len(&self) -> usize {
        membership_len(self.flags, &self.node_list)
    }
}

impl Encode for JoinMessage {
    type Error = FrameError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_membership(
            &mut dst,
            KIND_JOIN,
            self.flags,
            self.source,
            self.source_view_id,
            self.seq,
            self.aru_seq,
            self.fifo_seq,
            &self.node_list,
        )
    }
}

impl EncodeLen for InstallMessage {
    fn encode_len(&self) -> usize {
        membership_len(self.flags, &self.node_list)
    }
}

impl Encode for InstallMessage {
    type Error = FrameError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_membership(
            &mut dst,
            KIND_INSTALL,
            self.flags,
            self.source,
            self.source_view_id,
            self.seq,
            self.aru_seq,
            self.fifo_seq,
            &self.node_list,
        )
    }
}

impl EncodeLen for LeaveMessage {
    fn encode_len(&self) -> usize {
        ENVELOPE_LEN
            + ViewId::ENCODE_LEN
            + source_len(self.flags)
            + Seqno::ENCODE_LEN * 2
            + u64::ENCODE_LEN
    }
}

impl Encode for LeaveMessage {
    type Error = FrameError;

    #[allow(clippy::cast_sign_loss)] // bit-pattern round trip
    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_envelope(&mut dst, KIND_LEAVE, self.flags)?;
        dst.write(&self.source_view_id)?;
        write_source(&mut dst, self.flags, self.source)?;
        dst.write(&self.seq)?;
        dst.write(&self.aru_seq)?;
        dst.write(&(self.fifo_seq as u64))?;
        Ok(())
    }
}

impl EncodeLen for Message {
    fn encode_len(&self) -> usize {
        match self {
            Self::User(m) => m.encode_len(),
            Self::Delegate(m) => m.encode_len(),
            Self::Gap(m) => m.encode_len(),
            Self::Join(m) => m.encode_len(),
            Self::Install(m) => m.encode_len(),
            Self::Leave(m) => m.encode_len(),
        }
    }
}

impl Encode for Message {
    type Error = FrameError;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        match self {
            Self::User(m) => m.encode(dst),
            Self::Delegate(m) => m.encode(dst),
            Self::Gap(m) => m.encode(dst),
            Self::Join(m) => m.encode(dst),
            Self::Install(m) => m.encode(dst),
            Self::Leave(m) => m.encode(dst),
        }
    }
}

impl Message {
    /// Encodes this frame into a fresh byte buffer.
    #[must_use]
    pub fn encode_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encode_len());
        buf.write(self).expect("buffer grows on demand");
        buf.freeze()
    }

    /// Decodes a frame.
    ///
    /// `transport_source` is the sender identity reported by the transport
    /// layer; it is used unless the frame embeds its own source
    /// ([`Flags::SOURCE`]). Tunnelled inner frames are decoded with no
    /// transport source at all, and must embed one.
    ///
    /// # Errors
    ///
    /// Errors if the frame is truncated or carries invalid field values.
    pub fn decode(
        src: &mut Bytes,
        transport_source: Option<PeerId>,
    ) -> Result<Self, BufTooShortOr<FrameError>> {
        let version = src.read::<u8>()?;
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version).into());
        }
        let kind = src.read::<u8>()?;
        let flags = src.read::<Flags>()?;

        match kind {
            KIND_USER => {
                let user_type = src.read::<u8>()?;
                let safety = src.read::<SafetyPrefix>()?;
                let seq_range = src.read::<u8>()?;
                let source_view_id = src.read::<ViewId>()?;
                let source = read_source(src, flags, transport_source)?;
                let seq = src.read::<Seqno>()?;
                let aru_seq = src.read::<Seqno>()?;
                let payload = read_bytes(src)?;
                Ok(Self::User(UserMessage {
                    source,
                    source_view_id,
                    seq,
                    aru_seq,
                    seq_range,
                    safety,
                    user_type,
                    flags,
                    payload,
                }))
            }
            KIND_DELEGATE => {
                let source_view_id = src.read::<ViewId>()?;
                let source = read_source(src, flags, transport_source)?;
                let inner = read_bytes(src)?;
                Ok(Self::Delegate(DelegateMessage {
                    source,
                    source_view_id,
                    flags,
                    inner,
                }))
            }
            KIND_GAP => {
                let source_view_id = src.read::<ViewId>()?;
                let source = read_source(src, flags, transport_source)?;
                let seq = src.read::<Seqno>()?;
                let aru_seq = src.read::<Seqno>()?;
                let range_uuid = src.read::<PeerId>()?;
                let range = src.read::<SeqRange>()?;
                Ok(Self::Gap(GapMessage {
                    source,
                    source_view_id,
                    seq,
                    aru_seq,
                    range_uuid,
                    range,
                    flags,
                }))
            }
            KIND_JOIN | KIND_INSTALL => {
                let source_view_id = src.read::<ViewId>()?;
                let source = read_source(src, flags, transport_source)?;
                let seq = src.read::<Seqno>()?;
                let aru_seq = src.read::<Seqno>()?;
                #[allow(clippy::cast_possible_wrap)] // bit-pattern round trip
                let fifo_seq = src.read::<u64>()? as i64;
                let node_list = read_node_list(src)?;
                if kind == KIND_JOIN {
                    Ok(Self::Join(JoinMessage {
                        source,
                        source_view_id,
                        seq,
                        aru_seq,
                        fifo_seq,
                        node_list,
                        flags,
                    }))
                } else {
                    Ok(Self::Install(InstallMessage {
                        source,
                        source_view_id,
                        seq,
                        aru_seq,
                        fifo_seq,
                        node_list,
                        flags,
                    }))
                }
            }
            KIND_LEAVE => {
                let source_view_id = src.read::<ViewId>()?;
                let source = read_source(src, flags, transport_source)?;
                let seq = src.read::<Seqno>()?;
                let aru_seq = src.read::<Seqno>()?;
                #[allow(clippy::cast_possible_wrap)] // bit-pattern round trip
                let fifo_seq = src.read::<u64>()? as i64;
                Ok(Self::Leave(LeaveMessage {
                    source,
                    source_view_id,
                    seq,
                    aru_seq,
                    fifo_seq,
                    flags,
                }))
            }
            kind => Err(FrameError::InvalidKind(kind).into()),
        }
    }
}

fn read_source(
    src: &mut Bytes,
    flags: Flags,
    transport_source: Option<PeerId>,
) -> Result<PeerId, BufTooShortOr<FrameError>> {
    if flags.contains(Flags::SOURCE) {
        Ok(src.read::<PeerId>()?)
    } else {
        transport_source.ok_or_else(|| FrameError::MissingSource.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u128) -> PeerId {
        PeerId::from_u128(n)
    }

    fn view(n: u128, seq: u32) -> ViewId {
        ViewId::new(peer(n), seq)
    }

    fn round_trip(msg: &Message, transport_source: Option<PeerId>) {
        let mut frame = msg.encode_frame();
        assert_eq!(msg.encode_len(), frame.len());
        let back = Message::decode(&mut frame, transport_source).unwrap();
        assert_eq!(*msg, back);
    }

    #[test]
    fn user_round_trip() {
        round_trip(
            &Message::User(UserMessage {
                source: peer(1),
                source_view_id: view(1, 3),
                seq: Seqno(7),
                aru_seq: Seqno(6),
                seq_range: 0,
                safety: SafetyPrefix::Safe,
                user_type: 42,
                flags: Flags::NONE,
                payload: Bytes::from_static(b"hello group"),
            }),
            Some(peer(1)),
        );
    }

    #[test]
    fn user_round_trip_embedded_source() {
        round_trip(
            &Message::User(UserMessage {
                source: peer(9),
                source_view_id: view(1, 3),
                seq: Seqno(0),
                aru_seq: Seqno::NONE,
                seq_range: 2,
                safety: SafetyPrefix::Drop,
                user_type: 0xff,
                flags: Flags::SOURCE | Flags::RETRANS,
                payload: Bytes::new(),
            }),
            None,
        );
    }

    #[test]
    fn delegate_round_trip() {
        let inner = Message::User(UserMessage {
            source: peer(3),
            source_view_id: view(1, 3),
            seq: Seqno(1),
            aru_seq: Seqno(0),
            seq_range: 0,
            safety: SafetyPrefix::Agreed,
            user_type: 7,
            flags: Flags::SOURCE | Flags::RETRANS,
            payload: Bytes::from_static(b"recovered"),
        });
        round_trip(
            &Message::Delegate(DelegateMessage {
                source: peer(2),
                source_view_id: view(1, 3),
                flags: Flags::NONE,
                inner: inner.encode_frame(),
            }),
            Some(peer(2)),
        );
    }

    #[test]
    fn gap_round_trip() {
        round_trip(
            &Message::Gap(GapMessage {
                source: peer(2),
                source_view_id: view(1, 3),
                seq: Seqno(5),
                aru_seq: Seqno(4),
                range_uuid: peer(1),
                range: SeqRange::new(Seqno(2), Seqno(4)),
                flags: Flags::NONE,
            }),
            Some(peer(2)),
        );
    }

    #[test]
    fn join_round_trip() {
        let mut node_list = NodeList::new();
        node_list.insert(
            peer(1),
            MessageNode {
                operational: true,
                leaving: false,
                view_id: view(1, 3),
                safe_seq: Seqno(4),
                im_range: SeqRange::new(Seqno(5), Seqno(9)),
            },
        );
        node_list.insert(
            peer(2),
            MessageNode {
                operational: false,
                leaving: true,
                view_id: ViewId::nil(),
                safe_seq: Seqno::NONE,
                im_range: SeqRange::default(),
            },
        );
        round_trip(
            &Message::Join(JoinMessage {
                source: peer(1),
                source_view_id: view(1, 3),
                seq: Seqno(4),
                aru_seq: Seqno(6),
                fifo_seq: 11,
                node_list,
                flags: Flags::NONE,
            }),
            Some(peer(1)),
        );
    }

    #[test]
    fn install_round_trip() {
        let mut node_list = NodeList::new();
        node_list.insert(
            peer(1),
            MessageNode {
                operational: true,
                leaving: false,
                view_id: view(1, 3),
                safe_seq: Seqno(0),
                im_range: SeqRange::new(Seqno(1), Seqno(1)),
            },
        );
        round_trip(
            &Message::Install(InstallMessage {
                source: peer(1),
                source_view_id: view(1, 4),
                seq: Seqno(0),
                aru_seq: Seqno(1),
                fifo_seq: 12,
                node_list,
                flags: Flags::NONE,
            }),
            Some(peer(1)),
        );
    }

    #[test]
    fn leave_round_trip() {
        round_trip(
            &Message::Leave(LeaveMessage {
                source: peer(2),
                source_view_id: view(1, 3),
                seq: Seqno(8),
                aru_seq: Seqno(8),
                fifo_seq: -1,
                flags: Flags::NONE,
            }),
            Some(peer(2)),
        );
    }

    #[test]
    fn rejects_unknown_kind() {
        let msg = Message::Gap(GapMessage {
            source: peer(2),
            source_view_id: view(1, 3),
            seq: Seqno(5),
            aru_seq: Seqno(4),
            range_uuid: PeerId::nil(),
            range: SeqRange::default(),
            flags: Flags::NONE,
        });
        let frame = msg.encode_frame();
        let mut broken = BytesMut::from(&frame[..]);
        broken[1] = 0xaa;
        let err = Message::decode(&mut broken.freeze(), Some(peer(2))).unwrap_err();
        assert!(format!("{err:?}").contains("InvalidKind"));
    }

    #[test]
    fn rejects_missing_source() {
        let msg = Message::Gap(GapMessage {
            source: peer(2),
            source_view_id: view(1, 3),
            seq: Seqno(5),
            aru_seq: Seqno(4),
            range_uuid: PeerId::nil(),
            range: SeqRange::default(),
            flags: Flags::NONE,
        });
        let mut frame = msg.encode_frame();
        let err = Message::decode(&mut frame, None).unwrap_err();
        assert!(format!("{err:?}").contains("MissingSource"));
    }
}
