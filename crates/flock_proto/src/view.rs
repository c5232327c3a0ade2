//! See [`View`] and [`ViewId`].

use std::{cmp::Ordering, collections::BTreeSet, convert::Infallible, fmt};

use arbitrary::Arbitrary;
use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

use crate::peer::PeerId;

/// Globally unique identity of a view.
///
/// A view id pairs the identity of the representative that installed the view
/// with a sequence number that grows across installations. Ordering is by
/// sequence first, then by representative identity, so that a merge
/// representative can always pick a fresh id by exceeding every sequence it
/// has observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Arbitrary)]
pub struct ViewId {
    /// Representative which installed this view.
    pub uuid: PeerId,
    /// Installation counter.
    pub seq: u32,
}

impl ViewId {
    /// Creates a view id from its parts.
    #[must_use]
    pub const fn new(uuid: PeerId, seq: u32) -> Self {
        Self { uuid, seq }
    }

    /// Gets the reserved nil view id, used for the terminal empty view and
    /// for peers whose view is unknown.
    #[must_use]
    pub const fn nil() -> Self {
        Self::new(PeerId::nil(), 0)
    }

    /// Gets whether this is the nil view id.
    #[must_use]
    pub fn is_nil(self) -> bool {
        self.uuid.is_nil() && self.seq == 0
    }
}

impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq
            .cmp(&other.seq)
            .then_with(|| self.uuid.cmp(&other.uuid))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.uuid, self.seq)
    }
}

impl FixedEncodeLen for ViewId {
    const ENCODE_LEN: usize = PeerId::ENCODE_LEN + u32::ENCODE_LEN;
}

impl Encode for ViewId {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.uuid)?;
        dst.write(&self.seq)?;
        Ok(())
    }
}

impl Decode for ViewId {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            uuid: src.read()?,
            seq: src.read()?,
        })
    }
}

/// Which of the two view flavours a [`View`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Regular view: a stable installed membership within which ordered
    /// reliable multicast holds.
    Reg,
    /// Transitional view bridging the previous regular view to the next,
    /// carrying residual FIFO deliveries.
    Trans,
}

/// Membership snapshot delivered to the application.
///
/// A `Reg` view announces the next agreed membership. A `Trans` view keeps
/// the previous view's id and names the subset of its members that proceed
/// together. The empty `Reg` view with a nil id is the terminal shutdown
/// signal after a graceful leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    /// View flavour.
    pub kind: ViewKind,
    /// View identity.
    pub id: ViewId,
    /// Peers belonging to this view.
    pub members: BTreeSet<PeerId>,
    /// Members which were not part of the previous regular view.
    pub joined: BTreeSet<PeerId>,
    /// Previous members which left gracefully.
    pub left: BTreeSet<PeerId>,
    /// Previous members which were partitioned away.
    pub partitioned: BTreeSet<PeerId>,
}

impl View {
    /// Creates an empty view with the given flavour and id.
    #[must_use]
    pub fn new(kind: ViewKind, id: ViewId) -> Self {
        Self {
            kind,
            id,
            members: BTreeSet::new(),
            joined: BTreeSet::new(),
            left: BTreeSet::new(),
            partitioned: BTreeSet::new(),
        }
    }

    /// Gets whether this view has no members at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ViewKind::Reg => "reg",
            ViewKind::Trans => "trans",
        };
        write!(f, "view {kind} {} ({} members)", self.id, self.members.len())
    }
}

#[cfg(test)]
mod tests {
    use octs::BytesMut;

    use super::*;

    #[test]
    fn encode_decode() {
        let v = ViewId::new(PeerId::from_u128(7), 42);
        let mut buf = BytesMut::with_capacity(ViewId::ENCODE_LEN);

        buf.write(&v).unwrap();
        assert_eq!(ViewId::ENCODE_LEN, buf.len());

        assert_eq!(v, buf.freeze().read::<ViewId>().unwrap());
    }

    #[test]
    fn ordered_by_seq_then_uuid() {
        let a = PeerId::from_u128(1);
        let b = PeerId::from_u128(2);
        assert!(ViewId::new(b, 1) < ViewId::new(a, 2));
        assert!(ViewId::new(a, 2) < ViewId::new(b, 2));
        assert!(ViewId::nil() < ViewId::new(a, 1));
    }
}
