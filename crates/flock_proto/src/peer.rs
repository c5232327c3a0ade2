//! See [`PeerId`].

use std::{convert::Infallible, fmt};

use arbitrary::Arbitrary;
use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};
use uuid::Uuid;

/// Opaque identity of one group member.
///
/// Identities are totally ordered; the protocol uses that order to elect the
/// install representative (the smallest operational identity wins), so it
/// must be identical on every peer. The nil value is reserved: a nil source
/// on a frame is a transport contract violation, and a nil `range_uuid` on a
/// gap frame means "pure acknowledgement".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Arbitrary)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Gets the reserved nil identity.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Gets whether this is the nil identity.
    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    /// Creates an identity from a raw 128-bit value.
    #[must_use]
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.0).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FixedEncodeLen for PeerId {
    const ENCODE_LEN: usize = u64::ENCODE_LEN * 2;
}

impl Encode for PeerId {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let v = self.0.as_u128();
        #[allow(clippy::cast_possible_truncation)] // low half is intentional
        {
            dst.write(&((v >> 64) as u64))?;
            dst.write(&(v as u64))?;
        }
        Ok(())
    }
}

impl Decode for PeerId {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let hi = src.read::<u64>()?;
        let lo = src.read::<u64>()?;
        Ok(Self(Uuid::from_u128(
            (u128::from(hi) << 64) | u128::from(lo),
        )))
    }
}

#[cfg(test)]
mod tests {
    use octs::BytesMut;

    use super::*;

    #[test]
    fn encode_decode() {
        let v = PeerId::from_u128(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let mut buf = BytesMut::with_capacity(PeerId::ENCODE_LEN);

        buf.write(&v).unwrap();
        assert_eq!(PeerId::ENCODE_LEN, buf.len());

        assert_eq!(v, buf.freeze().read::<PeerId>().unwrap());
    }

    #[test]
    fn ordering_is_stable() {
        assert!(PeerId::from_u128(1) < PeerId::from_u128(2));
        assert!(PeerId::nil() < PeerId::from_u128(1));
        assert!(PeerId::nil().is_nil());
        assert!(!PeerId::from_u128(1).is_nil());
    }
}
