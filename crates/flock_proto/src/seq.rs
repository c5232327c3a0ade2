//! See [`Seqno`] and [`SeqRange`].

use std::{
    convert::Infallible,
    fmt,
    ops::{Add, Sub},
};

use arbitrary::Arbitrary;
use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

/// Sequence number of a user message within a view.
///
/// Each member numbers the messages it originates from `0` upwards,
/// restarting whenever a new view is installed, so the number never wraps in
/// practice and is stored as a plain [`u32`].
///
/// The all-ones value is reserved as the [`Seqno::NONE`] sentinel meaning
/// "no sequence number" - an empty range bound, an unset aru, a peer that has
/// not sent anything yet. Arithmetic is only defined on concrete values;
/// adding to or subtracting from the sentinel is a bug on the caller's side.
///
/// Ordering is the plain integer ordering, which places [`Seqno::NONE`] after
/// every concrete value. Code that wants "none sorts lowest" semantics (range
/// comparisons during recovery) must check [`Seqno::is_none`] explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Arbitrary)]
pub struct Seqno(pub u32);

impl Seqno {
    /// Sentinel meaning "no sequence number".
    pub const NONE: Self = Self(u32::MAX);

    /// Gets whether this is the [`Seqno::NONE`] sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Gets how many sequence numbers lie between `earlier` and `self`.
    ///
    /// # Panics
    ///
    /// Panics if `earlier > self` or if either value is the sentinel.
    #[must_use]
    pub fn since(self, earlier: Self) -> u32 {
        debug_assert!(!self.is_none() && !earlier.is_none());
        assert!(earlier <= self, "{earlier} > {self}");
        self.0 - earlier.0
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_none() {
            f.write_str("-")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Add<u32> for Seqno {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        debug_assert!(!self.is_none());
        Self(self.0 + rhs)
    }
}

impl Sub<u32> for Seqno {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        debug_assert!(!self.is_none());
        Self(self.0 - rhs)
    }
}

impl FixedEncodeLen for Seqno {
    const ENCODE_LEN: usize = u32::ENCODE_LEN;
}

impl Encode for Seqno {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seqno {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Span of sequence numbers received from a single source.
///
/// `lu` ("lowest unseen") is the smallest sequence number not yet received
/// from the source; `hs` ("highest seen") is the largest received so far, or
/// [`Seqno::NONE`] when nothing has been received. The default value
/// `(NONE, NONE)` stands for "unknown range" on the wire, used for peers
/// outside the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub struct SeqRange {
    /// Lowest sequence number not yet received.
    pub lu: Seqno,
    /// Highest sequence number received.
    pub hs: Seqno,
}

impl SeqRange {
    /// Creates a range from its bounds.
    #[must_use]
    pub const fn new(lu: Seqno, hs: Seqno) -> Self {
        Self { lu, hs }
    }
}

impl Default for SeqRange {
    /// Gets the unknown range, `(NONE, NONE)`.
    fn default() -> Self {
        Self::new(Seqno::NONE, Seqno::NONE)
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{},{}]", self.lu, self.hs)
    }
}

impl FixedEncodeLen for SeqRange {
    const ENCODE_LEN: usize = Seqno::ENCODE_LEN * 2;
}

impl Encode for SeqRange {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.lu)?;
        dst.write(&self.hs)?;
        Ok(())
    }
}

impl Decode for SeqRange {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            lu: src.read()?,
            hs: src.read()?,
        })
    }
}

/// Gets whether sending `seq` must be refused by window-based flow control.
///
/// `aru` is the group's all-received-upto sequence; a send is admitted while
/// it stays within `win` messages of that frontier. Only the `OPERATIONAL`
/// send path consults this - recovery flushes bypass it to drain queues.
#[must_use]
pub fn is_flow_control(seq: Seqno, aru: Seqno, win: u32) -> bool {
    debug_assert!(!seq.is_none());
    let base = if aru.is_none() { 0 } else { u64::from(aru.0) };
    u64::from(seq.0) >= base + u64::from(win)
}
