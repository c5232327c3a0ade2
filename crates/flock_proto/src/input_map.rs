//! See [`InputMap`].

use std::collections::BTreeMap;

use ahash::AHashMap;
use tracing::debug;

use crate::{
    msg::UserMessage,
    peer::PeerId,
    seq::{SeqRange, Seqno},
};

/// Per-source sliding windows of received user messages, with the group-wide
/// aggregates derived from them.
///
/// The map is rebuilt at every view installation: [`InputMap::clear`] drops
/// everything, then each member of the new view is registered with
/// [`InputMap::insert_source`]. From then on every user message received in
/// (or sent into) the view is [`InputMap::insert`]ed, and the delivery engine
/// walks the map in `(seq, source)` order - the total order of the view.
#[derive(Debug)]
pub struct InputMap {
    /// Reception state per registered source.
    sources: BTreeMap<PeerId, SourceState>,
    /// Stored messages, keyed for in-order iteration by `(seq, source)`.
    ///
    /// # Insertion policy
    ///
    /// In [`InputMap::insert`], unless the message's sequence span was
    /// already received (duplicates and retransmissions are silently
    /// deduplicated).
    ///
    /// # Removal policy
    ///
    /// In [`InputMap::erase`] once the delivery engine has decided the
    /// message's fate. Erasing moves the message to the shadow store rather
    /// than dropping it.
    msgs: BTreeMap<(Seqno, PeerId), UserMessage>,
    /// Shadow store of erased messages, kept for the lifetime of the view so
    /// that retransmission and delegated recovery can revive them.
    ///
    /// Lookup-only; never iterated, so ordering does not matter here.
    shadow: AHashMap<(PeerId, Seqno), UserMessage>,
    /// Cached group all-received-upto sequence.
    aru_seq: Seqno,
    /// Cached group safe sequence.
    safe_seq: Seqno,
}

/// Reception state for one registered source.
#[derive(Debug)]
struct SourceState {
    /// Received sequence spans, merged, as `start -> end` (inclusive).
    seen: BTreeMap<u32, u32>,
    /// Greatest sequence this peer is known to have received everything up
    /// to, learned from the aru it reports on its frames.
    safe_seq: Seqno,
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            seen: BTreeMap::new(),
            safe_seq: Seqno::NONE,
        }
    }
}

impl SourceState {
    /// Lowest sequence number not yet received.
    ///
    /// A registered source with nothing received has `lu = 0`; the sentinel
    /// form of a range is reserved for unregistered peers.
    fn lu(&self) -> Seqno {
        match self.seen.first_key_value() {
            Some((&0, &end)) => Seqno(end + 1),
            _ => Seqno(0),
        }
    }

    fn hs(&self) -> Seqno {
        self.seen
            .last_key_value()
            .map_or(Seqno::NONE, |(_, &end)| Seqno(end))
    }

    fn range(&self) -> SeqRange {
        SeqRange::new(self.lu(), self.hs())
    }

    fn is_covered(&self, start: u32, end: u32) -> bool {
        self.seen
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &e)| e >= end)
    }

    fn mark_seen(&mut self, start: u32, end: u32) {
        let mut new_start = start;
        let mut new_end = end;
        if let Some((&s, &e)) = self.seen.range(..=start).next_back() {
            if e + 1 >= start {
                new_start = s;
                new_end = new_end.max(e);
                self.seen.remove(&s);
            }
        }
        while let Some((&s, &e)) = self.seen.range(new_start..).next() {
            if s <= new_end.saturating_add(1) {
                new_end = new_end.max(e);
                self.seen.remove(&s);
            } else {
                break;
            }
        }
        self.seen.insert(new_start, new_end);
    }
}

impl Default for InputMap {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            msgs: BTreeMap::new(),
            shadow: AHashMap::new(),
            aru_seq: Seqno::NONE,
            safe_seq: Seqno::NONE,
        }
    }
}

impl InputMap {
    /// Creates an empty map with no registered sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source, making it participate in the aggregates.
    pub fn insert_source(&mut self, source: PeerId) {
        self.sources.entry(source).or_default();
        self.recompute_aru();
        self.recompute_safe();
    }

    /// Drops all sources, messages and shadow state.
    pub fn clear(&mut self) {
        self.sources.clear();
        self.msgs.clear();
        self.shadow.clear();
        self.aru_seq = Seqno::NONE;
        self.safe_seq = Seqno::NONE;
    }

    /// Stores a received (or locally sent) user message and returns the
    /// source's updated range.
    ///
    /// The message's `[seq, seq + seq_range]` span is marked received;
    /// duplicates are deduplicated silently.
    ///
    /// # Panics
    ///
    /// Panics if the message's source is not registered, or if its sequence
    /// number is the sentinel.
    pub fn insert(&mut self, source: PeerId, msg: UserMessage) -> SeqRange {
        assert!(!msg.seq.is_none(), "message without sequence number");
        let state = self
            .sources
            .get_mut(&source)
            .unwrap_or_else(|| panic!("source {source} not registered in input map"));

        let start = msg.seq.0;
        let end = start + u32::from(msg.seq_range);
        if !state.is_covered(start, end) {
            state.mark_seen(start, end);
            self.msgs.entry((msg.seq, source)).or_insert(msg);
            self.recompute_aru();
        }
        self.sources[&source].range()
    }

    /// Records that `source` has received everything up to `seq`.
    ///
    /// Monotonically non-decreasing per source; lowering attempts and the
    /// sentinel are no-ops.
    pub fn set_safe_seq(&mut self, source: PeerId, seq: Seqno) {
        if seq.is_none() {
            return;
        }
        let Some(state) = self.sources.get_mut(&source) else {
            debug!(%source, "safe seq for unregistered source");
            return;
        };
        if state.safe_seq.is_none() || state.safe_seq < seq {
            state.safe_seq = seq;
            self.recompute_safe();
        }
    }

    /// Gets the received range of a source, or the unknown range if the
    /// source is not registered.
    #[must_use]
    pub fn range(&self, source: PeerId) -> SeqRange {
        self.sources
            .get(&source)
            .map_or_else(SeqRange::default, SourceState::range)
    }

    /// Gets what `source` is known to have received everything up to.
    #[must_use]
    pub fn safe_seq_of(&self, source: PeerId) -> Seqno {
        self.sources
            .get(&source)
            .map_or(Seqno::NONE, |state| state.safe_seq)
    }

    /// Gets the group all-received-upto sequence: the last sequence up to
    /// which this peer has received every message from every source.
    #[must_use]
    pub const fn aru_seq(&self) -> Seqno {
        self.aru_seq
    }

    /// Gets the group safe sequence: the last sequence up to which every
    /// registered peer is known to have received everything.
    #[must_use]
    pub const fn safe_seq(&self) -> Seqno {
        self.safe_seq
    }

    /// Gets the first missing sequence span of a source, if its window has a
    /// hole.
    #[must_use]
    pub fn first_hole(&self, source: PeerId) -> Option<SeqRange> {
        let state = self.sources.get(&source)?;
        let lu = state.lu();
        let hs = state.hs();
        if hs.is_none() || hs.0 <= lu.0 {
            return None;
        }
        let (&next_start, _) = state.seen.range((lu.0 + 1)..).next()?;
        Some(SeqRange::new(lu, Seqno(next_start - 1)))
    }

    /// Looks up a stored message.
    #[must_use]
    pub fn find(&self, source: PeerId, seq: Seqno) -> Option<&UserMessage> {
        self.msgs.get(&(seq, source))
    }

    /// Looks up a message for retransmission, reviving it from the shadow
    /// store if it has already been delivered and erased.
    ///
    /// Returns [`None`] only on a protocol bug: the caller asked for a
    /// message this peer never held in the current view.
    #[must_use]
    pub fn recover(&self, source: PeerId, seq: Seqno) -> Option<&UserMessage> {
        self.find(source, seq)
            .or_else(|| self.shadow.get(&(source, seq)))
    }

    /// Removes a message from the live map, keeping it in the shadow store
    /// for recovery. Reception state is unaffected.
    pub fn erase(&mut self, source: PeerId, seq: Seqno) {
        if let Some(msg) = self.msgs.remove(&(seq, source)) {
            self.shadow.insert((source, seq), msg);
        }
    }

    /// Iterates stored messages in `(seq, source)` order - the total order
    /// of the view.
    pub fn iter(&self) -> impl Iterator<Item = ((Seqno, PeerId), &UserMessage)> + '_ {
        self.msgs.iter().map(|(k, v)| (*k, v))
    }

    /// Gets whether the message at `(source, seq)` is FIFO-deliverable:
    /// every earlier message from the same source has been received.
    #[must_use]
    pub fn is_fifo(&self, source: PeerId, seq: Seqno) -> bool {
        self.sources
            .get(&source)
            .is_some_and(|state| seq.0 < state.lu().0)
    }

    /// Gets whether the message at `seq` is agreed-deliverable: everything
    /// up to it has been received from every source.
    #[must_use]
    pub fn is_agreed(&self, seq: Seqno) -> bool {
        !self.aru_seq.is_none() && seq.0 <= self.aru_seq.0
    }

    /// Gets whether the message at `seq` is safe-deliverable: every
    /// registered peer is known to have received it.
    #[must_use]
    pub fn is_safe(&self, seq: Seqno) -> bool {
        !self.safe_seq.is_none() && seq.0 <= self.safe_seq.0
    }

    fn recompute_aru(&mut self) {
        let min_lu = self.sources.values().map(|s| s.lu()).min();
        self.aru_seq = match min_lu {
            None | Some(Seqno(0)) => Seqno::NONE,
            Some(lu) => lu - 1,
        };
    }

    fn recompute_safe(&mut self) {
        let mut min = Seqno::NONE;
        for state in self.sources.values() {
            if state.safe_seq.is_none() {
                self.safe_seq = Seqno::NONE;
                return;
            }
            min = min.min(state.safe_seq);
        }
        self.safe_seq = if self.sources.is_empty() {
            Seqno::NONE
        } else {
            min
        };
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        msg::{Flags, SafetyPrefix},
        view::ViewId,
    };

    fn peer(n: u128) -> PeerId {
        PeerId::from_u128(n)
    }

    fn user_msg(source: PeerId, seq: u32, seq_range: u8) -> UserMessage {
        UserMessage {
            source,
            source_view_id: ViewId::new(peer(1), 1),
            seq: Seqno(seq),
            aru_seq: Seqno::NONE,
            seq_range,
            safety: SafetyPrefix::Safe,
            user_type: 0,
            flags: Flags::NONE,
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn fresh_source_range() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));
        assert_eq!(SeqRange::new(Seqno(0), Seqno::NONE), im.range(peer(1)));
        assert_eq!(Seqno::NONE, im.aru_seq());
        assert_eq!(Seqno::NONE, im.safe_seq());
    }

    #[test]
    fn contiguous_insert_advances_lu() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));

        let range = im.insert(peer(1), user_msg(peer(1), 0, 0));
        assert_eq!(SeqRange::new(Seqno(1), Seqno(0)), range);
        let range = im.insert(peer(1), user_msg(peer(1), 1, 0));
        assert_eq!(SeqRange::new(Seqno(2), Seqno(1)), range);
        assert_eq!(Seqno(1), im.aru_seq());
    }

    #[test]
    fn gap_stalls_lu() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));

        im.insert(peer(1), user_msg(peer(1), 0, 0));
        let range = im.insert(peer(1), user_msg(peer(1), 2, 0));
        assert_eq!(SeqRange::new(Seqno(1), Seqno(2)), range);
        assert_eq!(Some(SeqRange::new(Seqno(1), Seqno(1))), im.first_hole(peer(1)));

        // retransmission fills the hole
        let range = im.insert(peer(1), user_msg(peer(1), 1, 0));
        assert_eq!(SeqRange::new(Seqno(3), Seqno(2)), range);
        assert_eq!(None, im.first_hole(peer(1)));
    }

    #[test]
    fn seq_range_reserves_span() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));

        let range = im.insert(peer(1), user_msg(peer(1), 0, 3));
        assert_eq!(SeqRange::new(Seqno(4), Seqno(3)), range);
        assert_eq!(Seqno(3), im.aru_seq());
    }

    #[test]
    fn duplicates_are_idempotent() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));

        im.insert(peer(1), user_msg(peer(1), 0, 0));
        let before: Vec<_> = im.iter().map(|(k, _)| k).collect();
        im.insert(peer(1), user_msg(peer(1), 0, 0));
        let after: Vec<_> = im.iter().map(|(k, _)| k).collect();
        assert_eq!(before, after);
        assert_eq!(Seqno(0), im.aru_seq());
    }

    #[test]
    fn aru_is_group_minimum() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));
        im.insert_source(peer(2));

        im.insert(peer(1), user_msg(peer(1), 0, 0));
        im.insert(peer(1), user_msg(peer(1), 1, 0));
        // peer 2 has sent nothing: the group frontier is unset
        assert_eq!(Seqno::NONE, im.aru_seq());

        im.insert(peer(2), user_msg(peer(2), 0, 0));
        assert_eq!(Seqno(0), im.aru_seq());
    }

    #[test]
    fn safe_seq_is_monotone() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));
        im.insert_source(peer(2));

        im.set_safe_seq(peer(1), Seqno(3));
        im.set_safe_seq(peer(2), Seqno(5));
        assert_eq!(Seqno(3), im.safe_seq());

        // lowering is a no-op
        im.set_safe_seq(peer(1), Seqno(1));
        assert_eq!(Seqno(3), im.safe_seq());
        assert_eq!(Seqno(3), im.safe_seq_of(peer(1)));

        im.set_safe_seq(peer(1), Seqno(7));
        assert_eq!(Seqno(5), im.safe_seq());
    }

    #[test]
    fn delivery_predicates() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));
        im.insert_source(peer(2));

        im.insert(peer(1), user_msg(peer(1), 0, 0));
        im.insert(peer(1), user_msg(peer(1), 2, 0));
        im.insert(peer(2), user_msg(peer(2), 0, 0));

        assert!(im.is_fifo(peer(1), Seqno(0)));
        assert!(!im.is_fifo(peer(1), Seqno(2)));

        assert_eq!(Seqno(0), im.aru_seq());
        assert!(im.is_agreed(Seqno(0)));
        assert!(!im.is_agreed(Seqno(2)));

        assert!(!im.is_safe(Seqno(0)));
        im.set_safe_seq(peer(1), Seqno(0));
        im.set_safe_seq(peer(2), Seqno(0));
        assert!(im.is_safe(Seqno(0)));
    }

    #[test]
    fn erase_keeps_message_recoverable() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));

        im.insert(peer(1), user_msg(peer(1), 0, 0));
        im.erase(peer(1), Seqno(0));

        assert!(im.find(peer(1), Seqno(0)).is_none());
        let recovered = im.recover(peer(1), Seqno(0)).unwrap();
        assert_eq!(Seqno(0), recovered.seq);
        // reception state is untouched by erase
        assert_eq!(SeqRange::new(Seqno(1), Seqno(0)), im.range(peer(1)));
    }

    #[test]
    fn iteration_is_seq_then_source_ordered() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));
        im.insert_source(peer(2));

        im.insert(peer(2), user_msg(peer(2), 1, 0));
        im.insert(peer(1), user_msg(peer(1), 0, 0));
        im.insert(peer(2), user_msg(peer(2), 0, 0));
        im.insert(peer(1), user_msg(peer(1), 1, 0));

        let keys: Vec<_> = im.iter().map(|(k, _)| k).collect();
        assert_eq!(
            vec![
                (Seqno(0), peer(1)),
                (Seqno(0), peer(2)),
                (Seqno(1), peer(1)),
                (Seqno(1), peer(2)),
            ],
            keys
        );
    }

    #[test]
    fn clear_resets_everything() {
        let mut im = InputMap::new();
        im.insert_source(peer(1));
        im.insert(peer(1), user_msg(peer(1), 0, 0));
        im.set_safe_seq(peer(1), Seqno(0));

        im.clear();
        assert_eq!(Seqno::NONE, im.aru_seq());
        assert_eq!(Seqno::NONE, im.safe_seq());
        assert_eq!(SeqRange::default(), im.range(peer(1)));
        assert!(im.recover(peer(1), Seqno(0)).is_none());
    }
}
