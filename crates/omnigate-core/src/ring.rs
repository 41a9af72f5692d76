//! Fixed-capacity event ring with strictly monotonic sequence numbers.
//!
//! Each session keeps one of these so a reconnecting client can replay
//! events it missed (`Last-Event-ID`). Overflow is explicit: pushing into a
//! full ring evicts the oldest entry and reports it, so the session layer
//! can emit a resync marker instead of silently losing data.

use std::collections::VecDeque;

/// Outcome of a [`EventRing::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingPush {
    /// The entry was stored without evicting anything.
    Stored,
    /// The ring was full; the oldest entry (with the given sequence) was
    /// dropped to make room.
    Evicted(u64),
}

/// Bounded ring buffer of sequenced entries.
///
/// Sequence numbers start at 1 and never repeat or go backwards within one
/// ring.
#[derive(Debug)]
pub struct EventRing<T> {
    entries: VecDeque<(u64, T)>,
    capacity: usize,
    next_seq: u64,
}

impl<T: Clone> EventRing<T> {
    /// Create a ring holding at most `capacity` entries.
    ///
    /// A zero capacity is clamped to 1 so the ring always retains the most
    /// recent event.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            next_seq: 1,
        }
    }

    /// Append an entry, assigning it the next sequence number.
    ///
    /// Returns the assigned sequence and whether an old entry was evicted.
    pub fn push(&mut self, entry: T) -> (u64, RingPush) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let outcome = if self.entries.len() == self.capacity {
            match self.entries.pop_front() {
                Some((evicted_seq, _)) => RingPush::Evicted(evicted_seq),
                None => RingPush::Stored,
            }
        } else {
            RingPush::Stored
        };
        self.entries.push_back((seq, entry));
        (seq, outcome)
    }

    /// Sequence number that will be assigned to the next pushed entry.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Oldest sequence still held, if any.
    #[must_use]
    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|(seq, _)| *seq)
    }

    /// Newest sequence held, if any.
    #[must_use]
    pub fn newest_seq(&self) -> Option<u64> {
        self.entries.back().map(|(seq, _)| *seq)
    }

    /// Whether a replay from `after` can be served without gaps.
    ///
    /// `after` is the last sequence the client saw. Replay is gapless when
    /// every event after it is still buffered (or nothing was ever pushed).
    #[must_use]
    pub fn can_resume_after(&self, after: u64) -> bool {
        if after + 1 >= self.next_seq {
            // Client is at (or beyond) the tip.
            return true;
        }
        match self.oldest_seq() {
            Some(oldest) => after + 1 >= oldest,
            None => false,
        }
    }

    /// Clone out every entry with a sequence greater than `after`, in order.
    #[must_use]
    pub fn replay_after(&self, after: u64) -> Vec<(u64, T)> {
        self.entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .cloned()
            .collect()
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_start_at_one_and_increase() {
        let mut ring = EventRing::new(8);
        let (s1, p1) = ring.push("a");
        let (s2, p2) = ring.push("b");
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(p1, RingPush::Stored);
        assert_eq!(p2, RingPush::Stored);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut ring = EventRing::new(2);
        ring.push(1);
        ring.push(2);
        let (seq, outcome) = ring.push(3);
        assert_eq!(seq, 3);
        assert_eq!(outcome, RingPush::Evicted(1));
        assert_eq!(ring.oldest_seq(), Some(2));
    }

    #[test]
    fn replay_after_returns_tail() {
        let mut ring = EventRing::new(16);
        for i in 0..10 {
            ring.push(i);
        }
        let tail = ring.replay_after(5);
        let seqs: Vec<u64> = tail.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn resume_detects_evicted_history() {
        let mut ring = EventRing::new(4);
        for i in 0..10 {
            ring.push(i);
        }
        // Entries 7..=10 remain.
        assert!(ring.can_resume_after(6));
        assert!(ring.can_resume_after(10));
        assert!(!ring.can_resume_after(2));
    }

    #[test]
    fn fresh_ring_resumes_from_zero() {
        let ring: EventRing<u8> = EventRing::new(4);
        assert!(ring.can_resume_after(0));
    }
}
