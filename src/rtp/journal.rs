use std::collections::VecDeque;

use crate::message::MidiMessage;

use super::peer::SequenceNumber;

/// One journalled transmission: the sequence number of the packet and the
/// messages it carried.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub sequence: SequenceNumber,
    pub messages: Vec<MidiMessage>,
}

/// Sender-side recovery journal for one peer.
///
/// A bounded ring of the most recently sent packets, keyed by sequence
/// number. Receiver feedback truncates the acknowledged prefix; `replay`
/// hands back what a receiver may still be missing, without a retransmit
/// round trip.
pub struct SendJournal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
}

impl SendJournal {
    pub const DEFAULT_CAPACITY: usize = 128;

    pub fn with_capacity(capacity: usize) -> SendJournal {
        SendJournal {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sent packet. The oldest entry is evicted when the ring is
    /// full.
    pub fn append(&mut self, sequence: SequenceNumber, messages: Vec<MidiMessage>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(JournalEntry { sequence, messages });
    }

    /// Drop all entries with sequence numbers up to and including `up_to`
    /// (wrap-around aware). Called on receiver feedback.
    pub fn truncate(&mut self, up_to: SequenceNumber) {
        while let Some(front) = self.entries.front() {
            if front.sequence.delta(up_to) <= 0 {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Entries from `from` (inclusive) onwards, in send order.
    pub fn replay(&self, from: SequenceNumber) -> impl Iterator<Item = &JournalEntry> {
        self.entries
            .iter()
            .filter(move |e| e.sequence.delta(from) >= 0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence numbers currently retained, oldest first.
    pub fn sequences(&self) -> Vec<SequenceNumber> {
        self.entries.iter().map(|e| e.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(raw: u16) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn entry_messages() -> Vec<MidiMessage> {
        vec![MidiMessage::note_on(0, 60, 100).unwrap()]
    }

    #[test]
    fn test_truncate_drops_acknowledged_prefix() {
        let mut journal = SendJournal::with_capacity(SendJournal::DEFAULT_CAPACITY);
        for raw in 100..105 {
            journal.append(seq(raw), entry_messages());
        }

        journal.truncate(seq(102));
        assert_eq!(journal.sequences(), vec![seq(103), seq(104)]);

        // feedback for an already-acknowledged sequence is a no-op
        journal.truncate(seq(101));
        assert_eq!(journal.len(), 2);

        journal.truncate(seq(200));
        assert!(journal.is_empty());
    }

    #[test]
    fn test_truncate_across_wrap() {
        let mut journal = SendJournal::with_capacity(SendJournal::DEFAULT_CAPACITY);
        let mut s = seq(0xfffd);
        for _ in 0..6 {
            journal.append(s, entry_messages());
            s = s.next();
        }

        journal.truncate(seq(0));
        assert_eq!(journal.sequences(), vec![seq(1), seq(2)]);
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut journal = SendJournal::with_capacity(4);
        for raw in 0..10 {
            journal.append(seq(raw), entry_messages());
        }
        assert_eq!(journal.len(), 4);
        assert_eq!(journal.sequences(), vec![seq(6), seq(7), seq(8), seq(9)]);
    }

    #[test]
    fn test_replay_returns_tail_in_order() {
        let mut journal = SendJournal::with_capacity(SendJournal::DEFAULT_CAPACITY);
        for raw in 10..15 {
            journal.append(seq(raw), entry_messages());
        }

        let replayed: Vec<_> = journal.replay(seq(12)).map(|e| e.sequence).collect();
        assert_eq!(replayed, vec![seq(12), seq(13), seq(14)]);
    }
}
