//! Pending-delivery storage.
//!
//! Entries are never removed from the middle. Clearing a handler or absorbing
//! a message through conflation blanks the entry in place; the loop skips
//! blank entries when it pops them.

use std::collections::{HashSet, VecDeque};

use crate::handler::{HandlerId, HandlerRef};
use crate::message::Message;

/// Position of an entry, stable for the entry's lifetime.
pub(crate) type EntrySeq = u64;

/// Identity of the loop run that owns a sentinel.
pub(crate) type RunId = u64;

pub(crate) enum QueueEntry {
    Delivery {
        seq: EntrySeq,
        handler: Option<HandlerRef>,
        msg: Option<Box<dyn Message>>,
    },
    Sentinel {
        seq: EntrySeq,
        run: RunId,
    },
}

impl QueueEntry {
    fn seq(&self) -> EntrySeq {
        match self {
            QueueEntry::Delivery { seq, .. } | QueueEntry::Sentinel { seq, .. } => *seq,
        }
    }

    fn is_live_for(&self, id: HandlerId) -> bool {
        matches!(
            self,
            QueueEntry::Delivery { handler: Some(h), msg: Some(_), .. } if HandlerId::of(h) == id
        )
    }
}

/// What the loop finds when it pops the front of the queue.
pub(crate) enum Popped {
    /// A live message for a handler.
    Deliver(HandlerRef, Box<dyn Message>),
    /// Blank entry, or the sentinel of some other run.
    Skip,
    /// The run that is popping has reached its sentinel, or a nested run
    /// popped that sentinel first.
    EndOfRun,
}

#[derive(Default)]
pub(crate) struct MessageQueue {
    entries: VecDeque<QueueEntry>,
    next_seq: EntrySeq,
    /// Runs whose sentinel was consumed by a nested run.
    cut: HashSet<RunId>,
}

impl MessageQueue {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Physical length, blank entries and sentinels included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn bump_seq(&mut self) -> EntrySeq {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn push(&mut self, handler: HandlerRef, msg: Box<dyn Message>) -> EntrySeq {
        let seq = self.bump_seq();
        self.entries.push_back(QueueEntry::Delivery {
            seq,
            handler: Some(handler),
            msg: Some(msg),
        });
        seq
    }

    /// Append the end-of-run marker for `run`.
    pub fn push_sentinel(&mut self, run: RunId) {
        let seq = self.bump_seq();
        self.entries.push_back(QueueEntry::Sentinel { seq, run });
    }

    /// Pop the next entry on behalf of `run`.
    ///
    /// A sentinel popped by a run other than its owner ends the owner's run:
    /// the owner's next pop reports [`Popped::EndOfRun`] without touching the
    /// queue.
    pub fn pop(&mut self, run: RunId) -> Option<Popped> {
        if self.cut.remove(&run) {
            return Some(Popped::EndOfRun);
        }
        let popped = match self.entries.pop_front()? {
            QueueEntry::Sentinel { run: owner, .. } if owner == run => Popped::EndOfRun,
            QueueEntry::Sentinel { run: owner, .. } => {
                self.cut.insert(owner);
                Popped::Skip
            }
            QueueEntry::Delivery {
                handler: Some(handler),
                msg: Some(msg),
                ..
            } => Popped::Deliver(handler, msg),
            QueueEntry::Delivery { .. } => Popped::Skip,
        };
        Some(popped)
    }

    /// First live entry for `id` whose message is conflatable and of `msg_type`.
    pub fn find_conflation_target(&self, id: HandlerId, msg_type: &str) -> Option<EntrySeq> {
        self.entries.iter().find_map(|entry| match entry {
            QueueEntry::Delivery {
                seq,
                handler: Some(h),
                msg: Some(m),
            } if HandlerId::of(h) == id && m.is_conflatable() && m.msg_type() == msg_type => {
                Some(*seq)
            }
            _ => None,
        })
    }

    fn position(&self, seq: EntrySeq) -> Option<usize> {
        // Sequence numbers are assigned on push_back, so the deque is sorted.
        self.entries
            .binary_search_by_key(&seq, QueueEntry::seq)
            .ok()
    }

    /// Take the message out of a live entry so user code can run against it
    /// without the queue being borrowed. The entry reads as blank until
    /// [`MessageQueue::restore_message`] puts it back.
    pub fn take_message(&mut self, seq: EntrySeq) -> Option<Box<dyn Message>> {
        let idx = self.position(seq)?;
        match &mut self.entries[idx] {
            QueueEntry::Delivery {
                handler: Some(_),
                msg,
                ..
            } => msg.take(),
            _ => None,
        }
    }

    /// Put a message taken by [`MessageQueue::take_message`] back. Returns
    /// `false` when the entry was popped or its handler cleared meanwhile;
    /// the message is dropped in that case.
    pub fn restore_message(&mut self, seq: EntrySeq, restored: Box<dyn Message>) -> bool {
        let Some(idx) = self.position(seq) else {
            return false;
        };
        match &mut self.entries[idx] {
            QueueEntry::Delivery {
                handler: Some(_),
                msg,
                ..
            } if msg.is_none() => {
                *msg = Some(restored);
                true
            }
            _ => false,
        }
    }

    /// Blank every entry for `id`, including one whose message is currently
    /// taken. Returns the number of entries blanked.
    pub fn invalidate_handler(&mut self, id: HandlerId) -> usize {
        let mut cleared = 0;
        for entry in self.entries.iter_mut() {
            if let QueueEntry::Delivery { handler, msg, .. } = entry {
                if handler.as_ref().is_some_and(|h| HandlerId::of(h) == id) {
                    *handler = None;
                    *msg = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Live entries currently waiting for `id`.
    pub fn live_count_for(&self, id: HandlerId) -> usize {
        self.entries.iter().filter(|e| e.is_live_for(id)).count()
    }
}
