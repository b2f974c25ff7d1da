//! Head-of-line reply ordering for one connection.

use std::collections::BTreeMap;

use crate::command::Reply;

/// Holds completed replies until every earlier reply was released.
///
/// Each command reserves a sequence number when dispatched. Replies may
/// complete in any order; [`ReplyBuffer::complete`] hands back the run of
/// replies that became releasable, always in sequence order.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    next_seq: u64,
    next_release: u64,
    ready: BTreeMap<u64, Reply>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot.
    pub fn reserve(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record the reply for `seq` and return what can be released now.
    pub fn complete(&mut self, seq: u64, reply: Reply) -> Vec<Reply> {
        if seq < self.next_release || seq >= self.next_seq {
            return Vec::new();
        }
        self.ready.insert(seq, reply);

        let mut released = Vec::new();
        while let Some(reply) = self.ready.remove(&self.next_release) {
            released.push(reply);
            self.next_release += 1;
        }
        released
    }

    /// Slots reserved but not yet released.
    pub fn in_flight(&self) -> usize {
        (self.next_seq - self.next_release) as usize
    }
}
