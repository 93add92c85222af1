// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The initiator's ring of requests awaiting responses.
//!
//! Responses carry no correlation id; they are matched positionally, so
//! this queue is strictly FIFO and the oldest entry is the only one a
//! response may answer. The ring holds [`PENDING_RING`]` - 1` entries
//! with one slot kept open, the same convention as the byte rings.

use memlink_proto::{Header, Op};

/// Ring size; usable depth is one less.
pub const PENDING_RING: usize = 32;

/// Error returned by [`PendingQueue::push`] at full depth. The driver
/// reacts by retiring one transaction, not by dropping the request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingFull;

#[derive(Debug)]
pub struct PendingQueue {
    entries: [Header; PENDING_RING],
    read: usize,
    write: usize,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: [Header::new(Op::Read, 0, 0); PENDING_RING],
            read: 0,
            write: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        (self.write + 1) % PENDING_RING == self.read
    }

    /// Outstanding request count.
    pub fn count(&self) -> usize {
        (self.write + PENDING_RING - self.read) % PENDING_RING
    }

    /// Appends a request that has just been serialized to the wire.
    pub fn push(&mut self, header: Header) -> Result<(), PendingFull> {
        if self.is_full() {
            return Err(PendingFull);
        }
        self.entries[self.write] = header;
        self.write = (self.write + 1) % PENDING_RING;
        Ok(())
    }

    /// The oldest outstanding request: the one the next response must
    /// answer.
    pub fn head(&self) -> Option<Header> {
        if self.is_empty() {
            None
        } else {
            Some(self.entries[self.read])
        }
    }

    /// Retires the oldest outstanding request.
    pub fn advance(&mut self) -> Option<Header> {
        let head = self.head()?;
        self.read = (self.read + 1) % PENDING_RING;
        Some(head)
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(addr: u32) -> Header {
        Header::new(Op::Read, addr, 1)
    }

    #[test]
    fn fifo_order_and_depth() {
        let mut q = PendingQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.head(), None);

        for i in 0..PENDING_RING as u32 - 1 {
            q.push(h(i)).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(q.count(), PENDING_RING - 1);
        assert_eq!(q.push(h(99)), Err(PendingFull));

        for i in 0..PENDING_RING as u32 - 1 {
            assert_eq!(q.head(), Some(h(i)));
            assert_eq!(q.advance(), Some(h(i)));
        }
        assert_eq!(q.advance(), None);
    }

    #[test]
    fn wraps_cleanly() {
        let mut q = PendingQueue::new();
        for round in 0..100u32 {
            q.push(h(round)).unwrap();
            assert_eq!(q.advance(), Some(h(round)));
            assert!(q.is_empty());
        }
    }
}
