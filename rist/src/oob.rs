//! Out-of-band block queue
//!
//! Best-effort auxiliary channel. When no OOB callback is registered,
//! inbound blocks land in this bounded FIFO; the oldest block is dropped on
//! overflow. Order is preserved per peer.

use crate::block::OobBlock;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default queue depth
pub const DEFAULT_OOB_DEPTH: usize = 1024;

/// Bounded drop-oldest FIFO for OOB blocks
pub struct OobQueue {
    inner: Mutex<VecDeque<OobBlock>>,
    capacity: usize,
}

impl OobQueue {
    pub fn new(capacity: usize) -> Self {
        OobQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a block, dropping the oldest when full. Returns the number of
    /// blocks discarded (zero or one).
    pub fn push(&self, block: OobBlock) -> usize {
        let mut queue = self.inner.lock();
        let mut dropped = 0;
        if queue.len() >= self.capacity {
            queue.pop_front();
            dropped = 1;
        }
        queue.push_back(block);
        dropped
    }

    pub fn pop(&self) -> Option<OobBlock> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for OobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OOB_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn block(tag: u8) -> OobBlock {
        OobBlock::new(Bytes::copy_from_slice(&[tag]))
    }

    #[test]
    fn test_fifo_order() {
        let queue = OobQueue::new(8);
        queue.push(block(1));
        queue.push(block(2));
        queue.push(block(3));

        assert_eq!(queue.pop().unwrap().payload[0], 1);
        assert_eq!(queue.pop().unwrap().payload[0], 2);
        assert_eq!(queue.pop().unwrap().payload[0], 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = OobQueue::new(2);
        assert_eq!(queue.push(block(1)), 0);
        assert_eq!(queue.push(block(2)), 0);
        assert_eq!(queue.push(block(3)), 1);

        assert_eq!(queue.pop().unwrap().payload[0], 2);
        assert_eq!(queue.pop().unwrap().payload[0], 3);
    }
}
