//! Fixed-capacity block ring shared by the planner and the dispatch thread.
//!
//! `BlockRing` is the plain head/tail ring. `BlockBuffer` wraps it in a mutex
//! with a condition variable so a full ring parks the producer until the
//! dispatch thread retires a block, or until the stop flag is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::block::Block;
use crate::motion::MotionError;

const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct BlockRing {
    blocks: Vec<Block>,
    head: usize,
    tail: usize,
    mask: usize,
}

impl BlockRing {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            blocks: vec![Block::default(); capacity],
            head: 0,
            tail: 0,
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn occupancy(&self) -> usize {
        self.head.wrapping_sub(self.tail) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// One slot always stays free so a full ring is distinguishable from an empty one.
    pub fn is_full(&self) -> bool {
        self.next(self.head) == self.tail
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn next(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }

    pub fn prev(&self, index: usize) -> usize {
        index.wrapping_sub(1) & self.mask
    }

    /// Append a block, returning its slot, or `None` when full.
    pub fn push(&mut self, block: Block) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let slot = self.head;
        self.blocks[slot] = block;
        self.head = self.next(slot);
        Some(slot)
    }

    pub fn pop_front(&mut self) -> Option<Block> {
        if self.is_empty() {
            return None;
        }
        let block = std::mem::take(&mut self.blocks[self.tail]);
        self.tail = self.next(self.tail);
        Some(block)
    }

    pub fn get(&self, slot: usize) -> &Block {
        &self.blocks[slot & self.mask]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Block {
        &mut self.blocks[slot & self.mask]
    }

    /// The newest block, if any.
    pub fn back(&self) -> Option<&Block> {
        (!self.is_empty()).then(|| self.get(self.prev(self.head)))
    }

    /// Occupied slots, oldest first.
    pub fn indices(&self) -> Vec<usize> {
        (0..self.occupancy())
            .map(|offset| (self.tail + offset) & self.mask)
            .collect()
    }

    /// Drop every block that has not been picked up for execution.
    pub fn clear_pending(&mut self) -> usize {
        let keep = if !self.is_empty() && self.blocks[self.tail].busy { 1 } else { 0 };
        let dropped = self.occupancy() - keep;
        for _ in 0..dropped {
            self.head = self.prev(self.head);
            self.blocks[self.head] = Block::default();
        }
        dropped
    }
}

#[derive(Debug)]
pub struct BlockBuffer {
    ring: Mutex<BlockRing>,
    slot_freed: Condvar,
    stop: Arc<AtomicBool>,
}

impl BlockBuffer {
    pub fn new(capacity: usize, stop: Arc<AtomicBool>) -> Self {
        Self {
            ring: Mutex::new(BlockRing::new(capacity)),
            slot_freed: Condvar::new(),
            stop,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Lock the ring once it has a free slot.
    ///
    /// Fails with [`MotionError::Cancelled`] as soon as the stop flag is seen.
    pub fn wait_for_slot(&self) -> Result<MutexGuard<'_, BlockRing>, MotionError> {
        let mut ring = self.lock();
        loop {
            if self.is_stopped() {
                return Err(MotionError::Cancelled);
            }
            if !ring.is_full() {
                return Ok(ring);
            }
            ring = self
                .slot_freed
                .wait_timeout(ring, STOP_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Mark the oldest block busy and hand out a copy for translation.
    ///
    /// Returns `None` when `slot` is no longer the oldest block, e.g. after a stop cleared it.
    pub fn begin(&self, slot: usize) -> Option<Block> {
        let mut ring = self.lock();
        if ring.is_empty() || ring.tail() != slot {
            return None;
        }
        let block = ring.get_mut(slot);
        block.busy = true;
        Some(block.clone())
    }

    /// Free the oldest block once it has been handed to the backend.
    pub fn retire(&self, slot: usize) {
        let mut ring = self.lock();
        if !ring.is_empty() && ring.tail() == slot {
            ring.pop_front();
            self.slot_freed.notify_all();
        }
    }

    pub fn clear_pending(&self) -> usize {
        let dropped = self.lock().clear_pending();
        self.slot_freed.notify_all();
        dropped
    }

    pub fn occupancy(&self) -> usize {
        self.lock().occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Copy of every buffered block, oldest first.
    pub fn snapshot(&self) -> Vec<Block> {
        let ring = self.lock();
        ring.indices().into_iter().map(|slot| ring.get(slot).clone()).collect()
    }

    /// Wake producers parked on a full ring so they re-check the stop flag.
    pub fn notify(&self) {
        self.slot_freed.notify_all();
    }
}
