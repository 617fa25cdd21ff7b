use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue was flushed")]
    Flushed,
    #[error("queue disconnected")]
    Disconnected,
}

/// Bounded blocking queue between the planner and the dispatch thread.
///
/// `flush()` wakes a blocked reader and makes every read fail with
/// [`QueueError::Flushed`] until `clear_flush()` is called.
#[derive(Debug, Clone)]
pub struct BlockQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    flush_tx: Sender<()>,
    flush_rx: Receiver<()>,
    flushed: Arc<AtomicBool>,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(1);
        Self {
            tx,
            rx,
            flush_tx,
            flush_rx,
            flushed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Blocks while the queue is full.
    pub fn send(&self, item: T) -> Result<(), QueueError> {
        self.tx.send(item).map_err(|_| QueueError::Disconnected)
    }

    /// Blocks until an item arrives or the queue is flushed.
    pub fn recv(&self) -> Result<T, QueueError> {
        if self.is_flushed() {
            return Err(QueueError::Flushed);
        }
        crossbeam_channel::select! {
            recv(self.rx) -> msg => msg.map_err(|_| QueueError::Disconnected),
            recv(self.flush_rx) -> _ => Err(QueueError::Flushed),
        }
    }

    pub fn try_recv(&self) -> Result<Option<T>, QueueError> {
        if self.is_flushed() {
            return Err(QueueError::Flushed);
        }
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    pub fn flush(&self) {
        self.flushed.store(true, Ordering::Release);
        let _ = self.flush_tx.try_send(());
    }

    pub fn clear_flush(&self) {
        self.flushed.store(false, Ordering::Release);
        while self.flush_rx.try_recv().is_ok() {}
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn items_come_out_in_order() {
        let queue = BlockQueue::new(4);
        for slot in [3usize, 0, 1] {
            queue.send(slot).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.recv(), Ok(3));
        assert_eq!(queue.try_recv(), Ok(Some(0)));
        assert_eq!(queue.drain(), vec![1]);
        assert_eq!(queue.try_recv(), Ok(None));
    }

    #[test]
    fn flush_unblocks_a_waiting_reader() {
        let queue: BlockQueue<usize> = BlockQueue::new(4);
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.recv())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.flush();
        assert_eq!(reader.join().unwrap(), Err(QueueError::Flushed));
    }

    #[test]
    fn reads_fail_until_flush_is_cleared() {
        let queue = BlockQueue::new(4);
        queue.send(7usize).unwrap();
        queue.flush();
        assert_eq!(queue.recv(), Err(QueueError::Flushed));
        assert_eq!(queue.try_recv(), Err(QueueError::Flushed));
        queue.clear_flush();
        assert_eq!(queue.recv(), Ok(7));
    }
}
