//! Bounded producer queues with drop-oldest overflow
//!
//! When a producer outruns the consumer, the oldest queued event is evicted
//! to make room and a shared drop counter is bumped. The capture never fails
//! on overrun; the counter surfaces in the report's health block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

pub struct SpillQueue<T> {
    tx: Sender<T>,
    /// Second handle on the same channel, used to evict the oldest entry.
    evict_rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for SpillQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict_rx: self.evict_rx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> SpillQueue<T> {
    /// Enqueue, evicting the oldest entry when full.
    pub fn push(&self, item: T) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                if self.evict_rx.try_recv().is_ok() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                if self.tx.try_send(item).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// A bounded queue plus its consumer end.
pub fn spill_queue<T>(
    capacity: usize,
    dropped: Arc<AtomicU64>,
) -> (SpillQueue<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity);
    (SpillQueue { tx, evict_rx: rx.clone(), dropped }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_receive_in_order() {
        let dropped = Arc::new(AtomicU64::new(0));
        let (queue, rx) = spill_queue(4, Arc::clone(&dropped));
        for i in 0..4 {
            queue.push(i);
        }
        assert_eq!(rx.iter().take(4).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let dropped = Arc::new(AtomicU64::new(0));
        let (queue, rx) = spill_queue(2, Arc::clone(&dropped));
        for i in 0..5 {
            queue.push(i);
        }
        // 0, 1, 2 were evicted; 3 and 4 remain
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert_eq!(rx.try_recv().unwrap(), 4);
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_push_after_consumer_gone() {
        let dropped = Arc::new(AtomicU64::new(0));
        let (queue, rx) = spill_queue(2, dropped);
        drop(rx);
        queue.push(1);
    }
}
