//! Bounded offline publish queue
//!
//! FIFO buffer for publishes captured while no broker session exists.
//! Capacity is fixed at 1000 entries; overflow drops the oldest entry so the
//! queue always holds the most recent traffic. Entries survive only for the
//! process lifetime, there is no persistence across restarts.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use rumqttc::QoS;
use tracing::{debug, warn};

pub(crate) const QUEUE_CAPACITY: usize = 1000;

/// One publish captured while disconnected.
#[derive(Clone, Debug)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    pub enqueued_at: Instant,
}

impl QueuedPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
            enqueued_at: Instant::now(),
        }
    }
}

/// Bounded FIFO of pending publishes.
///
/// All operations take the single internal mutex and return immediately; the
/// actual replay (popping entries and forwarding them to the active client)
/// is driven by the session manager so no await ever happens under the lock.
pub struct OfflineQueue {
    inner: Mutex<VecDeque<QueuedPublish>>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(QUEUE_CAPACITY))),
            capacity,
        }
    }

    /// Appends a publish; on overflow the oldest entry is dropped first.
    pub fn enqueue(&self, publish: QueuedPublish) {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    "Offline queue full, dropping oldest publish on {:?} ({} bytes)",
                    dropped.topic,
                    dropped.payload.len()
                );
            }
        }
        debug!("Queued publish on {:?} while disconnected", publish.topic);
        queue.push_back(publish);
    }

    /// Removes and returns the oldest entry.
    pub fn pop_front(&self) -> Option<QueuedPublish> {
        self.lock().pop_front()
    }

    /// Puts a popped entry back at the head after a failed replay, keeping
    /// FIFO order for the next flush attempt.
    pub fn restore_front(&self, publish: QueuedPublish) {
        self.lock().push_front(publish);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedPublish>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32) -> QueuedPublish {
        QueuedPublish::new("t", n.to_be_bytes().to_vec(), QoS::AtLeastOnce, false)
    }

    fn payload_number(p: &QueuedPublish) -> u32 {
        u32::from_be_bytes(p.payload.clone().try_into().unwrap())
    }

    #[test]
    fn pops_in_fifo_order() {
        let queue = OfflineQueue::new();
        for n in 1..=5 {
            queue.enqueue(entry(n));
        }
        let drained: Vec<u32> = std::iter::from_fn(|| queue.pop_front())
            .map(|p| payload_number(&p))
            .collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = OfflineQueue::new();
        for n in 1..=(QUEUE_CAPACITY as u32 + 1) {
            queue.enqueue(entry(n));
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        // Entry 1 was sacrificed; replay starts at 2.
        assert_eq!(payload_number(&queue.pop_front().unwrap()), 2);

        let mut last = 0;
        while let Some(p) = queue.pop_front() {
            last = payload_number(&p);
        }
        assert_eq!(last, QUEUE_CAPACITY as u32 + 1);
    }

    #[test]
    fn restore_front_preserves_replay_order() {
        let queue = OfflineQueue::new();
        for n in 1..=3 {
            queue.enqueue(entry(n));
        }
        // Simulate a failed replay of the head entry.
        let head = queue.pop_front().unwrap();
        queue.restore_front(head);
        let drained: Vec<u32> = std::iter::from_fn(|| queue.pop_front())
            .map(|p| payload_number(&p))
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = OfflineQueue::new();
        queue.enqueue(entry(1));
        queue.enqueue(entry(2));
        queue.clear();
        assert_eq!(queue.len(), 0);
        assert!(queue.pop_front().is_none());
    }
}
