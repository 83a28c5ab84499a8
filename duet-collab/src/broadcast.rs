//! Fan-out of session-wide activities to every subscriber.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` messages; one that falls further behind skips the oldest ones.
//! A skip can lose the checksums of other documents or other recipients, not
//! just stale copies. The watchdog resends every checksum each cycle, so the
//! loss lasts one interval.
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Messages sent while nobody was subscribed.
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Stats are tracked via atomics so that `broadcast()` never acquires a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for one session.
pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<Arc<T>>,

    /// Channel capacity (messages buffered per receiver)
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl<T> BroadcastGroup<T> {
    /// `capacity` determines how many messages can be buffered per
    /// subscriber before lagging subscribers start dropping messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Send to every receiver. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: T) -> usize {
        self.broadcast_shared(Arc::new(msg))
    }

    pub fn broadcast_shared(&self, msg: Arc<T>) -> usize {
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(msg) {
            Ok(count) => count,
            Err(_) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.sender.subscribe()
    }
}
