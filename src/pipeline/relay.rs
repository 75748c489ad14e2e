//! Drop-oldest relay queue between two pipeline stages.
//!
//! One producer, one consumer. A full queue evicts its oldest item before the
//! new one goes in, so the consumer always sees the freshest frames and the
//! backlog never grows past the configured capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

struct Shared<T> {
    name: &'static str,
    ring: Mutex<HeapRb<T>>,
    ready: Condvar,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
    dropped: AtomicUsize,
}

/// Counters of one relay queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

/// Producer endpoint
pub struct RelaySender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer endpoint
pub struct RelayReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a relay queue holding at most `capacity` items (at least one).
pub fn relay<T>(name: &'static str, capacity: usize) -> (RelaySender<T>, RelayReceiver<T>) {
    let shared = Arc::new(Shared {
        name,
        ring: Mutex::new(HeapRb::new(capacity.max(1))),
        ready: Condvar::new(),
        stats: CachePadded::new(Stats::default()),
    });
    (
        RelaySender {
            shared: shared.clone(),
        },
        RelayReceiver { shared },
    )
}

impl<T> Shared<T> {
    fn ring(&self) -> MutexGuard<'_, HeapRb<T>> {
        // A panicking peer cannot leave the ring half-written; keep going.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            written: self.stats.written.load(Ordering::Relaxed),
            read: self.stats.read.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl<T> RelaySender<T> {
    /// Insert `item`, evicting the oldest queued item first when full.
    ///
    /// Never blocks. Returns the evicted item, if any.
    pub fn try_put(&self, item: T) -> Option<T> {
        let evicted = self.shared.ring().push_overwrite(item);

        self.shared.stats.written.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("relay_frames_dropped", "queue" => self.shared.name).increment(1);
        }
        self.shared.ready.notify_one();
        evicted
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }
}

impl<T> RelayReceiver<T> {
    /// Remove the oldest item without blocking.
    pub fn try_take(&self) -> Option<T> {
        let item = self.shared.ring().try_pop();
        if item.is_some() {
            self.shared.stats.read.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Wait up to `timeout` for an item. `None` means the wait timed out.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.shared.ring();
        loop {
            if let Some(item) = ring.try_pop() {
                self.shared.stats.read.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            ring = self
                .shared
                .ready
                .wait_timeout(ring, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.shared.ring().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring().capacity().get()
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn capacity_two_keeps_last_two_puts() {
        let (tx, rx) = relay("test", 2);
        for i in 1..=10 {
            tx.try_put(i);
        }

        // Older of the two retained is the 2nd-to-last put
        assert_eq!(rx.try_take(), Some(9));
        assert_eq!(rx.try_take(), Some(10));
        assert_eq!(rx.try_take(), None);

        let stats = rx.stats();
        assert_eq!(stats.written, 10);
        assert_eq!(stats.dropped, 8);
        assert_eq!(stats.read, 2);
    }

    #[test]
    fn capacity_one_is_latest_value() {
        let (tx, rx) = relay("test", 1);
        assert_eq!(tx.try_put("a"), None);
        assert_eq!(tx.try_put("b"), Some("a"));
        assert_eq!(rx.try_take(), Some("b"));
    }

    #[test]
    fn never_yields_items_older_than_capacity_puts() {
        for capacity in 1..=2 {
            for puts in 1..20usize {
                let (tx, rx) = relay("test", capacity);
                for i in 0..puts {
                    tx.try_put(i);
                }
                let mut seen = Vec::new();
                while let Some(i) = rx.try_take() {
                    seen.push(i);
                }
                let oldest_allowed = puts.saturating_sub(capacity);
                assert!(seen.iter().all(|&i| i >= oldest_allowed));
                assert_eq!(seen.len(), puts.min(capacity));
                assert!(seen.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn empty_take_has_no_side_effects() {
        let (_tx, rx) = relay::<u8>("test", 2);
        assert_eq!(rx.try_take(), None);
        assert_eq!(rx.try_take(), None);
        assert_eq!(rx.stats(), RelayStats::default());
        assert!(rx.is_empty());
        assert_eq!(rx.capacity(), 2);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (_tx, rx) = relay::<u8>("test", 0);
        assert_eq!(rx.capacity(), 1);
    }

    #[test]
    fn take_timeout_returns_none_after_timeout() {
        let (_tx, rx) = relay::<u8>("test", 2);
        let started = Instant::now();
        assert_eq!(rx.take_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn take_timeout_wakes_on_put() {
        let (tx, rx) = relay("test", 2);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.try_put(7u32);
        });
        assert_eq!(rx.take_timeout(Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn concurrent_producer_consumer_sees_increasing_items() {
        let (tx, rx) = relay("test", 2);
        let producer = thread::spawn(move || {
            for i in 0..10_000u32 {
                tx.try_put(i);
            }
        });

        let mut last: Option<u32> = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && last != Some(9_999) {
            if let Some(i) = rx.take_timeout(Duration::from_millis(50)) {
                assert!(last.map_or(true, |l| i > l));
                last = Some(i);
            }
        }
        producer.join().unwrap();
        while let Some(i) = rx.try_take() {
            assert!(last.map_or(true, |l| i > l));
            last = Some(i);
        }
        assert_eq!(last, Some(9_999));
    }
}
