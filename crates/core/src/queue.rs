#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Sequenced<T> {
    priority: u8,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Sequenced<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Sequenced<T> {}

impl<T> PartialOrd for Sequenced<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Sequenced<T> {
    // higher priority first, then FIFO by sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Pool<T> {
    queues: Vec<BinaryHeap<Sequenced<T>>>,
    next_seq: u64,
}

/// An elastic pool of bounded priority queues.
///
/// `put` never blocks: when the newest queue is full another bounded queue
/// is appended, so worst-case insertion cost on the packet path stays
/// constant no matter how far the consumer has fallen behind. `get` drains
/// the pool oldest queue first.
pub struct DynamicQueueManager<T> {
    pool: Mutex<Pool<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> DynamicQueueManager<T> {
    pub fn new(capacity: usize) -> DynamicQueueManager<T> {
        DynamicQueueManager {
            pool: Mutex::new(Pool {
                queues: vec![BinaryHeap::new()],
                next_seq: 0,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn put(&self, item: T, priority: u8) {
        let Ok(mut pool) = self.pool.lock() else {
            return;
        };
        let seq = pool.next_seq;
        pool.next_seq += 1;
        let needs_new_queue = pool
            .queues
            .last()
            .map(|q| q.len() >= self.capacity)
            .unwrap_or(true);
        if needs_new_queue {
            pool.queues.push(BinaryHeap::new());
        }
        if let Some(queue) = pool.queues.last_mut() {
            queue.push(Sequenced {
                priority,
                seq,
                item,
            });
        }
        self.available.notify_one();
    }

    /// Pops the next item, scanning queues oldest-first, waiting up to
    /// `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut pool = self.pool.lock().ok()?;
        loop {
            for queue in pool.queues.iter_mut() {
                if let Some(entry) = queue.pop() {
                    return Some(entry.item);
                }
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self.available.wait_timeout(pool, remaining).ok()?;
            pool = guard;
            if result.timed_out() && pool.queues.iter().all(BinaryHeap::is_empty) {
                return None;
            }
        }
    }

    /// Drops fully drained queues, always keeping the newest one.
    pub fn cleanup(&self) {
        if let Ok(mut pool) = self.pool.lock() {
            let last = pool.queues.len().saturating_sub(1);
            let mut index = 0;
            pool.queues.retain(|queue| {
                let keep = !queue.is_empty() || index == last;
                index += 1;
                keep
            });
        }
    }

    pub fn len(&self) -> usize {
        self.pool
            .lock()
            .map(|pool| pool.queues.iter().map(BinaryHeap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue_count(&self) -> usize {
        self.pool.lock().map(|pool| pool.queues.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_within_a_priority() {
        let queue = DynamicQueueManager::new(16);
        queue.put("first", 0);
        queue.put("second", 0);
        queue.put("third", 0);
        assert_eq!(queue.get(Duration::from_millis(10)), Some("first"));
        assert_eq!(queue.get(Duration::from_millis(10)), Some("second"));
        assert_eq!(queue.get(Duration::from_millis(10)), Some("third"));
    }

    #[test]
    fn higher_priority_jumps_the_line() {
        let queue = DynamicQueueManager::new(16);
        queue.put("routine", 0);
        queue.put("urgent", 2);
        queue.put("notable", 1);
        assert_eq!(queue.get(Duration::from_millis(10)), Some("urgent"));
        assert_eq!(queue.get(Duration::from_millis(10)), Some("notable"));
        assert_eq!(queue.get(Duration::from_millis(10)), Some("routine"));
    }

    #[test]
    fn overflow_appends_a_queue_and_drains_oldest_first() {
        let queue = DynamicQueueManager::new(2);
        for n in 0..5 {
            queue.put(n, 0);
        }
        assert_eq!(queue.queue_count(), 3);
        // items keep global FIFO order because older queues drain first
        for n in 0..5 {
            assert_eq!(queue.get(Duration::from_millis(10)), Some(n));
        }
    }

    #[test]
    fn cleanup_keeps_the_newest_queue() {
        let queue = DynamicQueueManager::new(1);
        queue.put(1, 0);
        queue.put(2, 0);
        queue.put(3, 0);
        assert_eq!(queue.queue_count(), 3);
        queue.get(Duration::from_millis(10));
        queue.get(Duration::from_millis(10));
        queue.get(Duration::from_millis(10));
        queue.cleanup();
        assert_eq!(queue.queue_count(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn get_times_out_when_empty() {
        let queue: DynamicQueueManager<u32> = DynamicQueueManager::new(4);
        assert_eq!(queue.get(Duration::from_millis(5)), None);
    }

    #[test]
    fn get_wakes_on_concurrent_put() {
        let queue = Arc::new(DynamicQueueManager::new(4));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put(42, 0);
        });
        assert_eq!(queue.get(Duration::from_secs(2)), Some(42));
        handle.join().expect("join producer");
    }
}
