//! Priority dispatch queue.
//!
//! Four FIFO levels keyed on [`Priority`]; dequeue always serves the
//! highest non-empty level. Each level is bounded: enqueueing against a
//! full level counts as rejected and fails. Per-level counters track
//! enqueued, dequeued, expired (deadline passed while queued), and
//! rejected packets.
//!
//! Aging is off by default. When an age-boost threshold is configured, a
//! packet that has waited longer than the threshold is promoted one level
//! at the next dequeue scan, which bounds starvation of the lower levels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ProtocolError;
use crate::packet::Priority;

#[derive(Default)]
struct LevelStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of one level's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub expired: u64,
    pub rejected: u64,
}

struct Slot<T> {
    item: T,
    enqueued_at: Instant,
    deadline: Option<Instant>,
}

/// Multi-level FIFO queue; enqueue and dequeue are thread-safe, and any
/// number of workers may dequeue in parallel.
pub struct PriorityQueue<T> {
    levels: [Mutex<VecDeque<Slot<T>>>; Priority::COUNT],
    stats: [LevelStats; Priority::COUNT],
    capacity_per_level: usize,
    age_boost: Option<Duration>,
    notify: Notify,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity_per_level: usize, age_boost: Option<Duration>) -> Self {
        PriorityQueue {
            levels: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            stats: std::array::from_fn(|_| LevelStats::default()),
            capacity_per_level,
            age_boost,
            notify: Notify::new(),
        }
    }

    /// Appends to the level's FIFO; fails with `QueueFull` on overflow.
    pub fn enqueue(&self, priority: Priority, item: T) -> Result<(), ProtocolError> {
        self.enqueue_with_deadline(priority, item, None)
    }

    /// Appends with an expiry deadline (typically now + handler timeout).
    /// A slot whose deadline has passed is discarded at dequeue time and
    /// counted as expired.
    pub fn enqueue_with_deadline(
        &self,
        priority: Priority,
        item: T,
        deadline: Option<Instant>,
    ) -> Result<(), ProtocolError> {
        let idx = priority.index();
        {
            let mut level = self.levels[idx].lock();
            if level.len() >= self.capacity_per_level {
                self.stats[idx].rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ProtocolError::QueueFull);
            }
            level.push_back(Slot {
                item,
                enqueued_at: Instant::now(),
                deadline,
            });
        }
        self.stats[idx].enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Oldest item from the highest non-empty level, or `None`.
    pub fn try_dequeue(&self) -> Option<(Priority, T)> {
        let now = Instant::now();
        if let Some(threshold) = self.age_boost {
            self.promote_aged(now, threshold);
        }
        for idx in (0..Priority::COUNT).rev() {
            let mut level = self.levels[idx].lock();
            while let Some(slot) = level.pop_front() {
                if slot.deadline.is_some_and(|d| d <= now) {
                    self.stats[idx].expired.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                self.stats[idx].dequeued.fetch_add(1, Ordering::Relaxed);
                let priority = Priority::from_index(idx).unwrap_or(Priority::Low);
                return Some((priority, slot.item));
            }
        }
        None
    }

    /// Waits until an item is available.
    pub async fn dequeue(&self) -> (Priority, T) {
        loop {
            let notified = self.notify.notified();
            if let Some(found) = self.try_dequeue() {
                // Wake another worker in case several items arrived at once.
                self.notify.notify_one();
                return found;
            }
            notified.await;
        }
    }

    // Moves over-age slots one level up, preserving their enqueue stamps.
    fn promote_aged(&self, now: Instant, threshold: Duration) {
        for idx in (0..Priority::COUNT - 1).rev() {
            let mut promoted = Vec::new();
            {
                let mut level = self.levels[idx].lock();
                while let Some(front) = level.front() {
                    if now.duration_since(front.enqueued_at) <= threshold {
                        break;
                    }
                    if let Some(slot) = level.pop_front() {
                        promoted.push(slot);
                    }
                }
            }
            if !promoted.is_empty() {
                let mut upper = self.levels[idx + 1].lock();
                for slot in promoted {
                    upper.push_back(slot);
                }
            }
        }
    }

    pub fn stats(&self, priority: Priority) -> LevelSnapshot {
        let s = &self.stats[priority.index()];
        LevelSnapshot {
            enqueued: s.enqueued.load(Ordering::Relaxed),
            dequeued: s.dequeued.load(Ordering::Relaxed),
            expired: s.expired.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|l| l.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
