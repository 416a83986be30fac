//! Composite dispatcher over the three sibling queues.
//!
//! [`PrioritizedQueue`] owns a [`StrictQueue`], a [`DmClockQueue`], and a
//! [`TokenBucketQueue`] and consults them in that fixed order on dispatch:
//! strict items bypass all fairness, dmClock items are served against the
//! virtual clock, and weighted items soak up whatever is left. Enqueue APIs
//! direct each item to exactly one of the three.

use crate::config::{ConfigError, SchedulerConfig};
use crate::dmclock::{DmClockQueue, DmClockSnapshot};
use crate::slo::Slo;
use crate::strict_queue::StrictQueue;
use crate::token_bucket::{TokenBucketQueue, TokenBucketSnapshot};
use serde::Serialize;

/// Multi-tenant QoS dispatch queue.
///
/// `T` is the opaque item payload; `K` identifies the client (tenant) an
/// item belongs to and partitions all fairness decisions.
#[derive(Debug)]
pub struct PrioritizedQueue<T, K> {
    strict: StrictQueue<T, K>,
    dmclock: DmClockQueue<T, K>,
    weighted: TokenBucketQueue<T, K>,
}

impl<T, K: Ord + Clone> PrioritizedQueue<T, K> {
    /// Build a dispatcher with the given system capacity (requests per
    /// virtual tick, also the per-subqueue token cap) and minimum item cost.
    pub fn new(system_throughput: u64, min_cost: u64) -> Self {
        assert!(system_throughput > 0, "system throughput must be non-zero");
        PrioritizedQueue {
            strict: StrictQueue::new(),
            dmclock: DmClockQueue::new(system_throughput),
            weighted: TokenBucketQueue::new(system_throughput, min_cost),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.system_throughput, config.min_cost))
    }

    /// Queue an item that bypasses all fairness machinery.
    pub fn enqueue_strict(&mut self, cl: K, priority: u64, item: T) {
        self.strict.enqueue(cl, priority, item);
    }

    pub fn enqueue_strict_front(&mut self, cl: K, priority: u64, item: T) {
        self.strict.enqueue_front(cl, priority, item);
    }

    /// Queue an item under dmClock fairness.
    ///
    /// The SLO binds on the client's first enqueue and must be internally
    /// consistent (`limit == 0` or `limit > reserve`). `cost` is accepted
    /// for API compatibility; the virtual clock charges one tick per
    /// dispatch regardless.
    pub fn enqueue_dmclock(&mut self, cl: K, slo: Slo, _cost: u64, item: T) {
        self.dmclock.enqueue(cl, slo, item);
    }

    /// Queue an item under the weighted token-bucket policy. `cost` is
    /// clamped to `[min_cost, system_throughput]`.
    pub fn enqueue_weighted(&mut self, cl: K, priority: u64, cost: u64, item: T) {
        self.weighted.enqueue(cl, priority, cost, item);
    }

    pub fn enqueue_weighted_front(&mut self, cl: K, priority: u64, cost: u64, item: T) {
        self.weighted.enqueue_front(cl, priority, cost, item);
    }

    /// Dispatch one item: strict first, then dmClock, then weighted.
    pub fn dequeue(&mut self) -> T {
        assert!(!self.empty(), "dequeue from empty queue");
        if !self.strict.empty() {
            return self.strict.dequeue();
        }
        if !self.dmclock.empty() {
            return self.dmclock.pop();
        }
        self.weighted.dequeue()
    }

    /// Dispatch straight from the dmClock queue, bypassing the composite
    /// ordering.
    pub fn dequeue_dmclock(&mut self) -> T {
        assert!(!self.dmclock.empty(), "dmClock queue is empty");
        self.dmclock.pop()
    }

    pub fn empty(&self) -> bool {
        self.strict.empty() && self.dmclock.empty() && self.weighted.empty()
    }

    pub fn length(&self) -> usize {
        self.strict.length() + self.dmclock.length() + self.weighted.length()
    }

    /// Reclaim throughput held by idle dmClock clients.
    pub fn purge_idle_dmclock(&mut self) {
        self.dmclock.purge_idle();
    }

    /// Drop every queued item of `cl` across all three queues. Removed items
    /// are appended to `out`; returns the number removed.
    pub fn remove_by_class(&mut self, cl: &K, mut out: Option<&mut Vec<T>>) -> usize {
        let mut removed = self.strict.remove_by_class(cl, out.as_deref_mut());
        removed += self.dmclock.remove_by_class(cl, out.as_deref_mut());
        removed += self.weighted.remove_by_class(cl, out.as_deref_mut());
        removed
    }

    /// Drop every item matching `pred` across all three queues. Removed
    /// items are appended to `out`; returns the number removed.
    pub fn remove_by_filter<F>(&mut self, pred: F, mut out: Option<&mut Vec<T>>) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut removed = self.strict.remove_by_filter(&pred, out.as_deref_mut());
        removed += self.dmclock.remove_by_filter(&pred, out.as_deref_mut());
        removed += self.weighted.remove_by_filter(&pred, out.as_deref_mut());
        removed
    }

    /// Read access to the dmClock core (clock, throughput book, tags).
    pub fn dmclock(&self) -> &DmClockQueue<T, K> {
        &self.dmclock
    }

    /// Combined diagnostic snapshot of all three queues.
    pub fn snapshot(&self) -> QueueSnapshot<K> {
        QueueSnapshot {
            strict_length: self.strict.length(),
            dmclock: self.dmclock.snapshot(),
            weighted: self.weighted.snapshot(),
        }
    }
}

/// Point-in-time view of the composite dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot<K> {
    pub strict_length: usize,
    pub dmclock: DmClockSnapshot<K>,
    pub weighted: TokenBucketSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_drains_before_everything_else() {
        let mut q = PrioritizedQueue::new(100, 1);
        q.enqueue_dmclock("a", Slo::new(100, 0.0, 0), 1, "dm");
        q.enqueue_weighted("a", 1, 1, "weighted");
        q.enqueue_strict("b", 1, "strict");
        assert_eq!(q.length(), 3);
        assert_eq!(q.dequeue(), "strict");
        assert_eq!(q.dequeue(), "dm");
        assert_eq!(q.dequeue(), "weighted");
        assert!(q.empty());
    }

    #[test]
    fn dequeue_dmclock_bypasses_strict() {
        let mut q = PrioritizedQueue::new(100, 1);
        q.enqueue_strict("a", 1, "strict");
        q.enqueue_dmclock("b", Slo::new(100, 0.0, 0), 1, "dm");
        assert_eq!(q.dequeue_dmclock(), "dm");
        assert_eq!(q.dequeue(), "strict");
    }

    #[test]
    fn removal_fans_out_to_all_queues() {
        let mut q = PrioritizedQueue::new(100, 1);
        q.enqueue_strict("a", 1, 1);
        q.enqueue_dmclock("a", Slo::new(100, 0.0, 0), 1, 2);
        q.enqueue_weighted("a", 1, 1, 3);
        q.enqueue_strict("b", 1, 4);
        let mut out = Vec::new();
        let removed = q.remove_by_class(&"a", Some(&mut out));
        assert_eq!(removed, 3);
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(q.length(), 1);

        q.enqueue_weighted("b", 1, 1, 5);
        let removed = q.remove_by_filter(|item| *item == 5, None);
        assert_eq!(removed, 1);
        assert_eq!(q.dequeue(), 4);
        assert!(q.empty());
    }

    #[test]
    fn from_config_validates() {
        let bad = SchedulerConfig {
            system_throughput: 0,
            min_cost: 1,
        };
        assert!(PrioritizedQueue::<u32, u32>::from_config(&bad).is_err());
        let good = SchedulerConfig::default();
        let q = PrioritizedQueue::<u32, u32>::from_config(&good).unwrap();
        assert!(q.empty());
    }

    #[test]
    #[should_panic(expected = "dequeue from empty")]
    fn dequeue_from_empty_is_fatal() {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(100, 1);
        q.dequeue();
    }
}
