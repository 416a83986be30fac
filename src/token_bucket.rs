//! Weighted token-bucket priority queue.
//!
//! Each priority level owns a subqueue with a token bucket. On dispatch,
//! tokens are distributed to every remaining level in proportion to its
//! priority weight, and a subqueue may dispatch ahead of higher levels only
//! while it holds more tokens than the cost of its head item. When no
//! subqueue qualifies the queue degenerates to strict priority. Within a
//! subqueue, clients are served round robin.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

/// Per-priority subqueue: client FIFOs of `(cost, item)`, a token bucket,
/// and a client-id round-robin cursor resolved on use.
#[derive(Debug)]
struct SubQueue<T, K> {
    classes: BTreeMap<K, VecDeque<(u64, T)>>,
    cursor: Option<K>,
    tokens: u64,
    max_tokens: u64,
    size: usize,
}

impl<T, K: Ord + Clone> SubQueue<T, K> {
    fn new(max_tokens: u64) -> Self {
        SubQueue {
            classes: BTreeMap::new(),
            cursor: None,
            tokens: 0,
            max_tokens,
            size: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn put_tokens(&mut self, t: u64) {
        self.tokens = (self.tokens + t).min(self.max_tokens);
    }

    fn take_tokens(&mut self, t: u64) {
        self.tokens = self.tokens.saturating_sub(t);
    }

    fn enqueue(&mut self, cl: K, cost: u64, item: T) {
        self.classes.entry(cl).or_default().push_back((cost, item));
        self.size += 1;
    }

    fn enqueue_front(&mut self, cl: K, cost: u64, item: T) {
        self.classes.entry(cl).or_default().push_front((cost, item));
        self.size += 1;
    }

    fn resolve_cursor(&self) -> Option<K> {
        let first = || self.classes.keys().next().cloned();
        match &self.cursor {
            None => first(),
            Some(c) if self.classes.contains_key(c) => Some(c.clone()),
            Some(c) => self
                .classes
                .range((Bound::Excluded(c.clone()), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone())
                .or_else(first),
        }
    }

    fn next_after(&self, cl: &K) -> Option<K> {
        self.classes
            .range((Bound::Excluded(cl.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .or_else(|| self.classes.keys().next().cloned())
    }

    /// Cost of the item the next pop would return.
    fn front_cost(&self) -> u64 {
        let cl = self.resolve_cursor().expect("front of empty subqueue");
        self.classes[&cl]
            .front()
            .expect("subqueue holds no empty class")
            .0
    }

    fn pop(&mut self) -> (u64, T) {
        let cl = self.resolve_cursor().expect("pop from empty subqueue");
        let fifo = self.classes.get_mut(&cl).expect("cursor resolved to a live class");
        let entry = fifo.pop_front().expect("subqueue holds no empty class");
        if fifo.is_empty() {
            self.classes.remove(&cl);
        }
        self.cursor = self.next_after(&cl);
        self.size -= 1;
        entry
    }

    fn remove_by_class(&mut self, cl: &K, out: Option<&mut Vec<T>>) -> usize {
        let Some(fifo) = self.classes.remove(cl) else {
            return 0;
        };
        let removed = fifo.len();
        if let Some(out) = out {
            out.extend(fifo.into_iter().map(|(_, item)| item));
        }
        if self.cursor.as_ref() == Some(cl) {
            self.cursor = self.next_after(cl);
        }
        self.size -= removed;
        removed
    }

    fn remove_by_filter<F>(&mut self, pred: &F, mut out: Option<&mut Vec<T>>) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (cl, fifo) in self.classes.iter_mut() {
            let mut kept = VecDeque::with_capacity(fifo.len());
            for (cost, item) in fifo.drain(..) {
                if pred(&item) {
                    removed += 1;
                    if let Some(out) = out.as_deref_mut() {
                        out.push(item);
                    }
                } else {
                    kept.push_back((cost, item));
                }
            }
            *fifo = kept;
            if fifo.is_empty() {
                emptied.push(cl.clone());
            }
        }
        for cl in &emptied {
            self.classes.remove(cl);
            if self.cursor.as_ref() == Some(cl) {
                self.cursor = self.next_after(cl);
            }
        }
        self.size -= removed;
        removed
    }
}

/// Weighted priority queue over token-bucket subqueues.
#[derive(Debug)]
pub struct TokenBucketQueue<T, K> {
    queues: BTreeMap<u64, SubQueue<T, K>>,
    total_priority: u64,
    max_tokens: u64,
    min_cost: u64,
    size: usize,
}

impl<T, K: Ord + Clone> TokenBucketQueue<T, K> {
    /// `max_tokens` caps each subqueue's bucket and is also the upper clamp
    /// applied to item costs; `min_cost` is the lower clamp.
    pub fn new(max_tokens: u64, min_cost: u64) -> Self {
        TokenBucketQueue {
            queues: BTreeMap::new(),
            total_priority: 0,
            max_tokens,
            min_cost,
            size: 0,
        }
    }

    fn clamp_cost(&self, cost: u64) -> u64 {
        cost.max(self.min_cost).min(self.max_tokens)
    }

    fn subqueue(&mut self, priority: u64) -> &mut SubQueue<T, K> {
        let max_tokens = self.max_tokens;
        let total = &mut self.total_priority;
        self.queues.entry(priority).or_insert_with(|| {
            *total += priority;
            SubQueue::new(max_tokens)
        })
    }

    pub fn enqueue(&mut self, cl: K, priority: u64, cost: u64, item: T) {
        let cost = self.clamp_cost(cost);
        self.subqueue(priority).enqueue(cl, cost, item);
        self.size += 1;
    }

    pub fn enqueue_front(&mut self, cl: K, priority: u64, cost: u64, item: T) {
        let cost = self.clamp_cost(cost);
        self.subqueue(priority).enqueue_front(cl, cost, item);
        self.size += 1;
    }

    /// Dispatch one item.
    ///
    /// Ascending over priorities, the first subqueue whose head item costs
    /// strictly less than its tokens wins and pays for the item; if none
    /// qualifies the highest-priority subqueue dispatches for free. Either
    /// way every remaining subqueue then earns
    /// `priority * cost / total_priority + 1` tokens, capped at the bucket
    /// maximum.
    pub fn dequeue(&mut self) -> T {
        assert!(self.size > 0, "dequeue from empty token bucket queue");
        let eligible = self
            .queues
            .iter()
            .find(|(_, sq)| sq.front_cost() < sq.tokens)
            .map(|(&prio, _)| prio);
        let priority = eligible.unwrap_or_else(|| {
            *self
                .queues
                .keys()
                .next_back()
                .expect("non-zero size implies a subqueue")
        });
        let sq = self.queues.get_mut(&priority).expect("subqueue exists");
        let (cost, item) = sq.pop();
        if eligible.is_some() {
            sq.take_tokens(cost);
        }
        if sq.is_empty() {
            self.queues.remove(&priority);
            self.total_priority -= priority;
        }
        self.distribute_tokens(cost);
        self.size -= 1;
        item
    }

    fn distribute_tokens(&mut self, cost: u64) {
        if self.total_priority == 0 {
            return;
        }
        for (&priority, sq) in self.queues.iter_mut() {
            sq.put_tokens(priority * cost / self.total_priority + 1);
        }
    }

    pub fn empty(&self) -> bool {
        self.size == 0
    }

    pub fn length(&self) -> usize {
        self.size
    }

    pub fn remove_by_class(&mut self, cl: &K, mut out: Option<&mut Vec<T>>) -> usize {
        let mut removed = 0;
        let mut freed_priority = 0;
        self.queues.retain(|&priority, sq| {
            removed += sq.remove_by_class(cl, out.as_deref_mut());
            if sq.is_empty() {
                freed_priority += priority;
                false
            } else {
                true
            }
        });
        self.total_priority -= freed_priority;
        self.size -= removed;
        removed
    }

    pub fn remove_by_filter<F>(&mut self, pred: F, mut out: Option<&mut Vec<T>>) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut removed = 0;
        let mut freed_priority = 0;
        self.queues.retain(|&priority, sq| {
            removed += sq.remove_by_filter(&pred, out.as_deref_mut());
            if sq.is_empty() {
                freed_priority += priority;
                false
            } else {
                true
            }
        });
        self.total_priority -= freed_priority;
        self.size -= removed;
        removed
    }

    /// Diagnostic view of every subqueue's bucket state.
    pub fn snapshot(&self) -> TokenBucketSnapshot {
        TokenBucketSnapshot {
            total_priority: self.total_priority,
            subqueues: self
                .queues
                .iter()
                .map(|(&priority, sq)| SubQueueSnapshot {
                    priority,
                    tokens: sq.tokens,
                    max_tokens: sq.max_tokens,
                    length: sq.size,
                    front_cost: if sq.is_empty() {
                        None
                    } else {
                        Some(sq.front_cost())
                    },
                })
                .collect(),
        }
    }
}

/// Point-in-time view of one weighted subqueue.
#[derive(Debug, Clone, Serialize)]
pub struct SubQueueSnapshot {
    pub priority: u64,
    pub tokens: u64,
    pub max_tokens: u64,
    pub length: usize,
    pub front_cost: Option<u64>,
}

/// Point-in-time view of the weighted queue.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBucketSnapshot {
    pub total_priority: u64,
    pub subqueues: Vec<SubQueueSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_highest_priority_without_tokens() {
        let mut q = TokenBucketQueue::new(1000, 10);
        for i in 0..3 {
            q.enqueue("a", 1, 100, ("low", i));
            q.enqueue("b", 2, 100, ("high", i));
        }
        // Buckets start empty, so dispatch degenerates to strict priority
        // until the high subqueue drains and the low one has earned tokens.
        assert_eq!(q.dequeue().0, "high");
        assert_eq!(q.dequeue().0, "high");
        assert_eq!(q.dequeue().0, "high");
        assert_eq!(q.dequeue().0, "low");
        assert_eq!(q.length(), 2);
    }

    #[test]
    fn tokens_let_a_lower_priority_jump_ahead() {
        let mut q = TokenBucketQueue::new(1000, 10);
        // Prime the priority-1 subqueue with tokens by dispatching cheap
        // items while it is the only level present.
        q.enqueue("a", 1, 10, 0);
        q.enqueue("a", 1, 10, 1);
        assert_eq!(q.dequeue(), 0);
        // Now a higher level shows up with an expensive head; the tokened
        // lower level keeps dispatching ahead of it.
        q.enqueue("b", 5, 900, 99);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 99);
    }

    #[test]
    fn cost_is_clamped_into_bounds() {
        let mut q = TokenBucketQueue::new(500, 10);
        q.enqueue("a", 1, 3, "tiny");
        let snap = q.snapshot();
        assert_eq!(snap.subqueues[0].front_cost, Some(10));
        assert_eq!(q.dequeue(), "tiny");

        q.enqueue("a", 1, 10_000, "huge");
        let snap = q.snapshot();
        assert_eq!(snap.subqueues[0].front_cost, Some(500));
    }

    #[test]
    fn round_robins_clients_within_a_subqueue() {
        let mut q = TokenBucketQueue::new(1000, 1);
        q.enqueue("a", 1, 1, 1);
        q.enqueue("a", 1, 1, 2);
        q.enqueue("b", 1, 1, 10);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 10);
        assert_eq!(q.dequeue(), 2);
    }

    #[test]
    fn removal_releases_priority_weight() {
        let mut q = TokenBucketQueue::new(1000, 1);
        q.enqueue("a", 3, 1, 1);
        q.enqueue("b", 7, 1, 2);
        assert_eq!(q.snapshot().total_priority, 10);
        let removed = q.remove_by_class(&"b", None);
        assert_eq!(removed, 1);
        assert_eq!(q.snapshot().total_priority, 3);
        let removed = q.remove_by_filter(|item| *item == 1, None);
        assert_eq!(removed, 1);
        assert_eq!(q.snapshot().total_priority, 0);
        assert!(q.empty());
    }
}
