//! Strict-priority queue with per-client round robin.
//!
//! Items enqueued here bypass all fairness machinery: the highest priority
//! bucket is always drained first. Within one bucket, clients take turns via
//! a round-robin cursor so a single chatty client cannot monopolize its
//! priority level. Items carry no cost and are never subject to tokens or
//! deadlines.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

/// One priority bucket: per-client FIFOs plus the round-robin position.
///
/// The cursor stores a client id rather than an iterator so it survives
/// insertion and removal of clients; it is resolved against the live map on
/// every pop.
#[derive(Debug)]
struct Bucket<T, K> {
    classes: BTreeMap<K, VecDeque<T>>,
    cursor: Option<K>,
}

impl<T, K: Ord + Clone> Bucket<T, K> {
    fn new() -> Self {
        Bucket {
            classes: BTreeMap::new(),
            cursor: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn enqueue(&mut self, cl: K, item: T) {
        self.classes.entry(cl).or_default().push_back(item);
    }

    fn enqueue_front(&mut self, cl: K, item: T) {
        self.classes.entry(cl).or_default().push_front(item);
    }

    /// Client that owns the next pop: the cursor target if it still exists,
    /// otherwise the next client after it in key order, wrapping around.
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

    /// Client strictly after `cl` in key order, wrapping to the first.
    fn next_after(&self, cl: &K) -> Option<K> {
        self.classes
            .range((Bound::Excluded(cl.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .or_else(|| self.classes.keys().next().cloned())
    }

    fn pop(&mut self) -> T {
        let cl = self.resolve_cursor().expect("pop from empty strict bucket");
        let fifo = self.classes.get_mut(&cl).expect("cursor resolved to a live class");
        let item = fifo.pop_front().expect("strict bucket holds no empty class");
        if fifo.is_empty() {
            self.classes.remove(&cl);
        }
        self.cursor = self.next_after(&cl);
        item
    }

    fn remove_by_class(&mut self, cl: &K, out: Option<&mut Vec<T>>) -> usize {
        let Some(fifo) = self.classes.remove(cl) else {
            return 0;
        };
        let removed = fifo.len();
        if let Some(out) = out {
            out.extend(fifo);
        }
        if self.cursor.as_ref() == Some(cl) {
            self.cursor = self.next_after(cl);
        }
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
            for item in fifo.drain(..) {
                if pred(&item) {
                    removed += 1;
                    if let Some(out) = out.as_deref_mut() {
                        out.push(item);
                    }
                } else {
                    kept.push_back(item);
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
        removed
    }
}

/// Two-level strict priority queue: `priority -> (client -> FIFO)`.
#[derive(Debug)]
pub struct StrictQueue<T, K> {
    buckets: BTreeMap<u64, Bucket<T, K>>,
    size: usize,
}

impl<T, K: Ord + Clone> StrictQueue<T, K> {
    pub fn new() -> Self {
        StrictQueue {
            buckets: BTreeMap::new(),
            size: 0,
        }
    }

    pub fn enqueue(&mut self, cl: K, priority: u64, item: T) {
        self.buckets
            .entry(priority)
            .or_insert_with(Bucket::new)
            .enqueue(cl, item);
        self.size += 1;
    }

    pub fn enqueue_front(&mut self, cl: K, priority: u64, item: T) {
        self.buckets
            .entry(priority)
            .or_insert_with(Bucket::new)
            .enqueue_front(cl, item);
        self.size += 1;
    }

    /// Pop from the highest-priority non-empty bucket, round-robining across
    /// that bucket's clients.
    pub fn dequeue(&mut self) -> T {
        assert!(self.size > 0, "dequeue from empty strict queue");
        let priority = *self
            .buckets
            .keys()
            .next_back()
            .expect("non-zero size implies a bucket");
        let bucket = self.buckets.get_mut(&priority).expect("bucket exists");
        let item = bucket.pop();
        if bucket.is_empty() {
            self.buckets.remove(&priority);
        }
        self.size -= 1;
        item
    }

    pub fn empty(&self) -> bool {
        self.size == 0
    }

    pub fn length(&self) -> usize {
        self.size
    }

    /// Drop every queued item belonging to `cl`; removed items are appended
    /// to `out` highest priority first. Returns the number removed.
    pub fn remove_by_class(&mut self, cl: &K, mut out: Option<&mut Vec<T>>) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            removed += bucket.remove_by_class(cl, out.as_deref_mut());
            !bucket.is_empty()
        });
        self.size -= removed;
        removed
    }

    /// Drop every item for which `pred` returns true, preserving the relative
    /// order of survivors. Returns the number removed.
    pub fn remove_by_filter<F>(&mut self, pred: F, mut out: Option<&mut Vec<T>>) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            removed += bucket.remove_by_filter(&pred, out.as_deref_mut());
            !bucket.is_empty()
        });
        self.size -= removed;
        removed
    }
}

impl<T, K: Ord + Clone> Default for StrictQueue<T, K> {
    fn default() -> Self {
        Self::new()
    }
}
