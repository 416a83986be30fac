//! Shared wrapper for multi-producer use.
//!
//! The queue itself is a single-threaded cooperative structure; this module
//! provides the canonical serialization around it: a clone-able handle that
//! locks per call, plus a drain loop that dispatches items into a crossbeam
//! channel on a dedicated thread until its running flag is lowered.

use crate::config::{ConfigError, SchedulerConfig};
use crate::scheduler::{PrioritizedQueue, QueueSnapshot};
use crate::slo::Slo;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Thread-safe handle to a [`PrioritizedQueue`]. Every operation takes the
/// lock for the duration of the call; clones share the same queue.
pub struct SchedulerService<T, K> {
    inner: Arc<Mutex<PrioritizedQueue<T, K>>>,
}

impl<T, K> Clone for SchedulerService<T, K> {
    fn clone(&self) -> Self {
        SchedulerService {
            inner: self.inner.clone(),
        }
    }
}

impl<T, K: Ord + Clone> SchedulerService<T, K> {
    pub fn new(system_throughput: u64, min_cost: u64) -> Self {
        SchedulerService {
            inner: Arc::new(Mutex::new(PrioritizedQueue::new(system_throughput, min_cost))),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        Ok(SchedulerService {
            inner: Arc::new(Mutex::new(PrioritizedQueue::from_config(config)?)),
        })
    }

    pub fn enqueue_strict(&self, cl: K, priority: u64, item: T) {
        self.inner.lock().enqueue_strict(cl, priority, item);
    }

    pub fn enqueue_dmclock(&self, cl: K, slo: Slo, cost: u64, item: T) {
        self.inner.lock().enqueue_dmclock(cl, slo, cost, item);
    }

    pub fn enqueue_weighted(&self, cl: K, priority: u64, cost: u64, item: T) {
        self.inner.lock().enqueue_weighted(cl, priority, cost, item);
    }

    /// Dispatch one item, or `None` when the queue is currently empty.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut queue = self.inner.lock();
        if queue.empty() {
            None
        } else {
            Some(queue.dequeue())
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().length()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().empty()
    }

    pub fn purge_idle_dmclock(&self) {
        self.inner.lock().purge_idle_dmclock();
    }

    pub fn remove_by_class(&self, cl: &K, out: Option<&mut Vec<T>>) -> usize {
        self.inner.lock().remove_by_class(cl, out)
    }

    pub fn snapshot(&self) -> QueueSnapshot<K> {
        self.inner.lock().snapshot()
    }
}

impl<T, K> SchedulerService<T, K>
where
    T: Send + 'static,
    K: Ord + Clone + Send + 'static,
{
    /// Spawn a thread that forwards dispatched items into `out` until
    /// `running` goes false or the receiving side disconnects.
    pub fn spawn_drain(&self, out: Sender<T>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let service = self.clone();
        std::thread::spawn(move || {
            debug!("drain loop started");
            while running.load(Ordering::Relaxed) {
                match service.try_dequeue() {
                    Some(item) => {
                        if out.send(item).is_err() {
                            debug!("drain receiver disconnected");
                            break;
                        }
                    }
                    // Nothing queued; yield instead of spinning on the lock.
                    None => std::thread::yield_now(),
                }
            }
            debug!("drain loop stopped");
        })
    }
}
