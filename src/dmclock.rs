//! dmClock fair-share scheduler.
//!
//! Each client carries three deadline channels derived from its [`Slo`]: a
//! reservation channel guaranteeing a minimum rate, a proportional channel
//! sharing unreserved capacity by weight, and a limit channel capping the
//! total rate. Dispatch always prefers a reservation whose deadline has come
//! due; otherwise the earliest proportional deadline among limit-eligible
//! clients wins. All deadlines live on a virtual clock that advances once
//! per dispatch and once per idle cycle, never on wall time.

use crate::slo::Slo;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// Which deadline channel a dispatch decision used.
///
/// `Limit` is part of the tag state model but is only ever a gate on the
/// other two channels; it is never the selected channel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Channel {
    None,
    Reserve,
    Proportional,
    Limit,
}

/// Per-client scheduling state.
///
/// A deadline of zero means the channel is disabled for this client.
#[derive(Debug, Clone)]
struct Tag<K> {
    r_deadline: f64,
    r_spacing: f64,
    p_deadline: f64,
    p_spacing: f64,
    l_deadline: f64,
    l_spacing: f64,
    active: bool,
    selected: Channel,
    dispatches: u64,
    client: K,
    slo: Slo,
}

impl<K> Tag<K> {
    fn new(client: K, slo: Slo) -> Self {
        Tag {
            r_deadline: 0.0,
            r_spacing: 0.0,
            p_deadline: 0.0,
            p_spacing: 0.0,
            l_deadline: 0.0,
            l_spacing: 0.0,
            active: true,
            selected: Channel::None,
            dispatches: 0,
            client,
            slo,
        }
    }
}

/// Cached pointer to the client with the smallest eligible deadline on one
/// channel. Invalidated and rebuilt after every schedule mutation.
#[derive(Debug, Clone, Copy, Default)]
struct MinDeadline {
    index: usize,
    deadline: f64,
    valid: bool,
}

/// Share of the unreserved pool a weight is entitled to, proportional to its
/// fraction of the active weight total and capped at the full pool.
fn effective_prop_throughput(available: u64, total_prop: f64, weight: f64) -> f64 {
    if total_prop <= 0.0 || weight <= 0.0 {
        return 0.0;
    }
    if weight <= total_prop {
        available as f64 * (weight / total_prop)
    } else {
        available as f64
    }
}

/// The dmClock queue: per-client FIFOs plus the schedule of deadline tags.
#[derive(Debug)]
pub struct DmClockQueue<T, K> {
    requests: BTreeMap<K, VecDeque<T>>,
    schedule: Vec<Tag<K>>,
    min_reserve: MinDeadline,
    min_prop: MinDeadline,
    virtual_clock: u64,
    throughput_system: u64,
    throughput_available: u64,
    throughput_prop: f64,
    size: usize,
}

impl<T, K: Ord + Clone> DmClockQueue<T, K> {
    pub fn new(system_throughput: u64) -> Self {
        assert!(system_throughput > 0, "system throughput must be non-zero");
        DmClockQueue {
            requests: BTreeMap::new(),
            schedule: Vec::new(),
            min_reserve: MinDeadline::default(),
            min_prop: MinDeadline::default(),
            virtual_clock: 1,
            throughput_system: system_throughput,
            throughput_available: system_throughput,
            throughput_prop: 0.0,
            size: 0,
        }
    }

    pub fn virtual_clock(&self) -> u64 {
        self.virtual_clock
    }

    pub fn system_throughput(&self) -> u64 {
        self.throughput_system
    }

    /// Unreserved capacity remaining in the pool.
    pub fn available_throughput(&self) -> u64 {
        self.throughput_available
    }

    /// Sum of the proportional weights of all known clients.
    pub fn prop_throughput(&self) -> f64 {
        self.throughput_prop
    }

    pub fn empty(&self) -> bool {
        self.size == 0
    }

    pub fn length(&self) -> usize {
        self.size
    }

    /// Queue an item for `cl`.
    ///
    /// The SLO is consulted only on the client's first enqueue; it stays
    /// authoritative until the client is purged. A client returning from
    /// idle has its deadlines aged forward so it cannot cash in the head
    /// start accumulated while absent.
    pub fn enqueue(&mut self, cl: K, slo: Slo, item: T) {
        if !self.requests.contains_key(&cl) {
            self.create_tag(cl.clone(), slo);
            self.requests.insert(cl.clone(), VecDeque::new());
        } else if self.requests[&cl].is_empty() {
            let index = self
                .index_of(&cl)
                .expect("request list implies a scheduling tag");
            self.reactivate(index);
        }
        self.requests
            .get_mut(&cl)
            .expect("entry just ensured")
            .push_back(item);
        self.size += 1;
    }

    /// Dispatch the item with the earliest eligible deadline.
    ///
    /// When no client is currently eligible, idle cycles advance the virtual
    /// clock until one becomes due. The queue must hold at least one active
    /// client with an enabled channel; anything else is a caller error.
    pub fn pop(&mut self) -> T {
        assert!(self.size > 0, "pop from empty dmClock queue");
        let index = loop {
            if let Some(index) = self.select_front() {
                break index;
            }
            assert!(
                self.has_dispatchable_client(),
                "dmClock queue holds only clients with no enabled channel"
            );
            self.issue_idle_cycle();
        };
        let client = self.schedule[index].client.clone();
        let fifo = self
            .requests
            .get_mut(&client)
            .expect("scheduled client has a request list");
        let item = fifo.pop_front().expect("selected client has a queued request");
        if fifo.is_empty() {
            self.schedule[index].active = false;
        }
        self.schedule[index].dispatches += 1;
        self.size -= 1;
        self.virtual_clock += 1;
        self.advance_after_dispatch(index);
        item
    }

    /// Release the reserved and proportional throughput of every idle client
    /// and drop its state. Spacings of the survivors are recomputed against
    /// the enlarged pool.
    pub fn purge_idle(&mut self) {
        let tags = std::mem::take(&mut self.schedule);
        let mut kept = Vec::with_capacity(tags.len());
        let mut purged = 0usize;
        for tag in tags {
            if tag.active {
                kept.push(tag);
                continue;
            }
            debug_assert!(
                self.requests.get(&tag.client).map_or(true, |f| f.is_empty()),
                "inactive tag with queued requests"
            );
            purged += 1;
            if tag.slo.reserve > 0 {
                self.throughput_available = (self.throughput_available + tag.slo.reserve)
                    .min(self.throughput_system);
            }
            if tag.slo.prop > 0.0 {
                self.throughput_prop = (self.throughput_prop - tag.slo.prop).max(0.0);
            }
            self.requests.remove(&tag.client);
        }
        self.schedule = kept;
        if purged > 0 {
            debug!(
                purged,
                available = self.throughput_available,
                prop = self.throughput_prop,
                "purged idle clients"
            );
            self.recompute_prop_spacings();
        }
        self.refresh_min_deadlines();
    }

    /// Drop every queued item of `cl`. The client's tag goes inactive but
    /// survives until the next purge. Returns the number removed.
    pub fn remove_by_class(&mut self, cl: &K, out: Option<&mut Vec<T>>) -> usize {
        let Some(fifo) = self.requests.get_mut(cl) else {
            return 0;
        };
        let removed = fifo.len();
        if let Some(out) = out {
            out.extend(fifo.drain(..));
        } else {
            fifo.clear();
        }
        if removed > 0 {
            self.size -= removed;
            let index = self
                .index_of(cl)
                .expect("request list implies a scheduling tag");
            self.schedule[index].active = false;
            self.refresh_min_deadlines();
        }
        removed
    }

    /// Drop every item for which `pred` returns true; clients whose lists
    /// empty out go inactive. Returns the number removed.
    pub fn remove_by_filter<F>(&mut self, pred: F, mut out: Option<&mut Vec<T>>) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut removed = 0;
        let mut idled = Vec::new();
        for (cl, fifo) in self.requests.iter_mut() {
            if fifo.is_empty() {
                continue;
            }
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
            if kept.is_empty() {
                idled.push(cl.clone());
            }
            *fifo = kept;
        }
        if removed > 0 {
            self.size -= removed;
            for cl in &idled {
                if let Some(index) = self.index_of(cl) {
                    self.schedule[index].active = false;
                }
            }
            self.refresh_min_deadlines();
        }
        removed
    }

    /// Point-in-time view of the clock, throughput book, and every tag.
    pub fn snapshot(&self) -> DmClockSnapshot<K> {
        DmClockSnapshot {
            virtual_clock: self.virtual_clock,
            system_throughput: self.throughput_system,
            available_throughput: self.throughput_available,
            prop_throughput: self.throughput_prop,
            length: self.size,
            clients: self
                .schedule
                .iter()
                .map(|tag| TagSnapshot {
                    client: tag.client.clone(),
                    active: tag.active,
                    dispatches: tag.dispatches,
                    selected: tag.selected,
                    reserve_deadline: tag.r_deadline,
                    reserve_spacing: tag.r_spacing,
                    prop_deadline: tag.p_deadline,
                    prop_spacing: tag.p_spacing,
                    limit_deadline: tag.l_deadline,
                    limit_spacing: tag.l_spacing,
                    slo: tag.slo,
                })
                .collect(),
        }
    }

    fn index_of(&self, cl: &K) -> Option<usize> {
        self.schedule.iter().position(|tag| tag.client == *cl)
    }

    fn has_dispatchable_client(&self) -> bool {
        self.schedule
            .iter()
            .any(|tag| tag.active && (tag.r_deadline > 0.0 || tag.p_deadline > 0.0))
    }

    fn create_tag(&mut self, cl: K, slo: Slo) {
        if let Err(e) = slo.validate() {
            panic!("invalid SLO on first enqueue: {e}");
        }
        let now = self.virtual_clock as f64;
        let mut tag = Tag::new(cl, slo);
        if slo.reserve > 0 {
            tag.r_deadline = now;
            tag.r_spacing = self.throughput_system as f64 / slo.reserve as f64;
            // Oversubscription saturates the pool instead of rejecting.
            self.throughput_available = self.throughput_available.saturating_sub(slo.reserve);
        }
        if slo.limit > 0 {
            tag.l_deadline = now;
            tag.l_spacing = self.throughput_system as f64 / slo.limit as f64;
        }
        let has_prop = slo.prop > 0.0;
        if has_prop {
            self.throughput_prop += slo.prop;
        }
        self.schedule.push(tag);
        if has_prop {
            // The weight total changed, so every proportional spacing is stale.
            self.recompute_prop_spacings();
        }
        self.refresh_min_deadlines();
        debug!(
            reserve = slo.reserve,
            prop = slo.prop,
            limit = slo.limit,
            clients = self.schedule.len(),
            "created scheduling tag"
        );
    }

    /// Age a returning client's deadlines so idle time earns no credit:
    /// reservation and limit move to `max(deadline + spacing, now)`, the
    /// proportional deadline rejoins the current minimum.
    fn reactivate(&mut self, index: usize) {
        let now = self.virtual_clock as f64;
        let seed = if self.min_prop.valid {
            self.min_prop.deadline
        } else {
            now
        };
        let tag = &mut self.schedule[index];
        tag.active = true;
        if tag.r_deadline > 0.0 {
            tag.r_deadline = (tag.r_deadline + tag.r_spacing).max(now);
        }
        if tag.l_deadline > 0.0 {
            tag.l_deadline = (tag.l_deadline + tag.l_spacing).max(now);
        }
        if tag.p_deadline > 0.0 {
            tag.p_deadline = seed;
        }
        self.refresh_min_deadlines();
    }

    /// Recompute every proportional spacing from the current throughput
    /// book. A channel whose effective throughput hits zero goes dark; one
    /// coming back from dark is re-seeded at the current minimum.
    fn recompute_prop_spacings(&mut self) {
        let now = self.virtual_clock as f64;
        let seed = if self.min_prop.valid {
            self.min_prop.deadline
        } else {
            now
        };
        let available = self.throughput_available;
        let total_prop = self.throughput_prop;
        let system = self.throughput_system as f64;
        for tag in &mut self.schedule {
            if tag.slo.prop <= 0.0 {
                continue;
            }
            let effective = effective_prop_throughput(available, total_prop, tag.slo.prop);
            if effective > 0.0 {
                tag.p_spacing = system / effective;
                if tag.p_deadline == 0.0 {
                    tag.p_deadline = seed;
                }
            } else {
                tag.p_spacing = 0.0;
                tag.p_deadline = 0.0;
            }
        }
    }

    /// Rebuild both min-deadline caches from the active tags.
    ///
    /// A reservation is a candidate unless its limit deadline sits in the
    /// future of both the clock and the reservation itself; a proportional
    /// deadline is a candidate only when the limit allows running now. Equal
    /// deadlines resolve to the later tag in schedule order.
    fn refresh_min_deadlines(&mut self) {
        self.min_reserve = MinDeadline::default();
        self.min_prop = MinDeadline::default();
        let now = self.virtual_clock as f64;
        for (index, tag) in self.schedule.iter().enumerate() {
            if !tag.active {
                continue;
            }
            if tag.r_deadline > 0.0
                && (tag.r_deadline >= tag.l_deadline || tag.l_deadline <= now)
                && (!self.min_reserve.valid || self.min_reserve.deadline >= tag.r_deadline)
            {
                self.min_reserve = MinDeadline {
                    index,
                    deadline: tag.r_deadline,
                    valid: true,
                };
            }
            if tag.p_deadline > 0.0
                && tag.l_deadline <= now
                && (!self.min_prop.valid || self.min_prop.deadline >= tag.p_deadline)
            {
                self.min_prop = MinDeadline {
                    index,
                    deadline: tag.p_deadline,
                    valid: true,
                };
            }
        }
    }

    /// Two-phase selection: a due reservation wins outright, otherwise the
    /// earliest proportional deadline runs (possibly ahead of the clock,
    /// which keeps the proportional channel work-conserving).
    fn select_front(&mut self) -> Option<usize> {
        let now = self.virtual_clock as f64;
        if self.min_reserve.valid {
            let index = self.min_reserve.index;
            let tag = &mut self.schedule[index];
            if tag.r_deadline <= now {
                tag.selected = Channel::Reserve;
                return Some(index);
            }
        }
        if self.min_prop.valid {
            let index = self.min_prop.index;
            self.schedule[index].selected = Channel::Proportional;
            return Some(index);
        }
        None
    }

    fn issue_idle_cycle(&mut self) {
        trace!(clock = self.virtual_clock, "idle cycle");
        self.virtual_clock += 1;
        self.refresh_min_deadlines();
    }

    /// Advance the dispatched tag's deadlines by pure addition. Reservations
    /// advance only when the reservation channel was charged, so a briefly
    /// lagging reservation accumulates earlier deadlines and catches up;
    /// clamping to the clock happens solely on reactivation from idle.
    fn advance_after_dispatch(&mut self, index: usize) {
        let tag = &mut self.schedule[index];
        if matches!(tag.selected, Channel::Reserve | Channel::None) && tag.r_deadline > 0.0 {
            tag.r_deadline += tag.r_spacing;
        }
        if tag.p_deadline > 0.0 {
            tag.p_deadline += tag.p_spacing;
        }
        if tag.l_deadline > 0.0 {
            tag.l_deadline += tag.l_spacing;
        }
        self.refresh_min_deadlines();
    }
}

/// Point-in-time view of one client's tag.
#[derive(Debug, Clone, Serialize)]
pub struct TagSnapshot<K> {
    pub client: K,
    pub active: bool,
    pub dispatches: u64,
    pub selected: Channel,
    pub reserve_deadline: f64,
    pub reserve_spacing: f64,
    pub prop_deadline: f64,
    pub prop_spacing: f64,
    pub limit_deadline: f64,
    pub limit_spacing: f64,
    pub slo: Slo,
}

/// Point-in-time view of the dmClock queue.
#[derive(Debug, Clone, Serialize)]
pub struct DmClockSnapshot<K> {
    pub virtual_clock: u64,
    pub system_throughput: u64,
    pub available_throughput: u64,
    pub prop_throughput: f64,
    pub length: usize,
    pub clients: Vec<TagSnapshot<K>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_counts(q: &mut DmClockQueue<&'static str, u32>, pops: usize) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for _ in 0..pops {
            let item = q.pop();
            let cl = item.strip_prefix("client").unwrap().parse::<u32>().unwrap();
            *counts.entry(cl).or_insert(0) += 1;
        }
        counts
    }

    fn fill(q: &mut DmClockQueue<&'static str, u32>, cl: u32, slo: Slo, n: usize) {
        let label: &'static str = match cl {
            0 => "client0",
            1 => "client1",
            2 => "client2",
            _ => unreachable!(),
        };
        for _ in 0..n {
            q.enqueue(cl, slo, label);
        }
    }

    #[test]
    fn full_reservation_dispatches_every_tick() {
        let mut q = DmClockQueue::new(100);
        fill(&mut q, 0, Slo::new(100, 0.0, 0), 50);
        for _ in 0..50 {
            q.pop();
        }
        // One tick per dispatch and no idle cycles.
        assert_eq!(q.virtual_clock(), 51);
        assert!(q.empty());
    }

    #[test]
    fn fifo_order_within_a_client() {
        let mut q = DmClockQueue::new(10);
        for i in 0..5 {
            q.enqueue("a", Slo::new(10, 0.0, 0), i);
        }
        let drained: Vec<_> = (0..5).map(|_| q.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn oversubscribed_reservation_saturates_available() {
        let mut q = DmClockQueue::new(350);
        fill(&mut q, 0, Slo::new(500, 0.0, 0), 10);
        assert_eq!(q.available_throughput(), 0);
        // Still dispatches fine; the pool is just exhausted.
        for _ in 0..10 {
            q.pop();
        }
    }

    #[test]
    fn proportional_weights_share_by_ratio() {
        let mut q = DmClockQueue::new(60);
        fill(&mut q, 0, Slo::new(0, 1.0, 0), 100);
        fill(&mut q, 1, Slo::new(0, 2.0, 0), 100);
        let counts = drain_counts(&mut q, 60);
        let c0 = counts[&0] as i64;
        let c1 = counts[&1] as i64;
        assert_eq!(c0 + c1, 60);
        assert!((c0 - 20).abs() <= 2, "weight-1 client got {c0}");
        assert!((c1 - 40).abs() <= 2, "weight-2 client got {c1}");
    }

    #[test]
    fn reactivation_ages_deadlines_to_now() {
        let mut q = DmClockQueue::new(100);
        // Client 0 dispatches once and goes idle while client 1 runs.
        fill(&mut q, 0, Slo::new(50, 0.0, 0), 1);
        q.pop();
        fill(&mut q, 1, Slo::new(50, 0.0, 0), 50);
        for _ in 0..50 {
            q.pop();
        }
        let now = q.virtual_clock();
        fill(&mut q, 0, Slo::new(50, 0.0, 0), 1);
        let snap = q.snapshot();
        let tag = snap.clients.iter().find(|t| t.client == 0).unwrap();
        // max(stale deadline + spacing, now) == now: no back-credit.
        assert_eq!(tag.reserve_deadline, now as f64);
    }

    #[test]
    fn purge_restores_throughput_book() {
        let mut q = DmClockQueue::new(300);
        fill(&mut q, 0, Slo::new(100, 0.5, 0), 1);
        fill(&mut q, 1, Slo::new(100, 0.5, 0), 1);
        fill(&mut q, 2, Slo::new(100, 0.0, 0), 1);
        assert_eq!(q.available_throughput(), 0);
        for _ in 0..3 {
            q.pop();
        }
        q.purge_idle();
        assert_eq!(q.available_throughput(), 300);
        assert_eq!(q.prop_throughput(), 0.0);
        assert!(q.snapshot().clients.is_empty());
    }

    #[test]
    fn remove_by_class_idles_the_client() {
        let mut q = DmClockQueue::new(100);
        fill(&mut q, 0, Slo::new(50, 0.0, 0), 4);
        fill(&mut q, 1, Slo::new(50, 0.0, 0), 2);
        let mut out = Vec::new();
        let removed = q.remove_by_class(&0, Some(&mut out));
        assert_eq!(removed, 4);
        assert_eq!(out.len(), 4);
        assert_eq!(q.length(), 2);
        let snap = q.snapshot();
        assert!(!snap.clients.iter().find(|t| t.client == 0).unwrap().active);
        // Only client 1 dispatches from here on.
        assert_eq!(q.pop(), "client1");
        assert_eq!(q.pop(), "client1");
    }

    #[test]
    fn remove_by_filter_drops_matching_items() {
        let mut q = DmClockQueue::new(100);
        for i in 0..6 {
            q.enqueue("a", Slo::new(100, 0.0, 0), i);
        }
        let removed = q.remove_by_filter(|item| item % 2 == 0, None);
        assert_eq!(removed, 3);
        assert_eq!(q.length(), 3);
        assert_eq!(q.pop(), 1);
    }

    #[test]
    #[should_panic(expected = "invalid SLO")]
    fn limit_at_or_below_reserve_is_fatal() {
        let mut q = DmClockQueue::new(100);
        q.enqueue("a", Slo::new(50, 0.0, 50), 0);
    }

    #[test]
    #[should_panic(expected = "pop from empty")]
    fn pop_from_empty_is_fatal() {
        let mut q: DmClockQueue<u32, u32> = DmClockQueue::new(100);
        q.pop();
    }
}
