//! The W-TinyLFU admission/eviction policy core.
//!
//! Single-threaded state machine (callers serialize access behind one
//! lock): a Window LRU segment feeds a Main segment split into Probation
//! and Protected SLRUs. New entries always enter the Window; when it
//! overflows, its LRU victim is demoted into Probation as an admission
//! candidate. When Main is over its share of capacity, the candidate and
//! Probation's own LRU victim are compared by Count-Min Sketch frequency
//! and the loser is evicted, with a coin flip breaking exact ties.

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::list::{IntrusiveList, Linked, NIL};
use crate::sketch::Sketch;
use crate::timer_wheel::TimerWheel;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Window,
    Probation,
    Protected,
}

struct PolicyNode {
    fingerprint: u64,
    expire_ns: u64,
    segment: Segment,
    prev: u32,
    next: u32,
}

impl Linked for PolicyNode {
    fn prev(&self) -> u32 {
        self.prev
    }
    fn set_prev(&mut self, p: u32) {
        self.prev = p;
    }
    fn next(&self) -> u32 {
        self.next
    }
    fn set_next(&mut self, n: u32) {
        self.next = n;
    }
}

/// The Window-TinyLFU policy. Owns the sketch, the three segment lists,
/// the node arena and the timer wheel for TTL-bearing nodes.
pub struct Policy {
    capacity: u64,
    window_cap: u64,
    protected_cap: u64,

    nodes: Vec<PolicyNode>,
    free: Vec<u32>,
    index: HashMap<u64, u32>,

    window: IntrusiveList,
    probation: IntrusiveList,
    protected: IntrusiveList,

    sketch: Sketch,
    timer: TimerWheel,
    rng: SmallRng,
}

impl Policy {
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(1);
        let window_cap = (capacity / 100).max(1).min(capacity);
        let main_cap = capacity - window_cap;
        let protected_cap = (main_cap * 4) / 5;

        Self {
            capacity,
            window_cap,
            protected_cap,
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            window: IntrusiveList::new(),
            probation: IntrusiveList::new(),
            protected: IntrusiveList::new(),
            sketch: Sketch::for_capacity(capacity),
            timer: TimerWheel::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Records a batch of accesses (drained from the read buffer): bumps
    /// sketch frequency and promotes within/between segments.
    pub fn access(&mut self, fingerprints: &[u64]) {
        for &fp in fingerprints {
            self.sketch.record(fp);
            let Some(&idx) = self.index.get(&fp) else {
                continue;
            };
            self.touch(idx);
        }
    }

    /// Moves `idx` within/between segments the way a read does: Window
    /// entries move to front, Probation entries promote to Protected
    /// (demoting Protected's overflow back to Probation if needed), and
    /// Protected entries move to front. Shared by `access` and by `set`'s
    /// refresh-of-an-existing-fingerprint path, which touches position
    /// exactly as a read would (spec: "touch its position as in access").
    fn touch(&mut self, idx: u32) {
        match self.nodes[idx as usize].segment {
            Segment::Window => self.window.move_to_front(&mut self.nodes, idx),
            Segment::Probation => {
                self.probation.remove(&mut self.nodes, idx);
                self.nodes[idx as usize].segment = Segment::Protected;
                self.protected.push_front(&mut self.nodes, idx);
                self.demote_protected_overflow();
            }
            Segment::Protected => self.protected.move_to_front(&mut self.nodes, idx),
        }
    }

    /// Admits or refreshes a fingerprint with TTL `ttl_ns` (0 = no expiry).
    /// Returns fingerprints evicted to make room.
    pub fn set(&mut self, fp: u64, ttl_ns: u64, now_ns: u64) -> Vec<u64> {
        self.sketch.record(fp);

        if let Some(&idx) = self.index.get(&fp) {
            self.nodes[idx as usize].expire_ns = now_ns.saturating_add(ttl_ns);
            self.reschedule_timer(idx, now_ns);
            self.touch(idx);
            return Vec::new();
        }

        let expire_ns = now_ns.saturating_add(ttl_ns);
        let idx = self.alloc_node(fp, expire_ns);
        self.index.insert(fp, idx);
        self.window.push_front(&mut self.nodes, idx);
        self.reschedule_timer(idx, now_ns);

        let mut evicted = Vec::new();
        while self.index.len() as u64 > self.capacity {
            if let Some(victim) = self.rebalance_and_evict() {
                evicted.push(victim);
            } else {
                break;
            }
        }
        evicted
    }

    /// Removes `fp` unconditionally, if present.
    pub fn delete(&mut self, fp: u64) {
        if let Some(idx) = self.index.remove(&fp) {
            self.unlink(idx);
            self.timer.cancel(fp);
            self.free_node(idx);
        }
    }

    /// Advances the timer wheel to `now_ns`, removing and returning every
    /// fingerprint whose TTL has elapsed.
    pub fn advance(&mut self, now_ns: u64) -> Vec<u64> {
        let expired = self.timer.advance(now_ns);
        for &fp in &expired {
            if let Some(idx) = self.index.remove(&fp) {
                self.unlink(idx);
                self.free_node(idx);
            }
        }
        expired
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.window.clear();
        self.probation.clear();
        self.protected.clear();
        self.timer.clear();
        self.sketch.clear();
    }

    fn reschedule_timer(&mut self, idx: u32, now_ns: u64) {
        let fp = self.nodes[idx as usize].fingerprint;
        let expire_ns = self.nodes[idx as usize].expire_ns;
        if expire_ns == 0 {
            self.timer.cancel(fp);
        } else {
            self.timer.reschedule(fp, expire_ns, now_ns);
        }
    }

    fn alloc_node(&mut self, fp: u64, expire_ns: u64) -> u32 {
        let node = PolicyNode {
            fingerprint: fp,
            expire_ns,
            segment: Segment::Window,
            prev: NIL,
            next: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn free_node(&mut self, idx: u32) {
        self.free.push(idx);
    }

    fn unlink(&mut self, idx: u32) {
        match self.nodes[idx as usize].segment {
            Segment::Window => self.window.remove(&mut self.nodes, idx),
            Segment::Probation => self.probation.remove(&mut self.nodes, idx),
            Segment::Protected => self.protected.remove(&mut self.nodes, idx),
        }
    }

    fn demote_protected_overflow(&mut self) {
        while self.protected.len() as u64 > self.protected_cap {
            let Some(idx) = self.protected.pop_back(&mut self.nodes) else {
                break;
            };
            self.nodes[idx as usize].segment = Segment::Probation;
            self.probation.push_front(&mut self.nodes, idx);
        }
    }

    /// Moves window overflow into probation, then runs the TinyLFU
    /// admission contest if Main is still over its share of capacity.
    /// Returns the evicted fingerprint, if one was evicted.
    fn rebalance_and_evict(&mut self) -> Option<u64> {
        while self.window.len() as u64 > self.window_cap {
            let idx = self.window.pop_back(&mut self.nodes)?;
            self.nodes[idx as usize].segment = Segment::Probation;
            self.probation.push_front(&mut self.nodes, idx);
        }
        self.demote_protected_overflow();

        if self.index.len() as u64 <= self.capacity {
            return None;
        }

        let victim_idx = self.probation.tail()?;
        let candidate_idx = self.probation.head()?;

        let evict_idx = if victim_idx == candidate_idx {
            victim_idx
        } else {
            let victim_fp = self.nodes[victim_idx as usize].fingerprint;
            let candidate_fp = self.nodes[candidate_idx as usize].fingerprint;
            let v_est = self.sketch.estimate(victim_fp);
            let c_est = self.sketch.estimate(candidate_fp);
            match c_est.cmp(&v_est) {
                std::cmp::Ordering::Greater => victim_idx,
                std::cmp::Ordering::Less => candidate_idx,
                std::cmp::Ordering::Equal => {
                    if self.rng.gen_bool(0.5) {
                        victim_idx
                    } else {
                        candidate_idx
                    }
                }
            }
        };

        let evicted_fp = self.nodes[evict_idx as usize].fingerprint;
        self.probation.remove(&mut self.nodes, evict_idx);
        self.index.remove(&evicted_fp);
        self.timer.cancel(evicted_fp);
        self.free_node(evict_idx);
        Some(evicted_fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_without_eviction() {
        let mut p = Policy::new(10);
        for fp in 0..10u64 {
            let evicted = p.set(fp, 0, 0);
            assert!(evicted.is_empty());
        }
        assert_eq!(p.len(), 10);
    }

    #[test]
    fn stays_at_capacity_once_full() {
        let mut p = Policy::new(10);
        for fp in 0..10u64 {
            p.set(fp, 0, 0);
        }
        for fp in 10..50u64 {
            p.set(fp, 0, 0);
            assert!(p.len() <= 10);
        }
    }

    #[test]
    fn frequently_accessed_key_survives_contention() {
        let mut p = Policy::new(8);
        for fp in 0..8u64 {
            p.set(fp, 0, 0);
        }
        // Hammer key 0's frequency so the sketch strongly favors it.
        for _ in 0..200 {
            p.access(&[0]);
        }
        for fp in 100..140u64 {
            p.set(fp, 0, 0);
        }
        assert!(p.index.contains_key(&0), "hot key should survive churn");
    }

    #[test]
    fn delete_removes_and_frees_slot() {
        let mut p = Policy::new(10);
        p.set(1, 0, 0);
        assert_eq!(p.len(), 1);
        p.delete(1);
        assert_eq!(p.len(), 0);
        p.set(2, 0, 0);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn ttl_entries_expire_via_advance() {
        let mut p = Policy::new(10);
        const SEC: u64 = 1_000_000_000;
        p.set(1, 5 * SEC, 0);
        assert!(p.advance(2 * SEC).is_empty());
        let expired = p.advance(6 * SEC);
        assert_eq!(expired, vec![1]);
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn set_on_existing_fingerprint_touches_position_like_access() {
        // capacity 50 => window_cap = 1, so the second insert alone
        // demotes the first into Probation with no eviction contest
        // (2 total entries, well under capacity): deterministic, no
        // sketch-tie coin flip involved.
        let mut p = Policy::new(50);
        p.set(1, 0, 0);
        p.set(2, 0, 0);
        let idx = p.index[&1];
        assert_eq!(p.nodes[idx as usize].segment, Segment::Probation);

        // Refreshing the TTL of an already-known fingerprint must promote
        // it exactly as a read would, not leave it stranded in Probation.
        p.set(1, 5_000_000_000, 0);
        assert_eq!(p.nodes[idx as usize].segment, Segment::Protected);
    }

    #[test]
    fn access_promotes_probation_entry_to_protected() {
        let mut p = Policy::new(300);
        p.set(1, 0, 0);
        // Force key 1 out of the window into probation via overflow.
        for fp in 10..400u64 {
            p.set(fp, 0, 0);
        }
        let idx = p.index[&1];
        if p.nodes[idx as usize].segment == Segment::Probation {
            p.access(&[1]);
            assert_eq!(p.nodes[idx as usize].segment, Segment::Protected);
        }
    }
}
