//! A hierarchical timer wheel driving proactive TTL expiration.
//!
//! Four levels, each 64 slots, with per-level tick granularities of 1
//! second, 1 minute, 1 hour and 1 day. A node's deadline places it in the
//! coarsest level whose range still covers it; as time advances and a
//! coarse slot comes due, its contents cascade down into the next finer
//! level instead of firing directly, refining their placement.

use std::collections::HashMap;

const SLOTS_PER_LEVEL: usize = 64;

/// Sentinel level recorded in `positions` for a fingerprint whose deadline
/// is already due: it sits in `due_now` rather than any real wheel slot.
const DUE_LEVEL: usize = usize::MAX;

/// Seconds per tick, one entry per level, finest first.
const LEVEL_UNIT_SECS: [u64; 4] = [
    1,          // 1s
    60,         // 1m
    60 * 60,    // 1h
    60 * 60 * 24, // 1d
];

#[derive(Default)]
struct Slot {
    members: Vec<u64>,
}

struct Level {
    unit_secs: u64,
    slots: Vec<Slot>,
}

impl Level {
    fn new(unit_secs: u64) -> Self {
        Self {
            unit_secs,
            slots: (0..SLOTS_PER_LEVEL).map(|_| Slot::default()).collect(),
        }
    }

    fn range_secs(&self) -> u64 {
        self.unit_secs * SLOTS_PER_LEVEL as u64
    }
}

/// Where a fingerprint currently sits: `(level, slot)`.
type Position = (usize, usize);

/// A hierarchical timer wheel keyed by absolute deadline in nanoseconds.
pub struct TimerWheel {
    levels: [Level; 4],
    /// Current wheel time, in whole seconds since an arbitrary epoch fixed
    /// at construction (the first `advance` call's `now_ns`).
    current_secs: u64,
    epoch_ns: Option<u64>,
    positions: HashMap<u64, Position>,
    /// Deadline (seconds, absolute) recorded per fingerprint, used when
    /// cascading a coarse slot down into finer levels.
    deadlines: HashMap<u64, u64>,
    /// Fingerprints placed with a deadline already `<= current_secs`.
    /// Drained on the very next `advance()` rather than stored in a wheel
    /// slot, so they fire on the next tick instead of waiting out a full
    /// revolution of level 0.
    due_now: Vec<u64>,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            levels: LEVEL_UNIT_SECS.map(Level::new),
            current_secs: 0,
            epoch_ns: None,
            positions: HashMap::new(),
            deadlines: HashMap::new(),
            due_now: Vec::new(),
        }
    }

    fn to_secs(&mut self, now_ns: u64) -> u64 {
        let epoch = *self.epoch_ns.get_or_insert(now_ns);
        now_ns.saturating_sub(epoch) / 1_000_000_000
    }

    /// Inserts `fp` with absolute deadline `deadline_ns`. `now_ns` anchors
    /// the wheel's epoch on first use. A deadline already past `now_ns` is
    /// placed in the nearest due slot, so it is caught on the next advance.
    pub fn insert(&mut self, fp: u64, deadline_ns: u64, now_ns: u64) {
        let now_secs = self.to_secs(now_ns);
        let deadline_secs = deadline_ns / 1_000_000_000;
        self.place(fp, deadline_secs, now_secs);
    }

    /// Moves an already-scheduled (or new) fingerprint to a new deadline.
    pub fn reschedule(&mut self, fp: u64, deadline_ns: u64, now_ns: u64) {
        self.cancel(fp);
        self.insert(fp, deadline_ns, now_ns);
    }

    /// Removes `fp` from the wheel, if present. No-op otherwise.
    pub fn cancel(&mut self, fp: u64) {
        if let Some((lvl, slot)) = self.positions.remove(&fp) {
            if lvl == DUE_LEVEL {
                self.due_now.retain(|&x| x != fp);
            } else {
                self.levels[lvl].slots[slot].members.retain(|&x| x != fp);
            }
        }
        self.deadlines.remove(&fp);
    }

    /// Places `fp` at `deadline_secs`. A deadline that has already reached
    /// (or passed) `current_secs` goes to `due_now` instead of level 0:
    /// level 0's slot for `current_secs` was already ticked past by the
    /// time any direct `insert`/`reschedule` call runs (ticking happens
    /// only inside `advance`), so storing it there would strand the node
    /// for a full 64-second revolution instead of firing on the next tick.
    fn place(&mut self, fp: u64, deadline_secs: u64, now_secs: u64) {
        self.deadlines.insert(fp, deadline_secs);
        if deadline_secs <= self.current_secs {
            self.due_now.push(fp);
            self.positions.insert(fp, (DUE_LEVEL, 0));
            return;
        }
        let delay = deadline_secs.saturating_sub(now_secs);
        let (lvl, slot) = Self::locate(self.current_secs, delay, &self.levels);
        self.levels[lvl].slots[slot].members.push(fp);
        self.positions.insert(fp, (lvl, slot));
    }

    /// Picks the coarsest level whose range covers `delay` ticks from now,
    /// preferring the finest level that still fits.
    fn locate(current_secs: u64, delay: u64, levels: &[Level; 4]) -> Position {
        for (lvl, level) in levels.iter().enumerate() {
            if delay < level.range_secs() || lvl == levels.len() - 1 {
                let target = current_secs + delay;
                let slot = ((target / level.unit_secs) as usize) % SLOTS_PER_LEVEL;
                return (lvl, slot);
            }
        }
        unreachable!("last level always matches")
    }

    /// Advances the wheel to `now_ns`, returning fingerprints whose
    /// deadlines have passed. Slots in coarser levels that become due are
    /// cascaded into finer levels rather than fired directly, unless they
    /// are already in the finest level.
    pub fn advance(&mut self, now_ns: u64) -> Vec<u64> {
        let target_secs = self.to_secs(now_ns);
        let mut expired: Vec<u64> = self.due_now.drain(..).collect();
        for fp in &expired {
            self.positions.remove(fp);
            self.deadlines.remove(fp);
        }

        while self.current_secs < target_secs {
            self.current_secs += 1;
            self.tick(&mut expired);
        }
        expired
    }

    fn tick(&mut self, expired: &mut Vec<u64>) {
        for lvl in 0..self.levels.len() {
            let unit = self.levels[lvl].unit_secs;
            if self.current_secs % unit != 0 {
                break;
            }
            let slot = ((self.current_secs / unit) as usize) % SLOTS_PER_LEVEL;
            let members = std::mem::take(&mut self.levels[lvl].slots[slot].members);
            for fp in members {
                self.positions.remove(&fp);
                let deadline = self.deadlines.get(&fp).copied().unwrap_or(self.current_secs);
                if lvl == 0 || deadline <= self.current_secs {
                    self.deadlines.remove(&fp);
                    expired.push(fp);
                } else {
                    // Cascade: re-place using the remaining delay at the finer levels.
                    let now = self.current_secs;
                    self.place(fp, deadline, now);
                }
            }
        }
    }

    /// Drops every scheduled fingerprint.
    pub fn clear(&mut self) {
        for level in &mut self.levels {
            for slot in &mut level.slots {
                slot.members.clear();
            }
        }
        self.positions.clear();
        self.deadlines.clear();
        self.due_now.clear();
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
