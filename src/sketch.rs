//! Count-Min Sketch frequency estimator with aging.
//!
//! Four rows of 4-bit saturating counters packed into 64-bit words (16
//! counters per word). `record` increments the minimum-of-4 counters for a
//! fingerprint; `estimate` reads them back. A sample counter drives periodic
//! halving of the whole table, which is how past popularity decays over time.

use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::hash::{mix64, next_pow2};

const NIBBLE_MASK: u64 = 0xF;
const MASK_NIBBLES_64: u64 = 0x7777777777777777;

const MAX_CAS_TRIES: usize = 64;
const YIELD_EVERY_TRIES: usize = 8;
const SLEEP_AFTER_TRIES: usize = 32;

/// Minimum table length (in counters), regardless of capacity.
const MIN_TABLE_LEN: u32 = 16;

/// A Count-Min Sketch with saturating 4-bit counters and periodic aging.
pub struct Sketch {
    /// Packed 4-bit counters, 16 per word.
    words: Vec<AtomicU64>,
    /// `num_counters - 1`; `num_counters` is a power of two.
    mask: u32,
    /// Successful increments since the last reset.
    samples: AtomicU64,
    /// Reset threshold: halve the table once `samples` reaches this.
    reset_at: u64,
    /// Best-effort guard against concurrent full-table aging.
    aging_active: AtomicU32,
}

impl Sketch {
    /// Builds a sketch sized for `capacity` entries: the table length is the
    /// next power of two `>= 10 * capacity`, clamped to [`MIN_TABLE_LEN`].
    pub fn for_capacity(capacity: u64) -> Self {
        let target = (capacity.max(1) * 10) as usize;
        let table_len = next_pow2(target).max(MIN_TABLE_LEN as usize) as u32;
        Self::new(table_len)
    }

    /// Builds a sketch with an explicit power-of-two table length.
    pub fn new(table_len_pow2: u32) -> Self {
        let table_len_pow2 = next_pow2(table_len_pow2.max(1) as usize) as u32;
        let num_counters = table_len_pow2 as u64;
        let word_count = ((num_counters + 15) / 16) as usize;
        let words: Vec<AtomicU64> = (0..word_count).map(|_| AtomicU64::new(0)).collect();

        Self {
            words,
            mask: table_len_pow2 - 1,
            samples: AtomicU64::new(0),
            reset_at: num_counters,
            aging_active: AtomicU32::new(0),
        }
    }

    fn indices(&self, fp: u64) -> [u32; 4] {
        let mut h = fp;
        let i0 = (h as u32) & self.mask;
        h = mix64(h);
        let i1 = (h as u32) & self.mask;
        h = mix64(h);
        let i2 = (h as u32) & self.mask;
        h = mix64(h);
        let i3 = (h as u32) & self.mask;
        [i0, i1, i2, i3]
    }

    /// Records one observation of `fp`, incrementing its 4 counters.
    pub fn record(&self, fp: u64) {
        self.maybe_age();
        for idx in self.indices(fp) {
            self.inc_at(idx);
        }
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the minimum of the 4 counters for `fp`.
    pub fn estimate(&self, fp: u64) -> u8 {
        self.indices(fp)
            .into_iter()
            .map(|idx| self.get_at(idx))
            .min()
            .unwrap_or(0)
    }

    fn word_shift(&self, idx: u32) -> (usize, u32) {
        (idx as usize >> 4, (idx & 0xF) << 2)
    }

    fn inc_at(&self, idx: u32) {
        let (w, sh) = self.word_shift(idx);
        let word = &self.words[w];

        for tries in 1..=MAX_CAS_TRIES {
            let old = word.load(Ordering::Relaxed);
            let n = (old >> sh) & NIBBLE_MASK;
            if n == NIBBLE_MASK {
                return;
            }
            let new = old + (1 << sh);
            if word
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff(tries);
        }
    }

    fn get_at(&self, idx: u32) -> u8 {
        let (w, sh) = self.word_shift(idx);
        let v = self.words[w].load(Ordering::Relaxed);
        ((v >> sh) & NIBBLE_MASK) as u8
    }

    fn maybe_age(&self) {
        if self.samples.load(Ordering::Relaxed) < self.reset_at {
            return;
        }
        if self
            .aging_active
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            if self.samples.load(Ordering::Relaxed) >= self.reset_at {
                self.age();
                self.samples.store(0, Ordering::Relaxed);
            }
            self.aging_active.store(0, Ordering::Relaxed);
        }
    }

    /// Halves every 4-bit counter in the table.
    pub fn age(&self) {
        for word in &self.words {
            for tries in 1..=MAX_CAS_TRIES {
                let old = word.load(Ordering::Relaxed);
                let new = (old >> 1) & MASK_NIBBLES_64;
                if word
                    .compare_exchange(old, new, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                backoff(tries);
            }
        }
    }

    /// Clears the table back to all-zero counters.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.samples.store(0, Ordering::Relaxed);
    }
}

fn backoff(tries: usize) {
    if tries % YIELD_EVERY_TRIES == 0 {
        hint::spin_loop();
        if tries >= SLEEP_AFTER_TRIES {
            std::thread::yield_now();
        }
    }
}
