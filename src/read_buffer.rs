//! A striped, lossy ring buffer of "this fingerprint was just read" events.
//!
//! Reads must never block on the policy lock, so recording an access is
//! best-effort: pick a random stripe, try its lock, and drop the sample if
//! the stripe is contended or already full. A stripe that fills up on
//! successful insert is drained and handed back to the caller to apply to
//! the policy.

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::hash::next_pow2;

const STRIPE_CAPACITY: usize = 16;

struct Stripe {
    buf: Mutex<Vec<u64>>,
}

impl Stripe {
    fn new() -> Self {
        Self { buf: Mutex::new(Vec::with_capacity(STRIPE_CAPACITY)) }
    }
}

/// A per-CPU striped read buffer feeding the policy access events.
pub struct ReadBuffer {
    stripes: Vec<Stripe>,
    rng: Mutex<SmallRng>,
}

impl ReadBuffer {
    /// Builds `4 * next_pow2(num_cpus)` stripes.
    pub fn new() -> Self {
        Self::with_cpus(num_cpus::get().max(1))
    }

    pub fn with_cpus(cpus: usize) -> Self {
        let count = 4 * next_pow2(cpus.max(1));
        Self {
            stripes: (0..count).map(|_| Stripe::new()).collect(),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Records a read of `fp`. Returns a drained batch if recording filled
    /// the chosen stripe; returns `None` if the sample was dropped (lock
    /// contention or a full stripe) or simply buffered without overflow.
    pub fn record(&self, fp: u64) -> Option<Vec<u64>> {
        let idx = self.rng.lock().gen_range(0..self.stripes.len());
        let stripe = &self.stripes[idx];

        let mut buf = stripe.buf.try_lock()?;
        Self::push_and_maybe_drain(&mut buf, fp)
    }

    /// Like [`Self::record`], but blocks for the stripe lock instead of
    /// dropping the sample on contention. Used in `nolock` mode, where
    /// losing access-frequency information is considered worse than
    /// briefly blocking a single-threaded caller.
    pub fn record_blocking(&self, fp: u64) -> Option<Vec<u64>> {
        let idx = self.rng.lock().gen_range(0..self.stripes.len());
        let stripe = &self.stripes[idx];

        let mut buf = stripe.buf.lock();
        Self::push_and_maybe_drain(&mut buf, fp)
    }

    fn push_and_maybe_drain(buf: &mut Vec<u64>, fp: u64) -> Option<Vec<u64>> {
        if buf.len() >= STRIPE_CAPACITY {
            return None;
        }
        buf.push(fp);
        if buf.len() >= STRIPE_CAPACITY {
            Some(std::mem::replace(buf, Vec::with_capacity(STRIPE_CAPACITY)))
        } else {
            None
        }
    }

    /// Drains every stripe regardless of fill level. Used by maintenance
    /// and `force_drain` so accumulated-but-not-yet-full samples are not
    /// lost indefinitely.
    pub fn drain_all(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for stripe in &self.stripes {
            let mut buf = stripe.buf.lock();
            out.append(&mut buf);
        }
        out
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_count_scales_with_cpus() {
        let rb = ReadBuffer::with_cpus(1);
        assert_eq!(rb.stripe_count(), 4);
        let rb = ReadBuffer::with_cpus(5);
        assert_eq!(rb.stripe_count(), 32);
    }

    #[test]
    fn filling_a_single_stripe_eventually_drains() {
        let rb = ReadBuffer::with_cpus(1); // 4 stripes, so collisions are likely
        let mut drained_total = 0;
        for i in 0..10_000u64 {
            if let Some(batch) = rb.record(i) {
                drained_total += batch.len();
            }
        }
        let remaining = rb.drain_all();
        assert_eq!(drained_total + remaining.len() > 0, true);
    }

    #[test]
    fn drain_all_empties_every_stripe() {
        let rb = ReadBuffer::with_cpus(2);
        for i in 0..5u64 {
            rb.record(i);
        }
        let drained = rb.drain_all();
        assert!(drained.len() <= 5);
        assert_eq!(rb.drain_all().len(), 0);
    }
}
