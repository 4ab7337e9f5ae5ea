//! A bounded, coalescing queue of pending policy writes.
//!
//! Unlike the read buffer, this one never drops a sample: `set`/`delete`
//! calls must eventually reach the policy so capacity and TTL stay
//! correct. Repeated writes for the same fingerprint coalesce into a
//! single staged record. A full buffer signals its caller to force a
//! drain; an application author otherwise drains opportunistically
//! whenever the policy lock happens to be free.

use parking_lot::Mutex;

/// Sentinel meaning "no TTL" in a staged `(fingerprint, ttl_ns)` record.
pub const NO_TTL: i64 = 0;
/// Sentinel meaning "delete this fingerprint" in a staged record.
pub const DELETE: i64 = -1;

const CAPACITY: usize = 16;

pub struct WriteBuffer {
    entries: Mutex<Vec<(u64, i64)>>,
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::with_capacity(CAPACITY)) }
    }

    /// Stages `(fp, ttl_ns)`, coalescing with any already-staged record for
    /// the same fingerprint. Returns `true` if the buffer is now at
    /// capacity and must be drained before another write is accepted.
    pub fn stage(&self, fp: u64, ttl_ns: i64) -> bool {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter_mut().find(|(f, _)| *f == fp) {
            existing.1 = ttl_ns;
        } else {
            entries.push((fp, ttl_ns));
        }
        entries.len() >= CAPACITY
    }

    /// Takes every staged record, leaving the buffer empty.
    pub fn take_all(&self) -> Vec<(u64, i64)> {
        let mut entries = self.entries.lock();
        std::mem::replace(&mut *entries, Vec::with_capacity(CAPACITY))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.lock().len() >= CAPACITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_writes_to_same_fingerprint_coalesce() {
        let wb = WriteBuffer::new();
        wb.stage(1, NO_TTL);
        wb.stage(1, 500);
        wb.stage(1, DELETE);
        assert_eq!(wb.len(), 1);
        assert_eq!(wb.take_all(), vec![(1, DELETE)]);
    }

    #[test]
    fn signals_full_at_capacity() {
        let wb = WriteBuffer::new();
        for fp in 0..(CAPACITY as u64 - 1) {
            assert!(!wb.stage(fp, NO_TTL));
        }
        assert!(wb.stage(999, NO_TTL));
    }

    #[test]
    fn take_all_empties_the_buffer() {
        let wb = WriteBuffer::new();
        wb.stage(1, NO_TTL);
        wb.stage(2, NO_TTL);
        assert_eq!(wb.take_all().len(), 2);
        assert!(wb.is_empty());
    }
}
