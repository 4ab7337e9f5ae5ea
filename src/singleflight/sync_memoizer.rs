//! Single-flight memoization for a blocking producer function.
//!
//! Exactly one caller per key runs the producer; concurrent callers for
//! the same key block on a condition variable and receive a clone of the
//! same outcome. Failures are never cached, so the next caller after a
//! failure re-attempts the producer fresh.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cache::Cache;
use crate::config::MemoizeBuilder;
use crate::error::SingleFlightError;
use crate::singleflight::key::CacheKey;

struct Flight<V, E> {
    outcome: Mutex<Option<Result<V, SingleFlightError<E>>>>,
    cv: Condvar,
}

impl<V, E> Flight<V, E> {
    fn new() -> Self {
        Self { outcome: Mutex::new(None), cv: Condvar::new() }
    }
}

/// Settles a flight and removes it from the inflight table when dropped
/// while the leader's producer call did not complete normally — a panic
/// unwinding through `call` takes this path, so waiting followers are
/// released with [`SingleFlightError::Cancelled`] instead of blocking
/// forever.
struct LeaderGuard<'a, V, E> {
    flight: &'a Flight<V, E>,
    inflight: &'a Mutex<HashMap<u64, Arc<Flight<V, E>>>>,
    key: u64,
    completed: Cell<bool>,
}

impl<V, E> Drop for LeaderGuard<'_, V, E> {
    fn drop(&mut self) {
        if self.completed.get() {
            return;
        }
        *self.flight.outcome.lock() = Some(Err(SingleFlightError::Cancelled));
        self.flight.cv.notify_all();
        self.inflight.lock().remove(&self.key);
    }
}

/// A memoized blocking producer, built by [`memoize`].
pub struct SyncMemoizer<A, V, E, F>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<u64, V>,
    inflight: Mutex<HashMap<u64, Arc<Flight<V, E>>>>,
    typed: bool,
    key_fn: Option<Arc<dyn Fn(&A) -> u64 + Send + Sync>>,
    ttl: Option<std::time::Duration>,
    producer: F,
}

/// Builds a memoized wrapper around `producer`, deduplicating concurrent
/// calls for the same derived key.
pub fn memoize<A, V, E, F>(builder: MemoizeBuilder<A>, producer: F) -> SyncMemoizer<A, V, E, F>
where
    A: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: Fn(A) -> Result<V, E>,
{
    SyncMemoizer {
        cache: Cache::<u64, V>::builder(builder.capacity).nolock(builder.nolock).build(),
        inflight: Mutex::new(HashMap::new()),
        typed: builder.typed,
        key_fn: builder.key_fn,
        ttl: builder.ttl,
        producer,
    }
}

impl<A, V, E, F> SyncMemoizer<A, V, E, F>
where
    A: CacheKey,
    V: Clone + Send + Sync + 'static,
    E: Clone,
    F: Fn(A) -> Result<V, E>,
{
    fn derive_key(&self, args: &A) -> u64 {
        match &self.key_fn {
            Some(f) => f(args),
            None => args.cache_key(self.typed),
        }
    }

    /// Computes (or waits for, or returns the cached value for) `args`.
    pub fn call(&self, args: A) -> Result<V, SingleFlightError<E>> {
        let key = self.derive_key(&args);

        let (value, hit) = self.cache.get(&key);
        if hit {
            return Ok(value.expect("hit implies a value"));
        }

        let (flight, is_leader) = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                (existing.clone(), false)
            } else {
                // Recheck under the inflight lock: the leader for this key
                // may have finished and cached its result between our miss
                // above and acquiring this lock. Without this recheck we'd
                // wrongly claim leadership and re-invoke the producer.
                let (value, hit) = self.cache.get(&key);
                if hit {
                    return Ok(value.expect("hit implies a value"));
                }
                let flight = Arc::new(Flight::new());
                inflight.insert(key, flight.clone());
                (flight, true)
            }
        };

        if is_leader {
            let guard = LeaderGuard {
                flight: &flight,
                inflight: &self.inflight,
                key,
                completed: Cell::new(false),
            };

            let result = (self.producer)(args).map_err(SingleFlightError::ProducerFailed);
            *guard.flight.outcome.lock() = Some(result.clone());
            guard.flight.cv.notify_all();
            self.inflight.lock().remove(&key);
            guard.completed.set(true);

            if let Ok(v) = &result {
                let _ = self.cache.set_with_ttl(key, v.clone(), self.ttl);
            }
            result
        } else {
            let mut outcome = flight.outcome.lock();
            while outcome.is_none() {
                flight.cv.wait(&mut outcome);
            }
            outcome.clone().expect("loop exits only once set")
        }
    }
}
