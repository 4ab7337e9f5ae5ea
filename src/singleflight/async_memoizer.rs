//! Single-flight memoization for an async producer.
//!
//! Mirrors [`crate::singleflight::sync_memoizer`], but followers suspend
//! on a [`tokio::sync::Notify`] instead of blocking an OS thread, and the
//! leader awaits the producer's future rather than calling a blocking
//! function. A failed producer invalidates nothing (nothing was ever
//! cached), so the next caller re-attempts from scratch — the same
//! effective behavior as invalidating a cached pending future.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cache::Cache;
use crate::config::MemoizeBuilder;
use crate::error::SingleFlightError;
use crate::singleflight::key::CacheKey;

struct Flight<V, E> {
    outcome: Mutex<Option<Result<V, SingleFlightError<E>>>>,
    notify: Notify,
}

impl<V, E> Flight<V, E> {
    fn new() -> Self {
        Self { outcome: Mutex::new(None), notify: Notify::new() }
    }
}

/// Settles a flight and removes it from the inflight table when dropped
/// before the leader's producer future completes — covers both a panic
/// unwinding through `call` and the future itself being dropped (the
/// calling task cancelled or timed out). The guard's `Drop` runs
/// synchronously either way, which is why `outcome` and `inflight` use a
/// plain [`parking_lot::Mutex`] rather than an async one.
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
        self.flight.notify.notify_waiters();
        self.inflight.lock().remove(&self.key);
    }
}

/// A memoized async producer, built by [`memoize_async`].
pub struct AsyncMemoizer<A, V, E, F>
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

/// Builds a memoized wrapper around an async `producer`.
pub fn memoize_async<A, V, E, F, Fut>(
    builder: MemoizeBuilder<A>,
    producer: F,
) -> AsyncMemoizer<A, V, E, F>
where
    A: CacheKey,
    V: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    AsyncMemoizer {
        cache: Cache::<u64, V>::builder(builder.capacity).nolock(builder.nolock).build(),
        inflight: Mutex::new(HashMap::new()),
        typed: builder.typed,
        key_fn: builder.key_fn,
        ttl: builder.ttl,
        producer,
    }
}

impl<A, V, E, F, Fut> AsyncMemoizer<A, V, E, F>
where
    A: CacheKey,
    V: Clone + Send + Sync + 'static,
    E: Clone,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    fn derive_key(&self, args: &A) -> u64 {
        match &self.key_fn {
            Some(f) => f(args),
            None => args.cache_key(self.typed),
        }
    }

    /// Computes (or awaits, or returns the cached value for) `args`.
    pub async fn call(&self, args: A) -> Result<V, SingleFlightError<E>> {
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

            let result =
                (self.producer)(args).await.map_err(SingleFlightError::ProducerFailed);
            *guard.flight.outcome.lock() = Some(result.clone());
            guard.flight.notify.notify_waiters();
            self.inflight.lock().remove(&key);
            guard.completed.set(true);

            if let Ok(v) = &result {
                let _ = self.cache.set_with_ttl(key, v.clone(), self.ttl);
            }
            result
        } else {
            loop {
                {
                    let outcome = flight.outcome.lock();
                    if let Some(result) = outcome.clone() {
                        return result;
                    }
                }
                flight.notify.notified().await;
            }
        }
    }
}
