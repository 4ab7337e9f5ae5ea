//! Single-flight memoization: deduplicate concurrent computations of the
//! same key, for both blocking and async producers.

mod async_memoizer;
mod key;
mod sync_memoizer;

pub use async_memoizer::{memoize_async, AsyncMemoizer};
pub use key::CacheKey;
pub use sync_memoizer::{memoize, SyncMemoizer};
