//! Error types for the cache and the single-flight memoizer.

use std::fmt;

/// Errors returned by the cache's public surface.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// `set` was called with a TTL of exactly zero, or a negative duration.
    ///
    /// Pass no TTL at all for "never expires"; pass a positive duration otherwise.
    #[error("invalid ttl: must be a positive duration (omit it for no expiration)")]
    InvalidTtl,
}

/// Errors returned by the single-flight memoizer.
///
/// `E` is the producer's own error type; it is delivered verbatim to every
/// waiter in the herd rather than erased to a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SingleFlightError<E> {
    /// The producer function returned an error (or, for the async variant,
    /// the producer future failed).
    #[error("producer failed: {0}")]
    ProducerFailed(E),
    /// The producer panicked, or its future was dropped before completing,
    /// while this caller was waiting on it as a follower.
    #[error("producer was cancelled or panicked before completing")]
    Cancelled,
}

impl<E: fmt::Debug> SingleFlightError<E> {
    /// Returns the producer's error, if this is a `ProducerFailed`.
    pub fn into_producer_error(self) -> Option<E> {
        match self {
            SingleFlightError::ProducerFailed(e) => Some(e),
            SingleFlightError::Cancelled => None,
        }
    }
}
