//! Call-result memoization for asynchronous producers.
//!
//! A [`Memoizer`](caching::Memoizer) wraps a producer function and returns previously computed
//! results for equivalent arguments instead of invoking the producer again. Concurrent calls
//! with equivalent arguments are coalesced onto a single invocation.
//!
//! See the [`caching`] module for the lookup algorithm and its policies.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;


#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;

pub use caching::{
    Arguments, CacheBuster, CacheConfig, CachePolicy, CallError, Memoizer, NormalizedArgs,
    Producer, global_cache_buster,
};
