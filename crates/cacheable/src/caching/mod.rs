//! Memoization of asynchronous call results.
//!
//! Each memoized call site is a [`Memoizer`] owning two tables:
//!
//! - The *cache table* holds completed results together with the normalized arguments they were
//!   produced for. It is bounded by [`CachePolicy::max_cache_count`] (a single entry by default)
//!   and evicts its oldest entry first. With a [`CachePolicy::max_age`], entries expire lazily
//!   on their next lookup; [`CachePolicy::sliding_expiration`] renews them on every hit.
//! - The *pending table* holds invocations that have not settled yet. Equivalent calls that
//!   arrive in the meantime join the running invocation instead of starting another one.
//!
//! Whether two argument lists are equivalent is decided by a [`CacheResolver`]. Failed
//! invocations are never stored, and neither are values rejected by a should-cache decider.
//!
//! A call site can mirror its cache table into a [`PersistenceStore`], in which case the store
//! takes precedence over memory. [`CacheBuster`]s empty both tables (and the mirror) of every
//! subscribed call site.

mod arguments;
mod buster;
mod config;
mod error;
mod memoizer;
mod persistence;
mod replay;
mod resolver;
mod table;

#[cfg(test)]
mod tests;

pub use arguments::{ArgumentNormalizer, Arguments, NormalizedArgs};
pub use buster::{Bust, CacheBuster, global_cache_buster};
pub use config::{CacheConfig, CachePolicy, ShouldCache};
pub use error::CallError;
pub use memoizer::{CallResult, Memoizer, Producer};
pub use persistence::{DEFAULT_CACHE_NAME, FsStore, MemoryStore, PersistenceError, PersistenceStore};
pub use replay::{Replay, Replayed, StreamProducer, collect_stream};
pub use resolver::{CacheResolver, HashResolver, StructuralResolver};
pub use table::{CachePair, CacheTable, Lookup, PendingPair, PendingTable};
