//! Cache invalidation ("busting").
//!
//! A [`CacheBuster`] is a broadcast channel without payload. Every call site subscribes to the
//! process-wide [`global_cache_buster`] and optionally to one buster of its own. A notification
//! synchronously empties the cache and pending tables of all live subscribers before
//! [`CacheBuster::notify`] returns.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

/// Something that can be invalidated by a [`CacheBuster`].
pub trait Bust: Send + Sync {
    fn bust(&self);
}

static GLOBAL_CACHE_BUSTER: LazyLock<CacheBuster> = LazyLock::new(CacheBuster::new);

/// The process-wide buster that every call site subscribes to by default.
pub fn global_cache_buster() -> &'static CacheBuster {
    &GLOBAL_CACHE_BUSTER
}

/// A broadcast channel that invalidates its subscribers.
///
/// Clones share their subscribers. Subscriptions are weak: a dropped call site is pruned on the
/// next notification and never has to unsubscribe.
#[derive(Clone, Default)]
pub struct CacheBuster {
    subscribers: Arc<Mutex<Vec<Weak<dyn Bust>>>>,
}

impl CacheBuster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Weak<dyn Bust>) {
        self.subscribers.lock().push(subscriber);
    }

    /// Busts all live subscribers, returning how many were notified.
    pub fn notify(&self) -> usize {
        let live: Vec<_> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|subscriber| subscriber.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        for subscriber in &live {
            subscriber.bust();
        }
        live.len()
    }

    /// The number of subscribers that are still alive.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|subscriber| subscriber.strong_count() > 0)
            .count()
    }

    /// Whether `self` and `other` are the same channel.
    pub fn same_channel(&self, other: &CacheBuster) -> bool {
        Arc::ptr_eq(&self.subscribers, &other.subscribers)
    }

    /// Runs `operation` and notifies once it succeeds.
    ///
    /// Meant for operations that invalidate cached reads, such as saves. A failed operation
    /// does not bust.
    pub async fn bust_after<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let result = operation.await;
        if result.is_ok() {
            let notified = self.notify();
            tracing::debug!(notified, "Busted caches after successful operation");
        }
        result
    }

    /// Notifies immediately, then runs `operation`.
    pub async fn bust_before<F: Future>(&self, operation: F) -> F::Output {
        let notified = self.notify();
        tracing::debug!(notified, "Busted caches ahead of operation");
        operation.await
    }
}

impl fmt::Debug for CacheBuster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
