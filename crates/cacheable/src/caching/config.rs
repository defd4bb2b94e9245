use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::buster::{CacheBuster, global_cache_buster};
use super::persistence::{DEFAULT_CACHE_NAME, JsonMirror, Mirror, PersistenceStore};
use super::resolver::{CacheResolver, HashResolver, StructuralResolver};

/// The declarative part of a call site's configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Results older than this are discarded on their next lookup.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// Every hit resets the age of the matched result.
    pub sliding_expiration: bool,
    /// How many results with distinct arguments are kept. Unset keeps only the latest one.
    pub max_cache_count: Option<NonZeroUsize>,
    /// Defers delivery of cached results by one scheduler tick.
    #[serde(rename = "async")]
    pub async_delivery: bool,
    /// Compares arguments with [`HashResolver`] instead of [`StructuralResolver`].
    pub hash: bool,
    /// Identifies the call site in logs, metrics and the persistence store.
    pub name: Option<String>,
}

/// Decides whether a successfully produced value is stored.
pub type ShouldCache<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// The complete configuration of a call site producing values of type `T`.
pub struct CacheConfig<T> {
    pub(crate) policy: CachePolicy,
    pub(crate) resolver: Arc<dyn CacheResolver>,
    pub(crate) should_cache: Option<ShouldCache<T>>,
    pub(crate) cache_buster: Option<CacheBuster>,
    pub(crate) global_buster: CacheBuster,
    pub(crate) mirror: Option<Arc<dyn Mirror<T>>>,
    pub(crate) defaults: Vec<Option<Value>>,
}

impl<T> Default for CacheConfig<T> {
    fn default() -> Self {
        Self::from_policy(CachePolicy::default())
    }
}

impl<T> CacheConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policy(policy: CachePolicy) -> Self {
        let resolver: Arc<dyn CacheResolver> = if policy.hash {
            Arc::new(HashResolver)
        } else {
            Arc::new(StructuralResolver)
        };

        Self {
            policy,
            resolver,
            should_cache: None,
            cache_buster: None,
            global_buster: global_cache_buster().clone(),
            mirror: None,
            defaults: Vec::new(),
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.policy.max_age = Some(max_age);
        self
    }

    pub fn sliding_expiration(mut self, sliding: bool) -> Self {
        self.policy.sliding_expiration = sliding;
        self
    }

    pub fn max_cache_count(mut self, count: NonZeroUsize) -> Self {
        self.policy.max_cache_count = Some(count);
        self
    }

    pub fn async_delivery(mut self, deferred: bool) -> Self {
        self.policy.async_delivery = deferred;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.policy.name = Some(name.into());
        self
    }

    /// Replaces the equivalence policy for arguments.
    pub fn resolver(mut self, resolver: impl CacheResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Only stores produced values for which `decider` returns `true`.
    pub fn should_cache(mut self, decider: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.should_cache = Some(Arc::new(decider));
        self
    }

    /// Subscribes the call site to `buster` in addition to the global one.
    pub fn cache_buster(mut self, buster: CacheBuster) -> Self {
        self.cache_buster = Some(buster);
        self
    }

    /// Replaces the process-wide buster with `buster`.
    pub fn global_buster(mut self, buster: CacheBuster) -> Self {
        self.global_buster = buster;
        self
    }

    /// Declares the default value of each parameter, by position.
    pub fn defaults(mut self, defaults: Vec<Option<Value>>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// The configured name, or [`DEFAULT_CACHE_NAME`].
    pub fn cache_name(&self) -> &str {
        self.policy.name.as_deref().unwrap_or(DEFAULT_CACHE_NAME)
    }
}

impl<T> CacheConfig<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Mirrors the call site's table into `store`, under the [cache name](Self::cache_name).
    pub fn persistence(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.mirror = Some(Arc::new(JsonMirror::new(store)));
        self
    }
}

impl<T> fmt::Debug for CacheConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("policy", &self.policy)
            .field("should_cache", &self.should_cache.is_some())
            .field("cache_buster", &self.cache_buster)
            .field("mirror", &self.mirror)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
