use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::arguments::NormalizedArgs;
use super::resolver::CacheResolver;
use crate::utils::clock;

/// A completed call: its normalized arguments, its result and when it was stored.
///
/// `created_at` is only set when the call site has a `max_age`; pairs without it never expire
/// by age.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachePair<T> {
    pub parameters: NormalizedArgs,
    pub result: T,
    pub created_at: Option<DateTime<Utc>>,
}

/// Outcome of [`CacheTable::lookup`].
#[derive(Debug, PartialEq)]
pub enum Lookup<T> {
    /// A live pair matched. `renewed` is set when sliding expiration refreshed its timestamp.
    Hit { result: T, renewed: bool },
    /// A pair matched but was older than `max_age` and has been removed.
    Expired,
    Miss,
}

/// The completed calls of one call site, oldest first.
#[derive(Debug)]
pub struct CacheTable<T> {
    pairs: VecDeque<CachePair<T>>,
    max_count: Option<NonZeroUsize>,
}

impl<T> CacheTable<T> {
    pub fn new(max_count: Option<NonZeroUsize>) -> Self {
        Self {
            pairs: VecDeque::new(),
            max_count,
        }
    }

    fn position(&self, resolver: &dyn CacheResolver, args: &NormalizedArgs) -> Option<usize> {
        self.pairs
            .iter()
            .position(|pair| resolver.resolve(&pair.parameters, args))
    }

    /// Returns the first pair that `resolver` considers equivalent to `args`.
    pub fn find(&self, resolver: &dyn CacheResolver, args: &NormalizedArgs) -> Option<&CachePair<T>> {
        self.position(resolver, args).map(|index| &self.pairs[index])
    }

    /// Looks up `args`, expiring the matched pair lazily.
    ///
    /// A pair older than `max_age` is removed and reported as [`Lookup::Expired`]. With
    /// `sliding` set, a live pair has its timestamp reset to now.
    pub fn lookup(
        &mut self,
        resolver: &dyn CacheResolver,
        args: &NormalizedArgs,
        max_age: Option<Duration>,
        sliding: bool,
    ) -> Lookup<T>
    where
        T: Clone,
    {
        let Some(index) = self.position(resolver, args) else {
            return Lookup::Miss;
        };

        let mut renewed = false;
        if let (Some(max_age), Some(created_at)) = (max_age, self.pairs[index].created_at) {
            if clock::age(created_at) > max_age {
                self.pairs.remove(index);
                return Lookup::Expired;
            }
            if sliding {
                self.pairs[index].created_at = Some(clock::now());
                renewed = true;
            }
        }

        Lookup::Hit {
            result: self.pairs[index].result.clone(),
            renewed,
        }
    }

    /// Appends `pair`, making room for it first.
    ///
    /// Pairs already equivalent to the new one are dropped. Then the oldest pairs are evicted
    /// until the table holds fewer than `max_count` entries; without a `max_count` only a single
    /// pair is retained. Returns the number of pairs evicted for capacity; replaced equivalent
    /// pairs are not counted.
    pub fn insert(&mut self, resolver: &dyn CacheResolver, pair: CachePair<T>) -> usize {
        self.pairs
            .retain(|existing| !resolver.resolve(&existing.parameters, &pair.parameters));

        let limit = self.max_count.map_or(1, NonZeroUsize::get);
        let mut evicted = 0;
        while self.pairs.len() >= limit {
            self.pairs.pop_front();
            evicted += 1;
        }

        self.pairs.push_back(pair);
        evicted
    }

    /// Removes the first pair equivalent to `args`.
    pub fn remove(
        &mut self,
        resolver: &dyn CacheResolver,
        args: &NormalizedArgs,
    ) -> Option<CachePair<T>> {
        let index = self.position(resolver, args)?;
        self.pairs.remove(index)
    }

    /// Replaces the contents with `pairs`, e.g. rehydrated from a persistence store.
    pub fn replace(&mut self, pairs: Vec<CachePair<T>>) {
        self.pairs = pairs.into();
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn pairs(&self) -> &VecDeque<CachePair<T>> {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A call whose producer has not settled yet.
#[derive(Debug)]
pub struct PendingPair<H> {
    id: u64,
    pub parameters: NormalizedArgs,
    pub handle: H,
    pub created_at: DateTime<Utc>,
}

/// The in-flight calls of one call site.
///
/// Entries are identified by an id handed out on registration, so a settling call removes its
/// own entry even if an equivalent one was registered after a bust.
#[derive(Debug)]
pub struct PendingTable<H> {
    pairs: Vec<PendingPair<H>>,
    next_id: u64,
}

impl<H> Default for PendingTable<H> {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            next_id: 0,
        }
    }
}

impl<H> PendingTable<H> {
    pub fn register(&mut self, parameters: NormalizedArgs, handle: H) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pairs.push(PendingPair {
            id,
            parameters,
            handle,
            created_at: clock::now(),
        });
        id
    }

    pub fn find(&self, resolver: &dyn CacheResolver, args: &NormalizedArgs) -> Option<&H> {
        self.pairs
            .iter()
            .find(|pair| resolver.resolve(&pair.parameters, args))
            .map(|pair| &pair.handle)
    }

    /// Removes the entry registered under `id`, returning whether it was still present.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|pair| pair.id != id);
        self.pairs.len() != before
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
