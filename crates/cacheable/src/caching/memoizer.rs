use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::arguments::{ArgumentNormalizer, Arguments, NormalizedArgs};
use super::buster::Bust;
use super::config::{CacheConfig, CachePolicy, ShouldCache};
use super::error::CallError;
use super::persistence::Mirror;
use super::resolver::CacheResolver;
use super::table::{CachePair, CacheTable, Lookup, PendingTable};
use crate::utils::clock;
use crate::utils::futures::CallOnDrop;

/// The asynchronous function whose results are memoized.
///
/// Implemented for every `Fn(NormalizedArgs) -> impl Future<Output = Result<T, E>>`. Both the
/// value and the error are handed to every caller coalesced onto an invocation, so both need
/// to be [`Clone`].
pub trait Producer: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;
    type Error: Clone + Send + Sync + 'static;
    type Future: Future<Output = Result<Self::Output, Self::Error>> + Send + 'static;

    fn produce(&self, args: NormalizedArgs) -> Self::Future;

    /// Returns a future resolving once the output is final, for outputs that keep being filled in
    /// after the producer's future resolved.
    ///
    /// Such outputs are handed to callers as soon as the future resolves. The invocation stays
    /// joinable until the returned future completes, and the output is only stored if it resolves
    /// to `true`. The default treats every output as final.
    fn settled(&self, _output: &Self::Output) -> Option<BoxFuture<'static, bool>> {
        None
    }
}

impl<F, Fut, T, E> Producer for F
where
    F: Fn(NormalizedArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Output = T;
    type Error = E;
    type Future = Fut;

    fn produce(&self, args: NormalizedArgs) -> Self::Future {
        self(args)
    }
}

/// The result of a [`Memoizer::call`].
pub type CallResult<P> = Result<<P as Producer>::Output, CallError<<P as Producer>::Error>>;

type InFlight<T, E> = Shared<oneshot::Receiver<Result<T, E>>>;

struct State<T, E> {
    cache: CacheTable<T>,
    pending: PendingTable<InFlight<T, E>>,
}

struct Inner<P: Producer> {
    name: String,
    producer: P,
    normalizer: ArgumentNormalizer,
    resolver: Arc<dyn CacheResolver>,
    should_cache: Option<ShouldCache<P::Output>>,
    policy: CachePolicy,
    mirror: Option<Arc<dyn Mirror<P::Output>>>,
    state: Mutex<State<P::Output, P::Error>>,
}

/// Memoizes the results of a [`Producer`] for one call site.
///
/// Every call is resolved synchronously against the call site's tables:
///
/// 1. The arguments are normalized using the declared defaults.
/// 2. A stored result for equivalent arguments is returned if it has not expired. With
///    persistence configured, the stored results are read from the store first.
/// 3. Otherwise a running invocation for equivalent arguments is joined.
/// 4. Otherwise the producer is invoked and its future spawned on the tokio runtime. Once it
///    settles with a value that passes the should-cache decider, the value is stored.
///
/// Cloning a `Memoizer` yields another handle to the same call site.
pub struct Memoizer<P: Producer> {
    inner: Arc<Inner<P>>,
}

impl<P: Producer> Clone for Memoizer<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Producer> Memoizer<P> {
    /// Creates a call site and subscribes it to the configured busters.
    pub fn new(config: CacheConfig<P::Output>, producer: P) -> Self {
        let name = config.cache_name().to_owned();
        let CacheConfig {
            policy,
            resolver,
            should_cache,
            cache_buster,
            global_buster,
            mirror,
            defaults,
        } = config;

        let inner = Arc::new(Inner {
            name,
            producer,
            normalizer: ArgumentNormalizer::new(defaults),
            resolver,
            should_cache,
            state: Mutex::new(State {
                cache: CacheTable::new(policy.max_cache_count),
                pending: PendingTable::default(),
            }),
            policy,
            mirror,
        });

        let weak: Weak<Inner<P>> = Arc::downgrade(&inner);
        let subscriber: Weak<dyn Bust> = weak;
        global_buster.subscribe(subscriber.clone());
        if let Some(buster) = cache_buster {
            buster.subscribe(subscriber);
        }

        Self { inner }
    }

    /// The name used in logs, metrics and the persistence store.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// The number of results currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    /// The number of invocations that can still be joined.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Forgets all stored results and running invocations of this call site only.
    pub fn bust(&self) {
        self.inner.bust();
    }

    /// Resolves a call with `args`.
    ///
    /// Lookup, coalescing and the producer invocation all happen before this returns, so two
    /// calls issued back to back share one invocation even if neither future has been polled.
    /// The producer runs to completion even if the returned future is dropped.
    ///
    /// # Panics
    ///
    /// Invoking the producer spawns a task, which panics outside of a tokio runtime.
    pub fn call(&self, args: impl Into<Arguments>) -> BoxFuture<'static, CallResult<P>> {
        let inner = &self.inner;
        let args = inner.normalizer.normalize(args.into());
        let persisted = inner.mirror.as_ref().map(|mirror| mirror.load(&inner.name));
        let mut state = inner.state.lock();

        if let Some(result) = inner.lookup(&mut state, &args, persisted) {
            drop(state);
            metric!(counter("memoize.hit") += 1, "cache" => &inner.name);
            tracing::trace!(cache = %inner.name, "Serving stored result");

            if inner.policy.async_delivery {
                return async move {
                    tokio::task::yield_now().await;
                    Ok(result)
                }
                .boxed();
            }
            return future::ready(Ok(result)).boxed();
        }

        if let Some(in_flight) = state.pending.find(&*inner.resolver, &args) {
            let in_flight = in_flight.clone();
            drop(state);
            metric!(counter("memoize.coalesced") += 1, "cache" => &inner.name);
            tracing::trace!(cache = %inner.name, "Joining running invocation");
            return settle(in_flight, inner.name.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let in_flight = receiver.shared();
        let id = state.pending.register(args.clone(), in_flight.clone());
        drop(state);

        metric!(counter("memoize.miss") += 1, "cache" => &inner.name);
        tracing::trace!(cache = %inner.name, "Invoking producer");

        // Also fires if the producer panics, so a failed invocation never blocks retries.
        let remove_pending_token = {
            let inner = Arc::clone(inner);
            CallOnDrop::new(move || {
                inner.state.lock().pending.remove(id);
            })
        };

        let computation = inner.producer.produce(args.clone());
        let task = {
            let inner = Arc::clone(inner);
            async move {
                let result = computation.await;
                let settled = result
                    .as_ref()
                    .ok()
                    .and_then(|value| inner.producer.settled(value));
                let sender = match settled {
                    Some(settled) => {
                        // Outputs that are still filling in are handed out right away.
                        sender.send(result.clone()).ok();
                        if !settled.await {
                            return;
                        }
                        None
                    }
                    None => Some(sender),
                };

                if let Ok(value) = &result {
                    inner.store(args, value);
                }

                drop(remove_pending_token);
                // Every caller may have gone away, which is fine.
                if let Some(sender) = sender {
                    sender.send(result).ok();
                }
            }
        };
        tokio::spawn(task);

        settle(in_flight, inner.name.clone())
    }
}

impl<P: Producer> Inner<P> {
    /// Finds a live stored result for `args`.
    ///
    /// `persisted` is what the mirror held when the call started, if one is configured. It
    /// replaces the in-memory table.
    fn lookup(
        &self,
        state: &mut State<P::Output, P::Error>,
        args: &NormalizedArgs,
        persisted: Option<Option<Vec<CachePair<P::Output>>>>,
    ) -> Option<P::Output> {
        match persisted {
            Some(Some(pairs)) => state.cache.replace(pairs),
            Some(None) => {
                state.cache.clear();
                return None;
            }
            None => {}
        }

        let max_age = self.policy.max_age;
        let sliding = self.policy.sliding_expiration;
        match state.cache.lookup(&*self.resolver, args, max_age, sliding) {
            Lookup::Hit { result, renewed } => {
                if renewed {
                    self.save(&state.cache);
                }
                Some(result)
            }
            Lookup::Expired => {
                metric!(counter("memoize.expired") += 1, "cache" => &self.name);
                tracing::debug!(cache = %self.name, "Discarding expired result");
                self.save(&state.cache);
                None
            }
            Lookup::Miss => None,
        }
    }

    /// Stores a successfully produced `value` unless the decider rejects it.
    ///
    /// This happens even if the call site was busted while the invocation ran; the bust only
    /// kept later calls from joining it.
    fn store(&self, parameters: NormalizedArgs, value: &P::Output) {
        if let Some(should_cache) = &self.should_cache
            && !should_cache(value)
        {
            tracing::trace!(cache = %self.name, "Result rejected by should-cache decider");
            return;
        }

        let mut state = self.state.lock();
        let pair = CachePair {
            parameters,
            result: value.clone(),
            created_at: self.policy.max_age.map(|_| clock::now()),
        };
        let evicted = state.cache.insert(&*self.resolver, pair);
        if evicted > 0 {
            metric!(counter("memoize.evicted") += evicted as i64, "cache" => &self.name);
            tracing::debug!(cache = %self.name, evicted, "Evicted stored results");
        }
        self.save(&state.cache);
    }

    fn save(&self, cache: &CacheTable<P::Output>) {
        if let Some(mirror) = &self.mirror {
            mirror.save(&self.name, cache.pairs());
        }
    }
}

impl<P: Producer> Bust for Inner<P> {
    fn bust(&self) {
        let mut state = self.state.lock();
        state.cache.clear();
        state.pending.clear();
        if let Some(mirror) = &self.mirror {
            mirror.clear(&self.name);
        }
        drop(state);

        metric!(counter("memoize.bust") += 1, "cache" => &self.name);
        tracing::debug!(cache = %self.name, "Busted cache");
    }
}

/// Waits for an invocation to settle.
fn settle<T, E>(in_flight: InFlight<T, E>, name: String) -> BoxFuture<'static, Result<T, CallError<E>>>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async move {
        match in_flight.await {
            Ok(result) => result.map_err(CallError::Producer),
            Err(oneshot::Canceled) => Err(CallError::Cancelled(name)),
        }
    }
    .boxed()
}

impl<P: Producer> fmt::Debug for Memoizer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Memoizer")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("cached", &state.cache.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}
