use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{self, FutureExt};
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::*;
use crate::test;

const LATENCY: Duration = Duration::from_millis(100);

/// A call site configuration isolated from the process-wide buster.
fn config() -> CacheConfig<Value> {
    CacheConfig::new().global_buster(CacheBuster::new())
}

/// A producer answering `{"payload": <first argument>}` after [`LATENCY`].
fn payload_producer(calls: Arc<AtomicUsize>) -> impl Producer<Output = Value, Error = String> {
    move |args: NormalizedArgs| {
        calls.fetch_add(1, Ordering::SeqCst);
        let payload = args.get(0).cloned().unwrap_or(Value::Null);
        async move {
            tokio::time::sleep(LATENCY).await;
            Ok::<_, String>(json!({ "payload": payload }))
        }
    }
}

fn counted(config: CacheConfig<Value>) -> (Memoizer<impl Producer<Output = Value, Error = String>>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let memoizer = Memoizer::new(config, payload_producer(Arc::clone(&calls)));
    (memoizer, calls)
}

fn invocations(calls: &AtomicUsize) -> usize {
    calls.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn test_sequential_calls_invoke_once() {
    test::setup();
    let (memoizer, calls) = counted(config());

    let first = memoizer.call("test").await.unwrap();
    assert_eq!(first, json!({ "payload": "test" }));

    let second = memoizer.call("test").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(invocations(&calls), 1);
    assert_eq!(memoizer.name(), DEFAULT_CACHE_NAME);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_are_coalesced() {
    test::setup();
    let (memoizer, calls) = counted(config());

    let requests: Vec<_> = (0..500).map(|_| memoizer.call("test")).collect();
    assert_eq!(invocations(&calls), 1);
    assert_eq!(memoizer.pending_len(), 1);

    let results = future::join_all(requests).await;
    for result in results {
        assert_eq!(result.unwrap(), json!({ "payload": "test" }));
    }
    assert_eq!(invocations(&calls), 1);
    assert_eq!(memoizer.pending_len(), 0);
    assert_eq!(memoizer.cached_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_call_still_completes() {
    test::setup();
    let (memoizer, calls) = counted(config());

    drop(memoizer.call("test"));
    tokio::time::sleep(LATENCY * 2).await;
    assert_eq!(memoizer.cached_len(), 1);

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_age() {
    test::setup();
    let (memoizer, calls) = counted(config().max_age(Duration::from_secs(1)));

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);

    tokio::time::advance(Duration::from_millis(999)).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sliding_expiration() {
    test::setup();
    let config = config()
        .max_age(Duration::from_secs(1))
        .sliding_expiration(true);
    let (memoizer, calls) = counted(config);

    memoizer.call("test").await.unwrap();
    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(900)).await;
        memoizer.call("test").await.unwrap();
    }
    assert_eq!(invocations(&calls), 1);

    tokio::time::advance(Duration::from_millis(1001)).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_default_keeps_latest_result_only() {
    test::setup();
    let (memoizer, calls) = counted(config());

    memoizer.call("test1").await.unwrap();
    memoizer.call("test2").await.unwrap();
    assert_eq!(memoizer.cached_len(), 1);

    memoizer.call("test2").await.unwrap();
    assert_eq!(invocations(&calls), 2);
    memoizer.call("test1").await.unwrap();
    assert_eq!(invocations(&calls), 3);
}

#[tokio::test(start_paused = true)]
async fn test_max_cache_count() {
    test::setup();
    let count = NonZeroUsize::new(5).unwrap();
    let (memoizer, calls) = counted(config().max_cache_count(count));

    let names = ["test1", "test2", "test3", "test4", "test5"];
    for name in names {
        memoizer.call(name).await.unwrap();
    }
    assert_eq!(invocations(&calls), 5);

    for name in names {
        let result = memoizer.call(name).await.unwrap();
        assert_eq!(result, json!({ "payload": name }));
    }
    assert_eq!(invocations(&calls), 5);

    memoizer.call("test6").await.unwrap();
    assert_eq!(invocations(&calls), 6);
    assert_eq!(memoizer.cached_len(), 5);

    memoizer.call("test1").await.unwrap();
    assert_eq!(invocations(&calls), 7);
}

#[tokio::test(start_paused = true)]
async fn test_should_cache_decider() {
    test::setup();
    let config = config()
        .max_cache_count(NonZeroUsize::new(2).unwrap())
        .should_cache(|result: &Value| result["payload"] != "volatile");
    let (memoizer, calls) = counted(config);

    memoizer.call("volatile").await.unwrap();
    memoizer.call("volatile").await.unwrap();
    assert_eq!(invocations(&calls), 2);

    memoizer.call("stable").await.unwrap();
    memoizer.call("stable").await.unwrap();
    assert_eq!(invocations(&calls), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = {
        let calls = Arc::clone(&calls);
        move |_: NormalizedArgs| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(LATENCY).await;
                match attempt {
                    0 => Err("backend unavailable".to_owned()),
                    _ => Ok(json!("recovered")),
                }
            }
        }
    };
    let memoizer = Memoizer::new(config(), producer);

    let first = memoizer.call("test");
    let joined = memoizer.call("test");
    let expected = CallError::Producer("backend unavailable".to_owned());
    assert_eq!(first.await.unwrap_err(), expected);
    assert_eq!(joined.await.unwrap_err(), expected);
    assert_eq!(memoizer.pending_len(), 0);
    assert_eq!(memoizer.cached_len(), 0);

    assert_eq!(memoizer.call("test").await.unwrap(), json!("recovered"));
    assert_eq!(memoizer.call("test").await.unwrap(), json!("recovered"));
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test]
async fn test_panicking_producer_is_cancelled() {
    test::setup();
    let producer = |_: NormalizedArgs| {
        future::ready(()).map(|()| -> Result<Value, String> { panic!("producer exploded") })
    };
    let memoizer = Memoizer::new(config().name("exploding"), producer);

    let err = memoizer.call(()).await.unwrap_err();
    assert_eq!(err, CallError::Cancelled("exploding".to_owned()));
    assert!(err.is_cancelled());
    assert_eq!(memoizer.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cache_buster_after_operation() {
    test::setup();
    let buster = CacheBuster::new();
    let (memoizer, calls) = counted(config().cache_buster(buster.clone()));

    memoizer.call("test").await.unwrap();
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);

    let saved: Result<(), &str> = buster.bust_after(async { Ok(()) }).await;
    saved.unwrap();
    assert_eq!(memoizer.cached_len(), 0);

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);

    let failed: Result<(), &str> = buster.bust_after(async { Err("rejected") }).await;
    assert!(failed.is_err());
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);

    buster.bust_before(async {}).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 3);
}

#[tokio::test(start_paused = true)]
async fn test_global_bust_reaches_every_call_site() {
    test::setup();
    let global = CacheBuster::new();
    let (users, user_calls) = counted(CacheConfig::new().global_buster(global.clone()));
    let (posts, post_calls) = counted(CacheConfig::new().global_buster(global.clone()));

    users.call("test").await.unwrap();
    posts.call("test").await.unwrap();
    assert_eq!(global.notify(), 2);

    users.call("test").await.unwrap();
    posts.call("test").await.unwrap();
    assert_eq!(invocations(&user_calls), 2);
    assert_eq!(invocations(&post_calls), 2);

    drop(posts);
    assert_eq!(global.notify(), 1);
}

#[tokio::test]
async fn test_subscribes_to_process_wide_buster() {
    test::setup();
    let (memoizer, calls) = counted(CacheConfig::new());

    memoizer.call("test").await.unwrap();
    assert_eq!(memoizer.cached_len(), 1);

    assert!(global_cache_buster().notify() >= 1);
    assert_eq!(memoizer.cached_len(), 0);

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_bust_during_invocation() {
    test::setup();
    let (memoizer, calls) = counted(config());

    let stale = memoizer.call("test");
    memoizer.bust();
    assert_eq!(memoizer.pending_len(), 0);

    let fresh = memoizer.call("test");
    assert_eq!(invocations(&calls), 2);

    // Callers holding the busted invocation still receive its result.
    assert_eq!(stale.await.unwrap(), json!({ "payload": "test" }));
    fresh.await.unwrap();
    assert_eq!(memoizer.cached_len(), 1);

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busted_invocation_still_stores_result() {
    test::setup();
    let (memoizer, calls) = counted(config());

    let busted = memoizer.call("test");
    memoizer.bust();
    busted.await.unwrap();
    assert_eq!(memoizer.cached_len(), 1);

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_omitted_arguments_use_defaults() {
    test::setup();
    let received = Arc::new(Mutex::new(Vec::new()));
    let producer = {
        let received = Arc::clone(&received);
        move |args: NormalizedArgs| {
            received.lock().push(args.clone());
            future::ready(Ok::<_, String>(Value::from(args.into_inner())))
        }
    };
    let config = config().defaults(vec![None, Some(json!("Parameter2"))]);
    let memoizer = Memoizer::new(config, producer);

    let result = memoizer.call(Arguments::new().arg("Parameter1")).await.unwrap();
    assert_eq!(result, json!(["Parameter1", "Parameter2"]));

    memoizer
        .call(Arguments::new().arg("Parameter1").omitted())
        .await
        .unwrap();
    memoizer
        .call(Arguments::new().arg("Parameter1").arg("Parameter2"))
        .await
        .unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].get_as::<String>(1).unwrap(), "Parameter2");
}

#[tokio::test(start_paused = true)]
async fn test_resolver_reroutes_to_latest_result() {
    test::setup();
    let straight_to_last = |old: &NormalizedArgs, new: &NormalizedArgs| {
        let reroute = new
            .get(1)
            .and_then(|options| options.get("straightToLastCache"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        reroute || old == new
    };
    let (memoizer, calls) = counted(config().resolver(straight_to_last));

    memoizer.call("test1").await.unwrap();
    memoizer.call("test2").await.unwrap();
    assert_eq!(invocations(&calls), 2);

    let args = Arguments::new()
        .arg("test3")
        .arg(json!({ "straightToLastCache": true }));
    let result = memoizer.call(args).await.unwrap();
    assert_eq!(result, json!({ "payload": "test2" }));
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_arguments_are_owned_by_the_cache() {
    test::setup();
    let (memoizer, calls) = counted(config());

    let mut user = json!({ "id": 1, "name": "alice" });
    memoizer.call(user.clone()).await.unwrap();
    user["name"] = json!("bob");

    memoizer.call(json!({ "id": 1, "name": "alice" })).await.unwrap();
    assert_eq!(invocations(&calls), 1);
    memoizer.call(user).await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_key_order_per_resolver() {
    test::setup();
    let first = json!({ "a": 1, "b": 2 });
    let reordered = json!({ "b": 2, "a": 1 });

    let (structural, structural_calls) = counted(config());
    structural.call(first.clone()).await.unwrap();
    structural.call(reordered.clone()).await.unwrap();
    assert_eq!(invocations(&structural_calls), 2);

    let policy = CachePolicy {
        hash: true,
        ..Default::default()
    };
    let config = CacheConfig::from_policy(policy).global_buster(CacheBuster::new());
    let (hashed, hashed_calls) = counted(config);
    hashed.call(first).await.unwrap();
    hashed.call(reordered).await.unwrap();
    assert_eq!(invocations(&hashed_calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_is_preferred() {
    test::setup();
    let store = MemoryStore::new();
    let (memoizer, calls) = counted(config().name("users").persistence(Arc::new(store.clone())));

    memoizer.call("test").await.unwrap();
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);
    assert!(store.get("users").unwrap().is_some());

    // Another call site reading the same store is served without invoking its producer.
    let (reader, reader_calls) = counted(config().name("users").persistence(Arc::new(store.clone())));
    let result = reader.call("test").await.unwrap();
    assert_eq!(result, json!({ "payload": "test" }));
    assert_eq!(invocations(&reader_calls), 0);

    // An emptied store misses even though the result is still held in memory.
    store.set("users", None).unwrap();
    assert_eq!(memoizer.cached_len(), 1);
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);

    memoizer.bust();
    assert_eq!(store.get("users").unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_persistence_is_a_miss() {
    test::setup();
    let store = MemoryStore::new();
    let (memoizer, calls) = counted(config().name("users").persistence(Arc::new(store.clone())));

    memoizer.call("test").await.unwrap();
    store.set("users", Some("{\"broken\":")).unwrap();

    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
    // The miss rewrote the store.
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persisted_expiry_survives_reload() {
    test::setup();
    let dir = test::tempdir();
    let store = Arc::new(FsStore::new(dir.path()).unwrap());
    let config = config()
        .name("users")
        .max_age(Duration::from_secs(1))
        .persistence(store.clone());
    let (memoizer, calls) = counted(config);

    memoizer.call("test").await.unwrap();
    tokio::time::advance(Duration::from_millis(500)).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);

    tokio::time::advance(Duration::from_millis(600)).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sliding_renewal_is_persisted() {
    test::setup();
    let dir = test::tempdir();
    let store = Arc::new(FsStore::new(dir.path()).unwrap());
    let users = || {
        config()
            .name("users")
            .max_age(Duration::from_secs(1))
            .sliding_expiration(true)
            .persistence(store.clone())
    };
    let (memoizer, calls) = counted(users());

    memoizer.call("test").await.unwrap();
    tokio::time::advance(Duration::from_millis(900)).await;
    memoizer.call("test").await.unwrap();
    assert_eq!(invocations(&calls), 1);

    // Past the original expiry, but within `max_age` of the renewal.
    tokio::time::advance(Duration::from_millis(900)).await;
    let (reader, reader_calls) = counted(users());
    let result = reader.call("test").await.unwrap();
    assert_eq!(result, json!({ "payload": "test" }));
    assert_eq!(invocations(&reader_calls), 0);
}

#[tokio::test(start_paused = true)]
async fn test_async_delivery_defers_hits() {
    test::setup();
    let (eager, _) = counted(config());
    eager.call("test").await.unwrap();
    assert!(eager.call("test").now_or_never().is_some());

    let (deferred, calls) = counted(config().async_delivery(true));
    deferred.call("test").await.unwrap();

    let mut hit = deferred.call("test");
    assert!((&mut hit).now_or_never().is_none());
    assert_eq!(hit.await.unwrap(), json!({ "payload": "test" }));
    assert_eq!(invocations(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replayed_streams() {
    test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = {
        let calls = Arc::clone(&calls);
        move |args: NormalizedArgs| {
            calls.fetch_add(1, Ordering::SeqCst);
            let prefix = args.get_as::<String>(0).unwrap_or_default();
            stream::iter(1..=3).then(move |index| {
                let prefix = prefix.clone();
                async move {
                    tokio::time::sleep(LATENCY).await;
                    Ok::<_, String>(format!("{prefix}{index}"))
                }
            })
        }
    };
    let memoizer = Memoizer::new(
        CacheConfig::new().global_buster(CacheBuster::new()),
        Replay(producer),
    );

    let first = memoizer.call_stream("item");
    let second = memoizer.call_stream("item");
    let (first, second) = futures::join!(first.collect::<Vec<_>>(), second.collect::<Vec<_>>());
    let expected = vec![
        Ok("item1".to_owned()),
        Ok("item2".to_owned()),
        Ok("item3".to_owned()),
    ];
    assert_eq!(first, expected);
    assert_eq!(second, expected);

    let late = memoizer.call("item").await.unwrap();
    assert_eq!(late.last().as_deref(), Some("item3"));
    let replayed: Vec<Result<String, String>> = late.stream().collect().await;
    assert_eq!(replayed, ["item1", "item2", "item3"].map(|item| Ok(item.to_owned())));
    assert_eq!(invocations(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_values_arrive_while_running() {
    test::setup();
    let producer = |_args: NormalizedArgs| {
        stream::iter([Ok::<_, String>("first")]).chain(stream::pending())
    };
    let memoizer = Memoizer::new(
        CacheConfig::new().global_buster(CacheBuster::new()),
        Replay(producer),
    );

    let mut running = memoizer.call_stream("item");
    let first = tokio::time::timeout(Duration::from_secs(5), running.next()).await;
    assert_eq!(first.unwrap(), Some(Ok("first")));

    // A subscriber joining later is handed everything emitted so far.
    let mut joined = memoizer.call_stream("item");
    let first = tokio::time::timeout(Duration::from_secs(5), joined.next()).await;
    assert_eq!(first.unwrap(), Some(Ok("first")));

    assert_eq!(memoizer.pending_len(), 1);
    assert_eq!(memoizer.cached_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_stream_is_delivered_but_not_cached() {
    test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = {
        let calls = Arc::clone(&calls);
        move |_args: NormalizedArgs| {
            calls.fetch_add(1, Ordering::SeqCst);
            stream::iter([Ok("partial"), Err("broken".to_owned())])
        }
    };
    let memoizer = Memoizer::new(
        CacheConfig::new().global_buster(CacheBuster::new()),
        Replay(producer),
    );

    let values = memoizer.call_stream("item").collect::<Vec<_>>().await;
    assert_eq!(
        values,
        [Ok("partial"), Err(CallError::Producer("broken".to_owned()))]
    );

    tokio::time::sleep(LATENCY).await;
    assert_eq!(memoizer.pending_len(), 0);
    assert_eq!(memoizer.cached_len(), 0);

    memoizer.call_stream("item").collect::<Vec<_>>().await;
    assert_eq!(invocations(&calls), 2);
}
