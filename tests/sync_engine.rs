//! End-to-end behaviour of the synchronizer: coalescing, epochs, timers,
//! mutations and callback re-entrancy, driven by fetchers the test controls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{advance, Duration};

use agentdash::{
    fetch_fn, CacheEntry, FetchDescriptor, FetchError, FetchStatus, Fetcher, KeyFilter, Mutation, ResourceCache,
    ResourceKey, Synchronizer,
};

type Reply = oneshot::Sender<Result<Value, FetchError>>;

/// Fetcher whose requests wait until the test answers them.
fn gated() -> (Arc<dyn Fetcher>, mpsc::UnboundedReceiver<(ResourceKey, Reply)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let fetcher = fetch_fn(move |key: ResourceKey| {
        let tx = tx.clone();
        async move {
            let (reply, answer) = oneshot::channel();
            tx.send((key, reply)).map_err(|_| FetchError::network("test harness gone"))?;
            answer.await.unwrap_or_else(|_| Err(FetchError::network("request dropped")))
        }
    });
    (fetcher, rx)
}

/// Fetcher answering immediately with the number of calls so far.
fn counting() -> (Arc<dyn Fetcher>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let fetcher = fetch_fn(move |_key: ResourceKey| {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(json!(n)) }
    });
    (fetcher, calls)
}

/// Fetcher replaying a fixed script of results, then repeating the last one.
fn scripted(results: Vec<Result<Value, FetchError>>) -> Arc<dyn Fetcher> {
    let script = Arc::new(Mutex::new(VecDeque::from(results)));
    fetch_fn(move |_key: ResourceKey| {
        let next = {
            let mut s = script.lock().unwrap();
            if s.len() > 1 {
                s.pop_front().unwrap()
            } else {
                s.front().cloned().unwrap()
            }
        };
        async move { next }
    })
}

fn recorder() -> (Arc<Mutex<Vec<CacheEntry>>>, impl Fn(&CacheEntry) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    (seen, move |e: &CacheEntry| s.lock().unwrap().push(e.clone()))
}

/// Let spawned fetch and trigger tasks run to completion.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn value_of(sync: &Synchronizer, key: &ResourceKey) -> Option<Value> {
    sync.cache().get(key).and_then(|e| e.value)
}

#[tokio::test]
async fn test_leads_go_from_idle_to_success() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let key = ResourceKey::new("leads");
    let (seen, cb) = recorder();

    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), cb);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].status, FetchStatus::Idle);
        assert!(seen[0].value.is_none());
        assert_eq!(seen.last().unwrap().status, FetchStatus::Loading);
    }

    let (requested, reply) = requests.recv().await.unwrap();
    assert_eq!(requested, key);
    reply.send(Ok(json!([{"id": 1, "company_name": "ACME"}]))).unwrap();
    settle().await;

    let entry = sync.cache().get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert_eq!(entry.value, Some(json!([{"id": 1, "company_name": "ACME"}])));
    assert!(entry.error.is_none());
    assert!(entry.updated_at.is_some());
    assert_eq!(seen.lock().unwrap().last().unwrap().status, FetchStatus::Success);
}

#[tokio::test]
async fn test_triggers_during_fetch_are_coalesced() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let key = ResourceKey::new("health");

    let sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), |_e: &CacheEntry| {});
    sync.refetch(&key);
    sub.refetch();
    sync.refetch(&key);
    settle().await;

    assert_eq!(sync.fetches_issued(), 1);
    assert!(sync.is_in_flight(&key));
    let (_, reply) = requests.recv().await.unwrap();
    assert!(requests.try_recv().is_err());

    reply.send(Ok(json!("up"))).unwrap();
    settle().await;
    assert!(!sync.is_in_flight(&key));
    // manual refetches asked during the fetch were satisfied by it
    assert_eq!(sync.fetches_issued(), 1);

    sync.refetch(&key);
    assert_eq!(sync.fetches_issued(), 2);
}

#[tokio::test]
async fn test_subscribers_share_one_fetch() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("metrics");
    let desc = FetchDescriptor::new(key.clone(), fetcher);
    let (seen_a, cb_a) = recorder();
    let (seen_b, cb_b) = recorder();

    let _a = sync.subscribe(desc.clone(), cb_a);
    let _b = sync.subscribe(desc, cb_b);
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sync.subscriber_count(&key), 2);
    for seen in [seen_a, seen_b] {
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.status, FetchStatus::Success);
        assert_eq!(last.value, Some(json!(1)));
    }
}

#[tokio::test]
async fn test_switching_user_discards_previous_answer() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let alice = ResourceKey::new("conversation").with_param("alice");
    let bob = ResourceKey::new("conversation").with_param("bob");
    let (seen, cb) = recorder();

    let mut sub = sync.subscribe(FetchDescriptor::new(alice.clone(), fetcher), cb);
    let (k1, reply_alice) = requests.recv().await.unwrap();
    assert_eq!(k1, alice);

    sub.switch_to(bob.clone());
    assert_eq!(sub.key(), &bob);
    let (k2, reply_bob) = requests.recv().await.unwrap();
    assert_eq!(k2, bob);

    reply_alice.send(Ok(json!(["hi from alice"]))).unwrap();
    settle().await;
    let bob_entry = sync.cache().get(&bob).unwrap();
    assert_eq!(bob_entry.status, FetchStatus::Loading);
    assert!(bob_entry.value.is_none());
    assert!(value_of(&sync, &alice).is_none());

    reply_bob.send(Ok(json!(["hi from bob"]))).unwrap();
    settle().await;
    assert_eq!(value_of(&sync, &bob), Some(json!(["hi from bob"])));
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|e| e.value != Some(json!(["hi from alice"]))));
    assert_eq!(sync.subscriber_count(&alice), 0);
    assert_eq!(sync.fetches_issued(), 2);
}

#[tokio::test]
async fn test_late_answer_for_old_user_does_not_land_on_new_user() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let alice = ResourceKey::new("conversation").with_param("alice");
    let bob = ResourceKey::new("conversation").with_param("bob");

    let mut sub = sync.subscribe(FetchDescriptor::new(alice.clone(), fetcher), |_e: &CacheEntry| {});
    let (_, reply_alice) = requests.recv().await.unwrap();
    sub.switch_to(bob.clone());
    let (_, reply_bob) = requests.recv().await.unwrap();

    reply_bob.send(Ok(json!("bob"))).unwrap();
    settle().await;
    reply_alice.send(Ok(json!("alice"))).unwrap();
    settle().await;

    assert_eq!(value_of(&sync, &bob), Some(json!("bob")));
    assert!(value_of(&sync, &alice).is_none());
}

#[tokio::test]
async fn test_invalidate_issues_exactly_one_fetch() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("agent-config");

    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), |_e: &CacheEntry| {});
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sync.invalidate(&KeyFilter::Exact(key.clone()));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let entry = sync.cache().get(&key).unwrap();
    assert_eq!(entry.value, Some(json!(2)));
    assert!(!entry.is_invalidated());
}

#[tokio::test]
async fn test_invalidate_during_fetch_reruns_once() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let key = ResourceKey::new("zapi-config");
    let (seen, cb) = recorder();

    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), cb);
    let (_, first) = requests.recv().await.unwrap();

    sync.invalidate(&KeyFilter::Name("zapi-config".into()));
    sync.invalidate(&KeyFilter::Exact(key.clone()));
    assert_eq!(sync.fetches_issued(), 1);

    first.send(Ok(json!("before save"))).unwrap();
    let (_, second) = requests.recv().await.unwrap();
    assert_eq!(sync.fetches_issued(), 2);
    second.send(Ok(json!("after save"))).unwrap();
    settle().await;

    assert!(requests.try_recv().is_err());
    assert_eq!(sync.fetches_issued(), 2);
    assert_eq!(value_of(&sync, &key), Some(json!("after save")));
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|e| e.value != Some(json!("before save"))));
}

#[tokio::test]
async fn test_mutation_refreshes_watched_dependent() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("agent-config");
    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), |_e: &CacheEntry| {});
    settle().await;

    let save = Mutation::new(
        ResourceKey::new("save-agent-config"),
        fetch_fn(|_k: ResourceKey| async { Ok(json!({"message": "saved"})) }),
    )
    .invalidates(key.clone());
    let result = sync.mutate(&save).await.unwrap();
    assert_eq!(result, json!({"message": "saved"}));

    // no caller action needed: the dependent is already being refetched
    assert!(sync.cache().get(&key).unwrap().is_loading());
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // mutation results are never cached
    assert!(sync.cache().get(&ResourceKey::new("save-agent-config")).is_none());
}

#[tokio::test]
async fn test_mutation_marks_unwatched_dependent_stale() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("test-conversation").with_param("5511999");
    let sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher.clone()), |_e: &CacheEntry| {});
    settle().await;
    drop(sub);

    let send = Mutation::new(
        ResourceKey::new("send-test-message"),
        fetch_fn(|_k: ResourceKey| async { Ok(json!({"phone": "5511999"})) }),
    )
    .invalidates(KeyFilter::Name("test-conversation".into()));
    sync.mutate(&send).await.unwrap();
    settle().await;

    assert!(sync.cache().get(&key).unwrap().is_invalidated());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let _again = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), |_e: &CacheEntry| {});
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_mutation_leaves_dependents_alone() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("test-config");
    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), |_e: &CacheEntry| {});
    settle().await;

    let save = Mutation::new(
        ResourceKey::new("save-test-config"),
        fetch_fn(|_k: ResourceKey| async { Err(FetchError::server(422, "typing_delay must be positive")) }),
    )
    .invalidates(key.clone());
    let err = sync.mutate(&save).await.unwrap_err();
    assert_eq!(err.message(), "typing_delay must be positive");
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!sync.cache().get(&key).unwrap().is_invalidated());
}

#[tokio::test(start_paused = true)]
async fn test_interval_stops_with_last_subscriber() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("health");
    let desc = FetchDescriptor::new(key.clone(), fetcher).every(Duration::from_secs(15));

    let a = sync.subscribe(desc.clone(), |_e: &CacheEntry| {});
    let b = sync.subscribe(desc, |_e: &CacheEntry| {});
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(sync.has_timer(&key));

    advance(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    drop(a);
    assert!(sync.has_timer(&key));
    advance(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    b.unsubscribe();
    assert!(!sync.has_timer(&key));
    for _ in 0..4 {
        advance(Duration::from_secs(15)).await;
        settle().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_health_error_keeps_value_until_next_tick() {
    let sync = Synchronizer::new(ResourceCache::new());
    let up = json!({"application": "healthy", "database": "healthy", "redis": "healthy"});
    let degraded = json!({"application": "healthy", "database": "healthy", "redis": "unhealthy"});
    let fetcher = scripted(vec![
        Ok(up.clone()),
        Err(FetchError::network("connection refused")),
        Ok(degraded.clone()),
    ]);
    let key = ResourceKey::new("health");
    let _sub = sync.subscribe(
        FetchDescriptor::new(key.clone(), fetcher).every(Duration::from_secs(15)),
        |_e: &CacheEntry| {},
    );
    settle().await;
    assert_eq!(value_of(&sync, &key), Some(up.clone()));

    advance(Duration::from_secs(15)).await;
    settle().await;
    let failed = sync.cache().get(&key).unwrap();
    assert_eq!(failed.status, FetchStatus::Error);
    assert_eq!(failed.value, Some(up));
    let err = failed.error.unwrap();
    assert_eq!(err.error_code(), "NETWORK_ERROR");
    assert_eq!(err.message(), "connection refused");

    advance(Duration::from_secs(15)).await;
    settle().await;
    let recovered = sync.cache().get(&key).unwrap();
    assert_eq!(recovered.status, FetchStatus::Success);
    assert_eq!(recovered.value, Some(degraded));
    assert!(recovered.error.is_none());
}

#[tokio::test]
async fn test_clear_all_drops_in_flight_result() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let key = ResourceKey::new("leads");
    let (seen, cb) = recorder();

    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), cb);
    let (_, before_reset) = requests.recv().await.unwrap();

    sync.clear_all();
    assert!(sync.cache().get(&key).is_none());
    assert_eq!(seen.lock().unwrap().last().unwrap().status, FetchStatus::Idle);

    before_reset.send(Ok(json!([{"id": 1}]))).unwrap();
    let (_, after_reset) = requests.recv().await.unwrap();
    after_reset.send(Ok(json!([]))).unwrap();
    settle().await;

    assert_eq!(value_of(&sync, &key), Some(json!([])));
    assert!(seen.lock().unwrap().iter().all(|e| e.value != Some(json!([{"id": 1}]))));
}

#[tokio::test]
async fn test_destructive_mutation_clears_everything() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let watched = ResourceKey::new("leads");
    let _sub = sync.subscribe(FetchDescriptor::new(watched.clone(), fetcher.clone()), |_e: &CacheEntry| {});
    let other = sync.subscribe(FetchDescriptor::new(ResourceKey::new("conversations"), fetcher), |_e: &CacheEntry| {});
    settle().await;
    drop(other);
    assert_eq!(sync.cache().len(), 2);

    let reset = Mutation::new(
        ResourceKey::new("reset-database"),
        fetch_fn(|_k: ResourceKey| async { Ok(json!({"records_deleted": {"total": 3}})) }),
    )
    .clears_all();
    sync.mutate(&reset).await.unwrap();
    settle().await;

    assert_eq!(sync.cache().keys(), vec![watched.clone()]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sync.cache().get(&watched).unwrap().status, FetchStatus::Success);
}

#[tokio::test]
async fn test_refetch_from_callback_is_deferred() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("leads");
    let deferred = Arc::new(AtomicBool::new(false));
    let fired = Arc::new(AtomicBool::new(false));

    let cb = {
        let sync = sync.clone();
        let key = key.clone();
        let deferred = deferred.clone();
        let fired = fired.clone();
        move |e: &CacheEntry| {
            if e.status == FetchStatus::Success && !fired.swap(true, Ordering::SeqCst) {
                let before = sync.fetches_issued();
                sync.refetch(&key);
                deferred.store(sync.fetches_issued() == before, Ordering::SeqCst);
            }
        }
    };
    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), cb);
    settle().await;

    assert!(fired.load(Ordering::SeqCst));
    assert!(deferred.load(Ordering::SeqCst));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_enabling_a_key_fetches_it() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("conversation");
    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher).enabled(false), |_e: &CacheEntry| {});
    sync.invalidate(&KeyFilter::All);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    sync.set_enabled(&key, true);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sync.set_enabled(&key, false);
    sync.refetch(&key);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_is_not_refetched_on_resubscribe() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, calls) = counting();
    let key = ResourceKey::new("leads");
    let desc = FetchDescriptor::new(key.clone(), fetcher).stale_after(Duration::from_secs(60));

    let first = sync.subscribe(desc.clone(), |_e: &CacheEntry| {});
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(first);

    let second = sync.subscribe(desc.clone(), |_e: &CacheEntry| {});
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(second);

    advance(Duration::from_secs(61)).await;
    let _sub = sync.subscribe(desc, |_e: &CacheEntry| {});
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_switching_back_picks_up_running_fetch() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let alice = ResourceKey::new("conversation").with_param("alice");
    let bob = ResourceKey::new("conversation").with_param("bob");
    let (seen, cb) = recorder();

    let mut sub = sync.subscribe(FetchDescriptor::new(alice.clone(), fetcher), cb);
    let (_, reply_alice) = requests.recv().await.unwrap();
    sub.switch_to(bob.clone());
    let (_, _reply_bob) = requests.recv().await.unwrap();
    assert!(sync.cache().get(&alice).is_none());

    sub.switch_to(alice.clone());
    assert_eq!(sync.cache().get(&alice).unwrap().status, FetchStatus::Loading);
    assert_eq!(sync.fetches_issued(), 2);

    reply_alice.send(Ok(json!(["hi from alice"]))).unwrap();
    settle().await;

    let entry = sync.cache().get(&alice).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert_eq!(entry.value, Some(json!(["hi from alice"])));
    assert!(requests.try_recv().is_err());
    assert_eq!(sync.fetches_issued(), 2);
    assert_eq!(seen.lock().unwrap().last().unwrap().value, Some(json!(["hi from alice"])));
}

#[tokio::test]
async fn test_invalidated_fetch_is_not_picked_up_again() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, mut requests) = gated();
    let key = ResourceKey::new("leads");
    let desc = FetchDescriptor::new(key.clone(), fetcher);
    let (seen, cb) = recorder();

    let first = sync.subscribe(desc.clone(), |_e: &CacheEntry| {});
    let (_, before_save) = requests.recv().await.unwrap();
    drop(first);
    sync.invalidate(&KeyFilter::Exact(key.clone()));

    let _second = sync.subscribe(desc, cb);
    assert_eq!(sync.fetches_issued(), 1);

    before_save.send(Ok(json!("before save"))).unwrap();
    let (_, after_save) = requests.recv().await.unwrap();
    after_save.send(Ok(json!("after save"))).unwrap();
    settle().await;

    assert_eq!(sync.fetches_issued(), 2);
    assert_eq!(value_of(&sync, &key), Some(json!("after save")));
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|e| e.value != Some(json!("before save"))));
}

#[tokio::test]
async fn test_panicking_fetcher_settles_the_key() {
    let sync = Synchronizer::new(ResourceCache::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let fetcher = fetch_fn(move |_key: ResourceKey| {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 {
                panic!("malformed row");
            }
            Ok(json!(n))
        }
    });
    let key = ResourceKey::new("leads");

    let _sub = sync.subscribe(FetchDescriptor::new(key.clone(), fetcher), |_e: &CacheEntry| {});
    settle().await;

    let failed = sync.cache().get(&key).unwrap();
    assert_eq!(failed.status, FetchStatus::Error);
    assert_eq!(failed.error.unwrap().error_code(), "NETWORK_ERROR");
    assert!(!sync.is_in_flight(&key));

    sync.refetch(&key);
    settle().await;
    let entry = sync.cache().get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert_eq!(entry.value, Some(json!(2)));
}

#[tokio::test]
async fn test_evict_unwatched_conversations() {
    let sync = Synchronizer::new(ResourceCache::new());
    let (fetcher, _calls) = counting();
    let alice = ResourceKey::new("conversation").with_param("alice");
    let bob = ResourceKey::new("conversation").with_param("bob");
    let leads = ResourceKey::new("leads");

    let old = sync.subscribe(FetchDescriptor::new(alice.clone(), fetcher.clone()), |_e: &CacheEntry| {});
    let _bob = sync.subscribe(FetchDescriptor::new(bob.clone(), fetcher.clone()), |_e: &CacheEntry| {});
    let unwatched_leads = sync.subscribe(FetchDescriptor::new(leads.clone(), fetcher), |_e: &CacheEntry| {});
    settle().await;
    drop(old);
    drop(unwatched_leads);
    assert_eq!(sync.cache().len(), 3);

    let evicted = sync.evict_unwatched(&KeyFilter::Name("conversation".into()));
    assert_eq!(evicted, vec![alice.clone()]);
    assert!(sync.cache().get(&alice).is_none());
    assert!(value_of(&sync, &bob).is_some());
    assert!(value_of(&sync, &leads).is_some());
}
