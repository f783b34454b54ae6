// Integration tests for the keyed cache: de-duplication, invalidation, gating

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::FutureExt;
use serde_json::{Value, json};
use studio_cache::query::{
    FetchOptions, FetchStatus, Loader, Mutation, QueryClient, QueryDescriptor, QueryError,
    QueryStatus, loader,
};
use studio_cache::query_key;
use tokio::time::{Duration, sleep, timeout};

fn slow_model(calls: &Arc<AtomicU32>, delay: Duration) -> Loader<Value> {
    let calls = calls.clone();
    loader(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(delay).await;
            Ok(json!({ "id": "m1", "name": "X" }))
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_second_fetch_at_50ms_joins_100ms_load() {
    let client = QueryClient::new();
    let key = query_key!["model", "m1"];
    let calls = Arc::new(AtomicU32::new(0));
    let loader = slow_model(&calls, Duration::from_millis(100));

    let first = tokio::spawn({
        let client = client.clone();
        let key = key.clone();
        let loader = loader.clone();
        async move { client.fetch(&key, loader, FetchOptions::new()).await }
    });

    sleep(Duration::from_millis(50)).await;
    let entry = client.get::<Value>(&key).expect("entry created");
    assert_eq!(entry.status, FetchStatus::Pending);

    let second = client.fetch(&key, loader, FetchOptions::new()).await;
    let first = first.await.expect("task");

    assert_eq!(first, Ok(json!({ "id": "m1", "name": "X" })));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.get::<Value>(&key).expect("entry").status, FetchStatus::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_invoke_loader_once() {
    let client = QueryClient::new();
    let key = query_key!["apis", "m1", 1_i64];
    let calls = Arc::new(AtomicU32::new(0));
    let loader = slow_model(&calls, Duration::from_millis(20));

    let fetches: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            let key = key.clone();
            let loader = loader.clone();
            tokio::spawn(async move { client.fetch(&key, loader, FetchOptions::new()).await })
        })
        .collect();

    for fetch in fetches {
        assert!(fetch.await.expect("task").is_ok());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_distinct_keys_never_alias() {
    let client = QueryClient::new();
    let as_text = query_key!["model", "1"];
    let as_number = query_key!["model", 1_i64];
    let absent = query_key!["model", None::<&str>];

    client.set_data(&as_text, "text".to_string()).expect("seed");
    client.set_data(&as_number, "number".to_string()).expect("seed");
    client.set_data(&absent, "absent".to_string()).expect("seed");

    assert_eq!(client.len(), 3);
    assert_eq!(client.get::<String>(&as_text).and_then(|e| e.value), Some("text".into()));
    assert_eq!(client.get::<String>(&as_number).and_then(|e| e.value), Some("number".into()));
    assert_eq!(client.get::<String>(&absent).and_then(|e| e.value), Some("absent".into()));
}

#[tokio::test]
async fn test_invalidate_refetches_observed_and_drops_the_rest() {
    let client = QueryClient::new();
    let observed_calls = Arc::new(AtomicU32::new(0));
    let observed_key = query_key!["prototypes", "m1"];
    let idle_key = query_key!["prototypes", "m2"];
    let outside_key = query_key!["model", "m1"];

    let mut observer = client.observe(QueryDescriptor::new(
        observed_key.clone(),
        slow_model(&observed_calls, Duration::ZERO),
    ));
    observer.changed().await.expect("loaded");

    let idle_calls = Arc::new(AtomicU32::new(0));
    client
        .fetch(&idle_key, slow_model(&idle_calls, Duration::ZERO), FetchOptions::new())
        .await
        .expect("idle fetch");
    client.set_data(&outside_key, json!(null)).expect("seed");

    let report = client.invalidate(&query_key!["prototypes"]);
    assert_eq!(report.refetched, vec![observed_key.clone()]);
    assert_eq!(report.dropped, vec![idle_key.clone()]);

    assert!(client.get::<Value>(&idle_key).is_none());
    assert!(client.get::<Value>(&outside_key).is_some());

    let refreshed = timeout(Duration::from_secs(1), async {
        loop {
            let result = observer.changed().await.expect("entry alive");
            if result.status == QueryStatus::Success && !result.is_stale {
                return result;
            }
        }
    })
    .await
    .expect("refetch finished");
    assert!(refreshed.data().is_some());
    assert_eq!(observed_calls.load(Ordering::SeqCst), 2);
    assert_eq!(idle_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_create_child_refetches_subscribed_children() {
    let client = QueryClient::new();
    let children = query_key!["children", "p1"];
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let list_children = loader(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok((1..=n).map(|i| format!("c{i}")).collect::<Vec<_>>()) }
    });
    let mut observer = client.observe(QueryDescriptor::new(children.clone(), list_children));
    let first = observer.changed().await.expect("loaded");
    assert_eq!(first.data(), Some(&vec!["c1".to_string()]));

    let create_child = Mutation::new(
        client.clone(),
        |parent_id: String| async move { Ok(format!("{parent_id}-child")) }.boxed(),
        |parent_id: &String, _: &String| vec![query_key!["children", parent_id.as_str()]],
    );
    create_child.execute("p1".to_string()).await.expect("created");

    let refreshed = timeout(Duration::from_secs(1), async {
        loop {
            let result = observer.changed().await.expect("entry alive");
            if result.status == QueryStatus::Success && !result.is_stale {
                return result;
            }
        }
    })
    .await
    .expect("refetched");
    assert_eq!(refreshed.data(), Some(&vec!["c1".to_string(), "c2".to_string()]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disabled_query_loads_once_when_enabled() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let descriptor = |enabled: bool| {
        QueryDescriptor::new(query_key!["feedbacks", "p1", 1_i64], slow_model(&calls, Duration::ZERO))
            .enabled(enabled)
    };

    let mut observer = client.observe(descriptor(false));
    assert_eq!(observer.result().status, QueryStatus::Disabled);
    assert!(!observer.update(descriptor(false)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(observer.update(descriptor(true)));
    assert_eq!(observer.result().status, QueryStatus::Loading);
    observer.changed().await.expect("loaded");

    observer.update(descriptor(true));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_fetch_keeps_last_good_value() {
    let client = QueryClient::new();
    let key = query_key!["user", "self", "t1"];
    client.set_data(&key, 7_u32).expect("seed");

    let failing: Loader<u32> = loader(|| async {
        Err(QueryError::Http {
            status: 403,
            message: "forbidden".into(),
        })
    });
    let result = client.refetch::<u32>(&key).await;
    assert!(result.is_err(), "no loader registered yet");

    let result = client.fetch(&key, failing, FetchOptions::new()).await;
    assert!(matches!(
        result,
        Err(QueryError::Terminal { attempts: 1, .. })
    ));
    let entry = client.get::<u32>(&key).expect("entry");
    assert_eq!(entry.status, FetchStatus::Error);
    assert_eq!(entry.value, Some(7));
    assert!(entry.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_during_observed_fetch_refetches_once_after() {
    let client = QueryClient::new();
    let key = query_key!["prototypes", "m1"];
    let calls = Arc::new(AtomicU32::new(0));
    let _observer = client.observe(QueryDescriptor::new(
        key.clone(),
        slow_model(&calls, Duration::from_millis(100)),
    ));

    sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for _ in 0..2 {
        let report = client.invalidate(&query_key!["prototypes"]);
        assert_eq!(report.refetched, vec![key.clone()]);
        assert!(report.dropped.is_empty());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let entry = client.get::<Value>(&key).expect("entry");
    assert_eq!(entry.status, FetchStatus::Success);
    assert!(!entry.is_stale);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_during_unobserved_fetch_keeps_entry_stale() {
    let client = QueryClient::new();
    let key = query_key!["model", "m1"];
    let calls = Arc::new(AtomicU32::new(0));

    let fetch = tokio::spawn({
        let client = client.clone();
        let key = key.clone();
        let loader = slow_model(&calls, Duration::from_millis(100));
        async move { client.fetch(&key, loader, FetchOptions::new()).await }
    });
    sleep(Duration::from_millis(10)).await;

    let report = client.invalidate(&query_key!["model"]);
    assert_eq!(report.kept, vec![key.clone()]);
    assert!(report.dropped.is_empty());
    assert!(report.refetched.is_empty());

    assert!(fetch.await.expect("task").is_ok());
    let entry = client.get::<Value>(&key).expect("entry kept");
    assert_eq!(entry.status, FetchStatus::Success);
    assert!(entry.is_stale);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
