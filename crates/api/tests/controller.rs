#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kmirror_api::{ApiError, Controller, LifecycleState, MockCluster};
use kmirror_core::{BackoffConfig, ControllerConfig, Listing, ManagedObject, ObjectKey};
use kmirror_kubehub::{ClusterClient, WatchError};

fn obj(name: &str, rv: &str) -> ManagedObject {
    ManagedObject {
        key: ObjectKey::namespaced("ns", name),
        resource_version: rv.to_string(),
        payload: serde_json::json!({
            "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv },
            "spec": { "replicas": 1 }
        }),
    }
}

fn listing(items: Vec<ManagedObject>, rv: &str) -> Listing { Listing { items, resource_version: rv.to_string() } }

fn fast_config(resync: Duration) -> ControllerConfig {
    ControllerConfig {
        namespace: Some("ns".into()),
        resync_period: resync,
        backoff: BackoffConfig { initial: Duration::from_millis(5), max: Duration::from_millis(20) },
        ..ControllerConfig::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn rv_of(c: &Controller, key: &str) -> Option<String> {
    c.get_by_key(key).ok().flatten().map(|o| o.resource_version)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirrors_list_then_updates_and_deletes() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1"), obj("b", "1")], "10"));
    let feed = cluster.push_watch();

    let c = Controller::start_with(fast_config(Duration::ZERO), cluster.clone()).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();
    assert_eq!(c.list_keys(), vec!["ns/a".to_string(), "ns/b".to_string()]);

    feed.modified(obj("a", "2"));
    assert!(eventually(|| rv_of(&c, "ns/a").as_deref() == Some("2")).await);

    feed.deleted(obj("b", "3"));
    assert!(eventually(|| c.list_keys() == vec!["ns/a".to_string()]).await);
    assert_eq!(c.get_by_key("ns/b"), Ok(None));
    assert_eq!(cluster.watch_cursors(), vec!["10".to_string()]);

    let stats = c.stats();
    assert_eq!(stats.state, LifecycleState::Running);
    assert!(stats.has_synced);
    assert_eq!(stats.items, 1);
    assert_eq!(stats.last_sync_resource_version.as_deref(), Some("10"));

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_after_disconnect_drops_vanished_objects() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1"), obj("b", "1")], "10"));
    cluster.push_list(listing(vec![obj("a", "3")], "20"));
    let first = cluster.push_watch();
    let _second = cluster.push_watch();

    let c = Controller::start_with(fast_config(Duration::ZERO), cluster.clone()).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();

    // b is deleted while disconnected; the relist is the only evidence
    first.close();
    assert!(eventually(|| c.list_keys() == vec!["ns/a".to_string()]).await);
    assert_eq!(rv_of(&c, "ns/a").as_deref(), Some("3"));
    assert!(eventually(|| cluster.watch_cursors() == vec!["10".to_string(), "20".to_string()]).await);
    assert_eq!(c.stats().last_sync_resource_version.as_deref(), Some("20"));

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_watch_relists() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1")], "10"));
    cluster.push_list(listing(vec![obj("a", "5"), obj("c", "5")], "30"));
    let first = cluster.push_watch();

    let c = Controller::start_with(fast_config(Duration::ZERO), cluster.clone()).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();

    first.error(WatchError::Expired("too old resource version".into()));
    assert!(eventually(|| c.list_keys().len() == 2).await);
    assert_eq!(cluster.list_calls(), 2);

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_open_watch_and_keeps_state() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1")], "10"));
    // no watch scripted: the stream stays open and silent

    let c = Controller::start_with(fast_config(Duration::from_secs(3600)), cluster.clone()).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();
    assert!(eventually(|| !cluster.watch_cursors().is_empty()).await);

    c.stop().unwrap();
    tokio::time::timeout(Duration::from_secs(1), c.join()).await.expect("join within 1s");

    assert_eq!(c.state(), LifecycleState::Stopped);
    assert_eq!(c.list_keys(), vec!["ns/a".to_string()]);
    assert!(c.has_synced());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_errors() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![], "1"));
    let c = Controller::new(fast_config(Duration::ZERO), cluster);

    assert_eq!(c.stop(), Err(ApiError::NotStarted));
    assert_eq!(c.wait_for_sync(Duration::from_millis(10)).await, Err(ApiError::NotStarted));

    c.start().unwrap();
    assert_eq!(c.start(), Err(ApiError::AlreadyStarted));

    c.stop().unwrap();
    assert_eq!(c.stop(), Ok(()));
    assert_eq!(c.start(), Err(ApiError::Stopped));
    c.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_keys_are_rejected() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1")], "10"));
    let c = Controller::start_with(fast_config(Duration::ZERO), cluster).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();

    assert!(matches!(c.get_by_key("a/b/c"), Err(ApiError::InvalidKey(_))));
    assert!(matches!(c.get_by_key(""), Err(ApiError::InvalidKey(_))));
    assert!(matches!(c.get_by_key("ns/"), Err(ApiError::InvalidKey(_))));
    assert_eq!(c.get_by_key("ns/zzz"), Ok(None));
    assert!(c.get_by_key("ns/a").unwrap().is_some());

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_leaves_store_unchanged() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1"), obj("b", "2")], "10"));
    let _feed = cluster.push_watch();

    let c = Controller::start_with(fast_config(Duration::from_millis(30)), cluster).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();
    let before = c.list_deployments();

    assert!(eventually(|| c.stats().last_resync_ts.is_some()).await);
    // give a couple more periods a chance to run
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(c.list_deployments(), before);

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_sync_times_out_while_listing_fails() {
    let cluster = Arc::new(MockCluster::new());
    // nothing scripted: every list errors
    let c = Controller::start_with(fast_config(Duration::ZERO), cluster.clone()).unwrap();

    let res = c.wait_for_sync(Duration::from_millis(100)).await;
    assert!(matches!(res, Err(ApiError::NotSynced(_))));
    assert!(!c.has_synced());
    assert!(c.list_keys().is_empty());
    assert!(eventually(|| cluster.list_calls() >= 2).await);

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_handle_reaches_the_cluster() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list(listing(vec![obj("a", "1")], "10"));
    let c = Controller::start_with(fast_config(Duration::ZERO), cluster.clone()).unwrap();
    c.wait_for_sync(Duration::from_secs(2)).await.unwrap();

    let mut a = c.get_by_key("ns/a").unwrap().unwrap();
    a.payload["spec"]["replicas"] = serde_json::json!(3);
    c.client().update(&a).await.unwrap();

    let updates = cluster.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].payload["spec"]["replicas"], 3);
    let live = c.client().get(&ObjectKey::namespaced("ns", "a")).await.unwrap().unwrap();
    assert_eq!(live.payload["spec"]["replicas"], 3);

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_sync_wakes_when_late_listing_lands() {
    let cluster = Arc::new(MockCluster::new());
    cluster.push_list_error("apiserver unavailable");
    cluster.push_list_error("apiserver unavailable");
    cluster.push_list(listing(vec![obj("a", "1")], "10"));
    let c = Controller::start_with(fast_config(Duration::ZERO), cluster.clone()).unwrap();

    let t0 = Instant::now();
    c.wait_for_sync(Duration::from_secs(5)).await.unwrap();
    assert!(t0.elapsed() < Duration::from_secs(1), "took {:?}", t0.elapsed());
    assert_eq!(cluster.list_calls(), 3);
    assert_eq!(c.list_keys(), vec!["ns/a".to_string()]);

    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_ends_a_pending_wait_for_sync() {
    let cluster = Arc::new(MockCluster::new());
    // nothing scripted: every list errors
    let c = Arc::new(Controller::start_with(fast_config(Duration::ZERO), cluster).unwrap());

    let waiter = tokio::spawn({
        let c = c.clone();
        async move { c.wait_for_sync(Duration::from_secs(30)).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    c.stop().unwrap();

    let res = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("wait ends on stop").unwrap();
    assert_eq!(res, Err(ApiError::Stopped));
    c.join().await;
}
