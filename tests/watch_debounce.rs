//! Change-notification path: the etcd long-poll watch feeding the
//! debounced reload loop.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{Json, Router, extract::Query, extract::State, routing::get};
use quay::{EtcdClient, Registry, Reloader, ports::RouteStore};
use serde_json::json;
use tokio::{net::TcpListener, sync::Notify};

#[derive(Clone)]
struct MockEtcd {
    fetches: Arc<AtomicUsize>,
    changed: Arc<Notify>,
}

/// One handler plays both roles: `?wait=true` long-polls until the test
/// signals a change, anything else returns the current tree.
async fn keys(State(state): State<MockEtcd>, Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
    if params.get("wait").map(String::as_str) == Some("true") {
        state.changed.notified().await;
        return Json(json!({
            "action": "set",
            "node": {
                "key": "/proxy/master/9.9.9.9/0.re",
                "value": ".*",
                "modifiedIndex": 40,
                "createdIndex": 40
            }
        }));
    }

    let fetch = state.fetches.fetch_add(1, Ordering::SeqCst) + 1;
    let host = if fetch == 1 { "1.1.1.1" } else { "9.9.9.9" };
    Json(json!({
        "action": "get",
        "node": {
            "key": "/proxy",
            "dir": true,
            "nodes": [{
                "key": "/proxy/master",
                "dir": true,
                "nodes": [{
                    "key": format!("/proxy/master/{host}"),
                    "dir": true,
                    "nodes": [{
                        "key": format!("/proxy/master/{host}/0.re"),
                        "value": ".*",
                        "modifiedIndex": fetch,
                        "createdIndex": fetch
                    }]
                }]
            }]
        }
    }))
}

#[tokio::test]
async fn burst_of_changes_coalesces_into_one_rebuild() {
    let state = MockEtcd {
        fetches: Arc::new(AtomicUsize::new(0)),
        changed: Arc::new(Notify::new()),
    };
    let app = Router::new()
        .route("/v2/keys/proxy", get(keys))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let registry = Arc::new(Registry::new());
    let store: Arc<dyn RouteStore> =
        Arc::new(EtcdClient::new(&format!("http://{addr}"), "/proxy").unwrap());
    let reloader = Arc::new(
        Reloader::new(registry.clone(), store, None).with_debounce(Duration::from_millis(150)),
    );

    reloader.initial_load().await;
    assert_eq!(state.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        registry.get("master").unwrap().routes.replace("x"),
        "1.1.1.1"
    );

    tokio::spawn(reloader.clone().run());
    // Give the watch loop a moment to park on the long poll.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A burst of changes inside one debounce window.
    for _ in 0..5 {
        state.changed.notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    // Exactly one rebuild once the window closes, and it sees the new tree.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
        registry.get("master").unwrap().routes.replace("x"),
        "9.9.9.9"
    );
}
