//! Change-driven routing table refresh.
//!
//! [`Reloader`] owns the two upstream ports and the registry. A rebuild
//! re-reads both upstreams from scratch and publishes the result; no
//! state is carried between rebuilds. The run loop listens to both
//! change streams and coalesces bursts of events into a single rebuild
//! behind a trailing-edge timer: every event re-arms the timer, and only
//! its expiry triggers the (serialized) rebuild. Events arriving while a
//! rebuild is in flight stay queued in the channels and re-arm the timer
//! afterwards, so an upstream change is never lost.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};

use crate::{
    core::{registry::Registry, table::build_snapshot},
    ports::{ContainerRuntime, RouteStore, RuntimeEvent},
};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct Reloader {
    registry: Arc<Registry>,
    store: Arc<dyn RouteStore>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    debounce: Duration,
}

impl Reloader {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn RouteStore>,
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Self {
        Self {
            registry,
            store,
            runtime,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Override the debounce window (tests use a short one).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Fetch both upstreams, build a fresh snapshot and publish it.
    ///
    /// On any fetch error the current snapshot stays in place untouched;
    /// an absent config root publishes an empty snapshot.
    pub async fn rebuild(&self) -> Result<()> {
        let containers = match &self.runtime {
            Some(runtime) => Some(
                runtime
                    .containers()
                    .await
                    .wrap_err("container inventory fetch failed")?,
            ),
            None => None,
        };

        let tree = self
            .store
            .fetch_tree()
            .await
            .wrap_err("route tree fetch failed")?
            .unwrap_or_default();

        let snapshot = build_snapshot(containers.as_ref(), &tree);
        self.registry.publish(snapshot);
        Ok(())
    }

    /// Retry [`Reloader::rebuild`] until it succeeds once.
    ///
    /// Called at startup before any listener is bound, so the front-ends
    /// never observe a never-populated registry.
    pub async fn initial_load(&self) {
        tracing::info!("building routing table");
        while let Err(e) = self.rebuild().await {
            tracing::warn!(error = %e, "initial load failed, retrying");
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
        tracing::info!(accounts = self.registry.len(), "routing table ready");
    }

    /// Watch both upstreams and rebuild on change, forever.
    ///
    /// Returns only if the config change stream closes, which does not
    /// happen outside tests.
    pub async fn run(self: Arc<Self>) {
        let mut config_rx = self.store.watch();
        let mut runtime_rx = self.runtime.as_ref().map(|rt| rt.watch());

        // Single pending deadline; armed by any event, replaced by the
        // next one. Far-future placeholder while nothing is pending.
        let timer = sleep_until(Instant::now() + Duration::from_secs(86400));
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                event = config_rx.recv() => {
                    match event {
                        Some(()) => {
                            tracing::debug!("config change notification");
                            timer.as_mut().reset(Instant::now() + self.debounce);
                            armed = true;
                        }
                        None => {
                            tracing::info!("config change stream closed, reload loop exiting");
                            return;
                        }
                    }
                }
                event = recv_runtime(&mut runtime_rx) => {
                    tracing::debug!(status = %event.status, id = %event.id, "runtime event");
                    timer.as_mut().reset(Instant::now() + self.debounce);
                    armed = true;
                }
                _ = &mut timer, if armed => {
                    armed = false;
                    if let Err(e) = self.rebuild().await {
                        tracing::warn!(error = %e, "rebuild failed, keeping current snapshot");
                    }
                }
            }
        }
    }
}

/// Receive from the runtime event channel when there is one. A closed or
/// absent channel parks forever instead of waking the select loop.
async fn recv_runtime(rx: &mut Option<mpsc::Receiver<RuntimeEvent>>) -> RuntimeEvent {
    loop {
        match rx {
            Some(receiver) => match receiver.recv().await {
                Some(event) => return event,
                None => *rx = None,
            },
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        core::table::{AccountNode, RouteTree},
        ports::{RuntimeResult, StoreError, StoreResult},
    };

    struct FakeStore {
        fetches: AtomicUsize,
        fail: AtomicUsize,
        tx: Mutex<Option<mpsc::Sender<()>>>,
        rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl FakeStore {
        fn new() -> (Arc<Self>, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel(64);
            let store = Arc::new(Self {
                fetches: AtomicUsize::new(0),
                fail: AtomicUsize::new(0),
                tx: Mutex::new(Some(tx.clone())),
                rx: std::sync::Mutex::new(Some(rx)),
            });
            (store, tx)
        }
    }

    #[async_trait]
    impl RouteStore for FakeStore {
        async fn fetch_tree(&self) -> StoreResult<Option<RouteTree>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) > 0 {
                self.fail.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Transport("injected".into()));
            }
            Ok(Some(RouteTree {
                accounts: vec![AccountNode {
                    name: "master".into(),
                    destinations: vec![],
                }],
            }))
        }

        fn watch(&self) -> mpsc::Receiver<()> {
            self.rx.lock().unwrap().take().expect("watch called once")
        }
    }

    struct NoRuntime;

    #[async_trait]
    impl ContainerRuntime for NoRuntime {
        async fn containers(&self) -> RuntimeResult<HashMap<String, crate::core::route::Container>> {
            Ok(HashMap::new())
        }

        fn watch(&self) -> mpsc::Receiver<RuntimeEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    #[tokio::test]
    async fn rebuild_publishes_snapshot() {
        let registry = Arc::new(Registry::new());
        let (store, _tx) = FakeStore::new();
        let reloader = Reloader::new(registry.clone(), store, None);

        reloader.rebuild().await.unwrap();
        assert!(registry.get("master").is_some());
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_last_good_snapshot() {
        let registry = Arc::new(Registry::new());
        let (store, _tx) = FakeStore::new();
        let reloader = Reloader::new(registry.clone(), store.clone(), None);

        reloader.rebuild().await.unwrap();
        assert_eq!(registry.len(), 1);

        store.fail.store(1, Ordering::SeqCst);
        assert!(reloader.rebuild().await.is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("master").is_some());
    }

    #[tokio::test]
    async fn burst_of_events_triggers_one_rebuild() {
        let registry = Arc::new(Registry::new());
        let (store, tx) = FakeStore::new();
        let reloader = Arc::new(
            Reloader::new(registry, store.clone(), None)
                .with_debounce(Duration::from_millis(100)),
        );

        let handle = tokio::spawn(reloader.run());

        for _ in 0..10 {
            tx.send(()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        // A later event starts a fresh window and a second rebuild.
        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);

        drop(tx);
        drop(store.tx.lock().await.take());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn initial_load_retries_until_success() {
        let registry = Arc::new(Registry::new());
        let (store, _tx) = FakeStore::new();
        store.fail.store(2, Ordering::SeqCst);

        let reloader = Reloader::new(registry.clone(), store.clone(), None);
        tokio::time::timeout(Duration::from_secs(5), reloader.initial_load())
            .await
            .expect("initial load should eventually succeed");

        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
        assert!(registry.get("master").is_some());
    }

    #[tokio::test]
    async fn runtime_events_also_arm_the_timer() {
        let registry = Arc::new(Registry::new());
        let (store, _tx) = FakeStore::new();

        struct EventRuntime(std::sync::Mutex<Option<mpsc::Receiver<RuntimeEvent>>>);

        #[async_trait]
        impl ContainerRuntime for EventRuntime {
            async fn containers(
                &self,
            ) -> RuntimeResult<HashMap<String, crate::core::route::Container>> {
                Ok(HashMap::new())
            }

            fn watch(&self) -> mpsc::Receiver<RuntimeEvent> {
                self.0.lock().unwrap().take().unwrap()
            }
        }

        let (event_tx, event_rx) = mpsc::channel(8);
        let runtime = Arc::new(EventRuntime(std::sync::Mutex::new(Some(event_rx))));

        let reloader = Arc::new(
            Reloader::new(registry, store.clone(), Some(runtime))
                .with_debounce(Duration::from_millis(50)),
        );
        let handle = tokio::spawn(reloader.run());

        event_tx
            .send(RuntimeEvent {
                status: "start".into(),
                id: "abc".into(),
                from: "img".into(),
                time: 0,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        drop(_tx);
        drop(store.tx.lock().await.take());
        handle.await.unwrap();
    }
}
