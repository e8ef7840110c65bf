//! Subscription Manager
//!
//! Owns one supervised background task per subscribed cluster. A task holds
//! a dedicated store subscription, decodes each message, and fans it out to
//! the cluster's listeners in registration order.
//!
//! Starting and stopping tasks is serialised with listener changes under one
//! lock, so a cluster never has more than one live task, and removing the
//! last listener always stops it. Each spawn opens a new status generation;
//! a task that was superseded can no longer change the cluster's status.
//!
//! Every time a task subscribes it calls `on_subscribed` on all listeners
//! before draining the stream, and a listener that joins a running task gets
//! the same call from the task before its next event. Listener state is only
//! ever touched from the task, in channel order.
//!
//! ```text
//!  subscribe(cluster) ──► [tasks lock] ──► listeners.add ──► spawn if idle
//!                                                                │
//!        ┌───────────────────────────────────────────────────────┘
//!        ▼
//!  Starting ──► Active ──(transport fault)──► Reconnecting ──► Active ...
//!                 │                                │
//!                 ├──(protocol fault)──► Failed    └──(attempts exhausted)──► Failed
//!                 └──(cancelled)───────► Stopped
//! ```

use crate::config::{registry_key, RestartPolicy};
use crate::domain::ports::{EventListenerRef, RegistryStoreRef};
use crate::error::{Error, Result};
use crate::registry::address::RegistryEvent;
use crate::registry::listeners::ListenerRegistry;
use crate::registry::stats::RegistryStats;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Subscription Status
// =============================================================================

/// Lifecycle state of a cluster's background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Task spawned, subscription not yet established
    Starting,
    /// Receiving messages
    Active,
    /// Waiting to re-subscribe after a transport fault
    Reconnecting,
    /// Ended on a fault; no further events will be delivered
    Failed,
    /// Cancelled by unsubscribe or shutdown
    Stopped,
}

impl SubscriptionStatus {
    /// Whether the cluster's cache is currently kept fresh
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    /// Whether the task has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Failed | SubscriptionStatus::Stopped)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Starting => write!(f, "starting"),
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::Reconnecting => write!(f, "reconnecting"),
            SubscriptionStatus::Failed => write!(f, "failed"),
            SubscriptionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Status channel of one cluster, shared by all of its task generations.
///
/// Only the newest generation may publish.
struct StatusSlot {
    tx: watch::Sender<SubscriptionStatus>,
    generation: AtomicU64,
}

impl StatusSlot {
    fn new() -> Self {
        Self {
            tx: watch::channel(SubscriptionStatus::Starting).0,
            generation: AtomicU64::new(0),
        }
    }

    /// Open a new generation in the `Starting` state
    fn begin(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|status| {
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *status = SubscriptionStatus::Starting;
        });
        generation
    }

    /// Publish a status if `generation` is still the newest
    fn publish(&self, generation: u64, status: SubscriptionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            *current = status;
            true
        })
    }

    fn get(&self) -> SubscriptionStatus {
        *self.tx.borrow()
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Running task for one cluster
struct SubscriptionHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    /// Wakes the task to sync listeners that joined it
    sync: Arc<Notify>,
}

impl SubscriptionHandle {
    fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Cancel the task and wait for it to release its connection
    async fn stop(self, cluster: &str) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(cluster = %cluster, error = %e, "Subscription task did not exit cleanly");
        }
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Per-cluster supervisor of background listening tasks
pub struct SubscriptionManager {
    store: RegistryStoreRef,
    listeners: Arc<ListenerRegistry>,
    stats: Arc<RegistryStats>,
    restart: RestartPolicy,
    /// Parent of every task's cancellation token
    root: CancellationToken,
    /// Current task per cluster; also serialises listener changes
    tasks: Mutex<HashMap<String, SubscriptionHandle>>,
    /// Status per cluster, kept across task generations
    statuses: DashMap<String, Arc<StatusSlot>>,
}

impl SubscriptionManager {
    pub fn new(
        store: RegistryStoreRef,
        listeners: Arc<ListenerRegistry>,
        stats: Arc<RegistryStats>,
        restart: RestartPolicy,
    ) -> Self {
        Self {
            store,
            listeners,
            stats,
            restart,
            root: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
            statuses: DashMap::new(),
        }
    }

    /// Attach a listener and make sure the cluster has a live task.
    ///
    /// Returns without waiting for the subscription to be established.
    pub fn subscribe(&self, cluster: &str, listener: EventListenerRef) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if self.root.is_cancelled() {
            return Err(Error::Shutdown);
        }

        // The slot only reflects the task held in `tasks`; a terminal status
        // there means that task failed and is unwinding
        let failed = self.status(cluster).map(|s| s.is_terminal()).unwrap_or(false);
        let live = !failed && tasks.get(cluster).map(|h| h.is_running()).unwrap_or(false);

        // Queued before it becomes visible to dispatch
        if live {
            self.listeners.mark_pending(cluster, listener.clone());
        }
        let count = self.listeners.add(cluster, listener);

        if live {
            if let Some(handle) = tasks.get(cluster) {
                handle.sync.notify_one();
            }
        } else {
            let handle = self.spawn(cluster);
            tasks.insert(cluster.to_string(), handle);
        }

        debug!(cluster = %cluster, listeners = count, started = !live, "Listener subscribed");
        Ok(())
    }

    /// Detach a listener; stops the cluster's task when it was the last one.
    ///
    /// Returns `false` if the listener was not subscribed to the cluster.
    pub async fn unsubscribe(&self, cluster: &str, listener: &EventListenerRef) -> bool {
        let handle = {
            let mut tasks = self.tasks.lock();
            match self.listeners.remove(cluster, listener) {
                None => return false,
                Some(0) => tasks.remove(cluster),
                Some(_) => None,
            }
        };

        if let Some(handle) = handle {
            info!(cluster = %cluster, "Last listener removed, stopping subscription");
            handle.stop(cluster).await;
        }
        true
    }

    /// Current status of a cluster's subscription
    pub fn status(&self, cluster: &str) -> Option<SubscriptionStatus> {
        self.statuses.get(cluster).map(|s| s.get())
    }

    /// Watch a cluster's status changes
    pub fn watch_status(&self, cluster: &str) -> Option<watch::Receiver<SubscriptionStatus>> {
        self.statuses.get(cluster).map(|s| s.tx.subscribe())
    }

    /// Wait until the cluster's subscription is established, or has ended
    pub async fn wait_until_settled(&self, cluster: &str) -> Option<SubscriptionStatus> {
        let mut rx = self.watch_status(cluster)?;
        let status = rx
            .wait_for(|s| s.is_live() || s.is_terminal())
            .await
            .map(|s| *s)
            .ok()?;
        Some(status)
    }

    /// Wait for the outcome of the task's first subscribe attempt
    pub async fn wait_while_starting(&self, cluster: &str) -> Option<SubscriptionStatus> {
        let mut rx = self.watch_status(cluster)?;
        let status = rx
            .wait_for(|s| *s != SubscriptionStatus::Starting)
            .await
            .map(|s| *s)
            .ok()?;
        Some(status)
    }

    /// Clusters with a running task
    pub fn active_clusters(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, h)| h.is_running())
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn listener_count(&self, cluster: &str) -> usize {
        self.listeners.count(cluster)
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every task and wait for all of them to exit
    pub async fn shutdown(&self) {
        let handles: Vec<(String, SubscriptionHandle)> = {
            let mut tasks = self.tasks.lock();
            self.root.cancel();
            tasks.drain().collect()
        };

        info!(tasks = handles.len(), "Draining subscription tasks");
        for (cluster, handle) in handles {
            handle.stop(&cluster).await;
        }
    }

    fn status_slot(&self, cluster: &str) -> Arc<StatusSlot> {
        self.statuses
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(StatusSlot::new()))
            .clone()
    }

    fn spawn(&self, cluster: &str) -> SubscriptionHandle {
        let token = self.root.child_token();
        let sync = Arc::new(Notify::new());
        let status = self.status_slot(cluster);
        let generation = status.begin();
        RegistryStats::incr(&self.stats.subscription_starts);

        let worker = SubscriptionWorker {
            cluster: cluster.to_string(),
            channel: registry_key(cluster),
            store: self.store.clone(),
            listeners: self.listeners.clone(),
            stats: self.stats.clone(),
            status,
            generation,
            sync: sync.clone(),
            max_attempts: self.restart.max_attempts,
            backoff: self.restart.backoff(),
            failed_attempts: 0,
        };

        info!(
            cluster = %cluster,
            channel = %worker.channel,
            generation,
            "Starting subscription task"
        );
        let join = tokio::spawn(worker.run(token.clone()));
        SubscriptionHandle { token, join, sync }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("store", &self.store.store_name())
            .field("tasks", &self.tasks.lock().len())
            .field("shutdown", &self.root.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Subscription Worker
// =============================================================================

/// Why one subscription attempt ended
enum AttemptEnd {
    /// Connection closed or failed; eligible for restart
    Dropped(Error),
    /// Protocol fault; never restarted
    Fatal(Error),
}

struct SubscriptionWorker {
    cluster: String,
    channel: String,
    store: RegistryStoreRef,
    listeners: Arc<ListenerRegistry>,
    stats: Arc<RegistryStats>,
    status: Arc<StatusSlot>,
    generation: u64,
    sync: Arc<Notify>,
    max_attempts: u32,
    backoff: ExponentialBackoff,
    failed_attempts: u32,
}

impl SubscriptionWorker {
    async fn run(mut self, token: CancellationToken) {
        loop {
            let end = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                end = self.attempt() => end,
            };

            let err = match end {
                AttemptEnd::Fatal(err) => {
                    error!(cluster = %self.cluster, error = %err, "Subscription ended on protocol fault");
                    self.fail();
                    return;
                }
                AttemptEnd::Dropped(err) => err,
            };

            self.failed_attempts += 1;
            if self.max_attempts > 0 && self.failed_attempts >= self.max_attempts {
                error!(
                    cluster = %self.cluster,
                    attempts = self.failed_attempts,
                    error = %err,
                    "Subscription restart attempts exhausted"
                );
                self.fail();
                return;
            }

            let Some(delay) = self.backoff.next_backoff() else {
                error!(cluster = %self.cluster, error = %err, "Subscription backoff exhausted");
                self.fail();
                return;
            };

            warn!(
                cluster = %self.cluster,
                error = %err,
                attempt = self.failed_attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Subscription dropped, reconnecting"
            );
            self.set_status(SubscriptionStatus::Reconnecting);

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            RegistryStats::incr(&self.stats.subscription_restarts);
        }

        self.set_status(SubscriptionStatus::Stopped);
        info!(cluster = %self.cluster, generation = self.generation, "Subscription task stopped");
    }

    fn set_status(&self, status: SubscriptionStatus) {
        if !self.status.publish(self.generation, status) {
            debug!(
                cluster = %self.cluster,
                generation = self.generation,
                status = %status,
                "Superseded task left status unchanged"
            );
        }
    }

    fn fail(&self) {
        RegistryStats::incr(&self.stats.subscription_failures);
        self.set_status(SubscriptionStatus::Failed);
    }

    /// One subscribe-and-listen cycle; returns when the subscription ends
    async fn attempt(&mut self) -> AttemptEnd {
        let mut stream = match self.store.subscribe(&self.channel).await {
            Ok(stream) => stream,
            Err(e) => return AttemptEnd::Dropped(e),
        };

        // Messages published from here on are buffered in the stream, so
        // listeners re-read state before any of them is dispatched. Queued
        // joiners are covered by the full pass.
        self.listeners.take_pending(&self.cluster);
        for listener in self.listeners.listeners(&self.cluster) {
            if let Err(e) = listener.on_subscribed().await {
                return classify(e);
            }
        }

        self.set_status(SubscriptionStatus::Active);
        self.backoff.reset();
        self.failed_attempts = 0;
        debug!(cluster = %self.cluster, "Subscription active");

        loop {
            tokio::select! {
                biased;
                _ = self.sync.notified() => {
                    if let Err(e) = self.sync_joined().await {
                        return classify(e);
                    }
                }
                item = stream.next() => {
                    let Some(item) = item else { break };
                    let message = match item {
                        Ok(message) => message,
                        Err(e) => return classify(e),
                    };
                    RegistryStats::incr(&self.stats.events_received);

                    if let Err(e) = self.dispatch(&message).await {
                        return classify(e);
                    }
                }
            }
        }

        AttemptEnd::Dropped(Error::Transport(format!(
            "subscription to {} closed",
            self.channel
        )))
    }

    /// Call `on_subscribed` for listeners that joined while the task ran
    async fn sync_joined(&self) -> Result<()> {
        for listener in self.listeners.take_pending(&self.cluster) {
            listener.on_subscribed().await?;
        }
        Ok(())
    }

    /// Validate a message and deliver it to every listener in order.
    ///
    /// Listeners still queued for `on_subscribed` are synced first.
    async fn dispatch(&self, message: &str) -> Result<()> {
        let event = RegistryEvent::decode(message).map_err(|e| {
            RegistryStats::incr(&self.stats.protocol_faults);
            e
        })?;
        debug!(cluster = %self.cluster, event = %event, "Dispatching registry event");

        let listeners = self.listeners.listeners(&self.cluster);
        self.sync_joined().await?;
        for listener in listeners {
            if let Err(e) = listener.on_event(message).await {
                if e.is_fatal() {
                    RegistryStats::incr(&self.stats.protocol_faults);
                    return Err(e);
                }
                RegistryStats::incr(&self.stats.listener_faults);
                warn!(cluster = %self.cluster, error = %e, "Listener failed to handle event");
            }
        }
        Ok(())
    }
}

fn classify(err: Error) -> AttemptEnd {
    if err.is_fatal() {
        AttemptEnd::Fatal(err)
    } else {
        AttemptEnd::Dropped(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{EventListener, RegistryStore};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Forwards every message it sees, tagged with its name
    struct Recorder {
        name: &'static str,
        tx: mpsc::UnboundedSender<(&'static str, String)>,
    }

    #[async_trait]
    impl EventListener for Recorder {
        async fn on_event(&self, message: &str) -> Result<()> {
            let _ = self.tx.send((self.name, message.to_string()));
            Ok(())
        }

        async fn on_subscribed(&self) -> Result<()> {
            let _ = self.tx.send((self.name, "<synced>".to_string()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventListener for Failing {
        async fn on_event(&self, _message: &str) -> Result<()> {
            Err(Error::Transport("listener backend down".into()))
        }
    }

    fn fast_restart() -> RestartPolicy {
        RestartPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            max_attempts: 0,
        }
    }

    fn manager(store: Arc<MemoryStore>) -> (SubscriptionManager, Arc<RegistryStats>) {
        let stats = Arc::new(RegistryStats::new());
        let manager = SubscriptionManager::new(
            store,
            Arc::new(ListenerRegistry::new()),
            stats.clone(),
            fast_restart(),
        );
        (manager, stats)
    }

    fn recorder(
        name: &'static str,
    ) -> (EventListenerRef, mpsc::UnboundedReceiver<(&'static str, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { name, tx }), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<(&'static str, String)>) -> (&'static str, String) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("listener channel closed")
    }

    /// Next delivered event, skipping sync notifications
    async fn recv_event(rx: &mut mpsc::UnboundedReceiver<(&'static str, String)>) -> (&'static str, String) {
        loop {
            let item = recv(rx).await;
            if item.1 != "<synced>" {
                return item;
            }
        }
    }

    async fn wait_for_status(manager: &SubscriptionManager, cluster: &str, want: SubscriptionStatus) {
        let mut rx = manager.watch_status(cluster).expect("cluster has no status");
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
    }

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first: EventListenerRef = Arc::new(Recorder { name: "first", tx: tx.clone() });
        let second: EventListenerRef = Arc::new(Recorder { name: "second", tx });

        manager.subscribe("c1", first).unwrap();
        manager.subscribe("c1", second).unwrap();
        assert_eq!(manager.wait_until_settled("c1").await, Some(SubscriptionStatus::Active));

        // Both listeners are synced once before the first event
        assert_eq!(recv(&mut rx).await, ("first", "<synced>".to_string()));
        assert_eq!(recv(&mut rx).await, ("second", "<synced>".to_string()));

        store.publish("registry.redis.c1", "10.0.0.1:8091-REGISTER").await.unwrap();
        store.publish("registry.redis.c1", "10.0.0.2:8091-REGISTER").await.unwrap();

        assert_eq!(recv(&mut rx).await, ("first", "10.0.0.1:8091-REGISTER".to_string()));
        assert_eq!(recv(&mut rx).await, ("second", "10.0.0.1:8091-REGISTER".to_string()));
        assert_eq!(recv(&mut rx).await, ("first", "10.0.0.2:8091-REGISTER".to_string()));
        assert_eq!(recv(&mut rx).await, ("second", "10.0.0.2:8091-REGISTER".to_string()));

        // Only one task, on one connection, for both listeners
        assert_eq!(store.subscriber_count("registry.redis.c1"), 1);
        assert_eq!(manager.active_clusters(), vec!["c1".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_starts_one_task() {
        let store = Arc::new(MemoryStore::new());
        let (manager, stats) = manager(store.clone());
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let (listener, _rx) = recorder("l");
                manager.subscribe("c1", listener).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        manager.wait_until_settled("c1").await;
        assert_eq!(stats.snapshot().subscription_starts, 1);
        assert_eq!(store.subscriptions_opened(), 1);
        assert_eq!(manager.listener_count("c1"), 16);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_last_listener_releases_connection() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        let (a, _rx_a) = recorder("a");
        let (b, mut rx_b) = recorder("b");

        manager.subscribe("c1", a.clone()).unwrap();
        manager.subscribe("c1", b.clone()).unwrap();
        manager.wait_until_settled("c1").await;

        assert!(manager.unsubscribe("c1", &a).await);
        assert!(!manager.unsubscribe("c1", &a).await);
        assert_eq!(store.subscriber_count("registry.redis.c1"), 1);

        store.publish("registry.redis.c1", "10.0.0.1:8091-REGISTER").await.unwrap();
        assert_eq!(recv_event(&mut rx_b).await.1, "10.0.0.1:8091-REGISTER");

        assert!(manager.unsubscribe("c1", &b).await);
        assert_eq!(manager.status("c1"), Some(SubscriptionStatus::Stopped));
        assert_eq!(store.subscriber_count("registry.redis.c1"), 0);
        assert!(manager.active_clusters().is_empty());

        // A later subscribe starts a fresh task
        let (c, _rx_c) = recorder("c");
        manager.subscribe("c1", c).unwrap();
        assert_eq!(manager.wait_until_settled("c1").await, Some(SubscriptionStatus::Active));
        assert_eq!(store.subscriptions_opened(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_protocol_fault_fails_subscription() {
        let store = Arc::new(MemoryStore::new());
        let (manager, stats) = manager(store.clone());
        let (listener, mut rx) = recorder("l");

        manager.subscribe("c1", listener).unwrap();
        manager.wait_until_settled("c1").await;

        store.publish("registry.redis.c1", "10.0.0.1:8091-DELETE").await.unwrap();
        wait_for_status(&manager, "c1", SubscriptionStatus::Failed).await;

        // The malformed message never reached the listener
        while let Ok((_, message)) = rx.try_recv() {
            assert_eq!(message, "<synced>");
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.protocol_faults, 1);
        assert_eq!(snapshot.subscription_failures, 1);
        assert_eq!(snapshot.subscription_restarts, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_fault_restarts_and_resyncs() {
        let store = Arc::new(MemoryStore::new());
        let (manager, stats) = manager(store.clone());
        let (listener, mut rx) = recorder("l");

        manager.subscribe("c1", listener).unwrap();
        manager.wait_until_settled("c1").await;
        assert_eq!(recv(&mut rx).await.1, "<synced>");

        store.disconnect_subscribers("registry.redis.c1");
        assert_eq!(recv(&mut rx).await.1, "<synced>");
        wait_for_status(&manager, "c1", SubscriptionStatus::Active).await;

        store.publish("registry.redis.c1", "10.0.0.3:8091-REGISTER").await.unwrap();
        assert_eq!(recv(&mut rx).await.1, "10.0.0.3:8091-REGISTER");
        assert_eq!(stats.snapshot().subscription_restarts, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_attempts_bounded() {
        let store = Arc::new(MemoryStore::new());
        let stats = Arc::new(RegistryStats::new());
        let manager = SubscriptionManager::new(
            store.clone(),
            Arc::new(ListenerRegistry::new()),
            stats.clone(),
            RestartPolicy {
                max_attempts: 3,
                ..fast_restart()
            },
        );
        store.set_unavailable(true);

        let (listener, _rx) = recorder("l");
        manager.subscribe("c1", listener).unwrap();
        assert_eq!(manager.wait_until_settled("c1").await, Some(SubscriptionStatus::Failed));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.subscription_restarts, 2);
        assert_eq!(snapshot.subscription_failures, 1);

        // A new subscriber revives the failed cluster
        store.set_unavailable(false);
        let (again, _rx2) = recorder("again");
        manager.subscribe("c1", again).unwrap();
        assert_eq!(manager.wait_until_settled("c1").await, Some(SubscriptionStatus::Active));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_fault_does_not_stop_delivery() {
        let store = Arc::new(MemoryStore::new());
        let (manager, stats) = manager(store.clone());
        let (listener, mut rx) = recorder("after");

        manager.subscribe("c1", Arc::new(Failing)).unwrap();
        manager.subscribe("c1", listener).unwrap();
        manager.wait_until_settled("c1").await;

        store.publish("registry.redis.c1", "10.0.0.1:8091-REGISTER").await.unwrap();
        assert_eq!(recv_event(&mut rx).await.1, "10.0.0.1:8091-REGISTER");
        assert_eq!(stats.snapshot().listener_faults, 1);
        assert_eq!(manager.status("c1"), Some(SubscriptionStatus::Active));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_joining_listener_synced_before_next_event() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        let (a, mut rx_a) = recorder("a");
        let (b, mut rx_b) = recorder("b");

        manager.subscribe("c1", a).unwrap();
        manager.wait_until_settled("c1").await;
        assert_eq!(recv(&mut rx_a).await.1, "<synced>");

        manager.subscribe("c1", b).unwrap();
        store.publish("registry.redis.c1", "10.0.0.1:8091-REGISTER").await.unwrap();

        assert_eq!(recv(&mut rx_b).await.1, "<synced>");
        assert_eq!(recv(&mut rx_b).await.1, "10.0.0.1:8091-REGISTER");
        // The running listener is not synced again
        assert_eq!(recv(&mut rx_a).await.1, "10.0.0.1:8091-REGISTER");
        assert_eq!(store.subscriptions_opened(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_revived_cluster_resyncs_existing_listeners() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());
        let (listener, mut rx) = recorder("l");

        manager.subscribe("c1", listener).unwrap();
        manager.wait_until_settled("c1").await;
        assert_eq!(recv(&mut rx).await.1, "<synced>");

        store.publish("registry.redis.c1", "10.0.0.1:8091-DELETE").await.unwrap();
        wait_for_status(&manager, "c1", SubscriptionStatus::Failed).await;

        let (other, _rx_other) = recorder("other");
        manager.subscribe("c1", other).unwrap();
        assert_eq!(manager.wait_until_settled("c1").await, Some(SubscriptionStatus::Active));

        // Events missed while failed are recovered through the sync
        assert_eq!(recv(&mut rx).await.1, "<synced>");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_superseded_task_cannot_overwrite_status() {
        let store = Arc::new(MemoryStore::new());
        let (manager, stats) = manager(store.clone());
        let (a, _rx_a) = recorder("a");
        let (b, mut rx_b) = recorder("b");

        manager.subscribe("c1", a.clone()).unwrap();
        manager.wait_until_settled("c1").await;

        // Old task is cancelled but has not exited yet
        let mut unsubscribe = Box::pin(manager.unsubscribe("c1", &a));
        assert!(futures::poll!(&mut unsubscribe).is_pending());

        manager.subscribe("c1", b).unwrap();
        assert!(unsubscribe.await);
        assert_ne!(manager.status("c1"), Some(SubscriptionStatus::Stopped));
        assert_eq!(manager.wait_until_settled("c1").await, Some(SubscriptionStatus::Active));

        // Joining the new task must not spawn a third one
        let (c, _rx_c) = recorder("c");
        manager.subscribe("c1", c).unwrap();
        assert_eq!(stats.snapshot().subscription_starts, 2);
        assert_eq!(store.subscriber_count("registry.redis.c1"), 1);
        assert_eq!(manager.active_clusters(), vec!["c1".to_string()]);

        store.publish("registry.redis.c1", "10.0.0.1:8091-REGISTER").await.unwrap();
        assert_eq!(recv_event(&mut rx_b).await.1, "10.0.0.1:8091-REGISTER");
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok((_, message)) = rx_b.try_recv() {
            assert_eq!(message, "<synced>");
        }
        assert_eq!(stats.snapshot().events_received, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_tasks() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store.clone());

        for cluster in ["c1", "c2", "c3"] {
            let (listener, _rx) = recorder("l");
            manager.subscribe(cluster, listener).unwrap();
            manager.wait_until_settled(cluster).await;
        }
        assert_eq!(manager.active_clusters().len(), 3);

        manager.shutdown().await;

        for cluster in ["c1", "c2", "c3"] {
            assert_eq!(manager.status(cluster), Some(SubscriptionStatus::Stopped));
            assert_eq!(store.subscriber_count(&registry_key(cluster)), 0);
        }
        assert!(manager.is_shutdown());

        let (late, _rx) = recorder("late");
        assert!(matches!(manager.subscribe("c4", late), Err(Error::Shutdown)));
    }
}
