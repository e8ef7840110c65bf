//! Membership Cache
//!
//! Per-cluster sets of live addresses, built lazily from a store snapshot and
//! kept fresh by applying channel events. Entries are created atomically and
//! never evicted; only the addresses inside them change.

use crate::domain::ports::{EventListener, RegistryStoreRef};
use crate::error::{Error, Result};
use crate::registry::address::{Address, EventKind, RegistryEvent};
use crate::registry::stats::RegistryStats;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

// =============================================================================
// Cluster Membership
// =============================================================================

/// Live membership of a single cluster
#[derive(Debug)]
pub struct ClusterMembership {
    /// Cluster name
    cluster: String,
    /// Current members
    members: RwLock<HashSet<Address>>,
    /// Set once the initial snapshot was loaded and the cluster subscribed
    initialized: OnceCell<DateTime<Utc>>,
    /// Last applied event (Unix millis, 0 = never)
    last_event_ms: AtomicI64,
}

impl ClusterMembership {
    fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            members: RwLock::new(HashSet::new()),
            initialized: OnceCell::new(),
            last_event_ms: AtomicI64::new(0),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Run `init` exactly once across concurrent callers.
    ///
    /// Callers arriving while another caller initialises wait for it. A
    /// failed initialisation leaves the entry uninitialised so the next
    /// caller retries.
    pub async fn initialize<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.initialized
            .get_or_try_init(move || async move {
                init().await?;
                Ok::<_, Error>(Utc::now())
            })
            .await
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    pub fn initialized_at(&self) -> Option<DateTime<Utc>> {
        self.initialized.get().copied()
    }

    /// Apply one event, returning whether membership changed
    pub fn apply(&self, event: &RegistryEvent) -> bool {
        let changed = {
            let mut members = self.members.write();
            match event.kind {
                EventKind::Register => members.insert(event.address),
                EventKind::Unregister => members.remove(&event.address),
            }
        };
        self.last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        changed
    }

    /// Replace the whole set with a fresh snapshot
    pub fn replace(&self, addresses: impl IntoIterator<Item = Address>) {
        let fresh: HashSet<Address> = addresses.into_iter().collect();
        *self.members.write() = fresh;
    }

    /// Copy of the current members; never aliases the live set
    pub fn snapshot(&self) -> HashSet<Address> {
        self.members.read().clone()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.read().contains(address)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        match self.last_event_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

// =============================================================================
// Membership Cache
// =============================================================================

/// Concurrent map from cluster name to its membership
#[derive(Debug, Default)]
pub struct MembershipCache {
    clusters: DashMap<String, Arc<ClusterMembership>>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for a cluster, creating it atomically if absent
    pub fn entry(&self, cluster: &str) -> Arc<ClusterMembership> {
        if let Some(existing) = self.clusters.get(cluster) {
            return existing.value().clone();
        }
        self.clusters
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(ClusterMembership::new(cluster)))
            .value()
            .clone()
    }

    pub fn get(&self, cluster: &str) -> Option<Arc<ClusterMembership>> {
        self.clusters.get(cluster).map(|e| e.value().clone())
    }

    /// Names of every cluster with a cache entry
    pub fn clusters(&self) -> Vec<String> {
        self.clusters.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Parse the fields of a registry hash into addresses.
///
/// Fields that are not `ip:port` are left out; they are stale store data, not
/// channel traffic.
pub fn addresses_from_snapshot(cluster: &str, fields: &HashMap<String, String>) -> Vec<Address> {
    fields
        .keys()
        .filter_map(|field| match field.parse::<Address>() {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(cluster = %cluster, field = %field, error = %e, "Skipping malformed registry field");
                None
            }
        })
        .collect()
}

// =============================================================================
// Cache Updater
// =============================================================================

/// Listener that keeps one cluster's membership in sync with its channel
pub struct MembershipUpdater {
    membership: Arc<ClusterMembership>,
    store: RegistryStoreRef,
    registry_key: String,
    stats: Arc<RegistryStats>,
}

impl MembershipUpdater {
    pub fn new(
        membership: Arc<ClusterMembership>,
        store: RegistryStoreRef,
        registry_key: String,
        stats: Arc<RegistryStats>,
    ) -> Self {
        Self {
            membership,
            store,
            registry_key,
            stats,
        }
    }
}

#[async_trait]
impl EventListener for MembershipUpdater {
    async fn on_event(&self, message: &str) -> Result<()> {
        let event = RegistryEvent::decode(message)?;
        let changed = self.membership.apply(&event);
        RegistryStats::incr(&self.stats.events_applied);
        debug!(
            cluster = %self.membership.cluster(),
            address = %event.address,
            kind = %event.kind,
            changed,
            "Applied membership event"
        );
        Ok(())
    }

    async fn on_subscribed(&self) -> Result<()> {
        let fields = self.store.hash_get_all(&self.registry_key).await?;
        let addresses = addresses_from_snapshot(self.membership.cluster(), &fields);
        debug!(
            cluster = %self.membership.cluster(),
            members = addresses.len(),
            "Resynchronised membership from store snapshot"
        );
        self.membership.replace(addresses);
        Ok(())
    }
}
