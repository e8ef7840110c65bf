//! Registry Client
//!
//! Public facade over the registry core. One client is built at startup with
//! its store and configuration source injected, then shared by reference.
//!
//! Writes go straight to the store and are announced on the cluster channel.
//! Reads are served from the membership cache, which is loaded from a store
//! snapshot on the first lookup of a cluster and kept fresh by that cluster's
//! subscription task from then on.

use crate::config::{registry_key, resolve_cluster, RegistryConfig};
use crate::domain::ports::{ConfigSourceRef, EventListenerRef, RegistryStoreRef};
use crate::error::{Error, Result};
use crate::registry::address::{Address, RegistryEvent};
use crate::registry::listeners::ListenerRegistry;
use crate::registry::membership::{
    addresses_from_snapshot, ClusterMembership, MembershipCache, MembershipUpdater,
};
use crate::registry::stats::{RegistryStats, RegistryStatsSnapshot};
use crate::registry::subscription::{SubscriptionManager, SubscriptionStatus};
use crate::store::RedisStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Membership View
// =============================================================================

/// Membership of a cluster together with how fresh it is
#[derive(Debug, Clone, Serialize)]
pub struct MembershipView {
    /// Cluster the lookup key resolved to
    pub cluster: String,
    /// Known members, sorted
    pub addresses: Vec<Address>,
    /// State of the subscription keeping the set fresh
    pub status: SubscriptionStatus,
    /// When the last channel event was applied
    pub last_event_at: Option<DateTime<Utc>>,
    /// When the cluster was first loaded
    pub initialized_at: Option<DateTime<Utc>>,
    /// The set is not being kept up to date
    pub stale: bool,
}

// =============================================================================
// Registry Client
// =============================================================================

/// Service registry client
pub struct RegistryClient {
    config: RegistryConfig,
    store: RegistryStoreRef,
    source: ConfigSourceRef,
    membership: MembershipCache,
    subscriptions: SubscriptionManager,
    stats: Arc<RegistryStats>,
}

impl RegistryClient {
    /// Create a client over an existing store
    pub fn new(config: RegistryConfig, store: RegistryStoreRef, source: ConfigSourceRef) -> Self {
        let stats = Arc::new(RegistryStats::new());
        let subscriptions = SubscriptionManager::new(
            store.clone(),
            Arc::new(ListenerRegistry::new()),
            stats.clone(),
            config.restart.clone(),
        );

        info!(
            cluster = %config.cluster,
            store = %store.store_name(),
            identity = %config.identity,
            "Registry client created"
        );

        Self {
            config,
            store,
            source,
            membership: MembershipCache::new(),
            subscriptions,
            stats,
        }
    }

    /// Read the configuration from `source` and connect to the Redis store
    /// it names
    pub fn connect(source: ConfigSourceRef) -> Result<Self> {
        let config = RegistryConfig::from_source(source.as_ref())?;
        let store: RegistryStoreRef = Arc::new(RedisStore::new(&config)?);
        Ok(Self::new(config, store, source))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Announce `address` as a member of this process's cluster.
    ///
    /// Re-registering an address overwrites its entry.
    pub async fn register(&self, address: &Address) -> Result<()> {
        self.ensure_open()?;
        address.validate()?;

        let key = self.config.own_registry_key();
        self.store
            .hash_set(&key, &address.to_string(), &self.config.identity)
            .await?;
        let receivers = self
            .store
            .publish(&key, &RegistryEvent::register(*address).encode())
            .await?;

        RegistryStats::incr(&self.stats.registrations);
        info!(cluster = %self.config.cluster, address = %address, receivers, "Registered address");
        Ok(())
    }

    /// Withdraw `address` from this process's cluster.
    ///
    /// The event is published even if the address was not registered.
    pub async fn unregister(&self, address: &Address) -> Result<()> {
        self.ensure_open()?;
        address.validate()?;

        let key = self.config.own_registry_key();
        let existed = self.store.hash_delete(&key, &address.to_string()).await?;
        let receivers = self
            .store
            .publish(&key, &RegistryEvent::unregister(*address).encode())
            .await?;

        RegistryStats::incr(&self.stats.unregistrations);
        info!(
            cluster = %self.config.cluster,
            address = %address,
            existed,
            receivers,
            "Unregistered address"
        );
        Ok(())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Attach a listener to a cluster's events.
    ///
    /// Returns without waiting for the subscription to be established.
    pub fn subscribe(&self, cluster: &str, listener: EventListenerRef) -> Result<()> {
        self.subscriptions.subscribe(cluster, listener)
    }

    /// Detach a listener. The cluster's subscription is stopped once its
    /// last listener is gone.
    pub async fn unsubscribe(&self, cluster: &str, listener: &EventListenerRef) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.subscriptions.unsubscribe(cluster, listener).await)
    }

    pub fn subscription_status(&self, cluster: &str) -> Option<SubscriptionStatus> {
        self.subscriptions.status(cluster)
    }

    /// Wait until the cluster's subscription is receiving, or has ended
    pub async fn wait_until_active(&self, cluster: &str) -> Option<SubscriptionStatus> {
        self.subscriptions.wait_until_settled(cluster).await
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Current members of the cluster `key` maps to.
    ///
    /// The first lookup of a cluster loads it from the store and subscribes
    /// to its channel; concurrent first lookups share that work. The returned
    /// set is a copy.
    pub async fn lookup(&self, key: &str) -> Result<HashSet<Address>> {
        let (_, membership) = self.load(key).await?;
        Ok(membership.snapshot())
    }

    /// Like [`lookup`](Self::lookup), with the subscription state and age of
    /// the returned set
    pub async fn lookup_view(&self, key: &str) -> Result<MembershipView> {
        let (cluster, membership) = self.load(key).await?;

        let mut addresses: Vec<Address> = membership.snapshot().into_iter().collect();
        addresses.sort();
        let status = self
            .subscriptions
            .status(&cluster)
            .unwrap_or(SubscriptionStatus::Stopped);

        Ok(MembershipView {
            cluster,
            addresses,
            status,
            last_event_at: membership.last_event_at(),
            initialized_at: membership.initialized_at(),
            stale: !status.is_live(),
        })
    }

    async fn load(&self, key: &str) -> Result<(String, Arc<ClusterMembership>)> {
        self.ensure_open()?;
        RegistryStats::incr(&self.stats.lookups);

        let cluster = resolve_cluster(self.source.as_ref(), key).ok_or_else(|| Error::ClusterNotFound {
            key: key.to_string(),
        })?;

        let membership = self.membership.entry(&cluster);
        let entry = membership.clone();
        let (store, stats, subscriptions) = (&self.store, &self.stats, &self.subscriptions);
        let name = cluster.as_str();
        membership
            .initialize(move || async move {
                let registry_key = registry_key(name);
                let fields = store.hash_get_all(&registry_key).await?;
                entry.replace(addresses_from_snapshot(name, &fields));

                let updater = Arc::new(MembershipUpdater::new(
                    entry.clone(),
                    store.clone(),
                    registry_key,
                    stats.clone(),
                ));
                subscriptions.subscribe(name, updater)?;

                // The task re-reads the snapshot between subscribing and
                // going live, so Active means no event was missed
                match subscriptions.wait_while_starting(name).await {
                    Some(SubscriptionStatus::Active) => {}
                    status => warn!(
                        cluster = %name,
                        status = ?status,
                        "Cluster loaded without a live subscription"
                    ),
                }

                info!(cluster = %name, members = entry.len(), "Cluster membership loaded");
                Ok(())
            })
            .await?;

        debug!(key = %key, cluster = %cluster, "Lookup resolved");
        Ok((cluster, membership))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_shutdown(&self) -> bool {
        self.subscriptions.is_shutdown()
    }

    /// Stop every subscription and wait for their connections to be released.
    ///
    /// Later calls on the client fail with [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        info!(cluster = %self.config.cluster, "Shutting down registry client");
        self.subscriptions.shutdown().await;
        info!(stats = ?self.stats.snapshot(), "Registry client stopped");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.subscriptions.is_shutdown() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("cluster", &self.config.cluster)
            .field("store", &self.store.store_name())
            .field("clusters", &self.membership.clusters())
            .finish()
    }
}
