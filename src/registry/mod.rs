//! Registry Core
//!
//! Address codec, membership cache, listener registry and per-cluster
//! subscription tasks, composed by the [`RegistryClient`] facade.
//!
//! # Usage
//!
//! ```ignore
//! use cluster_registry::{MapConfig, RegistryClient};
//! use std::sync::Arc;
//!
//! let source = MapConfig::from_yaml_file("registry.yaml")?;
//! let client = RegistryClient::connect(Arc::new(source))?;
//!
//! // Announce this server
//! client.register(&"10.0.0.1:8091".parse()?).await?;
//!
//! // Discover the members of the cluster a key maps to
//! let members = client.lookup("my_test_tx_group").await?;
//!
//! // Inspect freshness
//! let view = client.lookup_view("my_test_tx_group").await?;
//! if view.stale {
//!     println!("membership of {} is not being updated", view.cluster);
//! }
//!
//! client.shutdown().await;
//! ```

pub mod address;
pub mod client;
pub mod listeners;
pub mod membership;
pub mod stats;
pub mod subscription;

// Re-export main types
pub use address::{Address, EventKind, RegistryEvent, EVENT_SEPARATOR};
pub use client::{MembershipView, RegistryClient};
pub use listeners::ListenerRegistry;
pub use membership::{ClusterMembership, MembershipCache, MembershipUpdater};
pub use stats::{RegistryStats, RegistryStatsSnapshot};
pub use subscription::{SubscriptionManager, SubscriptionStatus};
