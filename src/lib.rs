//! Cluster Registry - Service Registry Client
//!
//! Lets server processes announce their address under a named cluster, and
//! lets other processes discover the live membership of a cluster. Membership
//! is cached in-process and kept fresh over a publish/subscribe channel
//! instead of by polling.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             Registry Client                                  │
//! │          register · unregister · subscribe · unsubscribe · lookup            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Membership    │  │    Listener     │  │      Subscription           │  │
//! │  │     Cache       │◄─┤    Registry     │◄─┤      Manager                │  │
//! │  │ (single-flight) │  │ (ordered lists) │  │ (1 supervised task/cluster) │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────┬───────────────┘  │
//! │                                                          │                   │
//! │                    ┌─────────────────────────────────────┘                   │
//! │                    │  Address Codec  "<ip:port>-REGISTER|UNREGISTER"         │
//! ├────────────────────┴────────────────────────────────────────────────────────┤
//! │                           Registry Store                                     │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │        Redis                │  │           Memory                    │   │
//! │  │  (hashes + pub/sub)         │  │  (DashMap + broadcast)              │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Codec, membership cache, subscriptions and the client facade
//! - [`store`]: Registry store implementations
//! - [`config`]: Configuration keys and sources
//! - [`domain`]: Collaborator traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use config::{MapConfig, PoolConfig, RegistryConfig, RestartPolicy};

pub use domain::ports::{
    ConfigSource, ConfigSourceRef, EventListener, EventListenerRef, MessageStream,
    RegistryStore, RegistryStoreRef,
};

pub use error::{Error, Result};

pub use registry::{
    Address, EventKind, MembershipView, RegistryClient, RegistryEvent, RegistryStatsSnapshot,
    SubscriptionStatus,
};

pub use store::{MemoryStore, RedisStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
