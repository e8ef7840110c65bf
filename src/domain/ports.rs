//! Domain Ports - Collaborator trait definitions for the registry client
//!
//! These traits define the boundaries between the registry core and the
//! systems it consumes: the shared store, the configuration source and the
//! event listeners attached to a cluster.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Message Stream
// =============================================================================

/// Stream of raw messages received on one subscribed channel.
///
/// The stream owns the dedicated connection backing the subscription. It ends
/// when the connection closes; an `Err` item reports a transport fault.
/// Dropping the stream unsubscribes and releases the connection.
pub type MessageStream = BoxStream<'static, Result<String>>;

// =============================================================================
// Registry Store Port
// =============================================================================

/// Port for the shared key/value hash store and its publish/subscribe bus
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Set `field` to `value` in the hash stored at `key`
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Delete `field` from the hash stored at `key`, returning whether it existed
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Read every field of the hash stored at `key`
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Publish a message, returning the number of receivers reached
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    /// Subscribe to a channel on a dedicated connection.
    ///
    /// Returns once the subscription is established; messages published
    /// after that point are delivered on the stream in channel order.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;

    /// Get store name for logging
    fn store_name(&self) -> &str;
}

// =============================================================================
// Configuration Source Port
// =============================================================================

/// Port for flat key/value configuration lookup
pub trait ConfigSource: Send + Sync {
    /// Get the raw value for a dotted configuration key
    fn get(&self, key: &str) -> Option<String>;
}

// =============================================================================
// Event Listener Port
// =============================================================================

/// Callback attached to a cluster's event channel
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handle one raw event message (`<ip:port>-<KIND>`).
    ///
    /// Returning a protocol error ends the cluster's subscription.
    async fn on_event(&self, message: &str) -> Result<()>;

    /// Called by the subscription task once the channel is subscribed and
    /// before any further event reaches this listener: on every (re)connect,
    /// and when the listener joins a subscription that is already running.
    ///
    /// Events published before this call may have been missed; listeners
    /// that keep state re-read it here.
    async fn on_subscribed(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type RegistryStoreRef = Arc<dyn RegistryStore>;
pub type ConfigSourceRef = Arc<dyn ConfigSource>;
pub type EventListenerRef = Arc<dyn EventListener>;

/// Compare two listener handles by identity
pub fn same_listener(a: &EventListenerRef, b: &EventListenerRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
