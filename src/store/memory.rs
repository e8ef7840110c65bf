//! In-Memory Store
//!
//! Process-local hash store and pub/sub bus backed by DashMap and tokio
//! broadcast channels. Used for embedding and tests; it can also simulate
//! an unavailable store and dropped subscriber connections.

use crate::domain::ports::{MessageStream, RegistryStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default per-channel buffer before slow subscribers lag
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum ChannelMessage {
    Payload(String),
    Disconnect,
}

/// In-memory registry store
pub struct MemoryStore {
    /// Hashes by key
    hashes: DashMap<String, HashMap<String, String>>,
    /// Pub/sub channels by name
    channels: DashMap<String, broadcast::Sender<ChannelMessage>>,
    /// Buffer size for new channels
    channel_capacity: usize,
    /// When set, every command fails with a transport error
    unavailable: AtomicBool,
    /// Subscriptions opened over the store's lifetime
    subscriptions_opened: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            hashes: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
            unavailable: AtomicBool::new(false),
            subscriptions_opened: AtomicU64::new(0),
        }
    }

    /// Make subsequent commands fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End every open subscription on `channel`, as a dropped connection would
    pub fn disconnect_subscribers(&self, channel: &str) -> usize {
        match self.channels.get(channel) {
            Some(sender) => sender.send(ChannelMessage::Disconnect).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribers currently attached to a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn subscriptions_opened(&self) -> u64 {
        self.subscriptions_opened.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Transport("memory store unavailable".to_string()));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<ChannelMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.check_available()?;
        let removed = self
            .hashes
            .get_mut(key)
            .map(|mut fields| fields.remove(field).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_available()?;
        Ok(self
            .hashes
            .get(key)
            .map(|fields| fields.value().clone())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.check_available()?;
        let receivers = match self.channels.get(channel) {
            Some(sender) => sender
                .send(ChannelMessage::Payload(message.to_string()))
                .unwrap_or(0),
            None => 0,
        };
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.check_available()?;
        let receiver = self.sender(channel).subscribe();
        self.subscriptions_opened.fetch_add(1, Ordering::Relaxed);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(ChannelMessage::Payload(message)) => Some((Ok(message), receiver)),
                Ok(ChannelMessage::Disconnect) | Err(RecvError::Closed) => None,
                Err(RecvError::Lagged(skipped)) => Some((
                    Err(Error::Transport(format!(
                        "subscriber lagged behind by {} messages",
                        skipped
                    ))),
                    receiver,
                )),
            }
        });
        Ok(stream.boxed())
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}
