//! Store Adapters
//!
//! Implementations of [`RegistryStore`](crate::domain::ports::RegistryStore):
//! - **MemoryStore**: in-process hashes and broadcast channels
//! - **RedisStore**: Redis hashes and pub/sub over a bounded connection provider

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
