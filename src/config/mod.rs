//! Registry Configuration
//!
//! Typed view over the `registry.redis.*` keys and the lookup-key to cluster
//! mapping table (`service.vgroup_mapping.<key>`).

pub mod source;

pub use source::MapConfig;

use crate::domain::ports::ConfigSource;
use crate::error::{Error, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

// =============================================================================
// Keys
// =============================================================================

/// Prefix for every registry key, store key and channel name
pub const REGISTRY_PREFIX: &str = "registry.redis.";

/// Prefix of the lookup-key to cluster mapping table
pub const SERVICE_MAPPING_PREFIX: &str = "service.vgroup_mapping.";

pub const DEFAULT_CLUSTER: &str = "default";

const KEY_CLUSTER: &str = "cluster";
const KEY_SERVER_ADDR: &str = "serverAddr";
const KEY_PASSWORD: &str = "password";
const KEY_DB: &str = "db";
const KEY_IDENTITY: &str = "identity";

/// Store key (and channel name) holding a cluster's registrations
pub fn registry_key(cluster: &str) -> String {
    format!("{}{}", REGISTRY_PREFIX, cluster)
}

/// Configuration key mapping a lookup key to a cluster name
pub fn mapping_key(lookup_key: &str) -> String {
    format!("{}{}", SERVICE_MAPPING_PREFIX, lookup_key)
}

/// Resolve a lookup key to its cluster name
pub fn resolve_cluster(source: &dyn ConfigSource, lookup_key: &str) -> Option<String> {
    source
        .get(&mapping_key(lookup_key))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Connection pool tuning. `None` means "use the pool default".
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Validate a connection before handing it out
    pub test_on_borrow: bool,
    /// Validate a connection before returning it to the idle set
    pub test_on_return: bool,
    /// Validate examined connections during eviction runs
    pub test_while_idle: bool,
    /// Maximum idle connections kept
    pub max_idle: Option<usize>,
    /// Minimum idle connections kept
    pub min_idle: Option<usize>,
    /// Maximum connections handed out at once (subscriptions included)
    pub max_total: Option<usize>,
    /// Maximum time to wait for a connection
    pub max_wait: Option<Duration>,
    /// Idle connections examined per eviction run
    pub num_tests_per_eviction_run: Option<u32>,
    /// Interval between eviction runs; unset disables eviction
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle time after which a connection is evictable
    pub min_evictable_idle: Option<Duration>,
}

impl PoolConfig {
    pub const DEFAULT_MAX_TOTAL: usize = 8;
    pub const DEFAULT_MAX_IDLE: usize = 8;
    pub const DEFAULT_TESTS_PER_EVICTION_RUN: usize = 3;

    pub fn effective_max_total(&self) -> usize {
        self.max_total.unwrap_or(Self::DEFAULT_MAX_TOTAL)
    }

    pub fn effective_max_idle(&self) -> usize {
        self.max_idle.unwrap_or(Self::DEFAULT_MAX_IDLE)
    }

    /// Idle connections kept open ahead of demand, capped by `max_idle`
    pub fn effective_min_idle(&self) -> usize {
        self.min_idle.unwrap_or(0).min(self.effective_max_idle())
    }

    pub fn effective_tests_per_eviction_run(&self) -> usize {
        self.num_tests_per_eviction_run
            .map(|n| n as usize)
            .unwrap_or(Self::DEFAULT_TESTS_PER_EVICTION_RUN)
    }

    fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        // max.total overrides the older max.active spelling
        let max_total = positive(source, "max.total")?.or(positive(source, "max.active")?);
        let max_wait = match positive(source, "max.wait")? {
            Some(ms) => Some(ms),
            None => positive(source, "timeout")?,
        };

        Ok(Self {
            test_on_borrow: flag(source, "test.on.borrow", true)?,
            test_on_return: flag(source, "test.on.return", false)?,
            test_while_idle: flag(source, "test.while.idle", false)?,
            max_idle: positive_as(source, "max.idle")?,
            min_idle: positive_as(source, "min.idle")?,
            max_total: max_total.map(|v| narrow(v, "max.total")).transpose()?,
            max_wait: max_wait.map(Duration::from_millis),
            num_tests_per_eviction_run: positive_as(source, "num.tests.per.eviction.run")?,
            time_between_eviction_runs: positive(source, "time.between.eviction.runs.millis")?
                .map(Duration::from_millis),
            min_evictable_idle: positive(source, "min.evictable.idle.time.millis")?
                .map(Duration::from_millis),
        })
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            test_on_borrow: true,
            test_on_return: false,
            test_while_idle: false,
            max_idle: None,
            min_idle: None,
            max_total: None,
            max_wait: None,
            num_tests_per_eviction_run: None,
            time_between_eviction_runs: None,
            min_evictable_idle: None,
        }
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Backoff applied when a subscription drops on a transport fault
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// First retry delay
    pub initial_interval: Duration,
    /// Upper bound on the retry delay
    pub max_interval: Duration,
    /// Consecutive failed attempts before giving up (0 = never)
    pub max_attempts: u32,
}

impl RestartPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();
        let initial_interval = positive(source, "restart.initial.millis")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_interval);
        let max_interval = positive(source, "restart.max.millis")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_interval)
            .max(initial_interval);
        let max_attempts =
            positive_as(source, "restart.max.attempts")?.unwrap_or(defaults.max_attempts);

        Ok(Self {
            initial_interval,
            max_interval,
            max_attempts,
        })
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

// =============================================================================
// Registry Configuration
// =============================================================================

/// Configuration for a registry client
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cluster this process registers under
    pub cluster: String,
    /// Store host
    pub host: String,
    /// Store port
    pub port: u16,
    /// Store credential
    pub password: Option<String>,
    /// Store database index
    pub db: i64,
    /// Pool tuning
    pub pool: PoolConfig,
    /// Subscription restart policy
    pub restart: RestartPolicy,
    /// Value written next to each registered address
    pub identity: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cluster: DEFAULT_CLUSTER.to_string(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            pool: PoolConfig::default(),
            restart: RestartPolicy::default(),
            identity: process_identity(),
        }
    }
}

impl RegistryConfig {
    /// Read the registry configuration from a source
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let cluster = get(source, KEY_CLUSTER)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CLUSTER.to_string());

        let server_addr = get(source, KEY_SERVER_ADDR).ok_or_else(|| {
            Error::Configuration(format!("missing {}{}", REGISTRY_PREFIX, KEY_SERVER_ADDR))
        })?;
        let (host, port) = parse_server_addr(&server_addr)?;

        let db = match get(source, KEY_DB) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                Error::Configuration(format!("{}{} must be an integer: '{}'", REGISTRY_PREFIX, KEY_DB, raw))
            })?,
            None => 0,
        };

        Ok(Self {
            cluster,
            host,
            port,
            password: get(source, KEY_PASSWORD).filter(|p| !p.is_empty()),
            db,
            pool: PoolConfig::from_source(source)?,
            restart: RestartPolicy::from_source(source)?,
            identity: get(source, KEY_IDENTITY)
                .filter(|i| !i.is_empty())
                .unwrap_or_else(process_identity),
        })
    }

    /// Store key for this process's own cluster
    pub fn own_registry_key(&self) -> String {
        registry_key(&self.cluster)
    }

    /// Connection URL for the store
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}/{}",
                urlencoding::encode(password),
                self.server_addr(),
                self.db
            ),
            None => format!("redis://{}/{}", self.server_addr(), self.db),
        }
    }

    /// Store address in `host:port` form
    pub fn server_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// `<pid>@<hostname>` of the running process
pub fn process_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", std::process::id(), host)
}

fn parse_server_addr(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw.trim().rsplit_once(':').ok_or_else(|| {
        Error::Configuration(format!("{}{} must be host:port: '{}'", REGISTRY_PREFIX, KEY_SERVER_ADDR, raw))
    })?;
    let port = port.parse::<u16>().ok().filter(|p| *p > 0).ok_or_else(|| {
        Error::Configuration(format!("invalid port in {}{}: '{}'", REGISTRY_PREFIX, KEY_SERVER_ADDR, raw))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::Configuration(format!(
            "empty host in {}{}",
            REGISTRY_PREFIX, KEY_SERVER_ADDR
        )));
    }
    Ok((host.to_string(), port))
}

fn get(source: &dyn ConfigSource, key: &str) -> Option<String> {
    source
        .get(&format!("{}{}", REGISTRY_PREFIX, key))
        .map(|v| v.trim().to_string())
}

fn flag(source: &dyn ConfigSource, key: &str, default: bool) -> Result<bool> {
    match get(source, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(Error::Configuration(format!(
                "{}{} must be true or false: '{}'",
                REGISTRY_PREFIX, key, raw
            ))),
        },
    }
}

/// Non-negative integer where zero means unset
fn positive(source: &dyn ConfigSource, key: &str) -> Result<Option<u64>> {
    match get(source, key) {
        None => Ok(None),
        Some(raw) => {
            let value = raw.parse::<u64>().map_err(|_| {
                Error::Configuration(format!(
                    "{}{} must be a non-negative integer: '{}'",
                    REGISTRY_PREFIX, key, raw
                ))
            })?;
            Ok((value > 0).then_some(value))
        }
    }
}

/// [`positive`] narrowed to a smaller integer type
fn positive_as<T: TryFrom<u64>>(source: &dyn ConfigSource, key: &str) -> Result<Option<T>> {
    positive(source, key)?.map(|v| narrow(v, key)).transpose()
}

fn narrow<T: TryFrom<u64>>(value: u64, key: &str) -> Result<T> {
    T::try_from(value).map_err(|_| {
        Error::Configuration(format!("{}{} is out of range: {}", REGISTRY_PREFIX, key, value))
    })
}
