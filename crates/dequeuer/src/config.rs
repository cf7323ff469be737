//! Dispatcher configuration
//!
//! Configuration is either built in code with the `with_*` builders or read
//! from environment variables with [`DequeuerConfig::from_env`].

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest batch a single receive call may request
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Queue slots per worker, for both pool kinds
pub const QUEUE_SLOTS_PER_WORKER: usize = 200;

/// Longest long-poll wait SQS accepts
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Longest visibility timeout SQS accepts (12 hours)
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(43_200);

/// Default long-poll wait
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);

/// Default visibility timeout (lease on received messages)
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a worker thread blocks on the queue before re-checking liveness
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which pool a dispatch request is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Lazily-built isolated pool, sized by `process_concurrency`
    #[default]
    Isolated,
    /// Persistent worker threads, sized by `thread_concurrency`
    Threaded,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolated => write!(f, "isolated"),
            Self::Threaded => write!(f, "threaded"),
        }
    }
}

impl FromStr for PoolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "isolated" | "process" => Ok(Self::Isolated),
            "threaded" | "thread" => Ok(Self::Threaded),
            other => Err(ConfigError::invalid(
                "DEQUEUER_ROUTE",
                format!("unknown pool kind '{other}'"),
            )),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Size of the isolated pool (0 = run inline on the caller)
    pub process_concurrency: usize,

    /// Number of persistent worker threads (0 = run inline on the caller)
    pub thread_concurrency: usize,

    /// Capacity of the thread pool's internal queue
    pub internal_queue_capacity: usize,

    /// How long a worker thread waits for an item before re-checking liveness
    #[serde(with = "duration_millis")]
    pub dequeue_timeout: Duration,

    /// Pool kind that receives dispatch requests
    pub route: PoolKind,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

impl WorkerPoolConfig {
    /// Create a pool configuration; queue capacity follows thread concurrency
    pub fn new(process_concurrency: usize, thread_concurrency: usize) -> Self {
        Self {
            process_concurrency,
            thread_concurrency,
            internal_queue_capacity: default_queue_capacity(thread_concurrency),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            route: PoolKind::default(),
        }
    }

    /// Set the isolated pool size
    pub fn with_process_concurrency(mut self, size: usize) -> Self {
        self.process_concurrency = size;
        self
    }

    /// Set the thread count; resets the queue capacity to its default for that count
    pub fn with_thread_concurrency(mut self, size: usize) -> Self {
        self.thread_concurrency = size;
        self.internal_queue_capacity = default_queue_capacity(size);
        self
    }

    /// Override the internal queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.internal_queue_capacity = capacity;
        self
    }

    /// Set the worker dequeue timeout
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Set the pool kind that receives submissions
    pub fn with_route(mut self, route: PoolKind) -> Self {
        self.route = route;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.internal_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "internal_queue_capacity",
                "must be greater than zero",
            ));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "dequeue_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Invocations the isolated pool admits at once, running or waiting
    pub fn isolated_capacity(&self) -> usize {
        default_queue_capacity(self.process_concurrency)
    }
}

fn default_queue_capacity(workers: usize) -> usize {
    (workers * QUEUE_SLOTS_PER_WORKER).max(1)
}

/// Receive call configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Requested batch size (defaults to thread concurrency)
    pub max_messages: Option<usize>,

    /// Long-poll wait
    #[serde(with = "duration_millis")]
    pub wait_time: Duration,

    /// Visibility timeout applied to received messages
    #[serde(with = "duration_millis")]
    pub visibility_timeout: Duration,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            max_messages: None,
            wait_time: DEFAULT_WAIT_TIME,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl ReceiveConfig {
    /// Effective batch size, clamped into `1..=MAX_RECEIVE_BATCH`
    pub fn batch_size(&self, thread_concurrency: usize) -> usize {
        self.max_messages
            .unwrap_or(thread_concurrency)
            .clamp(1, MAX_RECEIVE_BATCH)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages == Some(0) {
            return Err(ConfigError::invalid(
                "max_messages",
                "must be greater than zero",
            ));
        }
        if self.wait_time > MAX_WAIT_TIME {
            return Err(ConfigError::invalid(
                "wait_time",
                format!("must be at most {}s", MAX_WAIT_TIME.as_secs()),
            ));
        }
        if self.visibility_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(ConfigError::invalid(
                "visibility_timeout",
                format!("must be at most {}s", MAX_VISIBILITY_TIMEOUT.as_secs()),
            ));
        }
        Ok(())
    }
}

/// Full dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DequeuerConfig {
    /// Name of the queue to consume
    pub queue_name: String,

    /// Worker pool configuration
    pub pool: WorkerPoolConfig,

    /// Receive configuration
    pub receive: ReceiveConfig,
}

impl DequeuerConfig {
    /// Create a configuration with defaults for the given queue
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            pool: WorkerPoolConfig::default(),
            receive: ReceiveConfig::default(),
        }
    }

    /// Set the isolated pool size
    pub fn with_process_concurrency(mut self, size: usize) -> Self {
        self.pool = self.pool.with_process_concurrency(size);
        self
    }

    /// Set the worker thread count
    pub fn with_thread_concurrency(mut self, size: usize) -> Self {
        self.pool = self.pool.with_thread_concurrency(size);
        self
    }

    /// Set the pool kind that receives submissions
    pub fn with_route(mut self, route: PoolKind) -> Self {
        self.pool = self.pool.with_route(route);
        self
    }

    /// Replace the pool configuration
    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the receive configuration
    pub fn with_receive(mut self, receive: ReceiveConfig) -> Self {
        self.receive = receive;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::invalid("queue_name", "must not be empty"));
        }
        self.pool.validate()?;
        self.receive.validate()
    }

    /// Effective receive batch size
    pub fn batch_size(&self) -> usize {
        self.receive.batch_size(self.pool.thread_concurrency)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SQS_QUEUE_NAME`: Queue to consume (required)
    /// - `DEQUEUER_PROCESS_CONCURRENCY`: Isolated pool size (default: 2)
    /// - `DEQUEUER_THREAD_CONCURRENCY`: Worker thread count (default: 2)
    /// - `DEQUEUER_QUEUE_CAPACITY`: Internal queue capacity (default: 200 per thread)
    /// - `DEQUEUER_DEQUEUE_TIMEOUT_MS`: Worker dequeue timeout (default: 5000)
    /// - `DEQUEUER_ROUTE`: `isolated` or `threaded` (default: isolated)
    /// - `DEQUEUER_MAX_MESSAGES`: Receive batch size (default: thread count, max 10)
    /// - `DEQUEUER_WAIT_TIME_SECS`: Long-poll wait (default: 5)
    /// - `DEQUEUER_VISIBILITY_TIMEOUT_SECS`: Visibility timeout (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_name = lookup("SQS_QUEUE_NAME")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVar("SQS_QUEUE_NAME"))?;

        let process = parse_var(&lookup, "DEQUEUER_PROCESS_CONCURRENCY")?.unwrap_or(2);
        let threads = parse_var(&lookup, "DEQUEUER_THREAD_CONCURRENCY")?.unwrap_or(2);

        let mut pool = WorkerPoolConfig::new(process, threads);
        if let Some(capacity) = parse_var(&lookup, "DEQUEUER_QUEUE_CAPACITY")? {
            pool = pool.with_queue_capacity(capacity);
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "DEQUEUER_DEQUEUE_TIMEOUT_MS")? {
            pool = pool.with_dequeue_timeout(Duration::from_millis(millis));
        }
        if let Some(route) = lookup("DEQUEUER_ROUTE") {
            pool = pool.with_route(route.parse()?);
        }

        let mut receive = ReceiveConfig {
            max_messages: parse_var(&lookup, "DEQUEUER_MAX_MESSAGES")?,
            ..Default::default()
        };
        if let Some(secs) = parse_var(&lookup, "DEQUEUER_WAIT_TIME_SECS")? {
            receive.wait_time = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "DEQUEUER_VISIBILITY_TIMEOUT_SECS")? {
            receive.visibility_timeout = Duration::from_secs(secs);
        }

        let config = Self {
            queue_name,
            pool,
            receive,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
    }
}

/// AWS credentials and region, resolved once at construction
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

impl AwsCredentials {
    /// Resolve credentials from explicit values, falling back to
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_REGION`
    pub fn resolve(
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        region: Option<String>,
    ) -> Result<Self, ConfigError> {
        Self::resolve_with(access_key_id, secret_access_key, region, |key| {
            env::var(key).ok()
        })
    }

    /// Same as [`AwsCredentials::resolve`] with a custom fallback lookup
    pub fn resolve_with<F>(
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        region: Option<String>,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |explicit: Option<String>, key: &'static str| {
            explicit
                .or_else(|| lookup(key))
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingVar(key))
        };

        Ok(Self {
            access_key_id: pick(access_key_id, "AWS_ACCESS_KEY_ID")?,
            secret_access_key: pick(secret_access_key, "AWS_SECRET_ACCESS_KEY")?,
            region: pick(region, "AWS_REGION")?,
        })
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_pool_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.process_concurrency, 2);
        assert_eq!(config.thread_concurrency, 2);
        assert_eq!(config.internal_queue_capacity, 400);
        assert_eq!(config.dequeue_timeout, Duration::from_secs(5));
        assert_eq!(config.route, PoolKind::Isolated);
    }

    #[test]
    fn test_queue_capacity_never_zero() {
        let config = WorkerPoolConfig::new(0, 0);
        assert_eq!(config.internal_queue_capacity, 1);
        assert!(config.validate().is_ok());

        let invalid = config.with_queue_capacity(0);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = DequeuerConfig::new("orders")
            .with_process_concurrency(0)
            .with_thread_concurrency(4)
            .with_route(PoolKind::Threaded);

        assert_eq!(config.queue_name, "orders");
        assert_eq!(config.pool.process_concurrency, 0);
        assert_eq!(config.pool.thread_concurrency, 4);
        assert_eq!(config.pool.internal_queue_capacity, 800);
        assert_eq!(config.pool.isolated_capacity(), 1);
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let receive = ReceiveConfig::default();
        assert_eq!(receive.batch_size(2), 2);
        assert_eq!(receive.batch_size(0), 1);
        assert_eq!(receive.batch_size(64), MAX_RECEIVE_BATCH);

        let explicit = ReceiveConfig {
            max_messages: Some(25),
            ..Default::default()
        };
        assert_eq!(explicit.batch_size(2), 10);
    }

    #[test]
    fn test_receive_limits_are_enforced() {
        assert!(ReceiveConfig::default().validate().is_ok());

        let at_limit = ReceiveConfig {
            max_messages: Some(10),
            wait_time: MAX_WAIT_TIME,
            visibility_timeout: MAX_VISIBILITY_TIMEOUT,
        };
        assert!(at_limit.validate().is_ok());

        let long_wait = ReceiveConfig {
            wait_time: Duration::from_secs(21),
            ..Default::default()
        };
        assert!(matches!(
            long_wait.validate(),
            Err(ConfigError::Invalid { key: "wait_time", .. })
        ));

        let long_lease = ReceiveConfig {
            visibility_timeout: Duration::from_secs(u32::MAX as u64 + 1),
            ..Default::default()
        };
        assert!(matches!(
            long_lease.validate(),
            Err(ConfigError::Invalid { key: "visibility_timeout", .. })
        ));

        let zero_batch = ReceiveConfig {
            max_messages: Some(0),
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());
    }

    #[test]
    fn test_invalid_receive_config_fails_construction() {
        let config = DequeuerConfig::new("jobs").with_receive(ReceiveConfig {
            wait_time: Duration::from_secs(60),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let from_env = DequeuerConfig::from_lookup(lookup_from(&[
            ("SQS_QUEUE_NAME", "jobs"),
            ("DEQUEUER_VISIBILITY_TIMEOUT_SECS", "99999"),
        ]));
        assert!(matches!(
            from_env,
            Err(ConfigError::Invalid { key: "visibility_timeout", .. })
        ));
    }

    #[test]
    fn test_isolated_capacity_follows_process_concurrency() {
        assert_eq!(WorkerPoolConfig::new(2, 0).isolated_capacity(), 400);
        assert_eq!(WorkerPoolConfig::new(0, 4).isolated_capacity(), 1);
    }

    #[test]
    fn test_empty_queue_name_is_invalid() {
        assert!(DequeuerConfig::new("  ").validate().is_err());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = DequeuerConfig::from_lookup(lookup_from(&[("SQS_QUEUE_NAME", "jobs")])).unwrap();
        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.pool, WorkerPoolConfig::default());
        assert_eq!(config.receive, ReceiveConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = DequeuerConfig::from_lookup(lookup_from(&[
            ("SQS_QUEUE_NAME", "jobs"),
            ("DEQUEUER_PROCESS_CONCURRENCY", "0"),
            ("DEQUEUER_THREAD_CONCURRENCY", "8"),
            ("DEQUEUER_QUEUE_CAPACITY", "16"),
            ("DEQUEUER_DEQUEUE_TIMEOUT_MS", "250"),
            ("DEQUEUER_ROUTE", "threaded"),
            ("DEQUEUER_MAX_MESSAGES", "5"),
            ("DEQUEUER_WAIT_TIME_SECS", "20"),
            ("DEQUEUER_VISIBILITY_TIMEOUT_SECS", "120"),
        ]))
        .unwrap();

        assert_eq!(config.pool.process_concurrency, 0);
        assert_eq!(config.pool.thread_concurrency, 8);
        assert_eq!(config.pool.internal_queue_capacity, 16);
        assert_eq!(config.pool.dequeue_timeout, Duration::from_millis(250));
        assert_eq!(config.pool.route, PoolKind::Threaded);
        assert_eq!(config.batch_size(), 5);
        assert_eq!(config.receive.wait_time, Duration::from_secs(20));
        assert_eq!(config.receive.visibility_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_from_lookup_errors() {
        let missing = DequeuerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(missing, Err(ConfigError::MissingVar("SQS_QUEUE_NAME")));

        let bad_number = DequeuerConfig::from_lookup(lookup_from(&[
            ("SQS_QUEUE_NAME", "jobs"),
            ("DEQUEUER_THREAD_CONCURRENCY", "many"),
        ]));
        assert!(matches!(
            bad_number,
            Err(ConfigError::Invalid { key: "DEQUEUER_THREAD_CONCURRENCY", .. })
        ));

        let bad_route = DequeuerConfig::from_lookup(lookup_from(&[
            ("SQS_QUEUE_NAME", "jobs"),
            ("DEQUEUER_ROUTE", "fibers"),
        ]));
        assert!(bad_route.is_err());
    }

    #[test]
    fn test_credentials_prefer_explicit_values() {
        let creds = AwsCredentials::resolve_with(
            Some("AWS_ID".into()),
            None,
            Some("us-east-1".into()),
            lookup_from(&[
                ("AWS_ACCESS_KEY_ID", "env-id"),
                ("AWS_SECRET_ACCESS_KEY", "env-secret"),
            ]),
        )
        .unwrap();

        assert_eq!(creds.access_key_id, "AWS_ID");
        assert_eq!(creds.secret_access_key, "env-secret");
        assert_eq!(creds.region, "us-east-1");
        assert!(!format!("{creds:?}").contains("env-secret"));
    }

    #[test]
    fn test_missing_credentials_fail_fast() {
        let err = AwsCredentials::resolve_with(
            Some("AWS_ID".into()),
            Some("AWS_SECRET".into()),
            None,
            lookup_from(&[]),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("AWS_REGION"));
    }

    #[test]
    fn test_pool_config_serde() {
        let config = WorkerPoolConfig::new(1, 3).with_route(PoolKind::Threaded);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["route"], "threaded");
        assert_eq!(json["dequeue_timeout"], 5000);

        let back: WorkerPoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
