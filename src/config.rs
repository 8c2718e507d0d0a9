use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::messaging::{ConsumeOptions, InMemoryBroker, RedpandaConfig, RedpandaTransport, Transport};
use crate::orders::DispatchMode;
use crate::outbox::RelayOptions;
use crate::utils::RetryConfig;

// ============================================================================
// Configuration
// ============================================================================
//
// Read from the process environment (after an optional `.env` file). Every
// key has a default; an empty environment runs on the memory broker and
// store, which are private to each process.
//
// ============================================================================

pub const DEFAULT_CUSTOMER_ID: &str = "2de01b0d-fb88-43c1-b462-ba4c72f51af8";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerUrl {
    Memory,
    /// Comma-separated `host:port` bootstrap list
    Redpanda { brokers: String },
}

impl FromStr for BrokerUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory://" || s == "memory" {
            return Ok(BrokerUrl::Memory);
        }
        let brokers = s
            .strip_prefix("redpanda://")
            .or_else(|| s.strip_prefix("kafka://"))
            .ok_or_else(|| "expected memory:// or redpanda://host:port".to_string())?;
        if brokers.split(',').any(|b| b.trim().is_empty()) {
            return Err("empty broker address".to_string());
        }
        Ok(BrokerUrl::Redpanda {
            brokers: brokers.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Memory,
    Postgres(String),
}

impl FromStr for DatabaseUrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory://" || s == "memory" {
            Ok(DatabaseUrl::Memory)
        } else if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            Ok(DatabaseUrl::Postgres(s.to_string()))
        } else {
            Err("expected memory:// or postgres://...".to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerUrl,
    pub database: DatabaseUrl,
    pub http_addr: SocketAddr,
    pub metrics_port: u16,
    pub orders_queue: String,
    pub dispatch_mode: DispatchMode,
    pub consumer_group: String,
    pub consumer_prefetch: u16,
    pub max_redeliveries: u32,
    pub handler_timeout: Duration,
    pub drain_timeout: Duration,
    pub connect_max_attempts: u32,
    pub connect_initial_backoff: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub default_customer_id: Uuid,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            broker: parse(&lookup, "BROKER_URL", "memory://")?,
            database: parse(&lookup, "DATABASE_URL", "memory://")?,
            http_addr: parse(&lookup, "HTTP_ADDR", "0.0.0.0:3333")?,
            metrics_port: parse(&lookup, "METRICS_PORT", "9091")?,
            orders_queue: parse(&lookup, "ORDERS_QUEUE", "orders")?,
            dispatch_mode: parse(&lookup, "DISPATCH_MODE", "outbox")?,
            consumer_group: parse(&lookup, "CONSUMER_GROUP", "invoices")?,
            consumer_prefetch: parse(&lookup, "CONSUMER_PREFETCH", "10")?,
            max_redeliveries: parse(&lookup, "MAX_REDELIVERIES", "3")?,
            handler_timeout: millis(&lookup, "HANDLER_TIMEOUT_MS", "30000")?,
            drain_timeout: millis(&lookup, "DRAIN_TIMEOUT_MS", "10000")?,
            connect_max_attempts: parse(&lookup, "CONNECT_MAX_ATTEMPTS", "5")?,
            connect_initial_backoff: millis(&lookup, "CONNECT_INITIAL_BACKOFF_MS", "200")?,
            outbox_poll_interval: millis(&lookup, "OUTBOX_POLL_INTERVAL_MS", "500")?,
            outbox_batch_size: parse(&lookup, "OUTBOX_BATCH_SIZE", "100")?,
            default_customer_id: parse(&lookup, "DEFAULT_CUSTOMER_ID", DEFAULT_CUSTOMER_ID)?,
        };

        if config.orders_queue.trim().is_empty() {
            return Err(invalid("ORDERS_QUEUE", &config.orders_queue, "must not be empty"));
        }
        if config.consumer_prefetch == 0 {
            return Err(invalid("CONSUMER_PREFETCH", "0", "must be at least 1"));
        }
        if config.connect_max_attempts == 0 {
            return Err(invalid("CONNECT_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if config.outbox_batch_size == 0 {
            return Err(invalid("OUTBOX_BATCH_SIZE", "0", "must be at least 1"));
        }
        Ok(config)
    }

    /// Broker transport named by `BROKER_URL`. The memory broker is local to
    /// this process.
    pub fn transport(&self) -> Arc<dyn Transport> {
        match &self.broker {
            BrokerUrl::Memory => Arc::new(InMemoryBroker::new()),
            BrokerUrl::Redpanda { brokers } => Arc::new(RedpandaTransport::new(RedpandaConfig::new(
                brokers.clone(),
                self.consumer_group.clone(),
            ))),
        }
    }

    pub fn connect_retry(&self) -> RetryConfig {
        RetryConfig::connect(self.connect_max_attempts, self.connect_initial_backoff)
    }

    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            prefetch: self.consumer_prefetch,
            max_redeliveries: self.max_redeliveries,
            handler_timeout: self.handler_timeout,
            drain_timeout: self.drain_timeout,
            ..ConsumeOptions::default()
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            poll_interval: self.outbox_poll_interval,
            batch_size: self.outbox_batch_size,
            ..RelayOptions::default()
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim().parse::<T>().map_err(|e| invalid(key, &raw, e))
}

fn millis<F>(lookup: &F, key: &'static str, default: &str) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse::<F, u64>(lookup, key, default).map(Duration::from_millis)
}
