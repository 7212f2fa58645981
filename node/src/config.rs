//! Configuration file of the node.

use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use tally_aggregator::{aggregator, submitter, subscriber};
use tally_retry::Policy;
use thiserror::Error;

/// Errors that can occur when validating a [Config].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("threshold must be between 1 and 100: {0}")]
    InvalidThreshold(u8),
    #[error("retry multiplier must be at least 1: {0}")]
    InvalidMultiplier(f64),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Server {
    /// Address operators send attestations to.
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metrics {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ledger {
    /// Base URL of the ledger gateway.
    pub url: String,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Telemetry {
    /// Base URL of the telemetry collector.
    pub url: String,
    pub request_timeout_ms: u64,

    /// Events buffered before new ones are dropped.
    pub mailbox_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Aggregator {
    pub threshold: u8,
    pub start_block: u64,
    pub reconnect_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    pub finish_trace_delay_ms: u64,
    pub gc_period_ms: u64,
    pub task_age: u64,

    /// Checks of the registry before an attestation for an unknown batch is rejected.
    pub task_wait_retries: u32,
    pub task_wait_delay_ms: u64,

    pub block_poll_interval_ms: u64,
    pub block_wait_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Retry {
    pub min_delay_ms: u64,
    pub multiplier: f64,
    pub max_retries: u64,
    pub max_delay_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub level: String,
    pub json: bool,
}

/// Configuration of the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub metrics: Metrics,
    pub ledger: Ledger,
    pub telemetry: Option<Telemetry>,
    pub aggregator: Aggregator,
    pub retry: Retry,
    pub log: Log,
}

impl Config {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), Error> {
        let threshold = self.aggregator.threshold;
        if threshold == 0 || threshold > 100 {
            return Err(Error::InvalidThreshold(threshold));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(Error::InvalidMultiplier(self.retry.multiplier));
        }
        if self.ledger.request_timeout_ms == 0 {
            return Err(Error::Zero("ledger.request_timeout_ms"));
        }
        if self.ledger.poll_interval_ms == 0 {
            return Err(Error::Zero("ledger.poll_interval_ms"));
        }
        if self.aggregator.attempt_timeout_ms == 0 {
            return Err(Error::Zero("aggregator.attempt_timeout_ms"));
        }
        if self.aggregator.gc_period_ms == 0 {
            return Err(Error::Zero("aggregator.gc_period_ms"));
        }
        if self.aggregator.block_poll_interval_ms == 0 {
            return Err(Error::Zero("aggregator.block_poll_interval_ms"));
        }
        if let Some(telemetry) = &self.telemetry {
            if telemetry.mailbox_size == 0 {
                return Err(Error::Zero("telemetry.mailbox_size"));
            }
        }
        self.level()?;
        Ok(())
    }

    /// Returns the configured log level.
    pub fn level(&self) -> Result<tracing::Level, Error> {
        self.log
            .level
            .parse()
            .map_err(|_| Error::InvalidLogLevel(self.log.level.clone()))
    }

    pub fn policy(&self) -> Policy {
        Policy {
            min_delay: Duration::from_millis(self.retry.min_delay_ms),
            multiplier: self.retry.multiplier,
            max_retries: self.retry.max_retries,
            max_delay: self.retry.max_delay_ms.map(Duration::from_millis),
        }
    }

    pub fn aggregator_config(&self) -> aggregator::Config {
        aggregator::Config {
            threshold: self.aggregator.threshold,
            retry: self.policy(),
            submitter: submitter::Config {
                policy: self.policy(),
                attempt_timeout: Duration::from_millis(self.aggregator.attempt_timeout_ms),
            },
            finish_trace_delay: Duration::from_millis(self.aggregator.finish_trace_delay_ms),
            gc_period: Duration::from_millis(self.aggregator.gc_period_ms),
            task_age: self.aggregator.task_age,
            task_wait_retries: self.aggregator.task_wait_retries,
            task_wait_delay: Duration::from_millis(self.aggregator.task_wait_delay_ms),
            block_poll_interval: Duration::from_millis(self.aggregator.block_poll_interval_ms),
            block_wait_timeout: Duration::from_millis(self.aggregator.block_wait_timeout_ms),
        }
    }

    pub fn subscriber_config(&self) -> subscriber::Config {
        subscriber::Config {
            start_block: self.aggregator.start_block,
            reconnect_delay: Duration::from_millis(self.aggregator.reconnect_delay_ms),
        }
    }
}
