//! Cache configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::invalidation::DEFAULT_INVALIDATION_CHANNEL;
use crate::{CacheError, Result};

/// Write-durability contract between L1 and L2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// L2 then L1, both must succeed; L2 is rolled back if L1 fails
    Strong,
    /// L2 must succeed; L1 failures are logged
    #[default]
    Eventual,
    /// Both layers attempted, backend failures never surface
    BestEffort,
}

/// Built-in reactions to an L2 failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Serve reads from L1 and keep writing L1 during an L2 outage
    #[default]
    DegradeToL1,
    /// Surface the L2 failure to the caller
    FailFast,
    /// Log and continue: reads miss, writes no-op
    Ignore,
}

/// What a full background queue does with a new side-effect job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Drop the new job and log a warning
    #[default]
    DropAndLog,
    /// Suspend the submitter until the queue has room
    Block,
}

/// Per-cache-name configuration, immutable once handed to an orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSpecification {
    /// L2 entry lifetime
    pub ttl: Duration,
    /// L1 entry lifetime, independent of `ttl`
    pub local_ttl: Duration,
    /// Maximum number of entries in L1
    pub local_max_capacity: u64,
    pub consistency_level: ConsistencyLevel,
    pub enable_bloom_filter: bool,
    /// Expected insertions for the first bloom slice
    pub bloom_expected_insertions: u64,
    /// Target false-positive probability per bloom slice
    pub bloom_false_positive_rate: f64,
    /// If false, storing an absent value is an argument error
    pub allow_null_values: bool,
    /// Prefix for L2 keys
    pub key_prefix: String,
}

impl Default for CacheSpecification {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),       // 1 hour
            local_ttl: Duration::from_secs(300), // 5 minutes
            local_max_capacity: 10_000,
            consistency_level: ConsistencyLevel::Eventual,
            enable_bloom_filter: false,
            bloom_expected_insertions: 1_000_000,
            bloom_false_positive_rate: 0.03,
            allow_null_values: true,
            key_prefix: "cache:".to_owned(),
        }
    }
}

impl CacheSpecification {
    /// Specification with the given L2 TTL and defaults elsewhere
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_local_ttl(mut self, local_ttl: Duration) -> Self {
        self.local_ttl = local_ttl;
        self
    }

    /// Derive the L1 TTL as a fraction of the L2 TTL.
    ///
    /// The ratio must be in `(0, 1]`; the result is rounded down to whole
    /// milliseconds and must stay positive.
    pub fn with_local_ttl_ratio(mut self, ratio: f64) -> Result<Self> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(CacheError::invalid(format!(
                "local TTL ratio must be in (0, 1], got {ratio}"
            )));
        }
        let millis = (self.ttl.as_millis() as f64 * ratio) as u64;
        if millis == 0 {
            return Err(CacheError::invalid(format!(
                "local TTL derived from {:?} x {ratio} is not positive",
                self.ttl
            )));
        }
        self.local_ttl = Duration::from_millis(millis);
        Ok(self)
    }

    pub fn with_local_max_capacity(mut self, capacity: u64) -> Self {
        self.local_max_capacity = capacity;
        self
    }

    pub fn with_consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = level;
        self
    }

    pub fn with_bloom_filter(mut self, enabled: bool) -> Self {
        self.enable_bloom_filter = enabled;
        self
    }

    pub fn with_bloom_sizing(mut self, expected_insertions: u64, false_positive_rate: f64) -> Self {
        self.bloom_expected_insertions = expected_insertions;
        self.bloom_false_positive_rate = false_positive_rate;
        self
    }

    pub fn with_null_values(mut self, allowed: bool) -> Self {
        self.allow_null_values = allowed;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Reject values the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(CacheError::invalid("ttl must be positive"));
        }
        if self.local_ttl.is_zero() {
            return Err(CacheError::invalid("local_ttl must be positive"));
        }
        if self.local_max_capacity == 0 {
            return Err(CacheError::invalid("local_max_capacity must be positive"));
        }
        if self.enable_bloom_filter {
            if self.bloom_expected_insertions == 0 {
                return Err(CacheError::invalid(
                    "bloom_expected_insertions must be positive",
                ));
            }
            let fpp = self.bloom_false_positive_rate;
            if !(fpp > 0.0 && fpp < 1.0) {
                return Err(CacheError::invalid(format!(
                    "bloom_false_positive_rate must be in (0, 1), got {fpp}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-orchestrator (and per-manager) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Reaction to L2 failures
    pub fallback: FallbackStrategy,
    /// Maximum queued background jobs (refills, filter inserts)
    pub queue_capacity: usize,
    /// Maximum background jobs running at once
    pub background_concurrency: usize,
    pub backpressure: Backpressure,
    /// Identifies this process in invalidation messages
    pub node_id: String,
    /// Pub/sub channel carrying cross-node invalidations
    pub invalidation_channel: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackStrategy::DegradeToL1,
            queue_capacity: 1024,
            background_concurrency: 8,
            backpressure: Backpressure::DropAndLog,
            node_id: uuid::Uuid::new_v4().to_string(),
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_owned(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_background_concurrency(mut self, concurrency: usize) -> Self {
        self.background_concurrency = concurrency;
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_invalidation_channel(mut self, channel: impl Into<String>) -> Self {
        self.invalidation_channel = channel.into();
        self
    }
}
