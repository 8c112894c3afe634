//! Tunables collected from every component in §4, validated at
//! construction time rather than owning a file format or CLI surface
//! (those stay with the embedding binary, per §1).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed chunk size for large-file paging (§4.6). Not configurable, by
/// design — a constant, not a tunable.
pub const PAGE_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(Error::invalid_argument(format!("unknown tier {other:?}"))),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromotionPolicy {
    None,
    OnAccess,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemotionPolicy {
    None,
    OnAge,
}

/// §4.7 tier-selection and promotion/demotion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub hot_max_size: u64,
    pub warm_max_size: u64,
    pub warm_enabled: bool,
    pub cold_enabled: bool,
    pub promotion_policy: PromotionPolicy,
    pub demotion_policy: DemotionPolicy,
    pub promotion_access_threshold: u32,
    pub promotion_window_ms: i64,
    pub hot_max_age_days: u32,
    pub warm_max_age_days: u32,
    pub max_cache_size: usize,
    pub max_recent_accesses: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_max_size: 64 * 1024,
            warm_max_size: 64 * 1024 * 1024,
            warm_enabled: true,
            cold_enabled: true,
            promotion_policy: PromotionPolicy::OnAccess,
            demotion_policy: DemotionPolicy::OnAge,
            promotion_access_threshold: 3,
            promotion_window_ms: 60_000,
            hot_max_age_days: 1,
            warm_max_age_days: 30,
            max_cache_size: 100_000,
            max_recent_accesses: 10,
        }
    }
}

impl TierConfig {
    /// §4.7 "Config validation". Hot has no enable/disable flag at all —
    /// disabling it is a structural impossibility, not a validated field.
    pub fn validate(&self) -> Result<()> {
        if self.hot_max_size > self.warm_max_size {
            return Err(Error::config("hot_max_size", "must be <= warm_max_size"));
        }
        if self.promotion_access_threshold == 0 {
            return Err(Error::config("promotion_access_threshold", "must be >= 1"));
        }
        if self.promotion_window_ms < 0 {
            return Err(Error::config("promotion_window_ms", "must be non-negative"));
        }
        Ok(())
    }
}

/// §4.9 event coalescer timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    pub debounce_ms: i64,
    pub max_batch_size: usize,
    pub max_wait_ms: i64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { debounce_ms: 50, max_batch_size: 1000, max_wait_ms: 1000 }
    }
}

impl CoalescerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms < 0 {
            return Err(Error::config("debounce_ms", "must be non-negative"));
        }
        if self.max_batch_size == 0 {
            return Err(Error::config("max_batch_size", "must be >= 1"));
        }
        if self.max_wait_ms < self.debounce_ms {
            return Err(Error::config("max_wait_ms", "must be >= debounce_ms"));
        }
        Ok(())
    }
}

/// §4.10 batch emitter window/size/behavior flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmitterConfig {
    pub batch_window_ms: i64,
    pub max_batch_size: usize,
    pub compress_events: bool,
    pub prioritize_events: bool,
    pub metrics_enabled: bool,
}

impl Default for BatchEmitterConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 10,
            max_batch_size: 100,
            compress_events: false,
            prioritize_events: false,
            metrics_enabled: true,
        }
    }
}

impl BatchEmitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_window_ms < 0 {
            return Err(Error::config("batch_window_ms", "must be non-negative"));
        }
        if self.max_batch_size == 0 {
            return Err(Error::config("max_batch_size", "must be >= 1"));
        }
        Ok(())
    }
}

/// §4.8 per-connection subscription limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub max_subscriptions_per_connection: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { max_subscriptions_per_connection: 256 }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_subscriptions_per_connection == 0 {
            return Err(Error::config(
                "max_subscriptions_per_connection",
                "must be >= 1",
            ));
        }
        Ok(())
    }
}

/// §4.5 transaction retry/timeout defaults and log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub default_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_log_entries: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { default_timeout_ms: 30_000, max_retries: 3, retry_delay_ms: 10, max_log_entries: 1000 }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_log_entries == 0 {
            return Err(Error::config("max_log_entries", "must be >= 1"));
        }
        Ok(())
    }
}

/// §4.3 write-buffer cache capacity/thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 10_000, max_bytes: 64 * 1024 * 1024 }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::config("max_entries", "must be >= 1"));
        }
        if self.max_bytes == 0 {
            return Err(Error::config("max_bytes", "must be >= 1"));
        }
        Ok(())
    }
}

/// §4.4 checkpoint triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub dirty_count_threshold: usize,
    pub interval_ms: i64,
    pub memory_pressure_ratio: f64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { dirty_count_threshold: 10, interval_ms: 5_000, memory_pressure_ratio: 0.8 }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dirty_count_threshold == 0 {
            return Err(Error::config("dirty_count_threshold", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.memory_pressure_ratio) {
            return Err(Error::config("memory_pressure_ratio", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Aggregate configuration for one coordinator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tier: TierConfig,
    pub coalescer: CoalescerConfig,
    pub batch_emitter: BatchEmitterConfig,
    pub subscription: SubscriptionConfig,
    pub transaction: TransactionConfig,
    pub cache: CacheConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tier: TierConfig::default(),
            coalescer: CoalescerConfig::default(),
            batch_emitter: BatchEmitterConfig::default(),
            subscription: SubscriptionConfig::default(),
            transaction: TransactionConfig::default(),
            cache: CacheConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.tier.validate()?;
        self.coalescer.validate()?;
        self.batch_emitter.validate()?;
        self.subscription.validate()?;
        self.transaction.validate()?;
        self.cache.validate()?;
        self.checkpoint.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn hot_max_size_above_warm_is_rejected() {
        let mut tier = TierConfig::default();
        tier.hot_max_size = tier.warm_max_size + 1;
        assert!(tier.validate().is_err());
    }
}
