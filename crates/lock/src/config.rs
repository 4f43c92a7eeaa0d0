// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{LockError, Result};

pub const ENV_SWEEP_INTERVAL_MS: &str = "TXLOCK_SWEEP_INTERVAL_MS";
pub const ENV_LEASE_TTL_MS: &str = "TXLOCK_LEASE_TTL_MS";
pub const ENV_RETRY_INTERVAL_MS: &str = "TXLOCK_RETRY_INTERVAL_MS";
pub const ENV_RENEW_RATIO: &str = "TXLOCK_RENEW_RATIO";
pub const ENV_KEY_PREFIX: &str = "TXLOCK_KEY_PREFIX";

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Wait-for graph detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Distributed lock configuration
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// Wait-for graph detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Pause between two sweeps of the request queue
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Initial identity capacity of the matrix (doubles on demand)
    #[serde(default = "default_initial_identities")]
    pub initial_identities: usize,

    /// Initial resource capacity of the matrix (doubles on demand)
    #[serde(default = "default_initial_resources")]
    pub initial_resources: usize,

    /// Capacity of the response and victim broadcast channels
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Lease lifetime of every mutex and hash entry
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: Duration,

    /// Pause between two acquisition attempts
    #[serde(default = "default_retry_interval")]
    pub retry_interval: Duration,

    /// Fraction of the lease TTL after which leases are renewed
    #[serde(default = "default_renew_ratio")]
    pub renew_ratio: f64,

    /// Prefix of every key written to the lease store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Command buffer of each per-identity lock instance
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            initial_identities: default_initial_identities(),
            initial_resources: default_initial_resources(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            lease_ttl: default_lease_ttl(),
            retry_interval: default_retry_interval(),
            renew_ratio: default_renew_ratio(),
            key_prefix: default_key_prefix(),
            command_buffer: default_command_buffer(),
        }
    }
}

// Default value functions
fn default_sweep_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_initial_identities() -> usize {
    64
}

fn default_initial_resources() -> usize {
    64
}

fn default_event_buffer() -> usize {
    1024
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_renew_ratio() -> f64 {
    0.5
}

fn default_key_prefix() -> String {
    "txlock:".to_string()
}

fn default_command_buffer() -> usize {
    64
}

fn get_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl DistributedConfig {
    /// Interval of the lease renewal loop
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl.mul_f64(self.renew_ratio)
    }
}

impl LockConfig {
    /// Configuration tuned for tests: fast sweeps, short leases
    pub fn minimal() -> Self {
        Self {
            detector: DetectorConfig {
                sweep_interval: Duration::from_millis(1),
                initial_identities: 2,
                initial_resources: 2,
                event_buffer: 256,
            },
            distributed: DistributedConfig {
                lease_ttl: Duration::from_millis(400),
                retry_interval: Duration::from_millis(10),
                renew_ratio: 0.5,
                key_prefix: default_key_prefix(),
                command_buffer: 16,
            },
        }
    }

    /// Load configuration from JSON, missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration overlaid with `TXLOCK_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(ms) = get_env_u64(ENV_SWEEP_INTERVAL_MS) {
            self.detector.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = get_env_u64(ENV_LEASE_TTL_MS) {
            self.distributed.lease_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = get_env_u64(ENV_RETRY_INTERVAL_MS) {
            self.distributed.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ratio) = get_env_f64(ENV_RENEW_RATIO) {
            self.distributed.renew_ratio = ratio;
        }
        if let Ok(prefix) = env::var(ENV_KEY_PREFIX) {
            self.distributed.key_prefix = prefix;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.detector.sweep_interval.is_zero() {
            return Err(LockError::configuration("Sweep interval must be greater than zero"));
        }

        if self.detector.initial_identities == 0 || self.detector.initial_resources == 0 {
            return Err(LockError::configuration("Detector capacities must be greater than zero"));
        }

        if self.detector.event_buffer == 0 {
            return Err(LockError::configuration("Event buffer must be greater than zero"));
        }

        if self.distributed.lease_ttl.is_zero() {
            return Err(LockError::configuration("Lease TTL must be greater than zero"));
        }

        if self.distributed.retry_interval.is_zero() {
            return Err(LockError::configuration("Retry interval must be greater than zero"));
        }

        if !(self.distributed.renew_ratio > 0.0 && self.distributed.renew_ratio < 1.0) {
            return Err(LockError::configuration("Renew ratio must be between 0.0 and 1.0 (exclusive)"));
        }

        if self.distributed.command_buffer == 0 {
            return Err(LockError::configuration("Command buffer must be greater than zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.distributed.renew_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_minimal_config() {
        let config = LockConfig::minimal();
        assert!(config.validate().is_ok());
        assert_eq!(config.detector.initial_identities, 2);
        assert_eq!(config.distributed.renew_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_config_validation() {
        let mut config = LockConfig::default();
        config.distributed.renew_ratio = 1.0;
        assert!(config.validate().is_err());

        config = LockConfig::default();
        config.distributed.lease_ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        config = LockConfig::default();
        config.detector.initial_resources = 0;
        assert!(config.validate().is_err());

        config = LockConfig::default();
        config.detector.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = LockConfig::from_json(r#"{"distributed": {"key_prefix": "app:", "lease_ttl": {"secs": 3, "nanos": 0}}}"#).unwrap();
        assert_eq!(config.distributed.lease_ttl, Duration::from_secs(3));
        assert_eq!(config.distributed.key_prefix, "app:");
        assert_eq!(config.distributed.renew_ratio, 0.5);
        assert_eq!(config.detector.sweep_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(LockConfig::from_json(r#"{"distributed": {"renew_ratio": 2.0}}"#).is_err());
        assert!(LockConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_env_without_overrides() {
        let config = LockConfig::from_env().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization() {
        let config = LockConfig::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: LockConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(config.distributed.lease_ttl, deserialized.distributed.lease_ttl);
        assert_eq!(config.distributed.key_prefix, deserialized.distributed.key_prefix);
    }
}
