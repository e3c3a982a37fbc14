//! Engine configuration
//!
//! `ImportConfig` is the serializable part of a job's configuration: it is
//! snapshotted into the persisted job state and re-applied on restore. The
//! schema, hooks, and other closure-carrying collaborators are configured on
//! the engine directly and re-supplied when restoring.

use serde::{Deserialize, Serialize};

/// Serializable engine configuration, snapshotted into job state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportConfig {
    /// Number of records grouped into one batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on batches processed in parallel
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    /// Record-level errors become non-fatal outcomes for the job
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
    /// Maximum processor retries per record; 0 means a single attempt
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrent_batches() -> usize {
    1
}

fn default_continue_on_error() -> bool {
    true
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            continue_on_error: default_continue_on_error(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ImportConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size < 1 {
            return Err("batch_size must be at least 1".into());
        }
        if self.max_concurrent_batches < 1 {
            return Err("max_concurrent_batches must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ImportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_concurrent_batches, 1);
        assert!(config.continue_on_error);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = ImportConfig {
            batch_size: 0,
            ..ImportConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let config: ImportConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ImportConfig::default());
    }
}
