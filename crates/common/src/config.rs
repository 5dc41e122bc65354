use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// Coordinator behavior/configuration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Max in-flight shard requests per node; throttling only kicks in when a
    /// phase has more participating shards than this.
    pub max_concurrent_shard_requests: usize,
    /// Default partial-results policy when the request does not set one.
    pub allow_partial_search_results: bool,
    /// Group the first query attempt of shards on the same node into one request.
    pub batched_query_phase: bool,
    /// Request circuit breaker limit for buffered shard results.
    pub request_breaker_limit_bytes: usize,
    /// Upper bound for `from + size`.
    pub max_result_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_shard_requests: 5,
            allow_partial_search_results: true,
            batched_query_phase: true,
            request_breaker_limit_bytes: 512 * 1024 * 1024,
            max_result_window: 10_000,
        }
    }
}

impl CoordinatorConfig {
    /// Build a config from `SCATTER_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults; the result is
    /// validated before it is returned.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_shard_requests: env_or_default(
                "SCATTER_MAX_CONCURRENT_SHARD_REQUESTS",
                defaults.max_concurrent_shard_requests,
            ),
            allow_partial_search_results: env_or_default(
                "SCATTER_ALLOW_PARTIAL_SEARCH_RESULTS",
                defaults.allow_partial_search_results,
            ),
            batched_query_phase: env_or_default(
                "SCATTER_BATCHED_QUERY_PHASE",
                defaults.batched_query_phase,
            ),
            request_breaker_limit_bytes: env_or_default(
                "SCATTER_REQUEST_BREAKER_LIMIT_BYTES",
                defaults.request_breaker_limit_bytes,
            ),
            max_result_window: env_or_default(
                "SCATTER_MAX_RESULT_WINDOW",
                defaults.max_result_window,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_shard_requests == 0 {
            return Err(SearchError::InvalidConfig(
                "max_concurrent_shard_requests must be at least 1".to_string(),
            ));
        }
        if self.max_result_window == 0 {
            return Err(SearchError::InvalidConfig(
                "max_result_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_shard_requests, 5);
        assert!(config.allow_partial_search_results);
    }

    #[test]
    fn zero_permits_are_rejected() {
        let config = CoordinatorConfig {
            max_concurrent_shard_requests: 0,
            ..CoordinatorConfig::default()
        };
        let err = config.validate().expect_err("zero permits");
        assert!(matches!(err, SearchError::InvalidConfig(_)));
    }

    #[test]
    fn unset_env_value_falls_back() {
        assert_eq!(env_or_default("SCATTER_TEST_UNSET_KEY_FOR_CONFIG", 7_usize), 7);
    }
}
