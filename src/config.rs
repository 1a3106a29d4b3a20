// src/config.rs

use std::collections::HashSet;
use std::time::Duration;

use strum::IntoEnumIterator;
use thiserror::Error;

use crate::core::models::RuleId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("breaker failure threshold must be at least 1")]
    ZeroThreshold,

    #[error("CRL cache size must be greater than zero")]
    ZeroCacheSize,

    #[error("scan timeout must be greater than zero")]
    ZeroTimeout,
}

/// Runtime settings for the scanner and its cache stack.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Upper bound, in bytes, for the certificate revocation list cache.
    pub crl_cache_max_bytes: usize,
    /// Consecutive failures before the cache backend breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub breaker_cool_down: Duration,
    /// Distributed cache backend. `None` keeps everything in process.
    pub redis_url: Option<String>,
    pub scan_timeout: Duration,
    /// Analyzers running longer than this are logged, not cancelled.
    pub analyzer_watchdog: Duration,
    pub flush_timeout: Duration,
    pub alert_webhook_url: Option<String>,
    /// Restricts the scan to these rules. `None` runs every rule.
    pub enabled_checks: Option<Vec<RuleId>>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            crl_cache_max_bytes: 100 * 1024 * 1024,
            breaker_failure_threshold: 10,
            breaker_cool_down: Duration::from_secs(30),
            redis_url: None,
            scan_timeout: Duration::from_secs(10),
            analyzer_watchdog: Duration::from_secs(15),
            flush_timeout: Duration::from_secs(5),
            alert_webhook_url: None,
            enabled_checks: None,
        }
    }
}

impl ScannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crl_cache_max_bytes(mut self, bytes: usize) -> Self {
        self.crl_cache_max_bytes = bytes;
        self
    }

    pub fn with_breaker(mut self, failure_threshold: u32, cool_down: Duration) -> Self {
        self.breaker_failure_threshold = failure_threshold;
        self.breaker_cool_down = cool_down;
        self
    }

    pub fn with_redis_url(mut self, url: Option<String>) -> Self {
        self.redis_url = url;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_analyzer_watchdog(mut self, threshold: Duration) -> Self {
        self.analyzer_watchdog = threshold;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_alert_webhook_url(mut self, url: Option<String>) -> Self {
        self.alert_webhook_url = url;
        self
    }

    /// An empty list is treated like `None`.
    pub fn with_enabled_checks(mut self, checks: Vec<RuleId>) -> Self {
        self.enabled_checks = if checks.is_empty() { None } else { Some(checks) };
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.crl_cache_max_bytes == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        if self.scan_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn enabled_check_set(&self) -> HashSet<RuleId> {
        match &self.enabled_checks {
            Some(checks) => checks.iter().copied().collect(),
            None => RuleId::iter().collect(),
        }
    }
}
