// src/core/target.rs

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strum::IntoEnumIterator;
use tracing::debug;
use url::Url;

use crate::cache::{Cache, CacheValue, SharedCache};
use crate::core::client::{HttpFetch, TlsDial};
use crate::core::models::{AnalysisResult, RuleId, RuleResults};

/// How long analyzer results stay cached under the target hostname.
pub const RESULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Deadline information for one scan. Code that cares checks it explicitly.
#[derive(Debug, Clone, Copy)]
pub struct ScanContext {
    deadline: Option<Instant>,
}

impl ScanContext {
    /// A context without deadline.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    /// A timeout too large to represent behaves like [`ScanContext::background`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Time left until the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Collaborators and flow control shared by every analyzer of one scan.
#[derive(Clone)]
pub struct ScanOptions {
    pub cache: SharedCache,
    pub http: Arc<dyn HttpFetch>,
    pub tls: Arc<dyn TlsDial>,
    pub enabled_checks: HashSet<RuleId>,
}

impl ScanOptions {
    /// Options with every check enabled.
    pub fn new(cache: SharedCache, http: Arc<dyn HttpFetch>, tls: Arc<dyn TlsDial>) -> Self {
        Self {
            cache,
            http,
            tls,
            enabled_checks: RuleId::iter().collect(),
        }
    }

    pub fn with_enabled_checks(mut self, checks: HashSet<RuleId>) -> Self {
        self.enabled_checks = checks;
        self
    }

    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn is_enabled(&self, rule: RuleId) -> bool {
        self.enabled_checks.contains(&rule)
    }
}

/// The host being scanned, as seen after following redirects.
#[derive(Clone)]
pub struct Target {
    pub url: Url,
    pub ips: Vec<IpAddr>,
    /// The first IPv4 address of `ips`, used where one address is needed.
    pub ipv4: Option<Ipv4Addr>,
    pub options: ScanOptions,
}

impl Target {
    pub fn new(url: Url, ips: Vec<IpAddr>, options: ScanOptions) -> Self {
        let ipv4 = ips.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        });
        Self {
            url,
            ips,
            ipv4,
            options,
        }
    }

    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn supports_ipv6(&self) -> bool {
        self.ips.iter().any(IpAddr::is_ipv6)
    }

    /// Runs `check` only if `rule` is enabled, otherwise reports Unknown.
    pub fn check(&self, rule: RuleId, check: impl FnOnce() -> AnalysisResult) -> AnalysisResult {
        if self.options.is_enabled(rule) {
            check()
        } else {
            AnalysisResult::unknown()
        }
    }

    /// Async variant of [`Target::check`].
    pub async fn maybe_check<F, Fut>(&self, rule: RuleId, check: F) -> AnalysisResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AnalysisResult>,
    {
        if self.options.is_enabled(rule) {
            check().await
        } else {
            AnalysisResult::unknown()
        }
    }

    /// Returns earlier results for `rule_ids` if the cache holds every one of them.
    pub async fn cached_results(&self, rule_ids: &[RuleId]) -> Option<RuleResults> {
        let cached = match self.options.cache.get(self.hostname()).await {
            Ok(value) => value,
            Err(e) => {
                debug!(host = self.hostname(), error = %e, "No cached results.");
                return None;
            }
        };
        let fields = cached.as_composite()?;

        let mut results = RuleResults::new();
        for id in rule_ids {
            let field = fields.get(id.as_ref())?;
            let result = serde_json::from_value::<AnalysisResult>(field.clone()).ok()?;
            results.insert(*id, result);
        }
        debug!(host = self.hostname(), rules = results.len(), "Using cached results.");
        Some(results)
    }

    /// Stores `results` under the hostname. Failures are logged and ignored.
    pub async fn store_results(&self, results: &RuleResults) {
        let value: CacheValue = results
            .iter()
            .filter_map(|(id, result)| {
                serde_json::to_value(result)
                    .ok()
                    .map(|encoded| (id.to_string(), encoded))
            })
            .collect();

        if let Err(e) = self
            .options
            .cache
            .set(self.hostname(), value, RESULT_TTL)
            .await
        {
            debug!(host = self.hostname(), error = %e, "Could not cache results.");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::core::models::DidPass;
    use serde_json::Value;

    #[test]
    fn selects_the_first_ipv4_address() {
        let target = target("https://example.com/");
        assert_eq!(target.ipv4, Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert!(target.supports_ipv6());
        assert_eq!(target.hostname(), "example.com");
    }

    #[test]
    fn disabled_checks_are_unknown() {
        let mut target = target("https://example.com/");
        target.options.enabled_checks = HashSet::from([RuleId::Hsts]);

        let ran = target.check(RuleId::Hsts, || AnalysisResult::pass(Value::Null));
        let skipped = target.check(RuleId::Caa, || AnalysisResult::pass(Value::Null));
        assert_eq!(ran.did_pass, DidPass::Pass);
        assert_eq!(skipped.did_pass, DidPass::Unknown);
    }

    #[test]
    fn deadlines() {
        assert!(!ScanContext::background().is_expired());
        assert!(ScanContext::background().remaining().is_none());
        assert!(ScanContext::with_timeout(Duration::ZERO).is_expired());
        assert!(!ScanContext::with_timeout(Duration::from_secs(60)).is_expired());
    }

    #[test]
    fn unrepresentable_timeout_has_no_deadline() {
        let ctx = ScanContext::with_timeout(Duration::MAX);
        assert!(!ctx.is_expired());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn cached_results_need_every_rule() {
        let target = target("https://example.com/");
        let mut results = RuleResults::new();
        results.insert(RuleId::Spf, AnalysisResult::pass(Value::Null));
        target.store_results(&results).await;

        let hit = target.cached_results(&[RuleId::Spf]).await.unwrap();
        assert!(hit[&RuleId::Spf].is_success());
        assert!(target.cached_results(&[RuleId::Spf, RuleId::Dmarc]).await.is_none());
    }
}
