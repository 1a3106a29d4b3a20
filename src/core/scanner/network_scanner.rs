// src/core/scanner/network_scanner.rs

use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::core::analyzer::{Analyzer, AnalyzerError, Upstream};
use crate::core::models::{AnalysisResult, DidPass, RuleId, RuleResults};
use crate::core::target::{ScanContext, Target};

/// Judges the network reachability of the target from its resolved addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkAnalyzer;

#[async_trait]
impl Analyzer for NetworkAnalyzer {
    fn name(&self) -> &'static str {
        "network"
    }

    fn analysis_rule_ids(&self) -> Vec<RuleId> {
        vec![RuleId::Ipv6]
    }

    async fn analyze(
        &self,
        _ctx: &ScanContext,
        target: &Target,
        _upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError> {
        let ipv6 = target.check(RuleId::Ipv6, || {
            let addresses: Vec<String> = target
                .ips
                .iter()
                .filter(|ip| ip.is_ipv6())
                .map(IpAddr::to_string)
                .collect();
            debug!(host = target.hostname(), count = addresses.len(), "Counted IPv6 addresses.");
            AnalysisResult::new(
                DidPass::from_outcome(target.supports_ipv6()),
                json!({ "addresses": addresses }),
            )
        });
        Ok(RuleResults::from([(RuleId::Ipv6, ipv6)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::test_support;

    #[tokio::test]
    async fn reports_ipv6_support() {
        let mut target = test_support::target("https://example.com/");
        let results = NetworkAnalyzer
            .analyze(&ScanContext::background(), &target, &Upstream::Nothing)
            .await
            .unwrap();
        assert!(results[&RuleId::Ipv6].is_success());

        target.ips.retain(IpAddr::is_ipv4);
        let results = NetworkAnalyzer
            .analyze(&ScanContext::background(), &target, &Upstream::Nothing)
            .await
            .unwrap();
        assert!(results[&RuleId::Ipv6].is_failure());
    }
}
