// tests/scan_pipeline.rs

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use url::Url;

use vanguard_bp_scanner::cache::{Cache, CacheValue, MaxMemoryMap, TtlCache};
use vanguard_bp_scanner::core::analyzer::{
    Analyzer, AnalyzerError, AnalyzerFamily, AnalyzerGroup, Upstream,
};
use vanguard_bp_scanner::core::client::{
    ClientError, HostResolver, HttpFetch, HttpResponse, TlsDial, TlsState,
};
use vanguard_bp_scanner::core::models::{AnalysisResult, RuleId, RuleResults};
use vanguard_bp_scanner::core::scanner::Scanner;
use vanguard_bp_scanner::core::scanner::headers_scanner::HeadersAnalyzer;
use vanguard_bp_scanner::core::scanner::network_scanner::NetworkAnalyzer;
use vanguard_bp_scanner::core::scanner::ssl_scanner::CertificateAnalyzer;
use vanguard_bp_scanner::core::target::{ScanContext, ScanOptions, Target};

/// Serves canned responses keyed by the requested url.
#[derive(Default)]
struct FakeHttp {
    responses: HashMap<String, HttpResponse>,
}

impl FakeHttp {
    fn with(
        mut self,
        requested: &str,
        final_url: &str,
        headers: &[(&'static str, &'static str)],
        body: &str,
    ) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        self.responses.insert(
            requested.to_string(),
            HttpResponse {
                url: Url::parse(final_url).unwrap(),
                status: 200,
                headers: map,
                body: body.as_bytes().to_vec(),
                tls: None,
            },
        );
        self
    }
}

#[async_trait]
impl HttpFetch for FakeHttp {
    async fn get(&self, url: &Url) -> Result<HttpResponse, ClientError> {
        self.responses
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| ClientError::Tls(format!("connection refused: {url}")))
    }
}

struct NoTls;

#[async_trait]
impl TlsDial for NoTls {
    async fn dial(&self, host: &str, _port: u16) -> Result<TlsState, ClientError> {
        Err(ClientError::Tls(format!("{host}:443 refused")))
    }
}

struct FakeResolver {
    ips: Vec<IpAddr>,
}

#[async_trait]
impl HostResolver for FakeResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ClientError> {
        if self.ips.is_empty() {
            return Err(ClientError::Resolve {
                host: host.to_string(),
                reason: "NXDOMAIN".to_string(),
            });
        }
        Ok(self.ips.clone())
    }
}

/// Reports one rule and caches it under the hostname like real analyzers do.
struct CachingAnalyzer {
    rule: RuleId,
}

#[async_trait]
impl Analyzer for CachingAnalyzer {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn analysis_rule_ids(&self) -> Vec<RuleId> {
        vec![self.rule]
    }

    async fn analyze(
        &self,
        _ctx: &ScanContext,
        target: &Target,
        _upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError> {
        let results = RuleResults::from([(
            self.rule,
            AnalysisResult::pass(json!({ "rule": self.rule })),
        )]);
        target.store_results(&results).await;
        Ok(results)
    }
}

fn resolver(ips: &[&str]) -> Arc<FakeResolver> {
    Arc::new(FakeResolver {
        ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
    })
}

fn scanner(resolver: Arc<FakeResolver>) -> Scanner {
    let crl_cache = Arc::new(MaxMemoryMap::new(1024 * 1024));
    let transport: Vec<Arc<dyn Analyzer>> = vec![Arc::new(CertificateAnalyzer::new(crl_cache))];
    let response: Vec<Arc<dyn Analyzer>> = vec![Arc::new(HeadersAnalyzer)];
    let context_free: Vec<Arc<dyn Analyzer>> = vec![
        Arc::new(NetworkAnalyzer),
        Arc::new(CachingAnalyzer { rule: RuleId::Spf }),
        Arc::new(CachingAnalyzer { rule: RuleId::Dmarc }),
    ];
    Scanner::with_groups(
        AnalyzerGroup::new(AnalyzerFamily::Transport, transport),
        AnalyzerGroup::new(AnalyzerFamily::Response, response),
        AnalyzerGroup::new(AnalyzerFamily::ContextFree, context_free),
        resolver,
    )
}

fn options(http: FakeHttp, cache: Arc<TtlCache<CacheValue>>) -> ScanOptions {
    ScanOptions::new(cache, Arc::new(http), Arc::new(NoTls))
}

#[tokio::test]
async fn successful_probe_runs_every_family() {
    let http = FakeHttp::default()
        .with(
            "http://example.com/",
            "https://example.com/",
            &[("strict-transport-security", "max-age=63072000; includeSubDomains")],
            "<html></html>",
        )
        .with("https://ipinfo.io/ip", "https://ipinfo.io/ip", &[], "203.0.113.7\n");
    let scanner = scanner(resolver(&["93.184.216.34", "2606:2800:220:1::"]));

    let response = scanner
        .scan(&ScanContext::background(), "example.com", options(http, Arc::new(TtlCache::new())))
        .await;

    assert_eq!(response.sut, "example.com/");
    assert_eq!(response.ip_address, "93.184.216.34");
    assert_eq!(response.scanner_ip, "203.0.113.7");

    let results = response.results().unwrap();
    assert!(results[&RuleId::Https].is_success());
    assert!(results[&RuleId::Hsts].is_success());
    assert!(results[&RuleId::XFrameOptions].is_failure());
    assert!(results[&RuleId::Ipv6].is_success());
    // The TLS dial fails, so every certificate rule is unknown with the reason.
    for rule in [RuleId::ValidCertificate, RuleId::NotRevoked] {
        assert!(results[&rule].is_unknown());
        assert!(results[&rule].actual_value["error"].as_str().unwrap().contains("refused"));
    }
    assert!(response.unscannable_keys().contains(&RuleId::MatchesHostname));
}

#[tokio::test]
async fn failed_probe_reports_response_rules_as_unknown() {
    let scanner = scanner(resolver(&["93.184.216.34"]));

    let response = scanner
        .scan(
            &ScanContext::background(),
            "example.com",
            options(FakeHttp::default(), Arc::new(TtlCache::new())),
        )
        .await;

    assert_eq!(response.sut, "example.com");
    assert_eq!(response.scanner_ip, "");
    let results = response.results().unwrap();
    for rule in [RuleId::Https, RuleId::Hsts, RuleId::ContentSecurityPolicy] {
        assert!(results[&rule].is_unknown());
        let error = results[&rule].actual_value["error"].as_str().unwrap();
        assert!(error.contains("connection refused"));
    }
    assert!(results[&RuleId::Ipv6].is_failure());
    assert!(results[&RuleId::Spf].is_success());
}

#[tokio::test]
async fn unresolvable_and_unparsable_targets_are_scan_errors() {
    let scanner = scanner(resolver(&[]));
    let cache = Arc::new(TtlCache::new());

    let response = scanner
        .scan(
            &ScanContext::background(),
            "nowhere.invalid",
            options(FakeHttp::default(), cache.clone()),
        )
        .await;
    assert_eq!(response.error().unwrap().code, 2);
    assert!(response.unscannable_keys().is_empty());

    let response = scanner
        .scan(&ScanContext::background(), "exa mple.com", options(FakeHttp::default(), cache))
        .await;
    assert_eq!(response.error().unwrap().code, 1);
    assert_eq!(
        serde_json::to_value(&response).unwrap()["result"],
        json!({ "error": { "code": 1, "errorCodeDescription": "could_not_parse_url" } })
    );
}

#[tokio::test]
async fn cache_writes_are_merged_and_flushed_after_the_scan() {
    let cache = Arc::new(TtlCache::<CacheValue>::new());
    let scanner = scanner(resolver(&["93.184.216.34"]));

    scanner
        .scan(
            &ScanContext::background(),
            "example.com",
            options(FakeHttp::default(), cache.clone()),
        )
        .await;

    let stored = cache.get("example.com").await.unwrap();
    let fields = stored.as_composite().unwrap();
    assert!(fields.contains_key("spf"));
    assert!(fields.contains_key("dmarc"));
}
