// src/core/scanner/dns_scanner.rs

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::analyzer::{Analyzer, AnalyzerError, Upstream};
use crate::core::models::{AnalysisResult, DidPass, RuleId, RuleResults};
use crate::core::target::{ScanContext, Target};

/// Selectors probed when the real DKIM selector is not known.
const COMMON_DKIM_SELECTORS: &[&str] = &[
    "google",
    "default",
    "mail",
    "selector1",
    "selector2",
    "dkim",
];

const DMARC_AVOID_POLICY_NONE: &str = "dmarcAvoidPolicyNone";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsLookupError {
    /// The name exists without records of the type, or does not exist at all.
    #[error("no records found")]
    NotFound,

    #[error("dns lookup failed: {0}")]
    Failed(String),
}

impl From<ResolveError> for DnsLookupError {
    fn from(e: ResolveError) -> Self {
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsLookupError::NotFound,
            _ => DnsLookupError::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaaRecord {
    pub tag: String,
    pub value: String,
}

impl CaaRecord {
    /// Parses the presentation format `<flags> <tag> "<value>"`.
    fn parse(text: &str) -> Option<Self> {
        let mut parts = text.splitn(3, char::is_whitespace);
        let _flags = parts.next()?;
        let tag = parts.next()?;
        let value = parts.next().unwrap_or_default().trim().trim_matches('"');
        Some(Self {
            tag: tag.to_ascii_lowercase(),
            value: value.to_string(),
        })
    }
}

/// The DNS queries the domain checks need.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsLookupError>;
    async fn caa(&self, name: &str) -> Result<Vec<CaaRecord>, DnsLookupError>;
}

pub struct HickoryDns {
    resolver: TokioAsyncResolver,
}

impl HickoryDns {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for HickoryDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsLookup for HickoryDns {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsLookupError> {
        debug!(name, "Looking up TXT records.");
        let records = self.resolver.txt_lookup(name).await?;
        Ok(records.iter().map(|record| record.to_string()).collect())
    }

    async fn caa(&self, name: &str) -> Result<Vec<CaaRecord>, DnsLookupError> {
        debug!(name, "Looking up CAA records.");
        let lookup = self.resolver.lookup(name, RecordType::CAA).await?;
        Ok(lookup
            .iter()
            .filter(|rdata| rdata.record_type() == RecordType::CAA)
            .filter_map(|rdata| CaaRecord::parse(&rdata.to_string()))
            .collect())
    }
}

/// Mail records live on the registrable name, not on `www.`.
fn mail_domain(hostname: &str) -> &str {
    hostname.strip_prefix("www.").unwrap_or(hostname)
}

/// `a.b.example.com` → `a.b.example.com`, `b.example.com`, `example.com`.
fn caa_candidates(hostname: &str) -> Vec<&str> {
    let labels = hostname.split('.').count();
    let mut candidates = Vec::new();
    let mut rest = hostname;
    for _ in 1..labels {
        candidates.push(rest);
        match rest.split_once('.') {
            Some((_, parent)) => rest = parent,
            None => break,
        }
    }
    candidates
}

fn is_valid_iodef(value: &str) -> bool {
    ["http://", "https://", "mailto:"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
}

fn lookup_failed(name: &str, e: &DnsLookupError) -> AnalysisResult {
    warn!(name, error = %e, "DNS lookup failed.");
    AnalysisResult::new(DidPass::Unknown, json!({ "error": e.to_string() }))
}

/// Judges the mail authentication and CAA records of the target's domain.
pub struct DomainAnalyzer {
    dns: Arc<dyn DnsLookup>,
}

impl DomainAnalyzer {
    pub fn new() -> Self {
        Self::with_lookup(Arc::new(HickoryDns::new()))
    }

    pub fn with_lookup(dns: Arc<dyn DnsLookup>) -> Self {
        Self { dns }
    }

    async fn spf(&self, domain: &str) -> AnalysisResult {
        let started = Instant::now();
        let result = match self.dns.txt(domain).await {
            Ok(records) => match records.into_iter().find(|r| r.starts_with("v=spf1")) {
                Some(record) => AnalysisResult::pass(json!({ "spf": record })),
                None => AnalysisResult::fail(Value::Null),
            },
            Err(DnsLookupError::NotFound) => AnalysisResult::fail(Value::Null),
            Err(e) => lookup_failed(domain, &e),
        };
        result.with_duration(started.elapsed())
    }

    async fn dmarc(&self, domain: &str) -> AnalysisResult {
        let started = Instant::now();
        let name = format!("_dmarc.{domain}");
        let result = match self.dns.txt(&name).await {
            Ok(records) => match records.into_iter().find(|r| r.starts_with("v=DMARC1")) {
                Some(record) => {
                    let policy_none = record
                        .split(';')
                        .any(|tag| tag.trim().eq_ignore_ascii_case("p=none"));
                    let result = AnalysisResult::pass(json!({ "dmarc": record }));
                    if policy_none {
                        result.with_recommendations([DMARC_AVOID_POLICY_NONE])
                    } else {
                        result
                    }
                }
                None => AnalysisResult::fail(Value::Null),
            },
            Err(DnsLookupError::NotFound) => AnalysisResult::fail(Value::Null),
            Err(e) => lookup_failed(&name, &e),
        };
        result.with_duration(started.elapsed())
    }

    /// The first selector with records decides. Without any, the outcome is
    /// Unknown since the real selector may simply not be on the list.
    async fn dkim(&self, ctx: &ScanContext, domain: &str) -> AnalysisResult {
        let started = Instant::now();
        for selector in COMMON_DKIM_SELECTORS {
            if ctx.is_expired() {
                debug!(domain, "Deadline passed, stopping DKIM probing.");
                break;
            }
            let name = format!("{selector}._domainkey.{domain}");
            match self.dns.txt(&name).await {
                Ok(records) => {
                    let result = match records.into_iter().find(|r| r.starts_with("v=DKIM1")) {
                        Some(record) => {
                            debug!(selector, "Found valid DKIM record.");
                            AnalysisResult::pass(json!({ "selector": selector, "dkim": record }))
                        }
                        None => AnalysisResult::fail(json!({ "selector": selector })),
                    };
                    return result.with_duration(started.elapsed());
                }
                Err(DnsLookupError::NotFound) => continue,
                Err(e) => return lookup_failed(&name, &e).with_duration(started.elapsed()),
            }
        }
        AnalysisResult::unknown().with_duration(started.elapsed())
    }

    /// Walks up from the hostname until a name carries usable CAA records.
    async fn caa(&self, hostname: &str) -> AnalysisResult {
        let started = Instant::now();
        for name in caa_candidates(hostname) {
            let records = match self.dns.caa(name).await {
                Ok(records) => records,
                Err(DnsLookupError::NotFound) => continue,
                Err(e) => return lookup_failed(name, &e).with_duration(started.elapsed()),
            };
            let iodef_valid = records
                .iter()
                .filter(|r| r.tag == "iodef")
                .all(|r| is_valid_iodef(&r.value));
            if !records.is_empty() && iodef_valid {
                let evidence: Vec<String> = records
                    .iter()
                    .map(|r| format!("{} {}", r.tag, r.value))
                    .collect();
                return AnalysisResult::pass(json!({ "domain": name, "caa": evidence }))
                    .with_duration(started.elapsed());
            }
        }
        AnalysisResult::fail(Value::Null).with_duration(started.elapsed())
    }
}

impl Default for DomainAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for DomainAnalyzer {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn analysis_rule_ids(&self) -> Vec<RuleId> {
        vec![RuleId::Spf, RuleId::Dmarc, RuleId::Dkim, RuleId::Caa]
    }

    async fn analyze(
        &self,
        ctx: &ScanContext,
        target: &Target,
        _upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError> {
        if let Some(cached) = target.cached_results(&self.analysis_rule_ids()).await {
            return Ok(cached);
        }

        let hostname = target.hostname();
        let domain = mail_domain(hostname);
        info!(domain, "Starting DNS analysis.");

        let (spf, dmarc, dkim, caa) = tokio::join!(
            target.maybe_check(RuleId::Spf, || self.spf(domain)),
            target.maybe_check(RuleId::Dmarc, || self.dmarc(domain)),
            target.maybe_check(RuleId::Dkim, || self.dkim(ctx, domain)),
            target.maybe_check(RuleId::Caa, || self.caa(hostname)),
        );

        let results = RuleResults::from([
            (RuleId::Spf, spf),
            (RuleId::Dmarc, dmarc),
            (RuleId::Dkim, dkim),
            (RuleId::Caa, caa),
        ]);
        info!(domain, "DNS analysis finished.");
        target.store_results(&results).await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::test_support;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeDns {
        txt: HashMap<String, Result<Vec<String>, DnsLookupError>>,
        caa: HashMap<String, Vec<CaaRecord>>,
        queries: Mutex<Vec<String>>,
    }

    impl FakeDns {
        fn with_txt(mut self, name: &str, records: &[&str]) -> Self {
            let records = records.iter().map(|r| r.to_string()).collect();
            self.txt.insert(name.to_string(), Ok(records));
            self
        }

        fn with_txt_error(mut self, name: &str) -> Self {
            self.txt
                .insert(name.to_string(), Err(DnsLookupError::Failed("SERVFAIL".into())));
            self
        }

        fn with_caa(mut self, name: &str, records: &[(&str, &str)]) -> Self {
            let records = records
                .iter()
                .map(|(tag, value)| CaaRecord {
                    tag: tag.to_string(),
                    value: value.to_string(),
                })
                .collect();
            self.caa.insert(name.to_string(), records);
            self
        }

        fn query_count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DnsLookup for FakeDns {
        async fn txt(&self, name: &str) -> Result<Vec<String>, DnsLookupError> {
            self.queries.lock().unwrap().push(name.to_string());
            self.txt.get(name).cloned().unwrap_or(Err(DnsLookupError::NotFound))
        }

        async fn caa(&self, name: &str) -> Result<Vec<CaaRecord>, DnsLookupError> {
            self.queries.lock().unwrap().push(name.to_string());
            self.caa.get(name).cloned().ok_or(DnsLookupError::NotFound)
        }
    }

    async fn analyze(dns: Arc<FakeDns>, target: &Target, ctx: ScanContext) -> RuleResults {
        DomainAnalyzer::with_lookup(dns)
            .analyze(&ctx, target, &Upstream::Nothing)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn well_configured_domain_passes() {
        let dns = Arc::new(
            FakeDns::default()
                .with_txt("example.com", &["google-site-verification=abc", "v=spf1 -all"])
                .with_txt("_dmarc.example.com", &["v=DMARC1; p=none; rua=mailto:d@example.com"])
                .with_txt("mail._domainkey.example.com", &["v=DKIM1; k=rsa; p=MIGf"])
                .with_caa(
                    "example.com",
                    &[("issue", "letsencrypt.org"), ("iodef", "mailto:sec@example.com")],
                ),
        );
        let target = test_support::target("https://www.example.com/");

        let results = analyze(dns, &target, ScanContext::background()).await;

        assert_eq!(results[&RuleId::Spf].actual_value, json!({ "spf": "v=spf1 -all" }));
        assert!(results[&RuleId::Dmarc].is_success());
        assert!(results[&RuleId::Dmarc].recommendations.contains(DMARC_AVOID_POLICY_NONE));
        assert_eq!(results[&RuleId::Dkim].actual_value["selector"], json!("mail"));
        assert_eq!(results[&RuleId::Caa].actual_value["domain"], json!("example.com"));
    }

    #[tokio::test]
    async fn missing_and_broken_records() {
        let dns = Arc::new(
            FakeDns::default()
                .with_txt_error("_dmarc.example.com")
                .with_caa("example.com", &[("iodef", "ftp://nope")]),
        );
        let target = test_support::target("https://example.com/");

        let results = analyze(dns, &target, ScanContext::background()).await;

        assert!(results[&RuleId::Spf].is_failure());
        assert!(results[&RuleId::Dmarc].is_unknown());
        assert_eq!(
            results[&RuleId::Dmarc].actual_value,
            json!({ "error": "dns lookup failed: SERVFAIL" })
        );
        assert!(results[&RuleId::Dkim].is_unknown());
        assert!(results[&RuleId::Caa].is_failure());
    }

    #[tokio::test]
    async fn expired_deadline_stops_dkim_probing() {
        let dns = Arc::new(FakeDns::default());
        let mut target = test_support::target("https://example.com/");
        target.options.enabled_checks = [RuleId::Dkim].into();

        let results = analyze(
            dns.clone(),
            &target,
            ScanContext::with_timeout(Duration::ZERO),
        )
        .await;

        assert!(results[&RuleId::Dkim].is_unknown());
        assert!(results[&RuleId::Spf].is_unknown());
        assert_eq!(dns.query_count(), 0);
    }

    #[tokio::test]
    async fn second_analysis_is_served_from_cache() {
        let dns = Arc::new(FakeDns::default().with_txt("example.com", &["v=spf1 ~all"]));
        let target = test_support::target("https://example.com/");

        let first = analyze(dns.clone(), &target, ScanContext::background()).await;
        let queries = dns.query_count();
        let second = analyze(dns.clone(), &target, ScanContext::background()).await;

        assert_eq!(dns.query_count(), queries);
        assert_eq!(first[&RuleId::Spf].did_pass, second[&RuleId::Spf].did_pass);
    }

    #[test]
    fn caa_candidates_stop_before_the_tld() {
        assert_eq!(
            caa_candidates("a.b.example.com"),
            vec!["a.b.example.com", "b.example.com", "example.com"]
        );
        assert!(caa_candidates("localhost").is_empty());
    }

    #[test]
    fn parses_caa_presentation_format() {
        assert_eq!(
            CaaRecord::parse(r#"0 issue "letsencrypt.org""#),
            Some(CaaRecord {
                tag: "issue".into(),
                value: "letsencrypt.org".into()
            })
        );
        assert_eq!(CaaRecord::parse("0"), None);
    }
}
