// src/core/scanner/ssl_scanner.rs

//! Certificate checks on the leaf certificate of the target's TLS session.
//!
//! The leaf comes from the probe request when it was served over TLS,
//! otherwise from a separate handshake on port 443. Revocation is checked
//! against the CRLs named in the certificate; their revoked serials are kept
//! in a size-bounded map shared by every scan.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;
use x509_parser::prelude::*;

use crate::cache::MaxMemoryMap;
use crate::core::analyzer::{Analyzer, AnalyzerError, Upstream};
use crate::core::client::{HttpFetch, TlsState};
use crate::core::models::{AnalysisResult, DidPass, RuleId, RuleResults};
use crate::core::target::{ScanContext, Target};

/// Revoked serial numbers (hex) per CRL url.
pub type RevocationCache = MaxMemoryMap<String, Vec<String>>;

const EXPIRING_SOON_DAYS: i64 = 30;

/// md2/md5/sha1 with RSA, sha1 with DSA, sha1 with ECDSA.
const WEAK_SIGNATURE_ALGORITHMS: &[&str] = &[
    "1.2.840.113549.1.1.2",
    "1.2.840.113549.1.1.4",
    "1.2.840.113549.1.1.5",
    "1.2.840.10040.4.3",
    "1.2.840.10045.4.1",
];

/// The parts of a certificate the checks look at, detached from the DER buffer.
#[derive(Debug, Clone)]
struct CertificateFacts {
    subject: String,
    issuer: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    /// SAN dns names, or the common names when there is no SAN extension.
    names: Vec<String>,
    signature_algorithm: String,
    serial: String,
    is_ca: bool,
    crl_urls: Vec<String>,
}

fn asn1_time_to_chrono_utc(time: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}

fn serial_hex(raw: &[u8]) -> String {
    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    let trimmed = hex.trim_start_matches('0');
    if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() }
}

impl CertificateFacts {
    fn from_der(der: &[u8]) -> Result<Self, AnalyzerError> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| AnalyzerError::Failed(format!("X.509 parse error: {e}")))?;
        debug!(subject = %cert.subject(), issuer = %cert.issuer(), "Parsed leaf certificate.");

        let mut names: Vec<String> = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Could not read the subject alternative names.");
                Vec::new()
            }
        };
        if names.is_empty() {
            names = cert
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_ascii_lowercase)
                .collect();
        }

        let mut crl_urls = Vec::new();
        for extension in cert.extensions() {
            let ParsedExtension::CRLDistributionPoints(points) = extension.parsed_extension() else {
                continue;
            };
            for point in &points.points {
                let Some(DistributionPointName::FullName(full_names)) = &point.distribution_point
                else {
                    continue;
                };
                for name in full_names {
                    if let GeneralName::URI(uri) = name {
                        crl_urls.push(uri.to_string());
                    }
                }
            }
        }

        let validity = cert.validity();
        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: asn1_time_to_chrono_utc(&validity.not_before),
            not_after: asn1_time_to_chrono_utc(&validity.not_after),
            names,
            signature_algorithm: cert.signature_algorithm.algorithm.to_id_string(),
            serial: serial_hex(cert.raw_serial()),
            is_ca: cert.is_ca(),
            crl_urls,
        })
    }
}

fn valid_certificate(facts: &CertificateFacts, now: DateTime<Utc>) -> AnalysisResult {
    let days_until_expiry = facts.not_after.signed_duration_since(now).num_days();
    let evidence = json!({
        "subject": facts.subject,
        "issuer": facts.issuer,
        "notBefore": facts.not_before.to_rfc3339(),
        "notAfter": facts.not_after.to_rfc3339(),
        "daysUntilExpiry": days_until_expiry,
    });

    if now < facts.not_before {
        return AnalysisResult::fail(evidence).with_errors(["notYetValid"]);
    }
    if now > facts.not_after {
        return AnalysisResult::fail(evidence).with_errors(["expired"]);
    }
    let result = AnalysisResult::pass(evidence);
    if days_until_expiry <= EXPIRING_SOON_DAYS {
        result.with_recommendations(["expiresSoon"])
    } else {
        result
    }
}

/// `*.example.com` covers exactly one label: `www.example.com`, not
/// `example.com` or `a.b.example.com`.
fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => hostname
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == hostname,
    }
}

fn matches_hostname(facts: &CertificateFacts, hostname: &str) -> AnalysisResult {
    let matched = facts.names.iter().any(|name| hostname_matches(name, hostname));
    AnalysisResult::new(
        DidPass::from_outcome(matched),
        json!({ "hostname": hostname, "names": facts.names }),
    )
}

fn strong_signature_algorithm(facts: &CertificateFacts) -> AnalysisResult {
    let weak = WEAK_SIGNATURE_ALGORITHMS.contains(&facts.signature_algorithm.as_str());
    AnalysisResult::new(
        DidPass::from_outcome(!weak),
        json!({ "algorithm": facts.signature_algorithm }),
    )
}

/// Checks the certificate's own fields plus revocation through published CRLs.
pub struct CertificateAnalyzer {
    revoked_serials: Arc<RevocationCache>,
}

impl CertificateAnalyzer {
    pub fn new(revoked_serials: Arc<RevocationCache>) -> Self {
        Self { revoked_serials }
    }

    async fn revoked_serials_of(
        &self,
        http: &dyn HttpFetch,
        crl_url: &str,
    ) -> Result<Vec<String>, String> {
        if let Some(serials) = self.revoked_serials.get(&crl_url.to_string()) {
            debug!(crl = crl_url, "Using cached revocation list.");
            return Ok(serials);
        }

        let url = Url::parse(crl_url).map_err(|e| e.to_string())?;
        let response = http.get(&url).await.map_err(|e| e.to_string())?;
        let (_, crl) = parse_x509_crl(&response.body)
            .map_err(|e| format!("CRL parse error: {e}"))?;
        let serials: Vec<String> = crl
            .iter_revoked_certificates()
            .map(|revoked| serial_hex(revoked.raw_serial()))
            .collect();

        debug!(crl = crl_url, revoked = serials.len(), "Fetched revocation list.");
        self.revoked_serials.set(crl_url.to_string(), serials.clone());
        Ok(serials)
    }

    async fn not_revoked(
        &self,
        ctx: &ScanContext,
        facts: &CertificateFacts,
        http: &dyn HttpFetch,
    ) -> AnalysisResult {
        if facts.is_ca {
            return AnalysisResult::pass(json!({ "ca": true }));
        }
        if facts.crl_urls.is_empty() {
            return AnalysisResult::unknown();
        }

        for crl_url in &facts.crl_urls {
            if ctx.is_expired() {
                debug!(crl = %crl_url, "Deadline passed, skipping revocation check.");
                return AnalysisResult::unknown();
            }
            match self.revoked_serials_of(http, crl_url).await {
                Ok(serials) if serials.contains(&facts.serial) => {
                    info!(serial = %facts.serial, crl = %crl_url, "Certificate is revoked.");
                    return AnalysisResult::fail(json!({ "serial": facts.serial, "crl": crl_url }));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(crl = %crl_url, error = %e, "Could not check revocation list.");
                    return AnalysisResult::new(
                        DidPass::Unknown,
                        json!({ "error": e, "crl": crl_url }),
                    );
                }
            }
        }
        AnalysisResult::pass(json!({ "serial": facts.serial }))
    }

    async fn leaf_certificate(
        &self,
        target: &Target,
        upstream: &Upstream,
    ) -> Result<Arc<TlsState>, AnalyzerError> {
        match upstream {
            Upstream::Transport(Some(state)) => Ok(state.clone()),
            Upstream::Transport(None) => {
                debug!(host = target.hostname(), "No TLS state from the probe, dialing.");
                Ok(Arc::new(target.options.tls.dial(target.hostname(), 443).await?))
            }
            _ => Err(AnalyzerError::Failed("certificate analyzer needs transport state".into())),
        }
    }
}

#[async_trait]
impl Analyzer for CertificateAnalyzer {
    fn name(&self) -> &'static str {
        "certificate"
    }

    fn analysis_rule_ids(&self) -> Vec<RuleId> {
        vec![
            RuleId::ValidCertificate,
            RuleId::MatchesHostname,
            RuleId::StrongSignatureAlgorithm,
            RuleId::NotRevoked,
        ]
    }

    async fn analyze(
        &self,
        ctx: &ScanContext,
        target: &Target,
        upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError> {
        if let Some(cached) = target.cached_results(&self.analysis_rule_ids()).await {
            return Ok(cached);
        }
        info!(host = target.hostname(), "Starting certificate analysis.");

        let state = self.leaf_certificate(target, upstream).await?;
        let der = state
            .leaf()
            .ok_or_else(|| AnalyzerError::Failed("peer presented no certificate".into()))?;
        let facts = CertificateFacts::from_der(der)?;

        let started = Instant::now();
        let now = Utc::now();
        let mut results = RuleResults::new();
        results.insert(
            RuleId::ValidCertificate,
            target.check(RuleId::ValidCertificate, || {
                valid_certificate(&facts, now).with_duration(started.elapsed())
            }),
        );
        results.insert(
            RuleId::MatchesHostname,
            target.check(RuleId::MatchesHostname, || {
                matches_hostname(&facts, target.hostname()).with_duration(started.elapsed())
            }),
        );
        results.insert(
            RuleId::StrongSignatureAlgorithm,
            target.check(RuleId::StrongSignatureAlgorithm, || {
                strong_signature_algorithm(&facts).with_duration(started.elapsed())
            }),
        );

        let http = target.options.http.clone();
        let revocation = target
            .maybe_check(RuleId::NotRevoked, || async {
                let started = Instant::now();
                self.not_revoked(ctx, &facts, http.as_ref())
                    .await
                    .with_duration(started.elapsed())
            })
            .await;
        results.insert(RuleId::NotRevoked, revocation);

        info!(host = target.hostname(), "Certificate analysis finished.");
        target.store_results(&results).await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::{ClientError, HttpResponse};
    use crate::core::target::test_support;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn facts() -> CertificateFacts {
        let now = Utc::now();
        CertificateFacts {
            subject: "CN=www.example.com".into(),
            issuer: "CN=Example CA".into(),
            not_before: now - Duration::days(10),
            not_after: now + Duration::days(80),
            names: vec!["www.example.com".into(), "*.example.com".into()],
            signature_algorithm: "1.2.840.113549.1.1.11".into(),
            serial: "1a2b".into(),
            is_ca: false,
            crl_urls: vec!["http://crl.example.com/ca.crl".into()],
        }
    }

    #[derive(Default)]
    struct CountingHttp {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpFetch for CountingHttp {
        async fn get(&self, url: &Url) -> Result<HttpResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Tls(format!("{url} is unreachable")))
        }
    }

    #[test]
    fn wildcards_cover_a_single_label() {
        assert!(hostname_matches("*.example.com", "www.example.com"));
        assert!(hostname_matches("WWW.Example.com", "www.example.com."));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(!hostname_matches("*.example.com", "a.b.example.com"));
        assert!(!hostname_matches("www.example.org", "www.example.com"));
    }

    #[test]
    fn validity_window() {
        let facts = facts();
        let now = Utc::now();
        assert!(valid_certificate(&facts, now).is_success());
        assert!(valid_certificate(&facts, now).recommendations.is_empty());

        let soon = valid_certificate(&facts, now + Duration::days(60));
        assert!(soon.recommendations.contains("expiresSoon"));

        let expired = valid_certificate(&facts, now + Duration::days(81));
        assert!(expired.is_failure());
        assert!(expired.errors.contains("expired"));

        let early = valid_certificate(&facts, now - Duration::days(11));
        assert!(early.errors.contains("notYetValid"));
    }

    #[test]
    fn sha1_signatures_are_weak() {
        let mut facts = facts();
        assert!(strong_signature_algorithm(&facts).is_success());
        facts.signature_algorithm = "1.2.840.113549.1.1.5".into();
        assert!(strong_signature_algorithm(&facts).is_failure());
    }

    #[test]
    fn serials_are_normalised() {
        assert_eq!(serial_hex(&[0x00, 0x1a, 0x2b]), "1a2b");
        assert_eq!(serial_hex(&[0x00]), "0");
    }

    #[tokio::test]
    async fn cached_revocation_lists_are_not_fetched_again() {
        let cache = Arc::new(RevocationCache::new(1024));
        cache.set("http://crl.example.com/ca.crl".into(), vec!["ff".into(), "1a2b".into()]);
        let analyzer = CertificateAnalyzer::new(cache);
        let http = CountingHttp::default();

        let result = analyzer.not_revoked(&ScanContext::background(), &facts(), &http).await;

        assert!(result.is_failure());
        assert_eq!(http.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_revocation_lists_are_unknown() {
        let analyzer = CertificateAnalyzer::new(Arc::new(RevocationCache::new(1024)));
        let http = CountingHttp::default();

        let result = analyzer.not_revoked(&ScanContext::background(), &facts(), &http).await;
        assert!(result.is_unknown());
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);

        let mut ca = facts();
        ca.is_ca = true;
        let result = analyzer.not_revoked(&ScanContext::background(), &ca, &http).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn failed_handshake_is_an_error() {
        let analyzer = CertificateAnalyzer::new(Arc::new(RevocationCache::new(1024)));
        let target = test_support::target("https://example.com/");
        let err = analyzer
            .analyze(&ScanContext::background(), &target, &Upstream::Transport(None))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Client(_)));
    }
}
