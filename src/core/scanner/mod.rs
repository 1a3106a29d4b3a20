// src/core/scanner/mod.rs

//! Scan orchestration and the built-in analyzers.
//!
//! [`Scanner::scan`] probes the target once and then runs the three analyzer
//! families side by side: transport (TLS state), response (the probe's HTTP
//! response) and context-free (DNS, network). Every family runs on its own
//! task. All cache writes of one scan go through a batching layer that is
//! flushed after the report is assembled.

pub mod content_scanner;
pub mod dns_scanner;
pub mod headers_scanner;
pub mod network_scanner;
pub mod ssl_scanner;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{BatchCache, CacheValue, MaxMemoryMap};
use crate::concurrency::{log_long_running, spawn_all};
use crate::config::ScannerConfig;
use crate::core::analyzer::{Analyzer, AnalyzerFamily, AnalyzerGroup, Upstream};
use crate::core::client::{HickoryResolver, HostResolver};
use crate::core::models::{
    RuleId, RuleResults, ScanError, ScanOutcome, ScanResponse, build_analysis_error,
};
use crate::core::target::{ScanContext, ScanOptions, Target};
use crate::monitoring::Alerter;

use self::content_scanner::ContentAnalyzer;
use self::dns_scanner::DomainAnalyzer;
use self::headers_scanner::HeadersAnalyzer;
use self::network_scanner::NetworkAnalyzer;
use self::ssl_scanner::CertificateAnalyzer;

/// Where the scanner looks up its own public address.
const SCANNER_IP_URL: &str = "https://ipinfo.io/ip";

/// Probe requests slower than this are logged.
const SLOW_PROBE_THRESHOLD: Duration = Duration::from_secs(5);

/// Extra time analyzers get when the probe already used up the scan deadline.
const ANALYZER_GRACE: Duration = Duration::from_secs(5);

/// Runs scans. Cheap to share: one instance serves every scan of the process.
pub struct Scanner {
    transport: Arc<AnalyzerGroup>,
    response: Arc<AnalyzerGroup>,
    context_free: Arc<AnalyzerGroup>,
    resolver: Arc<dyn HostResolver>,
    flush_timeout: Duration,
}

impl Scanner {
    /// A scanner with the built-in analyzers.
    pub fn new(config: &ScannerConfig, alerter: Arc<dyn Alerter>) -> Self {
        let revoked_serials = Arc::new(MaxMemoryMap::new(config.crl_cache_max_bytes));

        let group = |family: AnalyzerFamily, analyzers: Vec<Arc<dyn Analyzer>>| {
            AnalyzerGroup::new(family, analyzers)
                .with_alerter(alerter.clone())
                .with_slow_after(config.analyzer_watchdog)
        };

        let transport: Vec<Arc<dyn Analyzer>> =
            vec![Arc::new(CertificateAnalyzer::new(revoked_serials))];
        let response: Vec<Arc<dyn Analyzer>> =
            vec![Arc::new(HeadersAnalyzer), Arc::new(ContentAnalyzer)];
        let context_free: Vec<Arc<dyn Analyzer>> =
            vec![Arc::new(DomainAnalyzer::new()), Arc::new(NetworkAnalyzer)];

        Self::with_groups(
            group(AnalyzerFamily::Transport, transport),
            group(AnalyzerFamily::Response, response),
            group(AnalyzerFamily::ContextFree, context_free),
            Arc::new(HickoryResolver::new()),
        )
        .with_flush_timeout(config.flush_timeout)
    }

    pub fn with_groups(
        transport: AnalyzerGroup,
        response: AnalyzerGroup,
        context_free: AnalyzerGroup,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            response: Arc::new(response),
            context_free: Arc::new(context_free),
            resolver,
            flush_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Every rule id any family reports on.
    pub fn analysis_rule_ids(&self) -> Vec<RuleId> {
        let mut ids = self.transport.analysis_rule_ids();
        ids.extend(self.response.analysis_rule_ids());
        ids.extend(self.context_free.analysis_rule_ids());
        ids.sort();
        ids.dedup();
        ids
    }

    /// Scans `target_uri` (a host, optionally with a path, without scheme).
    ///
    /// Never fails: unparsable targets and unresolvable hosts come back as a
    /// [`ScanOutcome::Error`], everything else as a complete rule map.
    pub async fn scan(
        &self,
        ctx: &ScanContext,
        target_uri: &str,
        options: ScanOptions,
    ) -> ScanResponse {
        let started = Instant::now();
        info!(target = target_uri, "Starting scan.");

        let batch = Arc::new(BatchCache::<CacheValue>::new(options.cache.clone()));
        let options = options.with_cache(batch.clone());

        let response = self.run(ctx, target_uri, options, started).await;

        match tokio::time::timeout(self.flush_timeout, batch.flush()).await {
            Ok(Ok(())) => debug!(target = target_uri, "Flushed scan cache."),
            Ok(Err(e)) => warn!(target = target_uri, error = %e, "Could not flush scan cache."),
            Err(_) => warn!(
                target = target_uri,
                timeout_ms = self.flush_timeout.as_millis() as u64,
                "Flushing the scan cache timed out."
            ),
        }

        info!(target = target_uri, duration_ms = response.duration, "Scan finished.");
        response
    }

    async fn run(
        &self,
        ctx: &ScanContext,
        target_uri: &str,
        options: ScanOptions,
        started: Instant,
    ) -> ScanResponse {
        let uri = match Url::parse(&format!("http://{target_uri}")) {
            Ok(uri) if uri.host_str().is_some() => uri,
            Ok(_) => {
                warn!(target = target_uri, "Target has no host.");
                return error_response(
                    target_uri,
                    target_uri,
                    ScanError::could_not_parse_url(),
                    String::new(),
                    started,
                );
            }
            Err(e) => {
                warn!(target = target_uri, error = %e, "Could not parse target.");
                return error_response(
                    target_uri,
                    target_uri,
                    ScanError::could_not_parse_url(),
                    String::new(),
                    started,
                );
            }
        };

        let http = options.http.clone();
        let (probe, scanner_ip) = tokio::join!(
            log_long_running("probe request", SLOW_PROBE_THRESHOLD, http.get(&uri)),
            scanner_ip(&options),
        );

        let (sut, target, upstreams) = match probe {
            Err(e) => {
                error!(
                    target = target_uri,
                    error = %e,
                    "Probe request failed, skipping response analyzers."
                );
                let Some(ips) = self.resolve(&uri).await else {
                    return error_response(
                        target_uri,
                        target_uri,
                        ScanError::could_not_resolve_hostname(),
                        scanner_ip,
                        started,
                    );
                };
                let target = Arc::new(Target::new(uri, ips, options));
                let placeholders =
                    build_analysis_error(&e.to_string(), &self.response.analysis_rule_ids());
                (
                    target_uri.to_string(),
                    target,
                    Families {
                        transport: Upstream::Transport(None),
                        response: Err(placeholders),
                    },
                )
            }
            Ok(response) => {
                let final_url = response.url.clone();
                let sut = without_scheme(&final_url);
                let Some(ips) = self.resolve(&final_url).await else {
                    return error_response(
                        target_uri,
                        &sut,
                        ScanError::could_not_resolve_hostname(),
                        scanner_ip,
                        started,
                    );
                };
                let response = Arc::new(response);
                let target = Arc::new(Target::new(final_url, ips, options));
                (
                    sut,
                    target,
                    Families {
                        transport: Upstream::Transport(response.tls.clone()),
                        response: Ok(Upstream::Response(response)),
                    },
                )
            }
        };

        // The probe may have eaten the whole deadline.
        let ctx = if ctx.is_expired() {
            debug!(
                target = target_uri,
                "Deadline passed during the probe, granting analyzers extra time."
            );
            ScanContext::with_timeout(ANALYZER_GRACE)
        } else {
            *ctx
        };

        let results = self.run_families(ctx, target.clone(), upstreams).await;
        log_timings(&results);

        ScanResponse {
            target: target_uri.to_string(),
            sut,
            ip_address: target.ipv4.map(|ip| ip.to_string()).unwrap_or_default(),
            duration: elapsed_ms(started),
            timestamp: chrono::Utc::now().timestamp_millis(),
            result: ScanOutcome::Success(results),
            scanner_ip,
        }
    }

    async fn resolve(&self, url: &Url) -> Option<Vec<std::net::IpAddr>> {
        let host = url.host_str()?;
        match self.resolver.lookup_ip(host).await {
            Ok(ips) if !ips.is_empty() => Some(ips),
            Ok(_) => {
                warn!(host, "Host resolved to no addresses.");
                None
            }
            Err(e) => {
                warn!(host, error = %e, "Could not resolve host.");
                None
            }
        }
    }

    /// Runs the families on their own tasks and merges their maps.
    async fn run_families(
        &self,
        ctx: ScanContext,
        target: Arc<Target>,
        families: Families,
    ) -> RuleResults {
        let mut groups = vec![(self.transport.clone(), families.transport)];
        let mut merged = RuleResults::new();
        match families.response {
            Ok(upstream) => groups.push((self.response.clone(), upstream)),
            Err(placeholders) => merged.extend(placeholders),
        }
        groups.push((self.context_free.clone(), Upstream::Nothing));

        let tasks: Vec<BoxFuture<'static, RuleResults>> = groups
            .iter()
            .map(|(group, upstream)| {
                let group = group.clone();
                let target = target.clone();
                let upstream = upstream.clone();
                async move { group.analyze(&ctx, target, upstream).await }.boxed()
            })
            .collect();

        for ((group, _), outcome) in groups.iter().zip(spawn_all(tasks).await) {
            match outcome {
                Ok(results) => merged.extend(results),
                Err(panic) => {
                    error!(
                        family = %group.family(),
                        panic = %panic.message,
                        "Analyzer family panicked."
                    );
                    merged.extend(build_analysis_error(&panic.message, &group.analysis_rule_ids()));
                }
            }
        }
        merged
    }
}

/// Upstream input per family. The response family either runs or is
/// replaced by placeholders when the probe failed.
struct Families {
    transport: Upstream,
    response: Result<Upstream, RuleResults>,
}

async fn scanner_ip(options: &ScanOptions) -> String {
    let Ok(url) = Url::parse(SCANNER_IP_URL) else {
        return String::new();
    };
    match options.http.get(&url).await {
        Ok(response) => response.text().trim().to_string(),
        Err(e) => {
            warn!(error = %e, "Could not determine the scanner IP.");
            String::new()
        }
    }
}

fn without_scheme(url: &Url) -> String {
    let prefix = format!("{}://", url.scheme());
    url.as_str().strip_prefix(&prefix).unwrap_or(url.as_str()).to_string()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn error_response(
    target_uri: &str,
    sut: &str,
    error: ScanError,
    scanner_ip: String,
    started: Instant,
) -> ScanResponse {
    ScanResponse {
        target: target_uri.to_string(),
        sut: sut.to_string(),
        ip_address: String::new(),
        duration: elapsed_ms(started),
        timestamp: chrono::Utc::now().timestamp_millis(),
        result: ScanOutcome::Error { error },
        scanner_ip,
    }
}

fn log_timings(results: &RuleResults) {
    let mut timings: Vec<(&RuleId, Duration)> =
        results.iter().map(|(id, r)| (id, r.duration)).collect();
    timings.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, duration) in timings {
        debug!(rule = %id, duration_ms = duration.as_millis() as u64, "Rule timing.");
    }
}
