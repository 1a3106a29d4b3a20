// src/main.rs

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::{info, warn};

use vanguard_bp_scanner::cache::{
    CacheValue, DisableCache, DistributedCache, RedisStore, RefreshCache, SharedCache, TtlCache,
};
use vanguard_bp_scanner::concurrency::watchdog;
use vanguard_bp_scanner::config::ScannerConfig;
use vanguard_bp_scanner::core::client::{NativeTlsDialer, ReqwestFetcher};
use vanguard_bp_scanner::core::models::RuleId;
use vanguard_bp_scanner::core::scanner::Scanner;
use vanguard_bp_scanner::core::target::{ScanContext, ScanOptions};
use vanguard_bp_scanner::logging::initialize_logging;
use vanguard_bp_scanner::monitoring::SlackWebhookAlerter;
use vanguard_bp_scanner::resilience::CircuitBreaker;

/// A whole scan running longer than this is logged.
const SCAN_WATCHDOG: Duration = Duration::from_secs(20);

/// Scans one website against the best practice catalogue and prints the
/// report as JSON.
#[derive(Parser, Debug)]
#[command(name = "vanguard-bp-scanner", version, about = "Website security best practice scanner")]
struct Cli {
    /// Host to scan, optionally with a path (e.g. `example.com/login`).
    target: String,

    /// Redis instance used as the shared result cache.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Slack-compatible webhook that receives analyzer panic alerts.
    #[arg(long, env = "SLACK_WEBHOOK")]
    slack_webhook: Option<String>,

    #[arg(long, env = "SCAN_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,

    /// Ignore cached results but store the fresh ones.
    #[arg(long, conflicts_with = "no_cache")]
    refresh: bool,

    /// Neither read nor write cached results.
    #[arg(long)]
    no_cache: bool,

    /// Only run this check. Repeatable, e.g. `--check hsts --check spf`.
    #[arg(long = "check", value_parser = parse_rule)]
    checks: Vec<RuleId>,
}

fn parse_rule(value: &str) -> Result<RuleId, String> {
    RuleId::from_str(value).map_err(|_| format!("unknown check: {value}"))
}

async fn build_cache(config: &ScannerConfig, refresh: bool, no_cache: bool) -> SharedCache {
    if no_cache {
        info!("Caching disabled.");
        return Arc::new(DisableCache::<CacheValue>::new());
    }

    let cache: SharedCache = match &config.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("Using the distributed cache.");
                let breaker = CircuitBreaker::new(
                    "redis",
                    config.breaker_failure_threshold,
                    config.breaker_cool_down,
                );
                Arc::new(DistributedCache::<CacheValue>::new(Arc::new(store), breaker))
            }
            Err(e) => {
                warn!(error = %e, "Could not connect to Redis, using the in-memory cache.");
                Arc::new(TtlCache::<CacheValue>::new())
            }
        },
        None => Arc::new(TtlCache::<CacheValue>::new()),
    };

    if refresh {
        Arc::new(RefreshCache::new(cache))
    } else {
        cache
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    initialize_logging()?;
    let cli = Cli::parse();

    let config = ScannerConfig::new()
        .with_redis_url(cli.redis_url)
        .with_alert_webhook_url(cli.slack_webhook)
        .with_scan_timeout(Duration::from_secs(cli.timeout_secs))
        .with_enabled_checks(cli.checks);
    config.validate()?;

    let cache = build_cache(&config, cli.refresh, cli.no_cache).await;
    let http = Arc::new(ReqwestFetcher::new(config.scan_timeout)?);
    let tls = Arc::new(NativeTlsDialer::new(config.scan_timeout));
    let options = ScanOptions::new(cache, http, tls)
        .with_enabled_checks(config.enabled_check_set());

    let alerter = Arc::new(SlackWebhookAlerter::new(config.alert_webhook_url.clone()));
    let scanner = Scanner::new(&config, alerter);

    let response = {
        let _watchdog = watchdog("scan", SCAN_WATCHDOG);
        let ctx = ScanContext::with_timeout(config.scan_timeout);
        scanner.scan(&ctx, &cli.target, options).await
    };

    if let Some(error) = response.error() {
        warn!(code = error.code, reason = %error.error_code_description, "Scan did not complete.");
    } else {
        let unscannable = response.unscannable_keys();
        info!(unscannable = unscannable.len(), "Scan complete.");
    }

    let report = serde_json::to_string_pretty(&response)
        .wrap_err("could not encode the scan report")?;
    println!("{report}");
    Ok(())
}
