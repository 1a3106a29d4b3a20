// src/core/analyzer.rs

//! The analyzer contract and the group that runs analyzers side by side.
//!
//! A group never fails: whatever its children do (return an error, panic,
//! take forever) the caller receives a result for every rule id the group
//! declares.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use strum::Display;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::concurrency::{log_long_running, spawn_all};
use crate::core::client::{ClientError, HttpResponse, TlsState};
use crate::core::models::{RuleId, RuleResults, build_analysis_error};
use crate::core::target::{ScanContext, Target};
use crate::monitoring::{Alerter, NoopAlerter};

/// Default threshold after which a still running analyzer is reported.
pub const SLOW_ANALYZER_THRESHOLD: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{0}")]
    Failed(String),
}

/// Which kind of upstream input an analyzer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum AnalyzerFamily {
    Transport,
    Response,
    ContextFree,
}

/// What the scan learned before the analyzers run.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// The TLS session of the probe request, if there was one.
    Transport(Option<Arc<TlsState>>),
    Response(Arc<HttpResponse>),
    Nothing,
}

impl Upstream {
    pub fn family(&self) -> AnalyzerFamily {
        match self {
            Upstream::Transport(_) => AnalyzerFamily::Transport,
            Upstream::Response(_) => AnalyzerFamily::Response,
            Upstream::Nothing => AnalyzerFamily::ContextFree,
        }
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every rule id this analyzer reports on.
    fn analysis_rule_ids(&self) -> Vec<RuleId>;

    async fn analyze(
        &self,
        ctx: &ScanContext,
        target: &Target,
        upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError>;
}

/// Runs a fixed set of analyzers of one family concurrently.
pub struct AnalyzerGroup {
    family: AnalyzerFamily,
    analyzers: Vec<Arc<dyn Analyzer>>,
    alerter: Arc<dyn Alerter>,
    slow_after: Duration,
}

impl AnalyzerGroup {
    pub fn new(family: AnalyzerFamily, analyzers: Vec<Arc<dyn Analyzer>>) -> Self {
        Self {
            family,
            analyzers,
            alerter: Arc::new(NoopAlerter),
            slow_after: SLOW_ANALYZER_THRESHOLD,
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn with_slow_after(mut self, threshold: Duration) -> Self {
        self.slow_after = threshold;
        self
    }

    pub fn family(&self) -> AnalyzerFamily {
        self.family
    }

    /// Union of the children's rule ids, in declaration order, without duplicates.
    pub fn analysis_rule_ids(&self) -> Vec<RuleId> {
        let mut ids = Vec::new();
        for id in self.analyzers.iter().flat_map(|a| a.analysis_rule_ids()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Runs every child on its own task and merges their results.
    ///
    /// Children are not bound to the scan deadline; they only see it through
    /// `ctx`. Errors and panics become Unknown results for the failing
    /// child's rule ids. Later children win when two declare the same id.
    pub async fn analyze(
        &self,
        ctx: &ScanContext,
        target: Arc<Target>,
        upstream: Upstream,
    ) -> RuleResults {
        if upstream.family() != self.family {
            warn!(
                group = %self.family,
                input = %upstream.family(),
                "Analyzer group received input of another family."
            );
            let message = format!(
                "{} analyzers cannot consume {} input",
                self.family,
                upstream.family()
            );
            return build_analysis_error(&message, &self.analysis_rule_ids());
        }

        let slots: Arc<Mutex<Vec<Option<RuleResults>>>> =
            Arc::new(Mutex::new(vec![None; self.analyzers.len()]));

        let tasks: Vec<BoxFuture<'static, ()>> = self
            .analyzers
            .iter()
            .enumerate()
            .map(|(index, analyzer)| {
                let analyzer = analyzer.clone();
                let target = target.clone();
                let upstream = upstream.clone();
                let slots = slots.clone();
                let ctx = *ctx;
                let slow_after = self.slow_after;
                async move {
                    let started = Instant::now();
                    let outcome = log_long_running(
                        analyzer.name(),
                        slow_after,
                        analyzer.analyze(&ctx, &target, &upstream),
                    )
                    .await;
                    let results = match outcome {
                        Ok(results) => results,
                        Err(e) => {
                            error!(
                                analyzer = analyzer.name(),
                                error = %e,
                                "Analyzer returned an error."
                            );
                            build_analysis_error(&e.to_string(), &analyzer.analysis_rule_ids())
                        }
                    };
                    debug!(
                        analyzer = analyzer.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Analyzer finished."
                    );
                    slots.lock().unwrap_or_else(|p| p.into_inner())[index] = Some(results);
                }
                .boxed()
            })
            .collect();

        let outcomes = spawn_all(tasks).await;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            let Err(panic) = outcome else { continue };
            let analyzer = &self.analyzers[index];
            error!(analyzer = analyzer.name(), panic = %panic.message, "Analyzer panicked.");

            let alert = format!("panic in analyzer {}: {}", analyzer.name(), panic.message);
            if let Err(e) = self.alerter.alert(&alert).await {
                warn!(error = %e, "Could not send panic alert.");
            }

            let placeholder = build_analysis_error(&panic.message, &analyzer.analysis_rule_ids());
            slots.lock().unwrap_or_else(|p| p.into_inner())[index] = Some(placeholder);
        }

        let slots = std::mem::take(&mut *slots.lock().unwrap_or_else(|p| p.into_inner()));
        slots.into_iter().flatten().fold(RuleResults::new(), |mut merged, results| {
            merged.extend(results);
            merged
        })
    }
}
