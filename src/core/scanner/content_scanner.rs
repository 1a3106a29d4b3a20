// src/core/scanner/content_scanner.rs

use std::time::Instant;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::core::analyzer::{Analyzer, AnalyzerError, Upstream};
use crate::core::models::{AnalysisResult, DidPass, RuleId, RuleResults};
use crate::core::target::{ScanContext, Target};

/// A sub-resource referenced by the page.
#[derive(Debug)]
struct Resource {
    url: Url,
    /// Scripts and stylesheets can carry an integrity hash, images and frames cannot.
    integrity_applies: bool,
    has_integrity: bool,
}

fn collect_resources(document: &Html, base: &Url) -> Vec<Resource> {
    let tags = [
        ("script[src]", "src", true),
        ("link[href]", "href", true),
        ("img[src]", "src", false),
        ("iframe[src]", "src", false),
    ];

    let mut resources = Vec::new();
    for (selector, attribute, integrity_applies) in tags {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let element = element.value();
            // Only stylesheets, preloads and module preloads fetch executable content.
            if element.name() == "link" && !is_fetching_link(element.attr("rel")) {
                continue;
            }
            let Some(raw) = element.attr(attribute) else {
                continue;
            };
            match base.join(raw.trim()) {
                Ok(url) => resources.push(Resource {
                    url,
                    integrity_applies,
                    has_integrity: element
                        .attr("integrity")
                        .is_some_and(|v| !v.trim().is_empty()),
                }),
                Err(e) => debug!(
                    reference = raw,
                    error = %e,
                    "Skipping unparsable resource reference."
                ),
            }
        }
    }
    resources
}

fn is_fetching_link(rel: Option<&str>) -> bool {
    rel.is_some_and(|rel| {
        rel.split_whitespace().any(|kind| {
            ["stylesheet", "preload", "modulepreload"]
                .iter()
                .any(|k| kind.eq_ignore_ascii_case(k))
        })
    })
}

fn is_cross_origin(resource: &Url, page: &Url) -> bool {
    resource.host_str() != page.host_str()
}

/// Cross-origin scripts and stylesheets must pin their content with `integrity`.
fn sub_resource_integrity(resources: &[Resource], page: &Url) -> AnalysisResult {
    let missing: Vec<&str> = resources
        .iter()
        .filter(|r| r.integrity_applies && is_cross_origin(&r.url, page) && !r.has_integrity)
        .map(|r| r.url.as_str())
        .collect();

    AnalysisResult::new(
        DidPass::from_outcome(missing.is_empty()),
        json!({ "missingIntegrity": missing }),
    )
}

/// A page served over https must not pull anything over plain http. A plain
/// http page only fails when it mixes both schemes.
fn no_mixed_content(resources: &[Resource], page: &Url) -> AnalysisResult {
    let insecure: Vec<&str> = resources
        .iter()
        .filter(|r| r.url.scheme() == "http")
        .map(|r| r.url.as_str())
        .collect();
    let secure = resources.iter().any(|r| r.url.scheme() == "https");

    let mixed = if page.scheme() == "https" {
        !insecure.is_empty()
    } else {
        !insecure.is_empty() && secure
    };

    AnalysisResult::new(
        DidPass::from_outcome(!mixed),
        json!({ "insecureResources": insecure }),
    )
}

/// Inspects the HTML body of the final response.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentAnalyzer;

#[async_trait]
impl Analyzer for ContentAnalyzer {
    fn name(&self) -> &'static str {
        "content"
    }

    fn analysis_rule_ids(&self) -> Vec<RuleId> {
        vec![RuleId::SubResourceIntegrity, RuleId::NoMixedContent]
    }

    async fn analyze(
        &self,
        _ctx: &ScanContext,
        target: &Target,
        upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError> {
        let Upstream::Response(response) = upstream else {
            return Err(AnalyzerError::Failed("content analyzer needs an http response".into()));
        };
        let options = &target.options;
        if !self.analysis_rule_ids().iter().any(|id| options.is_enabled(*id)) {
            return Ok(self
                .analysis_rule_ids()
                .into_iter()
                .map(|id| (id, AnalysisResult::unknown()))
                .collect());
        }

        // Parsed once for both rules.
        let started = Instant::now();
        let resources = collect_resources(&Html::parse_document(&response.text()), &response.url);
        info!(url = %response.url, resources = resources.len(), "Parsed page resources.");

        let mut results = RuleResults::new();
        results.insert(
            RuleId::SubResourceIntegrity,
            target.check(RuleId::SubResourceIntegrity, || {
                sub_resource_integrity(&resources, &response.url).with_duration(started.elapsed())
            }),
        );
        results.insert(
            RuleId::NoMixedContent,
            target.check(RuleId::NoMixedContent, || {
                no_mixed_content(&resources, &response.url).with_duration(started.elapsed())
            }),
        );
        Ok(results)
    }
}
