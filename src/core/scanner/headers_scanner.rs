// src/core/scanner/headers_scanner.rs

use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::analyzer::{Analyzer, AnalyzerError, Upstream};
use crate::core::client::HttpResponse;
use crate::core::models::{AnalysisResult, DidPass, RuleId, RuleResults};
use crate::core::target::{ScanContext, Target};

const MISSING_HEADER: &str = "missingHeader";
const MISSING_MAX_AGE: &str = "missingMaxAge";
const MAX_AGE_TOO_LOW: &str = "maxAgeTooLow";
const MISSING_INCLUDE_SUBDOMAINS: &str = "missingIncludeSubDomains";
const NOT_DENY_OR_SAME_ORIGIN: &str = "notDenyOrSameOrigin";
const NOT_NO_SNIFF: &str = "notNoSniff";
const MISSING_DEFAULT_SRC_WITH_SELF: &str = "missingDefaultSrcWithSelf";
const MISSING_SCRIPT_SRC: &str = "missingScriptSrc";
const MISSING_STYLE_SRC: &str = "missingStyleSrc";
const MISSING_IMG_SRC: &str = "missingImgSrc";

/// One year, the lowest HSTS max-age that is not flagged.
const MIN_HSTS_MAX_AGE: u64 = 365 * 24 * 60 * 60;

static RE_MAX_AGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)max-age\s*=\s*"?(\d+)"?"#).unwrap());

type Rule = (&'static str, fn(&str) -> bool);

/// Error rules fail the check, recommendation rules only annotate it.
/// A rule matches when its predicate returns true.
struct Validator {
    errors: &'static [Rule],
    recommendations: &'static [Rule],
}

impl Validator {
    fn validate(&self, value: &str) -> AnalysisResult {
        let errors: Vec<&str> = matching(self.errors, value);
        let recommendations: Vec<&str> = if errors.iter().any(|e| *e == MISSING_HEADER) {
            Vec::new()
        } else {
            matching(self.recommendations, value)
        };

        AnalysisResult::new(DidPass::from_outcome(errors.is_empty()), json!(value))
            .with_errors(errors)
            .with_recommendations(recommendations)
    }
}

fn matching(rules: &'static [Rule], value: &str) -> Vec<&'static str> {
    rules
        .iter()
        .filter(|(_, predicate)| predicate(value))
        .map(|(code, _)| *code)
        .collect()
}

fn is_missing(value: &str) -> bool {
    value.trim().is_empty()
}

fn lacks_max_age(value: &str) -> bool {
    !RE_MAX_AGE.is_match(value)
}

fn max_age_too_low(value: &str) -> bool {
    RE_MAX_AGE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .is_some_and(|age| age < MIN_HSTS_MAX_AGE)
}

fn lacks_include_subdomains(value: &str) -> bool {
    !value.to_ascii_lowercase().contains("includesubdomains")
}

fn not_deny_or_same_origin(value: &str) -> bool {
    let value = value.trim();
    !value.eq_ignore_ascii_case("deny") && !value.eq_ignore_ascii_case("sameorigin")
}

fn not_no_sniff(value: &str) -> bool {
    !value.trim().eq_ignore_ascii_case("nosniff")
}

/// The sources listed for `directive`, `None` if the directive is absent.
fn csp_directive<'a>(policy: &'a str, directive: &str) -> Option<Vec<&'a str>> {
    policy.split(';').find_map(|part| {
        let mut tokens = part.split_whitespace();
        let name = tokens.next()?;
        name.eq_ignore_ascii_case(directive)
            .then(|| tokens.collect())
    })
}

fn lacks_default_src_self(value: &str) -> bool {
    !csp_directive(value, "default-src").is_some_and(|sources| {
        sources
            .iter()
            .any(|s| s.eq_ignore_ascii_case("'self'") || s.eq_ignore_ascii_case("'none'"))
    })
}

fn lacks_script_src(value: &str) -> bool {
    csp_directive(value, "script-src").is_none()
}

fn lacks_style_src(value: &str) -> bool {
    csp_directive(value, "style-src").is_none()
}

fn lacks_img_src(value: &str) -> bool {
    csp_directive(value, "img-src").is_none()
}

static HSTS: Validator = Validator {
    errors: &[(MISSING_HEADER, is_missing), (MISSING_MAX_AGE, lacks_max_age)],
    recommendations: &[
        (MISSING_INCLUDE_SUBDOMAINS, lacks_include_subdomains),
        (MAX_AGE_TOO_LOW, max_age_too_low),
    ],
};

static CONTENT_SECURITY_POLICY: Validator = Validator {
    errors: &[(MISSING_HEADER, is_missing)],
    recommendations: &[
        (MISSING_DEFAULT_SRC_WITH_SELF, lacks_default_src_self),
        (MISSING_SCRIPT_SRC, lacks_script_src),
        (MISSING_STYLE_SRC, lacks_style_src),
        (MISSING_IMG_SRC, lacks_img_src),
    ],
};

static X_FRAME_OPTIONS: Validator = Validator {
    errors: &[(MISSING_HEADER, is_missing), (NOT_DENY_OR_SAME_ORIGIN, not_deny_or_same_origin)],
    recommendations: &[],
};

static CONTENT_TYPE_OPTIONS: Validator = Validator {
    errors: &[(MISSING_HEADER, is_missing), (NOT_NO_SNIFF, not_no_sniff)],
    recommendations: &[],
};

/// Reads a header as text. Missing headers read as the empty string.
fn header_value(headers: &HeaderMap, name: &str) -> String {
    match headers.get(name) {
        Some(value) => match value.to_str() {
            Ok(s) => {
                debug!(header_name = name, value = s, "Header found.");
                s.to_string()
            }
            Err(_) => {
                warn!(header_name = name, "Header found but contained invalid UTF-8.");
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            }
        },
        None => {
            debug!(header_name = name, "Header not found.");
            String::new()
        }
    }
}

/// Judges the security headers of the final response.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadersAnalyzer;

impl HeadersAnalyzer {
    fn validate_header(
        target: &Target,
        response: &HttpResponse,
        rule: RuleId,
        header: &str,
        validator: &Validator,
    ) -> AnalysisResult {
        target.check(rule, || {
            let started = Instant::now();
            validator
                .validate(&header_value(&response.headers, header))
                .with_duration(started.elapsed())
        })
    }
}

#[async_trait]
impl Analyzer for HeadersAnalyzer {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn analysis_rule_ids(&self) -> Vec<RuleId> {
        vec![
            RuleId::Https,
            RuleId::Hsts,
            RuleId::ContentSecurityPolicy,
            RuleId::XFrameOptions,
            RuleId::ContentTypeOptions,
        ]
    }

    async fn analyze(
        &self,
        _ctx: &ScanContext,
        target: &Target,
        upstream: &Upstream,
    ) -> Result<RuleResults, AnalyzerError> {
        let Upstream::Response(response) = upstream else {
            return Err(AnalyzerError::Failed("headers analyzer needs an http response".into()));
        };
        info!(url = %response.url, "Starting headers analysis.");

        let mut results = RuleResults::new();
        results.insert(
            RuleId::Https,
            target.check(RuleId::Https, || {
                let scheme = response.url.scheme();
                AnalysisResult::new(
                    DidPass::from_outcome(scheme == "https"),
                    json!({ "finalUrl": response.url.as_str() }),
                )
            }),
        );

        let headers = [
            (RuleId::Hsts, "strict-transport-security", &HSTS),
            (RuleId::ContentSecurityPolicy, "content-security-policy", &CONTENT_SECURITY_POLICY),
            (RuleId::XFrameOptions, "x-frame-options", &X_FRAME_OPTIONS),
            (RuleId::ContentTypeOptions, "x-content-type-options", &CONTENT_TYPE_OPTIONS),
        ];
        for (rule, header, validator) in headers {
            results.insert(rule, Self::validate_header(target, response, rule, header, validator));
        }

        let failed = results.values().filter(|r| r.is_failure()).count();
        info!(failed, "Headers analysis finished.");
        Ok(results)
    }
}
