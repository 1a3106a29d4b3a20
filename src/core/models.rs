// src/core/models.rs

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{AsRefStr, Display, EnumIter, EnumString};

// --- Tri-state outcome ---

/// The outcome of a single check.
///
/// `Unknown` means the check could not be performed; it is never the same as
/// `Fail`. Serialized as `true` / `false` / `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum DidPass {
    Pass,
    Fail,
    #[default]
    Unknown,
}

impl DidPass {
    pub fn from_outcome(passed: bool) -> Self {
        if passed { DidPass::Pass } else { DidPass::Fail }
    }
}

impl From<Option<bool>> for DidPass {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(passed) => DidPass::from_outcome(passed),
            None => DidPass::Unknown,
        }
    }
}

impl From<DidPass> for Option<bool> {
    fn from(value: DidPass) -> Self {
        match value {
            DidPass::Pass => Some(true),
            DidPass::Fail => Some(false),
            DidPass::Unknown => None,
        }
    }
}

// --- Rule catalogue ---

/// Every best practice the scanner knows how to judge.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RuleId {
    // response
    Https,
    Hsts,
    ContentSecurityPolicy,
    XFrameOptions,
    ContentTypeOptions,
    SubResourceIntegrity,
    NoMixedContent,
    // transport
    ValidCertificate,
    MatchesHostname,
    StrongSignatureAlgorithm,
    NotRevoked,
    // domain and network
    Spf,
    Dmarc,
    Dkim,
    Caa,
    Ipv6,
}

// --- Analysis results ---

/// The evidence and verdict for one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(default)]
    pub did_pass: DidPass,
    #[serde(default = "empty_object")]
    pub actual_value: Value,
    #[serde(default)]
    pub errors: BTreeSet<String>,
    #[serde(default)]
    pub recommendations: BTreeSet<String>,
    #[serde(rename = "durationMS", with = "duration_ms", default)]
    pub duration: Duration,
}

fn empty_object() -> Value {
    json!({})
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl AnalysisResult {
    pub fn new(did_pass: DidPass, actual_value: Value) -> Self {
        Self {
            did_pass,
            actual_value: if actual_value.is_null() { empty_object() } else { actual_value },
            errors: BTreeSet::new(),
            recommendations: BTreeSet::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn pass(actual_value: Value) -> Self {
        Self::new(DidPass::Pass, actual_value)
    }

    pub fn fail(actual_value: Value) -> Self {
        Self::new(DidPass::Fail, actual_value)
    }

    /// A result for a check that was not performed.
    pub fn unknown() -> Self {
        Self::new(DidPass::Unknown, Value::Null)
    }

    pub fn with_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.errors.extend(errors.into_iter().map(Into::into));
        self
    }

    pub fn with_recommendations<I, S>(mut self, recommendations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recommendations
            .extend(recommendations.into_iter().map(Into::into));
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.did_pass == DidPass::Pass
    }

    pub fn is_failure(&self) -> bool {
        self.did_pass == DidPass::Fail
    }

    pub fn is_unknown(&self) -> bool {
        self.did_pass == DidPass::Unknown
    }
}

pub type RuleResults = BTreeMap<RuleId, AnalysisResult>;

/// Builds an Unknown result for every rule, carrying `message` as evidence.
pub fn build_analysis_error(message: &str, rule_ids: &[RuleId]) -> RuleResults {
    let evidence = json!({ "error": message });
    rule_ids
        .iter()
        .map(|id| (*id, AnalysisResult::new(DidPass::Unknown, evidence.clone())))
        .collect()
}

// --- Scan response ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanError {
    pub code: u16,
    pub error_code_description: String,
}

impl ScanError {
    pub fn could_not_parse_url() -> Self {
        Self {
            code: 1,
            error_code_description: "could_not_parse_url".to_string(),
        }
    }

    pub fn could_not_resolve_hostname() -> Self {
        Self {
            code: 2,
            error_code_description: "could_not_resolve_hostname".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScanOutcome {
    Success(RuleResults),
    Error { error: ScanError },
}

/// The report produced for one scanned target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    /// The target as requested.
    pub target: String,
    /// The system under test: the final URL after redirects, without scheme.
    pub sut: String,
    pub ip_address: String,
    /// Milliseconds.
    pub duration: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub result: ScanOutcome,
    #[serde(rename = "scannerIP")]
    pub scanner_ip: String,
}

impl ScanResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, ScanOutcome::Success(_))
    }

    pub fn error(&self) -> Option<&ScanError> {
        match &self.result {
            ScanOutcome::Error { error } => Some(error),
            ScanOutcome::Success(_) => None,
        }
    }

    pub fn results(&self) -> Option<&RuleResults> {
        match &self.result {
            ScanOutcome::Success(results) => Some(results),
            ScanOutcome::Error { .. } => None,
        }
    }

    /// Rules whose outcome is Unknown. Empty for failed scans.
    pub fn unscannable_keys(&self) -> Vec<RuleId> {
        self.results()
            .map(|results| {
                results
                    .iter()
                    .filter(|(_, result)| result.is_unknown())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }
}
