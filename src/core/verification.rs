//! Verification engine
//!
//! After provisioning (and the reboot, if any) the device is queried again
//! and every field declared by the profile is extracted and compared with
//! its expected value. Each distinct query is sent once; fields sharing a
//! query share its response. Verification is never retried.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::profile::{Profile, VerificationSpec};
use super::template::{self, Variables};
use crate::infra::serial::{self, SerialLink};

/// Result of one verified field
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldResult {
    /// Field name
    pub name: String,
    /// Query that produced the value
    pub query: String,
    /// Expected value as shown to the operator
    pub expected: String,
    /// Extracted value
    pub actual: Option<String>,
    /// Whether the field matched
    pub passed: bool,
    /// Mismatch description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Verification results
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct VerificationReport {
    /// Per-field results in profile order
    pub fields: Vec<FieldResult>,
    /// Raw response lines per rendered query
    pub responses: BTreeMap<String, Vec<String>>,
}

impl VerificationReport {
    /// Whether every field matched
    pub fn passed(&self) -> bool {
        self.fields.iter().all(|f| f.passed)
    }

    /// Fields that did not match
    pub fn mismatches(&self) -> Vec<FieldResult> {
        self.fields.iter().filter(|f| !f.passed).cloned().collect()
    }
}

/// Compare collected responses with the profile's expectations
pub fn evaluate(
    spec: &VerificationSpec,
    responses: &BTreeMap<String, Vec<String>>,
    vars: &Variables,
) -> VerificationReport {
    let fields = spec
        .fields
        .iter()
        .map(|field| {
            let query = template::render(&field.query, vars);
            let lines = responses.get(&query).map_or(&[][..], Vec::as_slice);
            let actual = field.parser.parse(lines);
            let check = field.expect.check(actual.as_deref(), vars);
            FieldResult {
                name: field.name.clone(),
                query,
                expected: field.expect.describe(vars),
                actual,
                passed: check.is_ok(),
                message: check.err(),
            }
        })
        .collect();

    VerificationReport {
        fields,
        responses: responses.clone(),
    }
}

/// Queries the device and evaluates the profile's fields
pub struct VerificationEngine {
    profile: Arc<Profile>,
    vars: Variables,
    cancel: CancellationToken,
}

impl VerificationEngine {
    /// Engine for `profile` with bound session variables
    pub fn new(profile: Arc<Profile>, vars: Variables, cancel: CancellationToken) -> Self {
        Self {
            profile,
            vars,
            cancel,
        }
    }

    /// Send each query once and evaluate; `None` if cancelled
    pub fn run(&self, link: &mut dyn SerialLink) -> Option<VerificationReport> {
        let spec = &self.profile.verification;
        let timeout = Duration::from_millis(spec.query_timeout_ms);
        let idle_gap = Duration::from_millis(spec.idle_gap_ms);
        let mut responses = BTreeMap::new();

        for query in self.profile.queries() {
            if self.cancel.is_cancelled() {
                return None;
            }
            let rendered = template::render(query, &self.vars);
            let response = match link.send_line(&rendered) {
                Ok(()) => serial::read_response(link, timeout, idle_gap),
                Err(e) => Err(e),
            };
            let lines = match response {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!("Verification query '{}' failed: {}", rendered, e);
                    Vec::new()
                }
            };
            tracing::debug!("Query '{}' returned {} line(s)", rendered, lines.len());
            responses.insert(rendered, lines);
        }

        let report = evaluate(spec, &responses, &self.vars);
        for field in report.fields.iter().filter(|f| !f.passed) {
            tracing::warn!(
                "Field '{}' mismatch: expected {}, got {}",
                field.name,
                field.expected,
                field.actual.as_deref().unwrap_or("<missing>")
            );
        }
        Some(report)
    }
}
