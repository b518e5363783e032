//! Product profiles
//!
//! A profile describes, per product, the provisioning command sequence, how
//! each response is judged, and which fields verification reads back. The
//! station code never hard-codes a product protocol; everything product
//! specific lives in `<product_id>.toml` under the profile directory.
//!
//! Profiles are validated completely at load time, so a session never
//! discovers a broken regex or an unknown placeholder halfway through a
//! device.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use super::matcher::{ExpectedValue, ResponseMatcher, ValueParser};
use super::template::{self, Variables, SESSION_VARIABLES};
use crate::config::defaults;
use crate::error::ProfileError;

/// A product profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Profile metadata
    pub profile: ProfileMetadata,

    /// Profile constants usable in templates (e.g. `unlock_code`)
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Provisioning steps, executed in order
    #[serde(default)]
    pub steps: Vec<ProvisioningStep>,

    /// Post-provisioning verification
    #[serde(default)]
    pub verification: VerificationSpec,
}

/// Profile metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProfileMetadata {
    /// Product identifier, also the profile file stem
    pub product_id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Banner the firmware prints once its console is ready
    #[serde(default)]
    pub ready: Option<ReadyBanner>,
}

/// Ready banner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReadyBanner {
    /// Text the banner line contains
    pub marker: String,

    /// How long to wait for it (in milliseconds)
    #[serde(default = "default_ready_timeout")]
    pub timeout_ms: u64,
}

/// Kind of provisioning step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Unlock the provisioning interface
    Unlock,
    /// Write one field
    Write,
    /// Read back and confirm what was written
    Verify,
    /// Reset the device; must be the final step
    Reboot,
}

/// One provisioning step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningStep {
    /// Unique step id
    pub id: String,

    /// Step kind
    pub kind: StepKind,

    /// Field written by a `write` step (informational)
    #[serde(default)]
    pub field: Option<String>,

    /// Command template
    pub command: String,

    /// Response matcher; defaults to `ok`, or `none` for reboot steps
    #[serde(default)]
    pub expect: Option<ResponseMatcher>,

    /// Attempts before the step fails
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Response timeout per attempt (in milliseconds)
    #[serde(default = "default_step_timeout")]
    pub timeout_ms: u64,

    /// Delay between attempts (in milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl ProvisioningStep {
    /// Effective response matcher
    pub fn matcher(&self) -> ResponseMatcher {
        match (&self.expect, self.kind) {
            (Some(matcher), _) => matcher.clone(),
            (None, StepKind::Reboot) => ResponseMatcher::None,
            (None, _) => ResponseMatcher::Ok,
        }
    }
}

/// Verification section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VerificationSpec {
    /// Fields to verify
    #[serde(default)]
    pub fields: Vec<VerificationField>,

    /// Maximum time spent on one query (in milliseconds)
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Silence that ends a query response (in milliseconds)
    #[serde(default = "default_idle_gap")]
    pub idle_gap_ms: u64,

    /// Wait for the port to come back after a reboot step
    #[serde(default = "default_true")]
    pub rebind_after_reboot: bool,
}

impl Default for VerificationSpec {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            query_timeout_ms: default_query_timeout(),
            idle_gap_ms: default_idle_gap(),
            rebind_after_reboot: true,
        }
    }
}

/// One verified field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VerificationField {
    /// Field name
    pub name: String,

    /// Query command template
    pub query: String,

    /// How the value is extracted
    pub parser: ValueParser,

    /// Expected value
    pub expect: ExpectedValue,
}

fn default_ready_timeout() -> u64 {
    defaults::READY_TIMEOUT_MS
}

fn default_attempts() -> u32 {
    1
}

fn default_step_timeout() -> u64 {
    defaults::STEP_TIMEOUT_MS
}

fn default_retry_delay() -> u64 {
    defaults::RETRY_DELAY_MS
}

fn default_query_timeout() -> u64 {
    defaults::QUERY_TIMEOUT_MS
}

fn default_idle_gap() -> u64 {
    defaults::IDLE_GAP_MS
}

fn default_true() -> bool {
    true
}

impl Profile {
    /// Parse a profile from TOML without validating it
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parse and validate a profile
    pub fn parse(content: &str, origin: &str) -> Result<Self, ProfileError> {
        let profile = Self::from_toml(content).map_err(|e| ProfileError::Parse {
            path: origin.to_string(),
            error: e.to_string(),
        })?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load and validate a profile file
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path).map_err(|e| ProfileError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Product id
    pub fn product_id(&self) -> &str {
        &self.profile.product_id
    }

    /// Whether `name` may appear as a template placeholder
    pub fn knows_variable(&self, name: &str) -> bool {
        SESSION_VARIABLES.contains(&name) || self.variables.contains_key(name)
    }

    /// Template variables for a session: profile constants overlaid with
    /// session values
    pub fn bind(&self, session: &Variables) -> Variables {
        let mut vars = self.variables.clone();
        vars.extend(session.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    /// Placeholders of steps and verification fields that `vars` leaves
    /// without a non-blank value, sorted
    pub fn unbound_variables(&self, vars: &Variables) -> Vec<String> {
        let step_texts = self.steps.iter().flat_map(|step| {
            std::iter::once(step.command.as_str())
                .chain(step.expect.iter().flat_map(|m| m.templates()))
        });
        let field_texts = self.verification.fields.iter().flat_map(|field| {
            std::iter::once(field.query.as_str()).chain(field.expect.templates())
        });

        step_texts
            .chain(field_texts)
            .flat_map(template::placeholders)
            .filter(|name| vars.get(name).map_or(true, |v| v.trim().is_empty()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct verification queries in declaration order
    pub fn queries(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.verification
            .fields
            .iter()
            .map(|f| f.query.as_str())
            .filter(|q| seen.insert(*q))
            .collect()
    }

    /// Whether the final step resets the device
    pub fn has_reboot(&self) -> bool {
        self.steps.iter().any(|s| s.kind == StepKind::Reboot)
    }

    /// Validate the whole profile
    pub fn validate(&self) -> Result<(), ProfileError> {
        let known = |name: &str| self.knows_variable(name);

        if self.steps.is_empty() {
            return Err(ProfileError::NoSteps {
                product_id: self.profile.product_id.clone(),
            });
        }

        if let Some(ready) = &self.profile.ready {
            if ready.timeout_ms == 0 {
                return Err(ProfileError::ZeroTimeout {
                    context: "Ready banner".to_string(),
                });
            }
        }

        let mut ids = HashSet::new();
        let last = self.steps.len() - 1;
        for (i, step) in self.steps.iter().enumerate() {
            if !ids.insert(step.id.as_str()) {
                return Err(ProfileError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
            if step.attempts == 0 || step.attempts > defaults::MAX_STEP_ATTEMPTS {
                return Err(ProfileError::AttemptsOutOfRange {
                    step: step.id.clone(),
                    attempts: step.attempts,
                    max: defaults::MAX_STEP_ATTEMPTS,
                });
            }
            if step.kind == StepKind::Reboot && i != last {
                return Err(ProfileError::RebootNotLast {
                    step: step.id.clone(),
                });
            }

            let context = format!("Step '{}'", step.id);
            let matcher = step.matcher();
            if matcher.expects_response() && step.timeout_ms == 0 {
                return Err(ProfileError::ZeroTimeout { context });
            }
            check_template(&context, &step.command, &known)?;
            matcher.validate(&context, &known)?;
        }

        let verification = &self.verification;
        if !verification.fields.is_empty() {
            if verification.query_timeout_ms == 0 {
                return Err(ProfileError::ZeroTimeout {
                    context: "Verification query".to_string(),
                });
            }
            if verification.idle_gap_ms == 0 {
                return Err(ProfileError::ZeroTimeout {
                    context: "Verification idle gap".to_string(),
                });
            }
        }

        let mut names = HashSet::new();
        for field in &verification.fields {
            if !names.insert(field.name.as_str()) {
                return Err(ProfileError::DuplicateField {
                    field: field.name.clone(),
                });
            }
            check_template(&format!("Field '{}' query", field.name), &field.query, &known)?;
            field.parser.validate(&field.name)?;
            field.expect.validate(&field.name, &known)?;
        }

        Ok(())
    }
}

fn check_template(
    context: &str,
    text: &str,
    known: &dyn Fn(&str) -> bool,
) -> Result<(), ProfileError> {
    if text.trim().is_empty() {
        return Err(ProfileError::InvalidMatcher {
            context: context.to_string(),
            message: "command cannot be empty".to_string(),
        });
    }
    match template::placeholders(text).into_iter().find(|p| !known(p)) {
        Some(variable) => Err(ProfileError::UnknownVariable {
            context: context.to_string(),
            variable,
        }),
        None => Ok(()),
    }
}

/// Directory of product profiles
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    dir: PathBuf,
}

impl ProfileRegistry {
    /// Registry rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Profile directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load a profile by product id, or by path if the argument names a file
    pub fn resolve(&self, id_or_path: &str) -> Result<Profile, ProfileError> {
        let as_path = Path::new(id_or_path);
        if as_path.extension().is_some_and(|e| e == "toml") || as_path.is_file() {
            return Profile::load(as_path);
        }

        let path = self.dir.join(format!("{id_or_path}.toml"));
        if !path.is_file() {
            return Err(ProfileError::NotFound {
                product_id: id_or_path.to_string(),
                dir: self.dir.clone(),
            });
        }
        let profile = Profile::load(&path)?;
        if profile.product_id() != id_or_path {
            tracing::warn!(
                "Profile {} declares product id '{}'",
                path.display(),
                profile.product_id()
            );
        }
        Ok(profile)
    }

    /// Every profile file in the directory, sorted by path
    ///
    /// Broken profiles are returned with their error so they can be reported.
    pub fn list(&self) -> Vec<(PathBuf, Result<Profile, ProfileError>)> {
        if !self.dir.is_dir() {
            return Vec::new();
        }
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(&self.dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .map(walkdir::DirEntry::into_path)
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "toml"))
            .collect();
        paths.sort();
        paths
            .into_iter()
            .map(|p| {
                let loaded = Profile::load(&p);
                (p, loaded)
            })
            .collect()
    }
}
