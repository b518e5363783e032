//! Response matchers, value parsers and expected-value matchers
//!
//! These are the tagged building blocks of a profile. Each kind is a serde
//! variant, so an unknown `kind` is rejected when the profile is parsed, and
//! [`ResponseMatcher::validate`] / [`ExpectedValue::validate`] reject bad
//! patterns and ranges before any session starts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::template::{self, Variables};
use crate::error::ProfileError;

/// How a provisioning step decides its response was acceptable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseMatcher {
    /// A line saying OK/SUCCESS accepts, ERROR/FAIL rejects
    Ok,
    /// Some line contains the (templated) text
    Contains { value: String },
    /// Some line equals the (templated) text after trimming
    Exact { value: String },
    /// The response matches the regex; placeholders are substituted escaped
    Pattern { pattern: String },
    /// Every inner matcher accepts
    AllOf { matchers: Vec<ResponseMatcher> },
    /// No response is read
    None,
}

/// Judgement of the response lines received so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Response satisfies the matcher
    Accept,
    /// Response definitively fails the matcher
    Reject(String),
    /// Keep reading
    Pending,
}

impl ResponseMatcher {
    /// Whether the step reads a response at all
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Judge the lines received so far
    pub fn judge(&self, lines: &[String], vars: &Variables) -> Verdict {
        match self {
            Self::None => Verdict::Accept,
            Self::Ok => judge_ok(lines),
            Self::Contains { value } => {
                let needle = template::render(value, vars);
                if lines.iter().any(|l| l.contains(&needle)) {
                    Verdict::Accept
                } else {
                    Verdict::Pending
                }
            }
            Self::Exact { value } => {
                let expected = template::render(value, vars);
                if lines.iter().any(|l| l.trim() == expected.trim()) {
                    Verdict::Accept
                } else {
                    Verdict::Pending
                }
            }
            Self::Pattern { pattern } => {
                match Regex::new(&template::render_pattern(pattern, vars)) {
                    Ok(re) if re.is_match(&lines.join("\n")) => Verdict::Accept,
                    Ok(_) => Verdict::Pending,
                    Err(e) => Verdict::Reject(format!("invalid pattern: {e}")),
                }
            }
            Self::AllOf { matchers } => {
                let mut pending = false;
                for matcher in matchers {
                    match matcher.judge(lines, vars) {
                        Verdict::Reject(reason) => return Verdict::Reject(reason),
                        Verdict::Pending => pending = true,
                        Verdict::Accept => {}
                    }
                }
                if pending {
                    Verdict::Pending
                } else {
                    Verdict::Accept
                }
            }
        }
    }

    /// Final verdict once the response window has closed
    ///
    /// `Ok` accepts a non-empty response without an explicit status word;
    /// every other pending matcher is a mismatch.
    pub fn settle(&self, lines: &[String], vars: &Variables) -> Verdict {
        match self.judge(lines, vars) {
            Verdict::Pending => match self {
                Self::Ok if !lines.is_empty() => Verdict::Accept,
                Self::AllOf { matchers } => {
                    for matcher in matchers {
                        if let Verdict::Reject(reason) = matcher.settle(lines, vars) {
                            return Verdict::Reject(reason);
                        }
                    }
                    Verdict::Accept
                }
                _ if lines.is_empty() => Verdict::Reject("no response".to_string()),
                _ => Verdict::Reject(format!("response did not match {}", self.describe())),
            },
            verdict => verdict,
        }
    }

    /// Templated texts the matcher renders
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::Ok | Self::None => Vec::new(),
            Self::Contains { value } | Self::Exact { value } => vec![value.as_str()],
            Self::Pattern { pattern } => vec![pattern.as_str()],
            Self::AllOf { matchers } => matchers.iter().flat_map(|m| m.templates()).collect(),
        }
    }

    /// Check patterns and placeholders
    pub fn validate(&self, context: &str, known: &dyn Fn(&str) -> bool) -> Result<(), ProfileError> {
        match self {
            Self::Ok | Self::None => Ok(()),
            Self::Contains { value } | Self::Exact { value } => {
                if value.is_empty() {
                    return Err(ProfileError::InvalidMatcher {
                        context: context.to_string(),
                        message: "matcher value cannot be empty".to_string(),
                    });
                }
                check_placeholders(context, value, known)
            }
            Self::Pattern { pattern } => {
                check_placeholders(context, pattern, known)?;
                compile_templated(context, pattern).map(|_| ())
            }
            Self::AllOf { matchers } => {
                if matchers.is_empty() {
                    return Err(ProfileError::InvalidMatcher {
                        context: context.to_string(),
                        message: "all_of needs at least one matcher".to_string(),
                    });
                }
                matchers.iter().try_for_each(|m| m.validate(context, known))
            }
        }
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self {
            Self::Ok => "OK status".to_string(),
            Self::Contains { value } => format!("text containing '{value}'"),
            Self::Exact { value } => format!("line '{value}'"),
            Self::Pattern { pattern } => format!("pattern /{pattern}/"),
            Self::AllOf { matchers } => matchers
                .iter()
                .map(Self::describe)
                .collect::<Vec<_>>()
                .join(" and "),
            Self::None => "no response".to_string(),
        }
    }
}

fn judge_ok(lines: &[String]) -> Verdict {
    for line in lines {
        let upper = line.to_uppercase();
        if upper.contains("ERROR") || upper.contains("FAIL") {
            return Verdict::Reject(format!("device reported '{line}'"));
        }
        let has_ok = upper
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "OK" || token == "SUCCESS");
        if has_ok {
            return Verdict::Accept;
        }
    }
    Verdict::Pending
}

/// How a verification field extracts its value from a query response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueParser {
    /// `Key: value` lines; keys are normalised before comparison
    KeyValue {
        key: String,
        #[serde(default)]
        aliases: Vec<String>,
    },
    /// Capture group of a regex applied to the whole response
    Regex {
        pattern: String,
        #[serde(default = "default_group")]
        group: usize,
    },
}

fn default_group() -> usize {
    1
}

impl ValueParser {
    /// Extract the value, if present
    pub fn parse(&self, lines: &[String]) -> Option<String> {
        match self {
            Self::KeyValue { key, aliases } => {
                let wanted: Vec<String> = std::iter::once(key)
                    .chain(aliases.iter())
                    .map(|k| normalize_key(k))
                    .collect();
                lines.iter().find_map(|line| {
                    let (k, v) = split_key_value(line)?;
                    wanted.contains(&k).then(|| v.to_string())
                })
            }
            Self::Regex { pattern, group } => {
                let re = Regex::new(pattern).ok()?;
                let joined = lines.join("\n");
                re.captures(&joined)
                    .and_then(|c| c.get(*group))
                    .map(|m| m.as_str().trim().to_string())
            }
        }
    }

    /// Check the regex and capture group
    pub fn validate(&self, field: &str) -> Result<(), ProfileError> {
        match self {
            Self::KeyValue { key, .. } => {
                if normalize_key(key).is_empty() {
                    return Err(ProfileError::InvalidMatcher {
                        context: format!("Field '{field}' parser"),
                        message: "key cannot be empty".to_string(),
                    });
                }
                Ok(())
            }
            Self::Regex { pattern, group } => {
                let context = format!("Field '{field}' parser");
                let re = Regex::new(pattern).map_err(|e| ProfileError::InvalidPattern {
                    context: context.clone(),
                    pattern: pattern.clone(),
                    error: e.to_string(),
                })?;
                if *group >= re.captures_len() {
                    return Err(ProfileError::InvalidMatcher {
                        context,
                        message: format!(
                            "capture group {group} does not exist (pattern has {})",
                            re.captures_len() - 1
                        ),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Normalise a response key: drop a leading `[TAG]`, lowercase, and collapse
/// runs of non-alphanumerics into `_`
pub fn normalize_key(raw: &str) -> String {
    let stripped = strip_tag(raw);
    let mut out = String::with_capacity(stripped.len());
    let mut pending_sep = false;
    for c in stripped.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

fn strip_tag(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with('[') {
        if let Some(end) = trimmed.find(']') {
            return trimmed[end + 1..].trim_start();
        }
    }
    trimmed
}

/// Split `Key: value` (or `Key = value`) into a normalised key and the value
fn split_key_value(line: &str) -> Option<(String, &str)> {
    let body = strip_tag(line);
    let idx = body.find([':', '='])?;
    let key = normalize_key(&body[..idx]);
    if key.is_empty() {
        return None;
    }
    Some((key, body[idx + 1..].trim()))
}

/// Expected value of a verification field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedValue {
    /// Equal to the (templated) value, case-insensitive unless requested
    Exact {
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// First number in the value lies within the bounds (inclusive)
    Range { min: Option<f64>, max: Option<f64> },
    /// Matches the regex
    Pattern { pattern: String },
    /// Equal (case-insensitive) to one of the values
    OneOf { values: Vec<String> },
}

impl ExpectedValue {
    /// Compare an extracted value; `Err` carries the mismatch message
    pub fn check(&self, actual: Option<&str>, vars: &Variables) -> Result<(), String> {
        let Some(actual) = actual.map(str::trim) else {
            return Err("value not reported by device".to_string());
        };
        match self {
            Self::Exact {
                value,
                case_sensitive,
            } => {
                let expected = template::render(value, vars);
                let equal = if *case_sensitive {
                    actual == expected.trim()
                } else {
                    actual.eq_ignore_ascii_case(expected.trim())
                };
                if equal {
                    Ok(())
                } else {
                    Err(format!("expected '{expected}', got '{actual}'"))
                }
            }
            Self::Range { min, max } => {
                let n = first_number(actual)
                    .ok_or_else(|| format!("'{actual}' is not a number"))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(format!("{n} is outside {}", describe_range(*min, *max)));
                }
                Ok(())
            }
            Self::Pattern { pattern } => {
                let re = Regex::new(&template::render_pattern(pattern, vars))
                    .map_err(|e| format!("invalid pattern: {e}"))?;
                if re.is_match(actual) {
                    Ok(())
                } else {
                    Err(format!("'{actual}' does not match /{pattern}/"))
                }
            }
            Self::OneOf { values } => {
                let rendered: Vec<String> =
                    values.iter().map(|v| template::render(v, vars)).collect();
                if rendered.iter().any(|v| v.trim().eq_ignore_ascii_case(actual)) {
                    Ok(())
                } else {
                    Err(format!("'{actual}' is not one of {rendered:?}"))
                }
            }
        }
    }

    /// Expected value as shown to the operator
    pub fn describe(&self, vars: &Variables) -> String {
        match self {
            Self::Exact { value, .. } => template::render(value, vars),
            Self::Range { min, max } => describe_range(*min, *max),
            Self::Pattern { pattern } => format!("/{}/", template::render(pattern, vars)),
            Self::OneOf { values } => values
                .iter()
                .map(|v| template::render(v, vars))
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }

    /// Templated texts the expectation renders
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::Exact { value, .. } => vec![value.as_str()],
            Self::Range { .. } => Vec::new(),
            Self::Pattern { pattern } => vec![pattern.as_str()],
            Self::OneOf { values } => values.iter().map(String::as_str).collect(),
        }
    }

    /// Check ranges, patterns and placeholders
    pub fn validate(&self, field: &str, known: &dyn Fn(&str) -> bool) -> Result<(), ProfileError> {
        let context = format!("Field '{field}' expectation");
        match self {
            Self::Exact { value, .. } => check_placeholders(&context, value, known),
            Self::Range { min, max } => match (min, max) {
                (None, None) => Err(ProfileError::InvalidRange {
                    field: field.to_string(),
                    message: "range needs min, max or both".to_string(),
                }),
                _ if min.iter().chain(max).any(|b| !b.is_finite()) => {
                    Err(ProfileError::InvalidRange {
                        field: field.to_string(),
                        message: "bounds must be finite numbers".to_string(),
                    })
                }
                (Some(lo), Some(hi)) if lo > hi => Err(ProfileError::InvalidRange {
                    field: field.to_string(),
                    message: format!("min {lo} is greater than max {hi}"),
                }),
                _ => Ok(()),
            },
            Self::Pattern { pattern } => {
                check_placeholders(&context, pattern, known)?;
                compile_templated(&context, pattern).map(|_| ())
            }
            Self::OneOf { values } => {
                if values.is_empty() {
                    return Err(ProfileError::InvalidMatcher {
                        context,
                        message: "one_of needs at least one value".to_string(),
                    });
                }
                values
                    .iter()
                    .try_for_each(|v| check_placeholders(&context, v, known))
            }
        }
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
        (Some(lo), None) => format!(">= {lo}"),
        (None, Some(hi)) => format!("<= {hi}"),
        (None, None) => "any".to_string(),
    }
}

fn first_number(s: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("static number regex")
    });
    re.find(s)?.as_str().parse().ok()
}

fn check_placeholders(
    context: &str,
    text: &str,
    known: &dyn Fn(&str) -> bool,
) -> Result<(), ProfileError> {
    match template::placeholders(text).into_iter().find(|p| !known(p)) {
        Some(variable) => Err(ProfileError::UnknownVariable {
            context: context.to_string(),
            variable,
        }),
        None => Ok(()),
    }
}

/// Compile a templated pattern with placeholder stand-ins
fn compile_templated(context: &str, pattern: &str) -> Result<Regex, ProfileError> {
    let sample: Variables = template::placeholders(pattern)
        .into_iter()
        .map(|p| (p, "x".to_string()))
        .collect();
    Regex::new(&template::render_pattern(pattern, &sample)).map_err(|e| {
        ProfileError::InvalidPattern {
            context: context.to_string(),
            pattern: pattern.to_string(),
            error: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.insert("serial_number".to_string(), "SN-42".to_string());
        v.insert("region_code".to_string(), "EU".to_string());
        v
    }

    fn any_known(_: &str) -> bool {
        true
    }

    // ============================================
    // Unit Tests - Response matchers
    // ============================================

    #[test]
    fn test_ok_matcher_accepts_ok_line() {
        let verdict = ResponseMatcher::Ok.judge(&lines(&["[ECHO] PROV UNLOCK", "OK"]), &vars());
        assert_eq!(verdict, Verdict::Accept);
    }

    #[test]
    fn test_ok_matcher_rejects_error_line() {
        let verdict = ResponseMatcher::Ok.judge(&lines(&["ERROR: bad code"]), &vars());
        assert!(matches!(verdict, Verdict::Reject(_)));
    }

    #[test]
    fn test_ok_matcher_does_not_match_inside_words() {
        let verdict = ResponseMatcher::Ok.judge(&lines(&["TOKEN accepted"]), &vars());
        assert_eq!(verdict, Verdict::Pending);
    }

    #[test]
    fn test_ok_matcher_settles_on_quiet_response() {
        let matcher = ResponseMatcher::Ok;
        assert_eq!(matcher.settle(&lines(&["Serial set"]), &vars()), Verdict::Accept);
        assert!(matches!(matcher.settle(&[], &vars()), Verdict::Reject(_)));
    }

    #[test]
    fn test_contains_matcher_renders_template() {
        let matcher = ResponseMatcher::Contains {
            value: "SN={serial_number}".to_string(),
        };
        assert_eq!(matcher.judge(&lines(&["ack SN=SN-42"]), &vars()), Verdict::Accept);
        assert_eq!(matcher.judge(&lines(&["ack SN=SN-43"]), &vars()), Verdict::Pending);
    }

    #[test]
    fn test_pattern_matcher_spans_lines() {
        let matcher = ResponseMatcher::Pattern {
            pattern: r"(?is)serial[^\n]*{serial_number}.*region[^\n]*{region_code}".to_string(),
        };
        let response = lines(&["Serial: SN-42", "Region: EU"]);
        assert_eq!(matcher.judge(&response, &vars()), Verdict::Accept);
        let wrong = lines(&["Serial: SN-42", "Region: US"]);
        assert!(matches!(matcher.settle(&wrong, &vars()), Verdict::Reject(_)));
    }

    #[test]
    fn test_all_of_needs_every_matcher() {
        let matcher = ResponseMatcher::AllOf {
            matchers: vec![
                ResponseMatcher::Contains { value: "{serial_number}".to_string() },
                ResponseMatcher::Contains { value: "{region_code}".to_string() },
            ],
        };
        assert_eq!(matcher.judge(&lines(&["SN-42"]), &vars()), Verdict::Pending);
        assert_eq!(matcher.judge(&lines(&["SN-42", "EU"]), &vars()), Verdict::Accept);
    }

    #[test]
    fn test_none_matcher_accepts_without_response() {
        assert!(!ResponseMatcher::None.expects_response());
        assert_eq!(ResponseMatcher::None.judge(&[], &vars()), Verdict::Accept);
    }

    #[test]
    fn test_unknown_matcher_kind_fails_to_parse() {
        let result: Result<ResponseMatcher, _> = toml::from_str(r#"kind = "fuzzy""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_pattern_validation_rejects_bad_regex() {
        let matcher = ResponseMatcher::Pattern {
            pattern: "(unclosed".to_string(),
        };
        let err = matcher.validate("Step 'x'", &any_known).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidPattern { .. }));
    }

    #[test]
    fn test_validation_rejects_unknown_placeholder() {
        let matcher = ResponseMatcher::Contains {
            value: "{mystery}".to_string(),
        };
        let known = |name: &str| name == "serial_number";
        let err = matcher.validate("Step 'x'", &known).unwrap_err();
        match err {
            ProfileError::UnknownVariable { variable, .. } => assert_eq!(variable, "mystery"),
            other => panic!("Expected UnknownVariable, got {other:?}"),
        }
    }

    // ============================================
    // Unit Tests - Value parsers
    // ============================================

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("[INFO] Device Serial"), "device_serial");
        assert_eq!(normalize_key("S/N"), "s_n");
        assert_eq!(normalize_key("  Firmware-Version  "), "firmware_version");
    }

    #[test]
    fn test_key_value_parser_uses_aliases() {
        let parser = ValueParser::KeyValue {
            key: "serial_number".to_string(),
            aliases: vec!["device_serial".to_string(), "sn".to_string()],
        };
        let response = lines(&["[SYS] Device Serial: SN-42", "Region: EU"]);
        assert_eq!(parser.parse(&response), Some("SN-42".to_string()));
    }

    #[test]
    fn test_key_value_parser_missing_key() {
        let parser = ValueParser::KeyValue {
            key: "region".to_string(),
            aliases: vec![],
        };
        assert_eq!(parser.parse(&lines(&["Serial: SN-42"])), None);
    }

    #[test]
    fn test_regex_parser_extracts_group() {
        let parser = ValueParser::Regex {
            pattern: r"FW v(\d+\.\d+\.\d+)".to_string(),
            group: 1,
        };
        assert_eq!(
            parser.parse(&lines(&["boot", "FW v1.2.3 (release)"])),
            Some("1.2.3".to_string())
        );
    }

    #[test]
    fn test_regex_parser_validation_checks_group() {
        let parser = ValueParser::Regex {
            pattern: r"v(\d+)".to_string(),
            group: 2,
        };
        assert!(parser.validate("fw").is_err());
    }

    // ============================================
    // Unit Tests - Expected values
    // ============================================

    #[test]
    fn test_exact_is_case_insensitive_by_default() {
        let expected = ExpectedValue::Exact {
            value: "{region_code}".to_string(),
            case_sensitive: false,
        };
        assert!(expected.check(Some("eu"), &vars()).is_ok());
        let err = expected.check(Some("US"), &vars()).unwrap_err();
        assert!(err.contains("expected 'EU'"));
    }

    #[test]
    fn test_exact_case_sensitive() {
        let expected = ExpectedValue::Exact {
            value: "EU".to_string(),
            case_sensitive: true,
        };
        assert!(expected.check(Some("eu"), &vars()).is_err());
    }

    #[test]
    fn test_range_checks_bounds() {
        let expected = ExpectedValue::Range {
            min: Some(3.0),
            max: Some(3.6),
        };
        assert!(expected.check(Some("3.3V"), &vars()).is_ok());
        assert!(expected.check(Some("5.0 V"), &vars()).is_err());
        assert!(expected.check(Some("n/a"), &vars()).is_err());
    }

    #[test]
    fn test_range_validation_rejects_inverted_bounds() {
        let expected = ExpectedValue::Range {
            min: Some(5.0),
            max: Some(1.0),
        };
        assert!(matches!(
            expected.validate("voltage", &any_known),
            Err(ProfileError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_range_validation_rejects_non_finite_bounds() {
        for (min, max) in [
            (Some(f64::NAN), Some(1.0)),
            (None, Some(f64::NAN)),
            (Some(f64::NEG_INFINITY), None),
        ] {
            let expected = ExpectedValue::Range { min, max };
            assert!(
                matches!(
                    expected.validate("voltage", &any_known),
                    Err(ProfileError::InvalidRange { .. })
                ),
                "{min:?}..{max:?} accepted"
            );
        }

        let parsed: ExpectedValue = toml::from_str("kind = \"range\"\nmin = nan\n").unwrap();
        assert!(parsed.validate("voltage", &any_known).is_err());
    }

    #[test]
    fn test_one_of() {
        let expected = ExpectedValue::OneOf {
            values: vec!["EU".to_string(), "US".to_string()],
        };
        assert!(expected.check(Some("us"), &vars()).is_ok());
        assert!(expected.check(Some("UK"), &vars()).is_err());
    }

    #[test]
    fn test_missing_value_is_mismatch() {
        let expected = ExpectedValue::Pattern {
            pattern: "^SN-".to_string(),
        };
        assert_eq!(
            expected.check(None, &vars()).unwrap_err(),
            "value not reported by device"
        );
    }
}
