//! Command and expectation templates
//!
//! Templates use `{name}` placeholders. Names start with a lowercase letter,
//! so regex quantifiers such as `{3}` or `{2,4}` are never mistaken for them.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Template variables for one session
pub type Variables = BTreeMap<String, String>;

/// Variables every session provides
pub const SESSION_VARIABLES: &[&str] = &[
    "serial_number",
    "firmware_version",
    "hardware_version",
    "region_code",
    "batch_id",
];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("static placeholder regex"))
}

/// Names of all placeholders in `template`, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute placeholders; unbound ones are left as written
pub fn render(template: &str, vars: &Variables) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Substitute placeholders with regex-escaped values
pub fn render_pattern(template: &str, vars: &Variables) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            regex::escape(vars.get(&caps[1]).map_or("", String::as_str))
        })
        .into_owned()
}
