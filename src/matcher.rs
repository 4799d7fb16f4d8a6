use crate::gmail::types::CandidateMessage;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

// --- TOML deserialization types ---

/// A pattern constraint as written in the config: absent, one pattern, or a
/// list of patterns. A list is OR-combined; an empty list is no constraint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PatternSpec {
    One(String),
    Many(Vec<String>),
}

impl PatternSpec {
    fn patterns(&self) -> &[String] {
        match self {
            PatternSpec::One(p) => std::slice::from_ref(p),
            PatternSpec::Many(ps) => ps,
        }
    }
}

/// One AND-combined group of field patterns plus an attachment pattern.
/// All fields are optional; an absent field never excludes a message.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSetDef {
    #[serde(default)]
    pub from: Option<PatternSpec>,
    #[serde(default)]
    pub to: Option<PatternSpec>,
    #[serde(default)]
    pub subject: Option<PatternSpec>,
    #[serde(default)]
    pub body: Option<PatternSpec>,
    #[serde(default)]
    pub attachments: Option<PatternSpec>,
}

// --- Compiled types ---

/// A compiled per-field constraint.
#[derive(Debug)]
enum FieldMatcher {
    /// No patterns configured: every value passes.
    Unconstrained,
    /// At least one of these must match (OR).
    Any(Vec<Regex>),
    /// A pattern failed to compile. Reported once at load; never matches.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Regex,
    Wildcard,
}

#[derive(Debug)]
pub struct CompiledFilterSet {
    from: FieldMatcher,
    to: FieldMatcher,
    subject: FieldMatcher,
    body: FieldMatcher,
    attachments: FieldMatcher,
    /// Whether the attachments field was present at all (absent = take all).
    select_all_attachments: bool,
}

/// Which filter set (if any) matched. First match wins for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    pub filter_set: Option<usize>,
}

// --- Compilation ---

/// Translate a filename wildcard into an anchored regex: `*` matches any run
/// of characters, everything else is literal. Case-sensitive.
fn wildcard_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
}

fn compile_field(
    spec: &Option<PatternSpec>,
    kind: PatternKind,
    account: &str,
    field: &str,
) -> FieldMatcher {
    let patterns = match spec {
        None => return FieldMatcher::Unconstrained,
        Some(spec) => spec.patterns(),
    };
    // Empty list is equivalent to an absent field, not an error.
    if patterns.is_empty() {
        return FieldMatcher::Unconstrained;
    }

    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let result = match kind {
            PatternKind::Regex => RegexBuilder::new(pattern).case_insensitive(true).build(),
            PatternKind::Wildcard => wildcard_to_regex(pattern),
        };
        match result {
            Ok(re) => compiled.push(re),
            Err(e) => {
                log_error!(
                    "[Filter] Account {}: invalid {} pattern '{}': {}",
                    account,
                    field,
                    pattern,
                    e
                );
                return FieldMatcher::Invalid;
            }
        }
    }
    FieldMatcher::Any(compiled)
}

/// Compile one filter set. Pattern errors are reported here, once, and the
/// offending field is left permanently non-matching rather than aborting
/// the run.
pub fn compile_filter_set(def: &FilterSetDef, account: &str) -> CompiledFilterSet {
    CompiledFilterSet {
        from: compile_field(&def.from, PatternKind::Regex, account, "from"),
        to: compile_field(&def.to, PatternKind::Regex, account, "to"),
        subject: compile_field(&def.subject, PatternKind::Regex, account, "subject"),
        body: compile_field(&def.body, PatternKind::Regex, account, "body"),
        attachments: compile_field(&def.attachments, PatternKind::Wildcard, account, "attachments"),
        select_all_attachments: def.attachments.is_none(),
    }
}

pub fn compile_filter_sets(defs: &[FilterSetDef], account: &str) -> Vec<CompiledFilterSet> {
    defs.iter()
        .map(|def| compile_filter_set(def, account))
        .collect()
}

// --- Evaluation ---

fn field_matches(matcher: &FieldMatcher, value: &str) -> bool {
    match matcher {
        FieldMatcher::Unconstrained => true,
        FieldMatcher::Any(regexes) => regexes.iter().any(|re| re.is_match(value)),
        FieldMatcher::Invalid => false,
    }
}

impl CompiledFilterSet {
    /// Strict AND across the present message fields.
    pub fn matches(&self, message: &CandidateMessage) -> bool {
        field_matches(&self.from, &message.from)
            && field_matches(&self.to, &message.to)
            && field_matches(&self.subject, &message.subject)
            && field_matches(&self.body, &message.body_text)
    }

    /// Whether this set's attachment patterns select the given filename.
    pub fn selects_attachment(&self, filename: &str) -> bool {
        if self.select_all_attachments {
            return true;
        }
        field_matches(&self.attachments, filename)
    }
}

/// OR across all filter sets, short-circuiting on the first match. An empty
/// set list never matches: an account with no rules extracts nothing.
pub fn evaluate(sets: &[CompiledFilterSet], message: &CandidateMessage) -> MatchResult {
    for (idx, set) in sets.iter().enumerate() {
        if set.matches(message) {
            return MatchResult {
                matched: true,
                filter_set: Some(idx),
            };
        }
    }
    MatchResult {
        matched: false,
        filter_set: None,
    }
}

/// Indices of the attachments the matched set selects.
pub fn select_attachments(set: &CompiledFilterSet, filenames: &[&str]) -> Vec<usize> {
    filenames
        .iter()
        .enumerate()
        .filter(|(_, name)| set.selects_attachment(name))
        .map(|(idx, _)| idx)
        .collect()
}

/// Human-readable description of a filter set for verbose logging.
pub fn describe_filter_set(def: &FilterSetDef) -> String {
    fn fmt(name: &str, spec: &Option<PatternSpec>, out: &mut Vec<String>) {
        if let Some(spec) = spec {
            let patterns = spec.patterns();
            match patterns {
                [] => {}
                [one] => out.push(format!("{}: /{}/", name, one)),
                many => out.push(format!(
                    "{}: ({})",
                    name,
                    many.iter()
                        .map(|p| format!("/{}/", p))
                        .collect::<Vec<_>>()
                        .join(" OR ")
                )),
            }
        }
    }

    let mut parts = Vec::new();
    fmt("from", &def.from, &mut parts);
    fmt("to", &def.to, &mut parts);
    fmt("subject", &def.subject, &mut parts);
    fmt("body", &def.body, &mut parts);
    fmt("attachments", &def.attachments, &mut parts);
    if parts.is_empty() {
        "no constraints".to_string()
    } else {
        parts.join(" AND ")
    }
}
