//! Label and field selector parsing plus local matching.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::core::DynamicObject;
use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid label selector {selector:?}: {reason}")]
    Label { selector: String, reason: String },
    #[error("invalid field selector {selector:?}: {reason}")]
    Field { selector: String, reason: String },
}

static LABEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$")
        .expect("label key pattern")
});
static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("label value pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, SmallVec<[String; 4]>),
    NotIn(String, SmallVec<[String; 4]>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::NotEq(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Eq(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEq(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }
    pub fn requirements(&self) -> &[Requirement] { &self.reqs }
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool { self.reqs.iter().all(|r| r.matches(labels)) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.reqs.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Split on commas that are not inside a parenthesised value set.
fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut start) = (0i32, 0usize);
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => { out.push(&s[start..i]); start = i + 1; }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| SelectorError::Label { selector: s.to_string(), reason: reason.to_string() };
        let key = |k: &str| -> Result<String, SelectorError> {
            let k = k.trim();
            if LABEL_KEY.is_match(k) { Ok(k.to_string()) } else { Err(fail(&format!("bad key {:?}", k))) }
        };
        let value = |v: &str| -> Result<String, SelectorError> {
            let v = v.trim();
            if LABEL_VALUE.is_match(v) { Ok(v.to_string()) } else { Err(fail(&format!("bad value {:?}", v))) }
        };
        let set = |rest: &str| -> Result<SmallVec<[String; 4]>, SelectorError> {
            let rest = rest.trim();
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| fail("set values must be parenthesised"))?;
            inner.split(',').map(|v| value(v)).collect()
        };

        let mut reqs = Vec::new();
        if s.trim().is_empty() {
            return Ok(Self { reqs });
        }
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() {
                return Err(fail("empty requirement"));
            }
            let req = if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(key(k)?)
            } else if let Some((k, rest)) = term.split_once(" notin ") {
                Requirement::NotIn(key(k)?, set(rest)?)
            } else if let Some((k, rest)) = term.split_once(" in ") {
                Requirement::In(key(k)?, set(rest)?)
            } else if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEq(key(k)?, value(v)?)
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Eq(key(k)?, value(v)?)
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Eq(key(k)?, value(v)?)
            } else {
                Requirement::Exists(key(term)?)
            };
            reqs.push(req);
        }
        Ok(Self { reqs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTerm {
    pub field: String,
    pub value: String,
    pub negated: bool,
}

/// Field selector. Only `metadata.name` and `metadata.namespace` are
/// evaluated locally; other fields are left to the API server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    terms: Vec<FieldTerm>,
}

impl FieldSelector {
    pub fn is_empty(&self) -> bool { self.terms.is_empty() }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        self.terms.iter().all(|t| {
            let actual = match t.field.as_str() {
                "metadata.name" => obj.metadata.name.as_deref().unwrap_or(""),
                "metadata.namespace" => obj.metadata.namespace.as_deref().unwrap_or(""),
                _ => return true,
            };
            (actual == t.value) != t.negated
        })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| format!("{}{}{}", t.field, if t.negated { "!=" } else { "=" }, t.value))
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: String| SelectorError::Field { selector: s.to_string(), reason };
        let mut terms = Vec::new();
        if s.trim().is_empty() {
            return Ok(Self { terms });
        }
        for term in s.split(',') {
            let term = term.trim();
            let (field, value, negated) = if let Some((f, v)) = term.split_once("!=") {
                (f, v, true)
            } else if let Some((f, v)) = term.split_once("==") {
                (f, v, false)
            } else if let Some((f, v)) = term.split_once('=') {
                (f, v, false)
            } else {
                return Err(fail(format!("{:?} has no operator", term)));
            };
            let field = field.trim();
            if field.is_empty() || field.contains(char::is_whitespace) {
                return Err(fail(format!("bad field name {:?}", field)));
            }
            terms.push(FieldTerm { field: field.to_string(), value: value.trim().to_string(), negated });
        }
        Ok(Self { terms })
    }
}
