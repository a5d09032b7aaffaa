//! HTTP expect rule evaluation (spec.md §4.4).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::check::CheckStatus;
use crate::probers::{end_of_headers, ProbeOutcome};

/// Which part of the response an expect rule examines, and whether the
/// pattern is a literal substring or a regular expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpectKind {
    /// Status-string: compare the 3-digit status code region verbatim.
    Sts,
    /// Status-regex: match the 3-digit status code region against a regex.
    RSts,
    /// Body-string: look for a literal substring in the response body.
    Str,
    /// Body-regex: match the response body against a regex.
    RStr,
}

/// A compiled match pattern: either a literal byte string or a regex.
#[derive(Debug, Clone)]
pub enum ExpectPattern {
    /// A literal substring to search for.
    Literal(Vec<u8>),
    /// A compiled regular expression.
    Regex(regex::bytes::Regex),
}

impl ExpectPattern {
    fn matches(&self, haystack: &[u8]) -> bool {
        match self {
            ExpectPattern::Literal(needle) => {
                !needle.is_empty() && contains_subslice(haystack, needle)
            }
            ExpectPattern::Regex(re) => re.is_match(haystack),
        }
    }

    /// A short human-readable rendering of the pattern, for error messages.
    pub fn display(&self) -> String {
        match self {
            ExpectPattern::Literal(s) => String::from_utf8_lossy(s).into_owned(),
            ExpectPattern::Regex(_) => "(regex)".to_string(),
        }
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// An HTTP expect rule: examine either the status or the body, as a literal
/// or a regex, optionally inverted.
#[derive(Debug, Clone)]
pub struct ExpectRule {
    /// Which region/match-mode this rule uses.
    pub kind: ExpectKind,
    /// The compiled pattern.
    pub pattern: ExpectPattern,
    /// Invert the match verdict.
    pub inverse: bool,
}

#[derive(Deserialize)]
struct RawExpectRule {
    kind: ExpectKind,
    pattern: String,
    #[serde(default)]
    inverse: bool,
}

impl<'de> Deserialize<'de> for ExpectRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawExpectRule::deserialize(deserializer)?;
        let pattern = match raw.kind {
            ExpectKind::Sts | ExpectKind::Str => ExpectPattern::Literal(raw.pattern.into_bytes()),
            ExpectKind::RSts | ExpectKind::RStr => {
                let re = regex::bytes::Regex::new(&raw.pattern).map_err(D::Error::custom)?;
                ExpectPattern::Regex(re)
            }
        };
        Ok(ExpectRule {
            kind: raw.kind,
            pattern,
            inverse: raw.inverse,
        })
    }
}

/// Evaluate an expect rule against the current HTTP response.
///
/// `status_region` is the 3-byte status code slice (e.g. `b"200"`).
/// `bi` is the full ingress buffer accumulated so far. `done` signals that no
/// more bytes will arrive (connection closed or buffer full).
pub fn evaluate(rule: &ExpectRule, status_region: &[u8], bi: &[u8], done: bool) -> ProbeOutcome {
    match rule.kind {
        ExpectKind::Sts | ExpectKind::RSts => {
            let matched = rule.pattern.matches(status_region) != rule.inverse;
            if matched {
                ProbeOutcome::done(CheckStatus::L7Ok, "")
            } else {
                let code = String::from_utf8_lossy(status_region);
                ProbeOutcome::done(
                    CheckStatus::L7Sts,
                    format!("HTTP status check returned code <{code}>"),
                )
            }
        }
        ExpectKind::Str | ExpectKind::RStr => {
            let Some(body_start) = end_of_headers(bi) else {
                return if done {
                    ProbeOutcome::done(CheckStatus::L7Rsp, "empty response body")
                } else {
                    ProbeOutcome::Pending
                };
            };
            let body = &bi[body_start..];
            if body.first() == Some(&0) {
                return ProbeOutcome::done(CheckStatus::L7Rsp, "empty response body");
            }
            let matched = rule.pattern.matches(body);
            match (matched, rule.inverse) {
                (true, false) => ProbeOutcome::done(CheckStatus::L7Ok, ""),
                (true, true) => ProbeOutcome::done(CheckStatus::L7Rsp, "matched unwanted content"),
                (false, false) => {
                    if done {
                        ProbeOutcome::done(CheckStatus::L7Rsp, "did not match")
                    } else {
                        ProbeOutcome::Pending
                    }
                }
                (false, true) => ProbeOutcome::done(CheckStatus::L7Ok, "did not match unwanted content"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(kind: ExpectKind, s: &str, inverse: bool) -> ExpectRule {
        ExpectRule {
            kind,
            pattern: ExpectPattern::Literal(s.as_bytes().to_vec()),
            inverse,
        }
    }

    #[test]
    fn status_literal_match() {
        let rule = literal(ExpectKind::Sts, "200", false);
        let outcome = evaluate(&rule, b"200", b"", false);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Ok, .. }));
    }

    #[test]
    fn status_literal_mismatch() {
        let rule = literal(ExpectKind::Sts, "200", false);
        let outcome = evaluate(&rule, b"503", b"", false);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Sts, .. }));
    }

    #[test]
    fn body_match_waits_for_more_when_not_done() {
        let rule = literal(ExpectKind::Str, "OK", false);
        let outcome = evaluate(&rule, b"200", b"HTTP/1.1 200 OK\r\n", false);
        assert_eq!(outcome, ProbeOutcome::Pending);
    }

    #[test]
    fn body_match_inverted_fails_on_match() {
        let rule = literal(ExpectKind::Str, "maintenance", true);
        let bi = b"HTTP/1.1 200 OK\r\n\r\nsite under maintenance";
        let outcome = evaluate(&rule, b"200", bi, true);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Rsp, .. }));
    }

    #[test]
    fn body_no_match_inverted_passes() {
        let rule = literal(ExpectKind::Str, "maintenance", true);
        let bi = b"HTTP/1.1 200 OK\r\n\r\nall good";
        let outcome = evaluate(&rule, b"200", bi, true);
        assert!(matches!(outcome, ProbeOutcome::Done { status: CheckStatus::L7Ok, .. }));
    }
}
