//! Per-statement classification of provider output.
//!
//! Each statement is one of three evidential kinds. Providers may tag a
//! statement explicitly with `[claim]`, `[opinion]` or `[cite]`; untagged
//! statements that carry a URL or DOI are citations; everything else is
//! subjective.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Evidential kind of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// Can be checked and later validated or falsified.
    VerifiableClaim,
    /// Opinion or prose with no checkable content.
    Subjective,
    /// Points at an outside source.
    Citation,
}

/// One classified statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Classification.
    pub kind: StatementKind,
    /// Statement text with any tag removed.
    pub text: String,
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^\[(claim|opinion|cite)\]\s*").expect("static pattern"))
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(https?://\S+|\bdoi:\s*10\.\d{4,9}/\S+|\b10\.\d{4,9}/[^\s]+)").expect("static pattern")
    })
}

/// Split text into statements.
///
/// Lines are split on sentence terminators followed by whitespace. A tag
/// at the start of a line applies to the first statement of that line only.
fn split_statements(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut rest = line.trim();
        while !rest.is_empty() {
            let cut = rest
                .char_indices()
                .zip(rest.chars().skip(1))
                .find(|((_, c), next)| matches!(c, '.' | '!' | '?') && next.is_whitespace())
                .map(|((i, c), _)| i + c.len_utf8());
            match cut {
                Some(end) => {
                    let (head, tail) = rest.split_at(end);
                    out.push(head.trim());
                    rest = tail.trim_start();
                }
                None => {
                    out.push(rest);
                    break;
                }
            }
        }
    }
    out.retain(|s| !s.is_empty());
    out
}

/// Classify a single statement.
pub fn classify(statement: &str) -> Statement {
    let trimmed = statement.trim();
    if let Some(caps) = tag_pattern().captures(trimmed) {
        let kind = match caps[1].to_ascii_lowercase().as_str() {
            "claim" => StatementKind::VerifiableClaim,
            "cite" => StatementKind::Citation,
            _ => StatementKind::Subjective,
        };
        let text = trimmed[caps[0].len()..].trim().to_string();
        return Statement { kind, text };
    }

    let kind = if citation_pattern().is_match(trimmed) {
        StatementKind::Citation
    } else {
        StatementKind::Subjective
    };
    Statement {
        kind,
        text: trimmed.to_string(),
    }
}

/// Classify every statement in free-form provider output.
pub fn classify_statements(text: &str) -> Vec<Statement> {
    split_statements(text).into_iter().map(classify).collect()
}
