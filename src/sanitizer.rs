//! Query Sanitizer
//!
//! Strips formatting noise from a generated candidate: markdown fences,
//! comments and trailing terminators. Never fails; an empty or nonsensical
//! result is for the validator to reject.
//!
//! Comments and fences are found on the PostgreSQL token stream, so
//! literals of every quoting style (including `$$...$$` and `E'...'`) pass
//! through untouched. Text the tokenizer cannot read goes through a plain
//! character scanner instead.

use serde::{Deserialize, Serialize};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, TokenWithLocation, Tokenizer, Whitespace};
use std::fmt;

const FENCE: &str = "```";
const FENCE_LANGUAGES: &[&str] = &["postgresql", "postgres", "pgsql", "psql", "sql"];

/// Candidate text after sanitization. Still untrusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedSql(String);

impl SanitizedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SanitizedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer;

impl Sanitizer {
    pub fn new() -> Self {
        Self
    }

    pub fn sanitize(&self, raw: &str) -> SanitizedSql {
        // Every pass only removes text, so this reaches a fixpoint
        let mut current = raw.to_string();
        loop {
            let next = sanitize_pass(&current);
            if next == current {
                return SanitizedSql(next);
            }
            current = next;
        }
    }
}

fn sanitize_pass(input: &str) -> String {
    let stripped = match Tokenizer::new(&PostgreSqlDialect {}, input).tokenize_with_location() {
        Ok(tokens) => strip_tokens(input, &tokens),
        Err(_) => strip_comments(&strip_fences(input)),
    };
    strip_trailing_terminators(&stripped)
}

/// Rebuild the text from the original slices of every token except
/// comments and boundary fences.
fn strip_tokens(input: &str, tokens: &[TokenWithLocation]) -> String {
    let chars: Vec<char> = input.chars().collect();
    let starts = token_offsets(&chars, tokens);
    let span = |idx: usize| -> String {
        let end = starts.get(idx + 1).copied().unwrap_or(chars.len());
        chars[starts[idx]..end].iter().collect()
    };

    let mut out = String::with_capacity(input.len());
    let mut idx = 0;
    while idx < tokens.len() {
        match &tokens[idx].token {
            Token::Whitespace(Whitespace::SingleLineComment { comment, .. }) => {
                if comment.ends_with('\n') {
                    out.push('\n');
                }
                idx += 1;
            }
            Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                out.push(' ');
                idx += 1;
            }
            _ if is_fence(tokens, idx) => {
                let after = idx + FENCE.len();
                let after = if is_language_tag(tokens.get(after)) { after + 1 } else { after };
                let start = starts[idx];
                let end = starts.get(after).copied().unwrap_or(chars.len());
                if at_line_boundary(&chars, start, end) {
                    idx = after;
                } else {
                    out.push_str(&span(idx));
                    idx += 1;
                }
            }
            _ => {
                out.push_str(&span(idx));
                idx += 1;
            }
        }
    }
    out
}

/// Char offset of each token, from its 1-based line and column.
fn token_offsets(chars: &[char], tokens: &[TokenWithLocation]) -> Vec<usize> {
    let mut line_starts = vec![0];
    line_starts.extend(
        chars
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == '\n')
            .map(|(i, _)| i + 1),
    );
    tokens
        .iter()
        .map(|t| {
            let line = line_starts
                .get((t.location.line as usize).saturating_sub(1))
                .copied()
                .unwrap_or(chars.len());
            (line + (t.location.column as usize).saturating_sub(1)).min(chars.len())
        })
        .collect()
}

fn is_fence(tokens: &[TokenWithLocation], idx: usize) -> bool {
    tokens
        .get(idx..idx + FENCE.len())
        .map_or(false, |run| run.iter().all(|t| t.token == Token::Char('`')))
}

fn is_language_tag(token: Option<&TokenWithLocation>) -> bool {
    match token.map(|t| &t.token) {
        Some(Token::Word(word)) if word.quote_style.is_none() => FENCE_LANGUAGES
            .iter()
            .any(|tag| word.value.eq_ignore_ascii_case(tag)),
        _ => false,
    }
}

/// A fence counts only when nothing but whitespace shares its line on one
/// side of it.
fn at_line_boundary(chars: &[char], start: usize, end: usize) -> bool {
    let before = chars[..start]
        .iter()
        .rev()
        .take_while(|c| **c != '\n')
        .all(|c| c.is_whitespace());
    let after = chars[end..]
        .iter()
        .take_while(|c| **c != '\n')
        .all(|c| c.is_whitespace());
    before || after
}

fn strip_fences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(FENCE) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx + FENCE.len()..];
        rest = strip_language_tag(rest);
    }
    out.push_str(rest);
    out
}

/// Drop a language tag right after a fence, e.g. the `sql` in "```sql".
fn strip_language_tag(rest: &str) -> &str {
    for tag in FENCE_LANGUAGES {
        if let (Some(head), Some(after)) = (rest.get(..tag.len()), rest.get(tag.len()..)) {
            if head.eq_ignore_ascii_case(tag) && (after.is_empty() || after.starts_with(char::is_whitespace)) {
                return after;
            }
        }
    }
    rest
}

/// Remove `--` and (nested) `/* */` comments outside quoted text. A block
/// comment becomes a single space so adjacent tokens stay apart.
fn strip_comments(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' => {
                // Copy through the closing quote; doubled quotes stay inside
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == c {
                        if chars.get(i + 1) == Some(&c) {
                            out.push(c);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                let mut depth = 0;
                while i < chars.len() {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn strip_trailing_terminators(input: &str) -> String {
    input
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}
