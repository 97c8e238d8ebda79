//! Token-level rules
//!
//! These run on the token stream before parsing so that separators and
//! write keywords are caught wherever they appear. String contents are
//! literals and quoted words are identifiers, so neither can smuggle a
//! keyword past the scan.

use sqlparser::dialect::Dialect;
use sqlparser::tokenizer::{Token, Tokenizer, Word};

/// Keywords that modify data or schema, or escape the read-only session.
pub const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "CREATE", "DROP", "ALTER", "TRUNCATE",
    "GRANT", "REVOKE", "COPY", "CALL", "EXEC", "EXECUTE", "VACUUM", "REINDEX", "SET", "INTO",
];

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexicalViolation {
    Tokenize(String),
    Separator,
    RowLock(String),
    LeadingKeyword(String),
    WriteKeyword(String),
}

pub fn tokenize(dialect: &dyn Dialect, sql: &str) -> Result<Vec<Token>, LexicalViolation> {
    Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| LexicalViolation::Tokenize(e.to_string()))
}

fn bare_word(token: &Token) -> Option<&Word> {
    match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word),
        _ => None,
    }
}

/// Any statement separator left after sanitization means a second statement.
pub fn check_single_statement(tokens: &[Token]) -> Result<(), LexicalViolation> {
    if tokens.iter().any(|t| matches!(t, Token::SemiColon)) {
        return Err(LexicalViolation::Separator);
    }
    Ok(())
}

/// Row-locking clauses: `FOR UPDATE`, `FOR NO KEY UPDATE`, `FOR SHARE`,
/// `FOR KEY SHARE`.
pub fn check_no_row_locks(tokens: &[Token]) -> Result<(), LexicalViolation> {
    let words: Vec<Option<String>> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .map(|t| bare_word(t).map(|w| w.value.to_uppercase()))
        .collect();

    for (idx, word) in words.iter().enumerate() {
        if word.as_deref() != Some("FOR") {
            continue;
        }
        let next: Vec<&str> = words[idx + 1..]
            .iter()
            .take(3)
            .map(|w| w.as_deref().unwrap_or_default())
            .collect();
        let clause = match next.as_slice() {
            ["UPDATE", ..] => "FOR UPDATE",
            ["SHARE", ..] => "FOR SHARE",
            ["NO", "KEY", "UPDATE"] => "FOR NO KEY UPDATE",
            ["KEY", "SHARE", ..] => "FOR KEY SHARE",
            _ => continue,
        };
        return Err(LexicalViolation::RowLock(clause.to_string()));
    }
    Ok(())
}

/// Leading keyword must be a read; no write keyword may appear anywhere.
pub fn check_read_only(tokens: &[Token]) -> Result<(), LexicalViolation> {
    let leading = tokens
        .iter()
        .find(|t| !matches!(t, Token::Whitespace(_) | Token::LParen));

    match leading.and_then(bare_word) {
        Some(word) if READ_KEYWORDS.contains(&word.value.to_uppercase().as_str()) => {}
        Some(word) => return Err(LexicalViolation::LeadingKeyword(word.value.to_uppercase())),
        None => {
            let found = leading.map(|t| t.to_string()).unwrap_or_default();
            return Err(LexicalViolation::LeadingKeyword(found));
        }
    }

    for word in tokens.iter().filter_map(bare_word) {
        let upper = word.value.to_uppercase();
        if WRITE_KEYWORDS.contains(&upper.as_str()) {
            return Err(LexicalViolation::WriteKeyword(upper));
        }
    }
    Ok(())
}
