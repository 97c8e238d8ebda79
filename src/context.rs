//! Prompt Context
//!
//! Picks the slice of the schema catalog a question needs and renders it
//! within a character budget.

use crate::catalog::{SchemaCatalog, TableDescriptor};
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "de", "do", "each", "for", "from", "give",
    "how", "in", "is", "it", "list", "many", "me", "much", "of", "on", "or", "per", "show", "that",
    "the", "their", "there", "to", "top", "wa", "what", "when", "where", "which", "who", "with",
];

/// The rejection that triggered a regeneration round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionFeedback {
    pub rejected_sql: String,
    pub reason: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    pub question: String,
    pub tables: Vec<TableDescriptor>,
    pub schema_text: String,
    /// True when some catalog tables were left out
    pub pruned: bool,
    pub feedback: Option<RejectionFeedback>,
}

impl PromptContext {
    pub fn with_feedback(mut self, feedback: RejectionFeedback) -> Self {
        self.feedback = Some(feedback);
        self
    }
}

pub struct ContextBuilder {
    char_budget: usize,
}

impl ContextBuilder {
    pub fn new(char_budget: usize) -> Self {
        Self { char_budget }
    }

    pub fn build(&self, catalog: &SchemaCatalog, question: &str) -> PromptContext {
        let full_text = render_tables(catalog.tables());
        if full_text.len() <= self.char_budget {
            return PromptContext {
                question: question.to_string(),
                tables: catalog.tables().cloned().collect(),
                schema_text: full_text,
                pruned: false,
                feedback: None,
            };
        }

        let words = question_words(question);
        let mut scored: Vec<(usize, &TableDescriptor)> = catalog
            .tables()
            .map(|t| (score_table(t, &words), t))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable sort keeps catalog (name) order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut order: Vec<&TableDescriptor> = scored.iter().map(|(_, t)| *t).collect();
        if order.is_empty() {
            order = catalog.tables().collect();
        } else {
            // Join partners of the matched tables, in the order they are reached
            let mut neighbours = Vec::new();
            for table in &order {
                for (_, fk) in table.foreign_keys() {
                    if let Some(target) = catalog.table(&fk.table) {
                        neighbours.push(target);
                    }
                }
            }
            order.extend(neighbours);
        }

        let mut seen = HashSet::new();
        let mut selected: Vec<TableDescriptor> = Vec::new();
        let mut used = 0;
        for table in order {
            if !seen.insert(table.name.to_lowercase()) {
                continue;
            }
            let block_len = render_table(table).len() + 1;
            if !selected.is_empty() && used + block_len > self.char_budget {
                continue;
            }
            used += block_len;
            selected.push(table.clone());
        }

        let schema_text = render_tables(selected.iter());
        PromptContext {
            question: question.to_string(),
            pruned: selected.len() < catalog.len(),
            tables: selected,
            schema_text,
            feedback: None,
        }
    }
}

fn question_words(question: &str) -> BTreeSet<String> {
    question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(normalize_word)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn normalize_word(word: &str) -> String {
    let lower = word.to_lowercase();
    match lower.strip_suffix('s') {
        Some(stem) if stem.len() > 2 => stem.to_string(),
        _ => lower,
    }
}

fn name_parts(name: &str) -> impl Iterator<Item = String> + '_ {
    name.split('_').filter(|p| !p.is_empty()).map(normalize_word)
}

fn score_table(table: &TableDescriptor, words: &BTreeSet<String>) -> usize {
    let table_hits = name_parts(&table.name).filter(|p| words.contains(p)).count();
    let column_hits: usize = table
        .columns
        .iter()
        .map(|c| name_parts(&c.name).filter(|p| words.contains(p)).count())
        .sum();
    table_hits * 3 + column_hits
}

/// Render one table with its columns and key relationships.
pub fn render_table(table: &TableDescriptor) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{} ({})", c.name, c.data_type))
        .collect();
    let pk = table.primary_key();
    let fks: Vec<String> = table
        .foreign_keys()
        .iter()
        .map(|(col, r)| format!("{} -> {}.{}", col, r.table, r.column))
        .collect();

    format!(
        "Table: {}\nColumns: {}\nPrimary Key: {}\nForeign Keys: {}\n",
        table.name,
        columns.join(", "),
        if pk.is_empty() { "None".to_string() } else { pk.join(", ") },
        if fks.is_empty() { "None".to_string() } else { fks.join(", ") },
    )
}

fn render_tables<'a>(tables: impl Iterator<Item = &'a TableDescriptor>) -> String {
    tables.map(render_table).collect::<Vec<_>>().join("\n")
}
