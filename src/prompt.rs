//! SQL generation prompt
//!
//! The preamble is the first line of defense; the validator does not trust
//! the model to have followed it.

use crate::context::PromptContext;
use serde::{Deserialize, Serialize};

pub const NON_DATA_ANSWER: &str =
    "SELECT 'Non-data question: ask about measurable telecom information.' AS message";

const PREAMBLE: &str = "You are a highly skilled AI that converts natural language questions \
into SQL queries for a PostgreSQL telecom data warehouse.

Hard constraints:
- SELECT-only: produce exactly one read-only SELECT statement (a WITH clause is allowed). \
Never write INSERT, UPDATE, DELETE, MERGE, CREATE, DROP, ALTER, TRUNCATE, GRANT or any \
other statement that changes data or schema.
- No semicolon-chained statements: return a single statement and nothing after it.
- Use only the tables and columns listed in the schema below.
- Do not call functions that read files, sleep, or touch server settings.
- Return ONLY the SQL query, without explanations, comments or markdown.";

const RULES: &str = "Rules:
1. If the question is NOT about data, metrics, revenue, counts, averages, trends, subscribers, \
products, billing or any other measurable information in the database, do not query the \
schema. Return exactly:
   {non_data}
2. Include the necessary JOINs when the question spans several tables, following the foreign keys.
3. For totals, counts, sums, averages or comparisons, return aggregated numeric columns \
(COUNT, SUM, AVG, ...).
4. When grouping by a text column, keep every non-aggregated column in GROUP BY.
5. ORDER BY columns must appear in GROUP BY or be aggregated.
6. When computing an age from date_of_birth, cast it to DATE.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    examples: Vec<FewShotExample>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_examples(mut self, examples: Vec<FewShotExample>) -> Self {
        self.examples = examples;
        self
    }

    /// Examples from the telecom star schema (fact_billing, dim_subscriber, ...)
    pub fn telecom_examples() -> Vec<FewShotExample> {
        vec![
            FewShotExample {
                question: "What is the total revenue per product category last year?".to_string(),
                sql: "SELECT p.category, SUM(fb.total_charges) AS total_revenue \
FROM fact_billing fb \
JOIN dim_subscriber ds ON fb.subscriber_key = ds.subscriber_key \
JOIN dim_product p ON ds.product_key = p.product_key \
JOIN dim_time dt ON fb.time_key = dt.time_key \
WHERE dt.year = (SELECT MAX(year) - 1 FROM dim_time) \
GROUP BY p.category"
                    .to_string(),
            },
            FewShotExample {
                question: "How many subscribers signed up in 2024?".to_string(),
                sql: "SELECT COUNT(ds.subscriber_key) AS num_subscribers \
FROM dim_subscriber ds \
JOIN dim_time dt ON ds.time_key = dt.time_key \
WHERE dt.year = 2024"
                    .to_string(),
            },
        ]
    }

    pub fn build(&self, context: &PromptContext) -> String {
        let mut sections = vec![
            PREAMBLE.to_string(),
            format!("Database schema:\n{}", context.schema_text.trim_end()),
            RULES.replace("{non_data}", NON_DATA_ANSWER),
        ];

        if !self.examples.is_empty() {
            let examples: Vec<String> = self
                .examples
                .iter()
                .map(|ex| format!("User: \"{}\"\nSQL: {}", ex.question, ex.sql))
                .collect();
            sections.push(format!("Examples:\n{}", examples.join("\n\n")));
        }

        if let Some(feedback) = &context.feedback {
            sections.push(format!(
                "Your previous answer was rejected ({}: {}).\nRejected SQL: {}\n\
Write a different query that satisfies every constraint above.",
                feedback.reason, feedback.detail, feedback.rejected_sql
            ));
        }

        sections.push(format!("User question:\n{}\n\nSQL:", context.question));
        sections.join("\n\n")
    }
}
