//! Chart suggestion from the shape of a result

use crate::execution::{QueryResult, SemanticType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

const TIME_LIKE_COLUMNS: &[&str] = &["date", "usage_date", "year", "month", "billing_cycle"];

/// At most this many categories render as a pie, more as bars
const PIE_MAX_CATEGORIES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Bar,
    Pie,
    Scatter,
    Histogram,
    Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub x: Option<String>,
    pub y: Vec<String>,
    pub title: String,
    pub is_time_series: bool,
}

impl ChartSpec {
    fn table(title: &str) -> Self {
        Self {
            kind: ChartKind::Table,
            x: None,
            y: Vec::new(),
            title: title.to_string(),
            is_time_series: false,
        }
    }

    fn plot(kind: ChartKind, x: &str, y: Option<&str>, title: String) -> Self {
        Self {
            kind,
            x: Some(x.to_string()),
            y: y.map(|y| vec![y.to_string()]).unwrap_or_default(),
            title,
            is_time_series: false,
        }
    }
}

pub fn infer_chart(result: &QueryResult) -> ChartSpec {
    if result.columns.is_empty() || result.rows.is_empty() {
        return ChartSpec::table("No data returned");
    }
    if result.rows.iter().all(|row| row.values().all(Value::is_null)) {
        return ChartSpec::table("No data available for the selected query or filters");
    }

    let numeric: Vec<&str> = result
        .columns
        .iter()
        .filter(|c| is_numeric(result, &c.name, c.semantic_type))
        .map(|c| c.name.as_str())
        .collect();
    let categorical: Vec<&str> = result
        .columns
        .iter()
        .filter(|c| c.semantic_type != SemanticType::Boolean && !numeric.contains(&c.name.as_str()))
        .map(|c| c.name.as_str())
        .collect();

    let time_column = result.columns.iter().find(|c| {
        c.semantic_type == SemanticType::Temporal
            || TIME_LIKE_COLUMNS.contains(&c.name.to_lowercase().as_str())
    });
    if let (Some(time), Some(&first_metric)) = (time_column, numeric.first()) {
        let metric = numeric
            .iter()
            .copied()
            .find(|n| *n != time.name)
            .unwrap_or(first_metric);
        let mut spec = ChartSpec::plot(
            ChartKind::Line,
            &time.name,
            Some(metric),
            format!("{} over {}", metric, time.name),
        );
        spec.is_time_series = true;
        return spec;
    }

    if let (Some(&category), Some(&metric)) = (categorical.first(), numeric.first()) {
        let distinct: HashSet<String> = result
            .column_values(category)
            .map(|v| v.to_string())
            .collect();
        return if distinct.len() <= PIE_MAX_CATEGORIES {
            ChartSpec::plot(
                ChartKind::Pie,
                category,
                Some(metric),
                format!("Distribution of {} by {}", metric, category),
            )
        } else {
            ChartSpec::plot(
                ChartKind::Bar,
                category,
                Some(metric),
                format!("{} by {}", metric, category),
            )
        };
    }

    match numeric.as_slice() {
        [x, y, ..] => ChartSpec::plot(ChartKind::Scatter, x, Some(*y), format!("{} vs {}", y, x)),
        [metric] => ChartSpec::plot(
            ChartKind::Histogram,
            metric,
            None,
            format!("Distribution of {}", metric),
        ),
        [] => ChartSpec::table("Query result"),
    }
}

/// Numeric by type, or a text column whose every value reads as a number.
fn is_numeric(result: &QueryResult, column: &str, semantic_type: SemanticType) -> bool {
    match semantic_type {
        SemanticType::Numeric => true,
        SemanticType::Text | SemanticType::Unknown => {
            let mut values = result.column_values(column).filter(|v| !v.is_null()).peekable();
            values.peek().is_some()
                && values.all(|v| match v {
                    Value::Number(_) => true,
                    Value::String(s) => s.trim().parse::<f64>().is_ok(),
                    _ => false,
                })
        }
        SemanticType::Temporal | SemanticType::Boolean => false,
    }
}
