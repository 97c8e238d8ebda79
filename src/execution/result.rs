//! Query Result - tabular output of an executed statement

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row, column name -> value, in projection order.
pub type Row = serde_json::Map<String, Value>;

/// Coarse column type used for display and chart selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Numeric,
    Text,
    Temporal,
    Boolean,
    Unknown,
}

impl SemanticType {
    /// Map a PostgreSQL type name (as reported by the driver) to a semantic type.
    pub fn from_pg_type(type_name: &str) -> Self {
        match type_name.to_uppercase().as_str() {
            "INT2" | "INT4" | "INT8" | "FLOAT4" | "FLOAT8" | "NUMERIC" | "MONEY" | "OID" => {
                SemanticType::Numeric
            }
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UUID" => SemanticType::Text,
            "DATE" | "TIME" | "TIMETZ" | "TIMESTAMP" | "TIMESTAMPTZ" | "INTERVAL" => {
                SemanticType::Temporal
            }
            "BOOL" => SemanticType::Boolean,
            _ => SemanticType::Unknown,
        }
    }

    /// Infer from the first non-null value.
    pub fn from_values<'a>(mut values: impl Iterator<Item = &'a Value>) -> Self {
        match values.find(|v| !v.is_null()) {
            Some(Value::Number(_)) => SemanticType::Numeric,
            Some(Value::Bool(_)) => SemanticType::Boolean,
            Some(Value::String(_)) => SemanticType::Text,
            _ => SemanticType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub semantic_type: SemanticType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// More rows existed than the row cap allowed
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().filter_map(move |row| row.get(name))
    }

    pub fn columns_of(&self, semantic_type: SemanticType) -> Vec<&ColumnMeta> {
        self.columns
            .iter()
            .filter(|c| c.semantic_type == semantic_type)
            .collect()
    }
}
