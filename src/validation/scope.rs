//! Statement-wide construct scan
//!
//! Visits every expression and table factor of a statement, at any depth,
//! and records calls to functions outside the allow-list. Name resolution
//! is scoped and lives in `schema`.

use sqlparser::ast::{Expr, ObjectName, Statement, TableFactor, Visit, Visitor};
use std::ops::ControlFlow;

/// Functions a generated query may call. Anything else is refused, so
/// file, session, replication and notification functions never run.
pub const ALLOWED_FUNCTIONS: &[&str] = &[
    // aggregates
    "count", "sum", "avg", "min", "max", "stddev", "stddev_pop", "stddev_samp", "variance",
    "var_pop", "var_samp", "string_agg", "array_agg", "bool_and", "bool_or", "every",
    "percentile_cont", "percentile_disc", "mode", "corr", "covar_pop", "covar_samp",
    "json_agg", "jsonb_agg", "json_object_agg", "jsonb_object_agg",
    // window
    "row_number", "rank", "dense_rank", "percent_rank", "cume_dist", "ntile", "lag", "lead",
    "first_value", "last_value", "nth_value",
    // conditional
    "coalesce", "nullif", "greatest", "least",
    // math
    "abs", "ceil", "ceiling", "floor", "round", "trunc", "sign", "sqrt", "cbrt", "power", "pow",
    "exp", "ln", "log", "log10", "mod", "div", "pi", "degrees", "radians", "width_bucket",
    // string
    "length", "char_length", "character_length", "octet_length", "lower", "upper", "initcap",
    "trim", "btrim", "ltrim", "rtrim", "lpad", "rpad", "substr", "substring", "left", "right",
    "replace", "concat", "concat_ws", "position", "strpos", "split_part", "reverse", "repeat",
    "format", "starts_with", "regexp_replace", "regexp_match", "regexp_matches",
    "regexp_split_to_array", "md5",
    // date and time
    "now", "current_date", "current_time", "current_timestamp", "localtime", "localtimestamp",
    "date_trunc", "date_part", "date_bin", "age", "make_date", "make_time", "make_timestamp",
    "make_interval", "justify_days", "justify_hours", "justify_interval", "date", "to_char",
    "to_date", "to_timestamp", "to_number",
    // arrays and json
    "array_length", "cardinality", "array_to_string", "string_to_array", "unnest", "to_json",
    "to_jsonb", "json_build_object", "jsonb_build_object", "json_build_array",
    "jsonb_build_array", "json_array_length", "jsonb_array_length", "json_extract_path_text",
    "jsonb_extract_path_text",
];

/// The only schema a function may be qualified with
const FUNCTION_SCHEMA: &str = "pg_catalog";

#[derive(Debug, Default)]
pub struct ConstructScan {
    pub disallowed: Vec<String>,
}

impl ConstructScan {
    pub fn scan(statement: &Statement) -> Self {
        let mut scan = ConstructScan::default();
        let _ = statement.visit(&mut scan);
        scan
    }

    fn note_function(&mut self, name: &ObjectName) {
        if !is_allowed_function(name) {
            self.disallowed.push(format!("function {}", name));
        }
    }
}

impl Visitor for ConstructScan {
    type Break = ();

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            // Set-returning function in FROM, e.g. pg_ls_dir('.')
            TableFactor::Table {
                name,
                args: Some(_),
                ..
            }
            | TableFactor::Function { name, .. } => self.note_function(name),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            self.note_function(&function.name);
        }
        ControlFlow::Continue(())
    }
}

pub fn is_allowed_function(name: &ObjectName) -> bool {
    let function = match name.0.as_slice() {
        [function] => function,
        [schema, function] if schema.value.eq_ignore_ascii_case(FUNCTION_SCHEMA) => function,
        _ => return false,
    };
    ALLOWED_FUNCTIONS.contains(&function.value.to_lowercase().as_str())
}
