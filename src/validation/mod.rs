//! SQL Validator
//!
//! Decides whether a sanitized candidate may run. Rules apply in order and
//! the first violation wins:
//!
//! 1. single statement (token scan)
//! 2. no row-locking clause (token scan)
//! 3. read-only intent (token scan, then the parsed statement kind)
//! 4. syntax (PostgreSQL dialect parser)
//! 5. only allow-listed functions
//! 6. every relation and column resolves in its scope against the catalog
//!
//! The accepted form is re-rendered from the AST, so the text that runs is
//! exactly the text that was checked.

mod lexical;
mod schema;
mod scope;

pub use lexical::WRITE_KEYWORDS;
pub use scope::ALLOWED_FUNCTIONS;

use crate::catalog::SchemaCatalog;
use crate::error::ErrorKind;
use crate::sanitizer::SanitizedSql;
use lexical::LexicalViolation;
use scope::ConstructScan;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// A statement that passed every rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedSql {
    /// Normalized statement text, rendered from the parsed statement
    pub sql: String,
    /// Catalog tables the statement reads, in order of first reference
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub detail: String,
}

impl Rejection {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted(AcceptedSql),
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted(_))
    }
}

#[derive(Debug)]
pub struct Validator {
    dialect: PostgreSqlDialect,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    pub fn validate(&self, sql: &SanitizedSql, catalog: &SchemaCatalog) -> ValidationVerdict {
        match self.check(sql.as_str(), catalog) {
            Ok(accepted) => ValidationVerdict::Accepted(accepted),
            Err(rejection) => {
                debug!(kind = %rejection.kind, detail = %rejection.detail, "Candidate rejected");
                ValidationVerdict::Rejected(rejection)
            }
        }
    }

    fn check(&self, sql: &str, catalog: &SchemaCatalog) -> Result<AcceptedSql, Rejection> {
        if sql.trim().is_empty() {
            return Err(Rejection::new(ErrorKind::SyntaxRejected, "empty statement"));
        }

        let tokens = lexical::tokenize(&self.dialect, sql).map_err(lexical_rejection)?;
        lexical::check_single_statement(&tokens).map_err(lexical_rejection)?;
        lexical::check_no_row_locks(&tokens).map_err(lexical_rejection)?;
        lexical::check_read_only(&tokens).map_err(lexical_rejection)?;

        let mut statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| Rejection::new(ErrorKind::SyntaxRejected, e.to_string()))?;
        let statement = match statements.len() {
            1 => statements.remove(0),
            0 => return Err(Rejection::new(ErrorKind::SyntaxRejected, "no statement found")),
            n => {
                return Err(Rejection::new(
                    ErrorKind::MultiStatementRejected,
                    format!("{} statements found", n),
                ))
            }
        };

        let query = match &statement {
            Statement::Query(query) => query,
            other => {
                return Err(Rejection::new(
                    ErrorKind::WriteOperationRejected,
                    format!("{} is not a read-only query", leading_keyword(other)),
                ))
            }
        };
        let resolution = schema::resolve(query, catalog);
        if let Some(write) = resolution.writes.first() {
            return Err(Rejection::new(
                ErrorKind::WriteOperationRejected,
                format!("{} is not a read-only query", write),
            ));
        }
        if let Some(construct) = ConstructScan::scan(&statement).disallowed.first() {
            return Err(Rejection::new(
                ErrorKind::DisallowedConstructRejected,
                format!("{} is not allowed", construct),
            ));
        }
        if let Some(identifier) = resolution.unknown.first() {
            return Err(Rejection::new(
                ErrorKind::UnknownIdentifierRejected,
                format!("unknown identifier: {}", identifier),
            ));
        }

        Ok(AcceptedSql {
            sql: statement.to_string(),
            tables: resolution.tables,
        })
    }
}

fn leading_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

fn lexical_rejection(violation: LexicalViolation) -> Rejection {
    match violation {
        LexicalViolation::Tokenize(message) => Rejection::new(ErrorKind::SyntaxRejected, message),
        LexicalViolation::Separator => Rejection::new(
            ErrorKind::MultiStatementRejected,
            "statement separator ';' found",
        ),
        LexicalViolation::RowLock(clause) => Rejection::new(
            ErrorKind::DisallowedConstructRejected,
            format!("{} is not allowed", clause),
        ),
        LexicalViolation::LeadingKeyword(found) => Rejection::new(
            ErrorKind::WriteOperationRejected,
            format!("statement must start with SELECT or WITH, found {}", found),
        ),
        LexicalViolation::WriteKeyword(keyword) => Rejection::new(
            ErrorKind::WriteOperationRejected,
            format!("keyword {} is not allowed", keyword),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::Sanitizer;

    const SCHEMA: &str = r#"{
        "database": "telecom",
        "dialect": "postgresql",
        "tables": [
            {
                "table_name": "customers",
                "primary_key": "id",
                "columns": [
                    {"name": "id", "data_type": "INTEGER", "nullable": false},
                    {"name": "name", "data_type": "TEXT"},
                    {"name": "region", "data_type": "TEXT"},
                    {"name": "signup_date", "data_type": "DATE"}
                ]
            },
            {
                "table_name": "revenue",
                "primary_key": ["id"],
                "columns": [
                    {"name": "id", "data_type": "INTEGER", "nullable": false},
                    {"name": "customer_id", "data_type": "INTEGER"},
                    {"name": "region", "data_type": "TEXT"},
                    {"name": "amount", "data_type": "NUMERIC"},
                    {"name": "billing_date", "data_type": "DATE"}
                ],
                "foreign_keys": [
                    {"column": "customer_id", "ref_table": "customers", "ref_column": "id"}
                ]
            }
        ]
    }"#;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::from_json_str(SCHEMA).unwrap()
    }

    fn validate(sql: &str) -> ValidationVerdict {
        Validator::new().validate(&Sanitizer::new().sanitize(sql), &catalog())
    }

    fn rejection(sql: &str) -> Rejection {
        match validate(sql) {
            ValidationVerdict::Rejected(rejection) => rejection,
            ValidationVerdict::Accepted(accepted) => {
                panic!("expected rejection for {:?}, accepted {:?}", sql, accepted)
            }
        }
    }

    fn accepted(sql: &str) -> AcceptedSql {
        match validate(sql) {
            ValidationVerdict::Accepted(accepted) => accepted,
            ValidationVerdict::Rejected(rejection) => {
                panic!("expected acceptance for {:?}, rejected {:?}", sql, rejection)
            }
        }
    }

    #[test]
    fn test_accepts_aggregate_over_known_columns() {
        let ok = accepted("SELECT region, SUM(amount) AS total_revenue FROM revenue GROUP BY region ORDER BY total_revenue DESC");
        assert_eq!(ok.tables, vec!["revenue".to_string()]);
        assert_eq!(
            ok.sql,
            "SELECT region, SUM(amount) AS total_revenue FROM revenue GROUP BY region ORDER BY total_revenue DESC"
        );
    }

    #[test]
    fn test_accepts_joins_ctes_and_subqueries() {
        let ok = accepted(
            "WITH regional AS (SELECT r.region, SUM(r.amount) AS total FROM public.revenue r GROUP BY r.region) \
             SELECT c.name, regional.total FROM customers c \
             JOIN regional ON regional.region = c.region \
             WHERE c.id IN (SELECT customer_id FROM revenue WHERE amount > 100) \
             AND EXTRACT(YEAR FROM c.signup_date) = 2024",
        );
        assert_eq!(ok.tables, vec!["revenue".to_string(), "customers".to_string()]);

        accepted("SELECT d.region, d.cnt FROM (SELECT region, COUNT(*) AS cnt FROM customers GROUP BY region) d");
        accepted("SELECT 'LLM offline' AS message");
        accepted("(SELECT name FROM customers) UNION (SELECT region FROM revenue)");
    }

    #[test]
    fn test_empty_is_syntax_rejection() {
        assert_eq!(rejection("").kind, ErrorKind::SyntaxRejected);
        assert_eq!(rejection("   -- nothing").kind, ErrorKind::SyntaxRejected);
    }

    #[test]
    fn test_chained_statements_rejected() {
        let r = rejection("SELECT * FROM customers; DROP TABLE customers");
        assert_eq!(r.kind, ErrorKind::MultiStatementRejected);
        let r = rejection("SELECT * FROM customers; DELETE FROM customers");
        assert_eq!(r.kind, ErrorKind::MultiStatementRejected);
    }

    #[test]
    fn test_write_operations_rejected_in_any_position_and_casing() {
        for sql in [
            "DELETE FROM customers",
            "update customers set name = 'x'",
            "SELECT * FROM customers WHERE id IN (SELECT id FROM customers) OR 1=1 InSeRt",
            "WITH gone AS (DELETE FROM customers RETURNING id) SELECT id FROM gone",
            "SELECT name INTO backup FROM customers",
            "EXPLAIN ANALYZE SELECT 1",
            "Truncate customers",
        ] {
            assert_eq!(rejection(sql).kind, ErrorKind::WriteOperationRejected, "{}", sql);
        }
        assert!(rejection("SELECT 1 FROM customers dRoP").detail.contains("DROP"));
    }

    #[test]
    fn test_keywords_inside_literals_are_not_writes() {
        accepted("SELECT name FROM customers WHERE name = 'drop table; delete'");
        accepted("SELECT name AS \"update\" FROM customers");
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(rejection("SELECT * FROM").kind, ErrorKind::SyntaxRejected);
        assert_eq!(rejection("SELECT 'unterminated FROM t").kind, ErrorKind::SyntaxRejected);
        assert_eq!(rejection("SELECT (1 + FROM customers").kind, ErrorKind::SyntaxRejected);
    }

    #[test]
    fn test_disallowed_constructs() {
        let r = rejection("SELECT pg_sleep(10)");
        assert_eq!(r.kind, ErrorKind::DisallowedConstructRejected);
        assert!(r.detail.contains("pg_sleep"));

        for sql in [
            "SELECT pg_read_file('/etc/passwd')",
            "SELECT * FROM pg_ls_dir('.') AS f",
            "SELECT current_setting('data_directory')",
            "SELECT pg_advisory_lock(42)",
            "SELECT * FROM dblink('host=evil', 'SELECT 1') AS t",
            "SELECT name FROM customers FOR SHARE",
            "SELECT name FROM customers FOR UPDATE",
            "SELECT pg_ls_waldir()",
            "SELECT pg_stat_reset()",
            "SELECT pg_notify('c', 'x')",
            "SELECT pg_current_logfile()",
        ] {
            assert_eq!(rejection(sql).kind, ErrorKind::DisallowedConstructRejected, "{}", sql);
        }
    }

    #[test]
    fn test_unknown_table_named_exactly() {
        let r = rejection("SELECT * FROM orders");
        assert_eq!(r.kind, ErrorKind::UnknownIdentifierRejected);
        assert!(r.detail.ends_with("orders"));

        let r = rejection("SELECT * FROM billing.revenue");
        assert_eq!(r.kind, ErrorKind::UnknownIdentifierRejected);
        assert!(r.detail.ends_with("billing.revenue"));
    }

    #[test]
    fn test_unknown_column_named_exactly() {
        let r = rejection("SELECT c.nickname FROM customers c");
        assert_eq!(r.kind, ErrorKind::UnknownIdentifierRejected);
        assert!(r.detail.ends_with("c.nickname"));

        let r = rejection("SELECT region, total_charges FROM revenue");
        assert!(r.detail.ends_with("total_charges"));

        // amount is a revenue column, not a customers column
        let r = rejection("SELECT c.amount FROM customers c JOIN revenue r ON r.customer_id = c.id");
        assert!(r.detail.ends_with("c.amount"));

        let r = rejection("SELECT x.name FROM customers c");
        assert!(r.detail.ends_with("x.name"));
    }

    #[test]
    fn test_projection_alias_does_not_vouch_for_its_own_column() {
        for (sql, unknown) in [
            ("SELECT nickname AS nickname FROM customers", "nickname"),
            (
                "SELECT region, SUM(total_charges) AS total_charges FROM revenue GROUP BY region",
                "total_charges",
            ),
            (
                "SELECT name FROM customers WHERE ghost_col > 0 UNION SELECT 1 AS ghost_col",
                "ghost_col",
            ),
            ("SELECT amount * 2 AS doubled FROM revenue WHERE doubled > 10", "doubled"),
        ] {
            let r = rejection(sql);
            assert_eq!(r.kind, ErrorKind::UnknownIdentifierRejected, "{}", sql);
            assert_eq!(r.detail, format!("unknown identifier: {}", unknown));
        }
    }

    #[test]
    fn test_output_names_usable_where_postgres_allows_them() {
        accepted("SELECT region AS area, COUNT(*) AS n FROM customers GROUP BY area ORDER BY n DESC");
        accepted("SELECT DISTINCT ON (area) region AS area, name FROM customers ORDER BY area, name");
        accepted(
            "WITH totals AS (SELECT customer_id, SUM(amount) AS total FROM revenue GROUP BY customer_id) \
             SELECT c.name, t.total FROM customers c JOIN totals t ON t.customer_id = c.id WHERE t.total > 100",
        );
        accepted("SELECT name FROM customers UNION SELECT region FROM revenue ORDER BY name");
        accepted("SELECT s.a, s.b FROM (SELECT id, name FROM customers) AS s(a, b)");
        accepted("SELECT count FROM (SELECT COUNT(*) FROM revenue) AS x");
    }

    #[test]
    fn test_columns_resolve_in_their_own_scope() {
        // Correlated subquery sees the outer frame
        accepted(
            "SELECT c.name FROM customers c WHERE EXISTS \
             (SELECT 1 FROM revenue r WHERE r.customer_id = c.id AND r.amount > 0)",
        );
        // An inner alias is invisible outside its subquery
        let r = rejection("SELECT r.amount FROM customers WHERE id IN (SELECT customer_id FROM revenue r)");
        assert_eq!(r.detail, "unknown identifier: r.amount");
        // A table hidden behind an alias is only reachable through the alias
        let r = rejection("SELECT customers.name FROM customers c");
        assert_eq!(r.detail, "unknown identifier: customers.name");
        // Derived table columns are only its outputs
        let r = rejection("SELECT d.amount FROM (SELECT region FROM revenue) d");
        assert_eq!(r.detail, "unknown identifier: d.amount");
        let r = rejection("SELECT c.name FROM customers c JOIN revenue r USING (nickname)");
        assert_eq!(r.detail, "unknown identifier: nickname");
    }

    #[test]
    fn test_case_insensitive_resolution() {
        accepted("SELECT C.Name, REGION FROM Customers C");
    }

    #[test]
    fn test_deterministic() {
        let sql = "select region, count(*) from customers group by region";
        assert_eq!(validate(sql), validate(sql));
    }
}
