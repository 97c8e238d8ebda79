use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use telesql::catalog::{CatalogHandle, SchemaCatalog};
use telesql::chart::ChartKind;
use telesql::execution::{ExecutionFailure, ExecutionLimits, Executor, RawColumn, RowSet, Warehouse};
use telesql::llm::{CompletionProvider, GenerationClient, GenerationPolicy, OfflineFallback, Provenance, ProviderError};
use telesql::pipeline::{PipelineOutcome, QueryPipeline, QuestionRequest, Stage};
use telesql::ErrorKind;

const TELECOM_SCHEMA: &str = r#"{
    "database": "telecom",
    "dialect": "postgresql",
    "tables": [
        {
            "table_name": "revenue",
            "primary_key": "id",
            "columns": [
                {"name": "id", "data_type": "INTEGER", "nullable": false},
                {"name": "region", "data_type": "TEXT"},
                {"name": "amount", "data_type": "NUMERIC"},
                {"name": "customer_id", "data_type": "INTEGER"}
            ],
            "foreign_keys": [
                {"column": "customer_id", "ref_table": "customers", "ref_column": "id"}
            ]
        },
        {
            "table_name": "customers",
            "primary_key": "id",
            "columns": [
                {"name": "id", "data_type": "INTEGER", "nullable": false},
                {"name": "name", "data_type": "TEXT"},
                {"name": "region", "data_type": "TEXT"}
            ]
        }
    ]
}"#;

/// Replays scripted completions in order, repeating the last, and keeps
/// every prompt it was sent.
struct ScriptedProvider {
    responses: Vec<String>,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: responses.iter().map(|r| r.to_string()).collect(),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: vec!["SELECT region FROM revenue".to_string()],
            delay,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, idx: usize) -> String {
        self.prompts.lock().unwrap()[idx].clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let n = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            prompts.len() - 1
        };
        tokio::time::sleep(self.delay).await;
        Ok(self.responses[n.min(self.responses.len() - 1)].clone())
    }
}

/// Decrements the checkout count however the fetch ends.
struct Checkout(Arc<AtomicUsize>);

impl Drop for Checkout {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeWarehouse {
    result: Result<RowSet, ExecutionFailure>,
    delay: Duration,
    statements: Mutex<Vec<String>>,
    checked_out: Arc<AtomicUsize>,
}

impl FakeWarehouse {
    fn returning(columns: &[(&str, &str)], rows: Vec<Vec<Value>>) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(RowSet {
                columns: columns
                    .iter()
                    .map(|(name, type_name)| RawColumn {
                        name: name.to_string(),
                        type_name: type_name.to_string(),
                    })
                    .collect(),
                rows,
            }),
            delay: Duration::ZERO,
            statements: Mutex::new(Vec::new()),
            checked_out: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn failing(failure: ExecutionFailure) -> Arc<Self> {
        Arc::new(Self {
            result: Err(failure),
            delay: Duration::ZERO,
            statements: Mutex::new(Vec::new()),
            checked_out: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            result: Ok(RowSet::default()),
            delay: Duration::from_secs(30),
            statements: Mutex::new(Vec::new()),
            checked_out: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn regional_totals() -> Arc<Self> {
        Self::returning(
            &[("region", "TEXT"), ("total_revenue", "NUMERIC")],
            vec![
                vec![json!("North"), json!(1200.5)],
                vec![json!("South"), json!(830.0)],
                vec![json!("East"), json!(410.25)],
            ],
        )
    }

    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<RowSet, ExecutionFailure> {
        self.statements.lock().unwrap().push(sql.to_string());
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        let _checkout = Checkout(self.checked_out.clone());
        tokio::time::sleep(self.delay).await;
        let mut result = self.result.clone();
        if let Ok(row_set) = &mut result {
            row_set.rows.truncate(limits.fetch_limit());
        }
        result
    }

    async fn health_check(&self) -> Result<(), ExecutionFailure> {
        Ok(())
    }
}

fn catalog() -> SchemaCatalog {
    SchemaCatalog::from_json_str(TELECOM_SCHEMA).unwrap()
}

fn policy() -> GenerationPolicy {
    GenerationPolicy {
        attempt_timeout: Duration::from_millis(50),
        max_remote_attempts: 2,
    }
}

fn limits(row_cap: usize) -> ExecutionLimits {
    ExecutionLimits {
        statement_timeout: Duration::from_secs(5),
        row_cap,
        client_grace: Duration::ZERO,
    }
}

fn pipeline_with(
    handle: Arc<CatalogHandle>,
    generator: GenerationClient,
    warehouse: Arc<FakeWarehouse>,
    row_cap: usize,
) -> QueryPipeline {
    QueryPipeline::new(handle, generator, Executor::new(warehouse, limits(row_cap)))
}

fn pipeline(provider: Arc<ScriptedProvider>, warehouse: Arc<FakeWarehouse>) -> QueryPipeline {
    pipeline_with(
        Arc::new(CatalogHandle::new(catalog())),
        GenerationClient::new(provider, policy()),
        warehouse,
        1000,
    )
}

#[tokio::test]
async fn test_total_revenue_by_region() {
    let provider = ScriptedProvider::new(&[
        "```sql\nSELECT region, SUM(amount) AS total_revenue FROM revenue GROUP BY region;\n```",
    ]);
    let warehouse = FakeWarehouse::regional_totals();
    let pipeline = pipeline(provider.clone(), warehouse.clone());

    let outcome = pipeline.ask(QuestionRequest::new("show total revenue by region")).await;
    let report = match &outcome {
        PipelineOutcome::Success(report) => report,
        PipelineOutcome::Failure(f) => panic!("unexpected failure: {:?}", f),
    };

    assert_eq!(report.provenance, Provenance::Remote);
    assert_eq!(report.recovered_from, None);
    assert_eq!(report.attempts, 1);
    assert_eq!(
        report.generated_sql,
        "SELECT region, SUM(amount) AS total_revenue FROM revenue GROUP BY region"
    );
    assert_eq!(report.result.row_count, 3);
    assert!(!report.result.truncated);
    assert_eq!(report.chart.kind, ChartKind::Pie);
    assert_eq!(warehouse.statements(), vec![report.generated_sql.clone()]);
    assert_eq!(provider.calls(), 1);
    assert!(provider.prompt(0).contains("Table: revenue"));
    assert!(provider.prompt(0).contains("show total revenue by region"));

    let body = serde_json::to_value(&outcome).unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["provenance"], "remote");
}

#[tokio::test]
async fn test_chained_delete_regenerates_once_then_fails_at_validate() {
    let chained = "SELECT * FROM customers; DELETE FROM customers";
    let provider = ScriptedProvider::new(&[chained]);
    let warehouse = FakeWarehouse::regional_totals();
    let pipeline = pipeline(provider.clone(), warehouse.clone());

    let outcome = pipeline.ask(QuestionRequest::new("list customers")).await;
    let report = match &outcome {
        PipelineOutcome::Failure(report) => report,
        PipelineOutcome::Success(s) => panic!("unexpected success: {:?}", s.generated_sql),
    };

    assert_eq!(report.stage, Stage::Validate);
    assert_eq!(report.reason, ErrorKind::MultiStatementRejected);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.generated_sql.as_deref(), Some(chained));
    assert_eq!(provider.calls(), 2);
    assert!(!provider.prompt(0).contains("previous answer was rejected"));
    assert!(provider
        .prompt(1)
        .contains("Your previous answer was rejected (MultiStatementRejected"));
    assert!(provider.prompt(1).contains(chained));
    assert!(warehouse.statements().is_empty());

    let body = serde_json::to_value(&outcome).unwrap();
    assert_eq!(body["status"], "failure");
    assert_eq!(body["stage"], "validate");
    assert_eq!(body["reason"], "MultiStatementRejected");
}

#[tokio::test]
async fn test_regeneration_recovers_from_unknown_table() {
    let provider = ScriptedProvider::new(&[
        "SELECT order_id FROM orders",
        "SELECT c.name FROM customers c",
    ]);
    let warehouse = FakeWarehouse::returning(&[("name", "TEXT")], vec![vec![json!("Ada")]]);
    let pipeline = pipeline(provider.clone(), warehouse.clone());

    let outcome = pipeline.ask(QuestionRequest::new("customer names")).await;
    match outcome {
        PipelineOutcome::Success(report) => {
            assert_eq!(report.attempts, 2);
            assert_eq!(report.generated_sql, "SELECT c.name FROM customers AS c");
        }
        PipelineOutcome::Failure(f) => panic!("unexpected failure: {:?}", f),
    }
    assert!(provider.prompt(1).contains("UnknownIdentifierRejected"));
    assert!(provider.prompt(1).contains("orders"));
    assert_eq!(warehouse.statements().len(), 1);
}

#[tokio::test]
async fn test_provider_timeout_falls_back_and_still_succeeds() {
    let provider = ScriptedProvider::slow(Duration::from_secs(30));
    let warehouse = FakeWarehouse::returning(
        &[("message", "TEXT")],
        vec![vec![json!("LLM offline - cannot generate SQL for this question right now.")]],
    );
    let pipeline = pipeline(provider.clone(), warehouse.clone());

    let start = Instant::now();
    let outcome = pipeline.ask(QuestionRequest::new("show total revenue by region")).await;
    assert!(start.elapsed() < Duration::from_secs(5));

    let report = match &outcome {
        PipelineOutcome::Success(report) => report,
        PipelineOutcome::Failure(f) => panic!("unexpected failure: {:?}", f),
    };
    assert_eq!(report.provenance, Provenance::Fallback);
    assert_eq!(report.recovered_from, Some(ErrorKind::GenerationTimeout));
    assert_eq!(report.attempts, 1);
    assert!(report.generated_sql.starts_with("SELECT 'LLM offline"));
    assert_eq!(report.chart.kind, ChartKind::Table);
    // Both remote attempts were made before falling back
    assert_eq!(provider.calls(), 2);

    let body = serde_json::to_value(&outcome).unwrap();
    assert_eq!(body["provenance"], "fallback");
    assert_eq!(body["recovered_from"], "GenerationTimeout");
}

#[tokio::test]
async fn test_offline_client_serves_fallback() {
    let warehouse = FakeWarehouse::returning(&[("message", "TEXT")], vec![vec![json!("offline")]]);
    let pipeline = pipeline_with(
        Arc::new(CatalogHandle::new(catalog())),
        GenerationClient::offline(policy()),
        warehouse.clone(),
        1000,
    );

    match pipeline.ask(QuestionRequest::new("how many customers?")).await {
        PipelineOutcome::Success(report) => {
            assert_eq!(report.provenance, Provenance::Fallback);
            assert_eq!(report.recovered_from, Some(ErrorKind::GenerationProviderError));
        }
        PipelineOutcome::Failure(f) => panic!("unexpected failure: {:?}", f),
    }
    assert!(warehouse.statements()[0].contains(&OfflineFallback::PLACEHOLDER_SQL[..20]));
}

#[tokio::test]
async fn test_blank_question_fails_at_context() {
    let provider = ScriptedProvider::new(&["SELECT 1"]);
    let pipeline = pipeline(provider.clone(), FakeWarehouse::regional_totals());

    match pipeline.ask(QuestionRequest::new("   ")).await {
        PipelineOutcome::Failure(report) => {
            assert_eq!(report.stage, Stage::Context);
            assert_eq!(report.reason, ErrorKind::EmptyQuestion);
            assert_eq!(report.attempts, 0);
        }
        PipelineOutcome::Success(_) => panic!("blank question succeeded"),
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_empty_candidate_fails_at_sanitize() {
    let provider = ScriptedProvider::new(&["```sql\n-- nothing to see\n```"]);
    let warehouse = FakeWarehouse::regional_totals();
    let pipeline = pipeline(provider.clone(), warehouse.clone());

    match pipeline.ask(QuestionRequest::new("revenue")).await {
        PipelineOutcome::Failure(report) => {
            assert_eq!(report.stage, Stage::Sanitize);
            assert_eq!(report.reason, ErrorKind::EmptyCandidate);
            assert_eq!(report.generated_sql, None);
        }
        PipelineOutcome::Success(_) => panic!("empty candidate succeeded"),
    }
    assert_eq!(provider.calls(), 2);
    assert!(warehouse.statements().is_empty());
}

#[tokio::test]
async fn test_execution_failure_is_not_retried() {
    let provider = ScriptedProvider::new(&["SELECT region FROM revenue"]);
    let warehouse = FakeWarehouse::failing(ExecutionFailure::Database(
        "division by zero".to_string(),
    ));
    let pipeline = pipeline(provider.clone(), warehouse.clone());

    match pipeline.ask(QuestionRequest::new("regions")).await {
        PipelineOutcome::Failure(report) => {
            assert_eq!(report.stage, Stage::Execute);
            assert_eq!(report.reason, ErrorKind::ExecutionError);
            assert_eq!(report.generated_sql.as_deref(), Some("SELECT region FROM revenue"));
            assert!(report.detail.contains("division by zero"));
        }
        PipelineOutcome::Success(_) => panic!("execution failure succeeded"),
    }
    assert_eq!(provider.calls(), 1);
    assert_eq!(warehouse.statements().len(), 1);
}

#[tokio::test]
async fn test_connection_failure_surfaces() {
    let provider = ScriptedProvider::new(&["SELECT region FROM revenue"]);
    let warehouse = FakeWarehouse::failing(ExecutionFailure::ConnectionUnavailable(
        "pool timed out".to_string(),
    ));
    match pipeline(provider, warehouse).ask(QuestionRequest::new("regions")).await {
        PipelineOutcome::Failure(report) => {
            assert_eq!(report.reason, ErrorKind::ConnectionUnavailable)
        }
        PipelineOutcome::Success(_) => panic!("connection failure succeeded"),
    }
}

#[tokio::test]
async fn test_row_cap_truncates_instead_of_failing() {
    let provider = ScriptedProvider::new(&["SELECT id FROM customers"]);
    let rows = (0..10).map(|i| vec![json!(i)]).collect();
    let warehouse = FakeWarehouse::returning(&[("id", "INT4")], rows);
    let pipeline = pipeline_with(
        Arc::new(CatalogHandle::new(catalog())),
        GenerationClient::new(provider, policy()),
        warehouse,
        4,
    );

    match pipeline.ask(QuestionRequest::new("customer ids")).await {
        PipelineOutcome::Success(report) => {
            assert_eq!(report.result.row_count, 4);
            assert_eq!(report.result.rows.len(), 4);
            assert!(report.result.truncated);
        }
        PipelineOutcome::Failure(f) => panic!("unexpected failure: {:?}", f),
    }
}

#[tokio::test]
async fn test_abandoned_request_releases_connection() {
    let provider = ScriptedProvider::new(&["SELECT region FROM revenue"]);
    let warehouse = FakeWarehouse::hanging();
    let pipeline = pipeline(provider, warehouse.clone());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        pipeline.ask(QuestionRequest::new("regions")),
    )
    .await;

    assert!(abandoned.is_err());
    assert_eq!(warehouse.statements().len(), 1);
    assert_eq!(warehouse.checked_out.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_catalog_refresh_applies_to_later_requests() {
    let handle = Arc::new(CatalogHandle::new(catalog()));
    let provider = ScriptedProvider::new(&["SELECT plan_name FROM plans"]);
    let warehouse = FakeWarehouse::returning(&[("plan_name", "TEXT")], vec![vec![json!("Gold")]]);
    let pipeline = pipeline_with(
        handle.clone(),
        GenerationClient::new(provider, policy()),
        warehouse,
        1000,
    );

    match pipeline.ask(QuestionRequest::new("plan names")).await {
        PipelineOutcome::Failure(report) => {
            assert_eq!(report.reason, ErrorKind::UnknownIdentifierRejected);
            assert!(report.detail.contains("plans"));
        }
        PipelineOutcome::Success(_) => panic!("unknown table accepted"),
    }

    let before = handle.snapshot();
    let mut json: Value = serde_json::from_str(TELECOM_SCHEMA).unwrap();
    json["tables"].as_array_mut().unwrap().push(json!({
        "table_name": "plans",
        "primary_key": "plan_id",
        "columns": [
            {"name": "plan_id", "data_type": "INTEGER", "nullable": false},
            {"name": "plan_name", "data_type": "TEXT"}
        ]
    }));
    handle.replace(SchemaCatalog::from_json_str(&json.to_string()).unwrap());

    // A snapshot taken earlier still sees the old catalog
    assert!(!before.contains_table("plans"));
    assert!(handle.snapshot().contains_table("plans"));

    assert!(pipeline.ask(QuestionRequest::new("plan names")).await.is_success());
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let provider = ScriptedProvider::new(&["SELECT region, SUM(amount) AS total_revenue FROM revenue GROUP BY region"]);
    let pipeline = Arc::new(pipeline(provider.clone(), FakeWarehouse::regional_totals()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .ask(QuestionRequest::new(format!("total revenue by region #{}", i)))
                    .await
            })
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    for outcome in futures::future::join_all(handles).await {
        let outcome = outcome.unwrap();
        assert!(outcome.is_success());
        ids.insert(outcome.request_id());
    }
    assert_eq!(ids.len(), 8);
    assert_eq!(provider.calls(), 8);
}

#[tokio::test]
async fn test_check_uses_current_catalog() {
    let pipeline = pipeline(ScriptedProvider::new(&["SELECT 1"]), FakeWarehouse::regional_totals());
    assert!(pipeline.check("SELECT name FROM customers;").is_accepted());
    assert!(!pipeline.check("SELECT nickname FROM customers").is_accepted());
    assert!(pipeline.context_for("revenue by region").schema_text.contains("Table: revenue"));
}
