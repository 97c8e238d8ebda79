use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telesql::catalog::{CatalogHandle, SchemaCatalog};
use telesql::config::Settings;
use telesql::db;
use telesql::execution::{ExecutionFailure, ExecutionLimits, Executor, PgWarehouse, QueryResult, RowSet, Warehouse};
use telesql::llm::{GenerationClient, OpenAiCompatibleProvider};
use telesql::pipeline::{PipelineOutcome, QueryPipeline, QuestionRequest};
use telesql::prompt::PromptBuilder;
use telesql::validation::ValidationVerdict;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PREVIEW_ROWS: usize = 10;

#[derive(Parser)]
#[command(name = "telesql")]
#[command(about = "Natural-language questions over a telecom warehouse, answered with validated read-only SQL")]
struct Args {
    /// Schema metadata document (or set SCHEMA_PATH)
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// LLM API key (or set LLM_API_KEY / GROQ_API_KEY / OPENAI_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Model name (or set LLM_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Warehouse connection string (or set DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Print outcomes as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question end to end
    Ask { question: String },
    /// Sanitize and validate a SQL statement without running it
    Check { sql: String },
    /// Show the schema context that would be sent to the model
    Schema {
        #[arg(long)]
        question: Option<String>,
    },
    /// Run every question in a file, one per line; `#` lines start a category
    Batch { file: PathBuf },
}

/// Stand-in warehouse for commands that never execute SQL.
struct NoWarehouse;

#[async_trait::async_trait]
impl Warehouse for NoWarehouse {
    fn name(&self) -> &str {
        "none"
    }

    async fn fetch(&self, _sql: &str, _limits: &ExecutionLimits) -> Result<RowSet, ExecutionFailure> {
        Err(ExecutionFailure::ConnectionUnavailable("no database configured".to_string()))
    }

    async fn health_check(&self) -> Result<(), ExecutionFailure> {
        Err(ExecutionFailure::ConnectionUnavailable("no database configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telesql=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env()?;
    if let Some(schema) = args.schema.clone() {
        settings.schema_path = schema;
    }
    if let Some(key) = args.api_key.clone() {
        settings.llm.api_key = Some(key);
    }
    if let Some(model) = args.model.clone() {
        settings.llm.model = model;
    }
    if let Some(url) = args.database_url.clone() {
        settings.database.url = Some(url);
    }

    let catalog = SchemaCatalog::load(&settings.schema_path)
        .with_context(|| format!("loading schema metadata from {}", settings.schema_path.display()))?;
    info!(tables = catalog.len(), path = %settings.schema_path.display(), "Schema catalog loaded");
    let catalog = Arc::new(CatalogHandle::new(catalog));

    match args.command {
        Command::Check { sql } => {
            let pipeline = offline_pipeline(&settings, catalog);
            match pipeline.check(&sql) {
                ValidationVerdict::Accepted(accepted) => {
                    println!("ACCEPTED");
                    println!("{}", accepted.sql);
                    println!("tables: {}", accepted.tables.join(", "));
                }
                ValidationVerdict::Rejected(rejection) => {
                    println!("REJECTED {}: {}", rejection.kind, rejection.detail);
                    std::process::exit(1);
                }
            }
        }
        Command::Schema { question } => {
            let pipeline = offline_pipeline(&settings, catalog);
            let context = pipeline.context_for(question.as_deref().unwrap_or_default());
            println!(
                "-- {} table(s){}",
                context.tables.len(),
                if context.pruned { ", pruned" } else { "" }
            );
            println!("{}", context.schema_text);
        }
        Command::Ask { question } => {
            let pipeline = live_pipeline(&settings, catalog).await?;
            let outcome = pipeline.ask(QuestionRequest::new(question)).await;
            print_outcome(&outcome, args.json)?;
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Command::Batch { file } => {
            let pipeline = live_pipeline(&settings, catalog).await?;
            run_batch(&pipeline, &file, args.json).await?;
        }
    }

    Ok(())
}

fn generation_client(settings: &Settings) -> Result<GenerationClient> {
    let policy = settings.generation_policy();
    match &settings.llm.api_key {
        Some(key) => {
            let provider = OpenAiCompatibleProvider::new(
                key.clone(),
                settings.llm.model.clone(),
                settings.llm.base_url.clone(),
                settings.llm.timeout,
            )?;
            Ok(GenerationClient::new(Arc::new(provider), policy))
        }
        None => {
            warn!("No LLM API key configured; questions will be answered by the offline fallback");
            Ok(GenerationClient::offline(policy))
        }
    }
}

fn offline_pipeline(settings: &Settings, catalog: Arc<CatalogHandle>) -> QueryPipeline {
    let executor = Executor::new(Arc::new(NoWarehouse), settings.execution_limits());
    QueryPipeline::new(catalog, GenerationClient::offline(settings.generation_policy()), executor)
        .with_context_budget(settings.context_char_budget)
}

async fn live_pipeline(settings: &Settings, catalog: Arc<CatalogHandle>) -> Result<QueryPipeline> {
    let pool = db::init_pool(&settings.database).await?;
    let executor = Executor::new(Arc::new(PgWarehouse::new(pool)), settings.execution_limits());
    Ok(QueryPipeline::new(catalog, generation_client(settings)?, executor)
        .with_context_budget(settings.context_char_budget)
        .with_prompt_builder(PromptBuilder::new().with_examples(PromptBuilder::telecom_examples())))
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    match outcome {
        PipelineOutcome::Success(report) => {
            println!("SQL ({:?}, attempt {}):", report.provenance, report.attempts);
            println!("  {}", report.generated_sql);
            if let Some(cause) = report.recovered_from {
                println!("  recovered from {}", cause);
            }
            print_table(&report.result);
            println!("Chart: {:?} - {}", report.chart.kind, report.chart.title);
        }
        PipelineOutcome::Failure(report) => {
            println!("FAILED at {:?}: {} ({})", report.stage, report.reason, report.detail);
            if let Some(sql) = &report.generated_sql {
                println!("  {}", sql);
            }
        }
    }
    Ok(())
}

fn print_table(result: &QueryResult) {
    let header: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    println!("{}", header.join(" | "));
    for row in result.rows.iter().take(PREVIEW_ROWS) {
        let cells: Vec<String> = row
            .values()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
    println!(
        "({} row(s){}, {} ms)",
        result.row_count,
        if result.truncated { ", truncated" } else { "" },
        result.elapsed_ms
    );
}

async fn run_batch(pipeline: &QueryPipeline, file: &Path, json: bool) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("reading question file {}", file.display()))?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(header) = line.strip_prefix('#') {
            println!("\n=== {} ===", header.trim());
            continue;
        }

        println!("\nQ: {}", line);
        let outcome = pipeline.ask(QuestionRequest::new(line)).await;
        print_outcome(&outcome, json)?;
        let key = match &outcome {
            PipelineOutcome::Success(_) => "success".to_string(),
            PipelineOutcome::Failure(f) => format!("failure/{:?}/{}", f.stage, f.reason),
        };
        *by_status.entry(key).or_default() += 1;
    }

    println!("\n=== Summary ===");
    for (status, count) in &by_status {
        println!("{:>4}  {}", count, status);
    }
    Ok(())
}
