//! Question pipeline
//!
//! context -> prompt -> generate -> sanitize -> validate -> execute
//!
//! The only branch: a candidate that sanitizes to nothing or fails
//! validation earns exactly one regeneration with the rejection fed back
//! into the prompt. A second failure ends the request.

use crate::catalog::CatalogHandle;
use crate::chart::{infer_chart, ChartSpec};
use crate::context::{ContextBuilder, PromptContext, RejectionFeedback};
use crate::error::ErrorKind;
use crate::execution::{Executor, QueryResult};
use crate::llm::{GenerationClient, Provenance};
use crate::prompt::PromptBuilder;
use crate::sanitizer::Sanitizer;
use crate::validation::{AcceptedSql, Rejection, ValidationVerdict, Validator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Generation round-trips per request: the first plus one regeneration
const MAX_ATTEMPTS: u8 = 2;

pub const DEFAULT_CONTEXT_CHAR_BUDGET: usize = 12_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
    pub request_id: Uuid,
    pub received_at: DateTime<Utc>,
}

impl QuestionRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            request_id: Uuid::new_v4(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Context,
    Generation,
    Sanitize,
    Validate,
    Execute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessReport {
    pub request_id: Uuid,
    pub result: QueryResult,
    /// The normalized statement that ran
    pub generated_sql: String,
    pub provenance: Provenance,
    pub recovered_from: Option<ErrorKind>,
    pub attempts: u8,
    pub chart: ChartSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub request_id: Uuid,
    pub stage: Stage,
    pub reason: ErrorKind,
    pub detail: String,
    pub generated_sql: Option<String>,
    pub attempts: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PipelineOutcome {
    Success(SuccessReport),
    Failure(FailureReport),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success(_))
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            PipelineOutcome::Success(s) => s.request_id,
            PipelineOutcome::Failure(f) => f.request_id,
        }
    }
}

/// An accepted statement together with how it was produced.
struct Approved {
    accepted: AcceptedSql,
    provenance: Provenance,
    recovered_from: Option<ErrorKind>,
    attempts: u8,
}

pub struct QueryPipeline {
    catalog: Arc<CatalogHandle>,
    context_builder: ContextBuilder,
    prompt_builder: PromptBuilder,
    generator: GenerationClient,
    sanitizer: Sanitizer,
    validator: Validator,
    executor: Executor,
}

impl QueryPipeline {
    pub fn new(catalog: Arc<CatalogHandle>, generator: GenerationClient, executor: Executor) -> Self {
        Self {
            catalog,
            context_builder: ContextBuilder::new(DEFAULT_CONTEXT_CHAR_BUDGET),
            prompt_builder: PromptBuilder::new(),
            generator,
            sanitizer: Sanitizer::new(),
            validator: Validator::new(),
            executor,
        }
    }

    pub fn with_context_budget(mut self, char_budget: usize) -> Self {
        self.context_builder = ContextBuilder::new(char_budget);
        self
    }

    pub fn with_prompt_builder(mut self, prompt_builder: PromptBuilder) -> Self {
        self.prompt_builder = prompt_builder;
        self
    }

    pub fn catalog(&self) -> &Arc<CatalogHandle> {
        &self.catalog
    }

    /// The context a question would be answered with, against the current catalog.
    pub fn context_for(&self, question: &str) -> PromptContext {
        self.context_builder.build(&self.catalog.snapshot(), question)
    }

    /// Sanitize and validate a statement without generating or running it.
    pub fn check(&self, sql: &str) -> ValidationVerdict {
        let sanitized = self.sanitizer.sanitize(sql);
        self.validator.validate(&sanitized, &self.catalog.snapshot())
    }

    pub async fn ask(&self, request: QuestionRequest) -> PipelineOutcome {
        let span = info_span!("ask", request_id = %request.request_id);
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: QuestionRequest) -> PipelineOutcome {
        let request_id = request.request_id;
        let fail = |stage: Stage,
                    reason: ErrorKind,
                    detail: String,
                    generated_sql: Option<String>,
                    attempts: u8| {
            warn!(?stage, %reason, %detail, "Request failed");
            PipelineOutcome::Failure(FailureReport {
                request_id,
                stage,
                reason,
                detail,
                generated_sql,
                attempts,
            })
        };

        let question = request.question.trim();
        if question.is_empty() {
            return fail(
                Stage::Context,
                ErrorKind::EmptyQuestion,
                "question is blank".to_string(),
                None,
                0,
            );
        }

        // Snapshot for the whole request; a refresh only affects later requests
        let catalog = self.catalog.snapshot();
        let mut context = self.context_builder.build(&catalog, question);
        info!(tables = context.tables.len(), pruned = context.pruned, "Built prompt context");

        let mut attempts = 0;
        let approved = loop {
            attempts += 1;
            let prompt = self.prompt_builder.build(&context);
            debug!(attempt = attempts, prompt = %prompt, "Prompt built");

            let outcome = self.generator.generate(&prompt).await;
            let recovered_from = outcome.recovered_from();
            let candidate = outcome.into_candidate();
            debug!(attempt = attempts, provenance = ?candidate.provenance, raw = %candidate.text, "Candidate generated");

            let sanitized = self.sanitizer.sanitize(&candidate.text);
            let (stage, rejection) = if sanitized.is_empty() {
                (
                    Stage::Sanitize,
                    Rejection {
                        kind: ErrorKind::EmptyCandidate,
                        detail: "candidate contains no SQL".to_string(),
                    },
                )
            } else {
                match self.validator.validate(&sanitized, &catalog) {
                    ValidationVerdict::Accepted(accepted) => {
                        break Approved {
                            accepted,
                            provenance: candidate.provenance,
                            recovered_from,
                            attempts,
                        };
                    }
                    ValidationVerdict::Rejected(rejection) => (Stage::Validate, rejection),
                }
            };

            let rejected_sql = sanitized.into_inner();
            if attempts >= MAX_ATTEMPTS {
                let shown = (!rejected_sql.is_empty()).then_some(rejected_sql);
                return fail(stage, rejection.kind, rejection.detail, shown, attempts);
            }

            warn!(
                attempt = attempts,
                kind = %rejection.kind,
                detail = %rejection.detail,
                "Candidate rejected, regenerating"
            );
            context = context.with_feedback(RejectionFeedback {
                rejected_sql: if rejected_sql.is_empty() { candidate.text } else { rejected_sql },
                reason: rejection.kind,
                detail: rejection.detail,
            });
        };

        info!(
            attempts = approved.attempts,
            provenance = ?approved.provenance,
            sql = %approved.accepted.sql,
            "SQL accepted"
        );

        match self.executor.execute(&approved.accepted).await {
            Ok(result) => {
                let chart = infer_chart(&result);
                PipelineOutcome::Success(SuccessReport {
                    request_id,
                    result,
                    generated_sql: approved.accepted.sql,
                    provenance: approved.provenance,
                    recovered_from: approved.recovered_from,
                    attempts: approved.attempts,
                    chart,
                })
            }
            Err(failure) => fail(
                Stage::Execute,
                failure.error_kind(),
                failure.to_string(),
                Some(approved.accepted.sql),
                approved.attempts,
            ),
        }
    }
}
