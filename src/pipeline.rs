//! Orchestrator
//!
//! `QueryPipeline` runs one question through table selection, example
//! selection, generation, sanitization, execution and rephrasing.
//! `ChatService` puts sessions around it: it validates the question, holds
//! the session history for the whole turn and records the turn only after
//! the pipeline succeeded.

use crate::catalog::SchemaCatalog;
use crate::config::{AppConfig, PipelineConfig, SessionConfig};
use crate::database::{Database, ExecutionOutcome, QueryExecutor, SqlDatabase};
use crate::dialect::Dialect;
use crate::embedding::{Embedder, OpenAiEmbedder};
use crate::error::{PipelineError, Result};
use crate::few_shot::{default_examples, load_examples, ExampleSelector, ExampleStore, FewShotExample};
use crate::generator::QueryGenerator;
use crate::history::{ConversationTurn, SessionStore};
use crate::llm::{ChatMessage, LanguageModel, OpenAiClient};
use crate::rephraser::AnswerRephraser;
use crate::sanitizer::Sanitizer;
use crate::table_selector::{SelectedTables, TableSelector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub question: String,
    /// Serialized catalog shown to the table selector.
    pub table_details: String,
    /// Prior conversation, oldest first.
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub answer: String,
}

/// Intermediate results of one run, for logging and the CLI.
#[derive(Debug, Clone)]
pub struct PipelineTrace {
    pub tables: SelectedTables,
    pub examples: Vec<FewShotExample>,
    pub raw_query: String,
    pub sql: String,
    pub degraded: bool,
    pub outcome: ExecutionOutcome,
}

pub struct QueryPipeline {
    catalog: Arc<SchemaCatalog>,
    db: Arc<dyn Database>,
    table_selector: TableSelector,
    example_selector: ExampleSelector,
    generator: QueryGenerator,
    sanitizer: Sanitizer,
    executor: QueryExecutor,
    rephraser: AnswerRephraser,
}

impl QueryPipeline {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        db: Arc<dyn Database>,
        catalog: Arc<SchemaCatalog>,
        examples: Arc<ExampleStore>,
        dialect: Dialect,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            table_selector: TableSelector::new(llm.clone(), catalog.clone()),
            example_selector: ExampleSelector::new(examples, embedder, config.example_count),
            generator: QueryGenerator::new(llm.clone(), dialect),
            sanitizer: Sanitizer::new(dialect),
            executor: QueryExecutor::new(db.clone()),
            rephraser: AnswerRephraser::new(llm),
            catalog,
            db,
        }
    }

    pub async fn run(&self, request: &PipelineRequest) -> Result<(PipelineResponse, PipelineTrace)> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidRequest("question must not be empty".to_string()));
        }

        let (tables, examples) = tokio::try_join!(
            self.table_selector.select(question, &request.table_details),
            self.example_selector.select(question),
        )?;

        let table_info = self.table_info(&tables).await?;
        let raw_query = self
            .generator
            .generate(question, &table_info, &examples, &request.messages)
            .await?;

        let sanitized = self.sanitizer.sanitize_with_report(&raw_query);
        if sanitized.degraded {
            warn!("Sanitized query may not be executable: {:?}", sanitized.sql);
        }
        info!("Generated SQL: {}", sanitized.sql);

        let outcome = self.executor.execute(&sanitized.sql).await;
        let answer = self
            .rephraser
            .rephrase(question, &sanitized.sql, &outcome.as_text())
            .await?;

        let trace = PipelineTrace {
            tables,
            examples,
            raw_query,
            sql: sanitized.sql,
            degraded: sanitized.degraded,
            outcome,
        };
        Ok((PipelineResponse { answer }, trace))
    }

    /// Schema text of the selected tables, each led by its catalog description.
    async fn table_info(&self, tables: &SelectedTables) -> Result<String> {
        let mut sections = Vec::with_capacity(tables.len());
        for name in tables {
            let info = self.db.table_info(std::slice::from_ref(name)).await?;
            let description = self
                .catalog
                .get(name)
                .map(|t| t.description.as_str())
                .unwrap_or_default();
            sections.push(format!("-- {}: {}\n{}", name, description, info));
        }
        Ok(sections.join("\n\n"))
    }
}

/// Result of one conversational turn.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub session_id: String,
    pub answer: String,
    pub trace: PipelineTrace,
}

pub struct ChatService {
    pipeline: QueryPipeline,
    catalog: Arc<SchemaCatalog>,
    sessions: SessionStore,
    timeout: Duration,
}

impl ChatService {
    pub fn new(
        pipeline: QueryPipeline,
        catalog: Arc<SchemaCatalog>,
        sessions: &SessionConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            catalog,
            sessions: SessionStore::new(sessions),
            timeout,
        }
    }

    /// Wire up the HTTP oracles, the database and the example index.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let catalog = Arc::new(SchemaCatalog::from_csv_path(&config.catalog_path)?);
        let examples = match &config.examples_path {
            Some(path) => load_examples(path)?,
            None => default_examples()?,
        };

        let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(&config.llm)?);
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(&config.embedding)?);
        let db: Arc<dyn Database> =
            Arc::new(SqlDatabase::connect(&config.database, config.pipeline.max_result_rows).await?);
        let store = Arc::new(ExampleStore::build(examples, embedder.as_ref()).await?);

        let pipeline = QueryPipeline::new(
            llm,
            embedder,
            db,
            catalog.clone(),
            store,
            config.database.dialect,
            &config.pipeline,
        );
        Ok(Self::new(
            pipeline,
            catalog,
            &config.sessions,
            config.server.request_timeout(),
        ))
    }

    /// Answer `question` within the session, creating one when needed.
    pub async fn ask(&self, session_id: Option<&str>, question: &str) -> Result<ChatReply> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidRequest("question must not be empty".to_string()));
        }

        let request_id = Uuid::new_v4();
        let span = info_span!("request", %request_id);
        async move {
            let start = Instant::now();
            let (session_id, shared) = self.sessions.get_or_create(session_id);
            let mut history = shared.lock().await;

            let request = PipelineRequest {
                question: question.to_string(),
                table_details: self.catalog.details(),
                messages: history.as_messages(),
            };
            info!("Session {} question: {}", session_id, question);

            let (response, trace) = tokio::time::timeout(self.timeout, self.pipeline.run(&request))
                .await
                .map_err(|_| PipelineError::Timeout(self.timeout.as_secs()))??;

            history.append_user(question);
            history.append_assistant(response.answer.clone());
            self.sessions.touch(&session_id);
            info!("Answered in {}ms", start.elapsed().as_millis());

            Ok(ChatReply {
                session_id,
                answer: response.answer,
                trace,
            })
        }
        .instrument(span)
        .await
    }

    /// Turns of an existing session.
    pub async fn history(&self, session_id: &str) -> Option<Vec<ConversationTurn>> {
        let history = self.sessions.get(session_id)?;
        let turns = history.lock().await.turns().to_vec();
        Some(turns)
    }
}
