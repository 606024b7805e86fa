//! In-process fakes of the language model, the embedding model and the database.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use talk2sql::catalog::{SchemaCatalog, TableDescription};
use talk2sql::config::{PipelineConfig, SessionConfig};
use talk2sql::database::{Database, QueryRows};
use talk2sql::dialect::Dialect;
use talk2sql::embedding::{Embedder, Embedding};
use talk2sql::few_shot::{default_examples, ExampleStore};
use talk2sql::llm::{ChatMessage, LanguageModel, OutputSchema};
use talk2sql::{ChatService, PipelineError, QueryPipeline, Result};

pub const FRANCE_QUESTION: &str = "List all customers in France with a credit limit over 20,000.";
pub const FRANCE_SQL: &str = "SELECT * FROM customers WHERE country = 'France' AND creditLimit > 20000;";

pub fn one_line(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn catalog() -> SchemaCatalog {
    let tables = [
        ("customers", "Customer records: name, contact, country, creditLimit"),
        ("orders", "Customer orders with status and dates"),
        ("payments", "Payments made by customers"),
        ("products", "Product catalog with stock and prices"),
        ("employees", "Employees and reporting lines"),
    ];
    SchemaCatalog::new(
        tables
            .iter()
            .map(|(name, description)| TableDescription {
                table_name: name.to_string(),
                description: description.to_string(),
            })
            .collect(),
    )
    .unwrap()
}

/// Language model whose answers are fixed per prompt kind.
pub struct ScriptedLlm {
    pub selection: Value,
    pub generated: String,
    pub answer: std::result::Result<String, String>,
    pub delay: Option<Duration>,
    pub structured_calls: AtomicUsize,
    pub generation_prompts: Mutex<Vec<Vec<ChatMessage>>>,
    pub rephrase_prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(selection: Value, generated: &str, answer: &str) -> Self {
        Self {
            selection,
            generated: generated.to_string(),
            answer: Ok(answer.to_string()),
            delay: None,
            structured_calls: AtomicUsize::new(0),
            generation_prompts: Mutex::new(Vec::new()),
            rephrase_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn france() -> Self {
        Self::new(
            serde_json::json!({"name": ["customers"]}),
            &format!("```sql\n{}\n```", FRANCE_SQL),
            "Three customers in France have a credit limit above 20000.",
        )
    }

    pub fn total_calls(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst)
            + self.generation_prompts.lock().unwrap().len()
            + self.rephrase_prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if last.starts_with("Given the following user question") {
            self.rephrase_prompts.lock().unwrap().push(last);
            self.answer.clone().map_err(PipelineError::Llm)
        } else {
            self.generation_prompts.lock().unwrap().push(messages.to_vec());
            Ok(self.generated.clone())
        }
    }

    async fn complete_structured(
        &self,
        _messages: &[ChatMessage],
        _schema: &OutputSchema,
    ) -> Result<Value> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.selection.clone())
    }
}

/// Embeds text as keyword hit counts.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lower = text.to_lowercase();
        Ok(["customer", "france", "credit", "payment", "product", "employee", "order"]
            .iter()
            .map(|k| lower.matches(k).count() as f32 + 0.01)
            .collect())
    }
}

/// Database answering statements from a fixed table of results.
#[derive(Default)]
pub struct FakeDatabase {
    pub results: Vec<(String, std::result::Result<QueryRows, String>)>,
    pub executed: Mutex<Vec<String>>,
    pub described: Mutex<Vec<String>>,
}

impl FakeDatabase {
    pub fn with_result(sql: &str, result: std::result::Result<QueryRows, String>) -> Self {
        Self {
            results: vec![(one_line(sql), result)],
            ..Default::default()
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn execute(&self, sql: &str) -> std::result::Result<QueryRows, String> {
        self.executed.lock().unwrap().push(sql.to_string());
        self.results
            .iter()
            .find(|(known, _)| *known == one_line(sql))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Ok(QueryRows::default()))
    }

    async fn table_info(&self, tables: &[String]) -> Result<String> {
        self.described.lock().unwrap().extend(tables.iter().cloned());
        Ok(tables
            .iter()
            .map(|t| format!("CREATE TABLE {} (\n\tid int NOT NULL\n)", t))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

pub fn france_rows() -> QueryRows {
    let rows: Vec<Map<String, Value>> = [
        ("Atelier graphique", "21000.00"),
        ("La Rochelle Gifts", "118200.00"),
        ("Saveurs et Vins", "53800.00"),
    ]
    .iter()
    .map(|(name, limit)| {
        serde_json::json!({"customerName": name, "country": "France", "creditLimit": limit})
            .as_object()
            .cloned()
            .unwrap()
    })
    .collect();
    QueryRows {
        columns: vec![
            "customerName".to_string(),
            "country".to_string(),
            "creditLimit".to_string(),
        ],
        rows,
        truncated: false,
    }
}

pub struct Harness {
    pub service: ChatService,
    pub llm: Arc<ScriptedLlm>,
    pub embedder: Arc<KeywordEmbedder>,
    pub db: Arc<FakeDatabase>,
}

impl Harness {
    pub async fn new(llm: ScriptedLlm, db: FakeDatabase) -> Self {
        Self::with_timeout(llm, db, Duration::from_secs(10)).await
    }

    pub async fn with_timeout(llm: ScriptedLlm, db: FakeDatabase, timeout: Duration) -> Self {
        Self::build(llm, db, timeout, SessionConfig::default()).await
    }

    pub async fn build(
        llm: ScriptedLlm,
        db: FakeDatabase,
        timeout: Duration,
        sessions: SessionConfig,
    ) -> Self {
        let llm = Arc::new(llm);
        let embedder = Arc::new(KeywordEmbedder::default());
        let db = Arc::new(db);
        let catalog = Arc::new(catalog());

        let store = ExampleStore::build(default_examples().unwrap(), embedder.as_ref())
            .await
            .unwrap();
        let pipeline = QueryPipeline::new(
            llm.clone(),
            embedder.clone(),
            db.clone(),
            catalog.clone(),
            Arc::new(store),
            Dialect::MySql,
            &PipelineConfig::default(),
        );
        let service = ChatService::new(pipeline, catalog, &sessions, timeout);

        Self {
            service,
            llm,
            embedder,
            db,
        }
    }

    pub fn embed_calls(&self) -> usize {
        self.embedder.calls.load(Ordering::SeqCst)
    }
}
