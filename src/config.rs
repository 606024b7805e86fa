//! Application configuration
//!
//! All oracle endpoints, credentials and database parameters live here and are
//! handed to component constructors. Core modules never read the environment.

use crate::dialect::Dialect;
use crate::error::{PipelineError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CATALOG_PATH: &str = "data/table_descriptions.csv";

#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_retries: usize,
    pub request_timeout_secs: u64,
}

#[derive(Clone)]
pub struct EmbeddingConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub dialect: Dialect,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Sample rows shown per table in the generator prompt.
    pub sample_rows: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of few-shot examples retrieved per question.
    pub example_count: usize,
    /// Rows kept from a result before it is handed to the rephraser.
    pub max_result_rows: usize,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub max_sessions: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub sessions: SessionConfig,
    pub server: ServerConfig,
    pub catalog_path: PathBuf,
    pub examples_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            example_count: 2,
            max_result_rows: 100,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            max_sessions: 1024,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 120,
            max_body_bytes: 1_000_000,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| PipelineError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let base_url = get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());

        let llm = LlmConfig {
            api_key: api_key.clone(),
            base_url: base_url.clone(),
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            temperature: parse_or(&get, "TALK2SQL_TEMPERATURE", 0.0)?,
            max_retries: parse_or(&get, "TALK2SQL_LLM_MAX_RETRIES", 2)?,
            request_timeout_secs: parse_or(&get, "TALK2SQL_LLM_TIMEOUT_SECS", 60)?,
        };

        let embedding = EmbeddingConfig {
            api_key: get("EMBEDDING_API_KEY").unwrap_or(api_key),
            base_url: get("EMBEDDING_BASE_URL").unwrap_or(base_url),
            model: get("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        };

        let url = get("DATABASE_URL")
            .ok_or_else(|| PipelineError::Config("DATABASE_URL is not set".to_string()))?;
        let database = DatabaseConfig {
            dialect: Dialect::from_url(&url)?,
            url,
            max_connections: parse_or(&get, "TALK2SQL_DB_MAX_CONNECTIONS", 5)?,
            acquire_timeout_secs: parse_or(&get, "TALK2SQL_DB_ACQUIRE_TIMEOUT_SECS", 30)?,
            sample_rows: parse_or(&get, "TALK2SQL_SAMPLE_ROWS", 3)?,
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            example_count: parse_or(&get, "TALK2SQL_EXAMPLE_COUNT", defaults.example_count)?,
            max_result_rows: parse_or(&get, "TALK2SQL_MAX_RESULT_ROWS", defaults.max_result_rows)?,
        };

        let defaults = SessionConfig::default();
        let sessions = SessionConfig {
            ttl_secs: parse_or(&get, "TALK2SQL_SESSION_TTL_SECS", defaults.ttl_secs)?,
            max_sessions: parse_or(&get, "TALK2SQL_MAX_SESSIONS", defaults.max_sessions)?,
        };

        let defaults = ServerConfig::default();
        let server = ServerConfig {
            bind: get("TALK2SQL_BIND").unwrap_or(defaults.bind),
            request_timeout_secs: parse_or(
                &get,
                "TALK2SQL_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            max_body_bytes: parse_or(&get, "TALK2SQL_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        };

        let config = Self {
            llm,
            embedding,
            database,
            pipeline,
            sessions,
            server,
            catalog_path: get("TALK2SQL_CATALOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH)),
            examples_path: get("TALK2SQL_EXAMPLES").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.trim().is_empty() {
            return Err(PipelineError::Config("LLM API key is empty".to_string()));
        }
        if self.embedding.api_key.trim().is_empty() {
            return Err(PipelineError::Config("embedding API key is empty".to_string()));
        }
        if self.pipeline.example_count == 0 {
            return Err(PipelineError::Config("example count must be at least 1".to_string()));
        }
        if self.server.request_timeout_secs == 0 || self.llm.request_timeout_secs == 0 {
            return Err(PipelineError::Config("timeouts must be greater than zero".to_string()));
        }
        if self.sessions.max_sessions == 0 {
            return Err(PipelineError::Config("max sessions must be at least 1".to_string()));
        }
        // The scheme must agree with the configured dialect.
        if Dialect::from_url(&self.database.url)? != self.database.dialect {
            return Err(PipelineError::Config(
                "database URL scheme does not match the configured dialect".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PipelineError::Config(format!("invalid value for {}: {}", key, e))),
        None => Ok(default),
    }
}

/// Replace the password component of a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

fn redact_key(key: &str) -> String {
    if key.chars().count() <= 8 {
        "***".to_string()
    } else {
        format!("{}***", key.chars().take(4).collect::<String>())
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &redact_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("api_key", &redact_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &redact_url(&self.url))
            .field("dialect", &self.dialect)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("sample_rows", &self.sample_rows)
            .finish()
    }
}
