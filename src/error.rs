use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Malformed model output: {0}")]
    MalformedModelOutput(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Failed to rephrase answer: {0}")]
    RephraseFailure(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Errors caused by the caller rather than by a pipeline stage.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::InvalidRequest(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_request_is_client_error() {
        assert!(PipelineError::InvalidRequest("missing question".into()).is_client_error());
        assert!(!PipelineError::RephraseFailure("boom".into()).is_client_error());
        assert!(!PipelineError::MalformedModelOutput("bad".into()).is_client_error());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = PipelineError::MalformedModelOutput("expected a list of strings".into());
        assert_eq!(err.to_string(), "Malformed model output: expected a list of strings");
        assert_eq!(PipelineError::Timeout(30).to_string(), "Request timed out after 30s");
    }
}
