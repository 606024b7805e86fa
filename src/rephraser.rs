//! Answer Rephraser
//!
//! Turns the question, the executed query and its result text into a
//! natural-language answer with one model call.

use crate::error::{PipelineError, Result};
use crate::llm::{ChatMessage, LanguageModel};
use std::sync::Arc;
use tracing::debug;

pub fn answer_prompt(question: &str, sql: &str, result: &str) -> String {
    format!(
        "Given the following user question, corresponding SQL query, and SQL result, \
         answer the user question.\n\n\
         Question: {}\nSQL Query: {}\nSQL Result: {}\nAnswer: ",
        question, sql, result
    )
}

pub struct AnswerRephraser {
    llm: Arc<dyn LanguageModel>,
}

impl AnswerRephraser {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Any model failure, or an empty answer, is a `RephraseFailure`.
    pub async fn rephrase(&self, question: &str, sql: &str, result: &str) -> Result<String> {
        let messages = [ChatMessage::user(answer_prompt(question, sql, result))];
        let answer = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| PipelineError::RephraseFailure(e.to_string()))?;

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(PipelineError::RephraseFailure("model returned an empty answer".to_string()));
        }
        debug!("Answer: {}", answer);
        Ok(answer.to_string())
    }
}
