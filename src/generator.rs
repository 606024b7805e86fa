//! Query Generator
//!
//! Assembles the generation prompt and asks the language model for a query.
//! The raw completion is returned as-is; cleaning is the sanitizer's job.

use crate::dialect::Dialect;
use crate::error::Result;
use crate::few_shot::FewShotExample;
use crate::llm::{ChatMessage, LanguageModel};
use std::sync::Arc;
use tracing::debug;

/// Appended to every question shown to the model.
pub const QUERY_CUE: &str = "\nSQLQuery:";

fn system_prompt(dialect: Dialect, table_info: &str) -> String {
    format!(
        "You are a {dialect} expert. Given an input question, create a syntactically correct \
         {dialect} query to run. Unless otherwise specified, answer with the query only.\n\n\
         Here is the relevant table info: {table_info}\n\n\
         Below are a number of examples of questions and their corresponding SQL queries. \
         Those examples are just for reference and should be considered while answering \
         follow up questions",
        dialect = dialect.name(),
        table_info = table_info,
    )
}

/// Build the four ordered prompt parts: system instructions with table info,
/// worked examples, prior conversation, then the current question.
pub fn build_prompt(
    dialect: Dialect,
    table_info: &str,
    examples: &[FewShotExample],
    history: &[ChatMessage],
    question: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2 + examples.len() * 2 + history.len());
    messages.push(ChatMessage::system(system_prompt(dialect, table_info)));

    for example in examples {
        messages.push(ChatMessage::user(format!("{}{}", example.input, QUERY_CUE)));
        messages.push(ChatMessage::assistant(example.query.clone()));
    }

    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(format!("{}{} ", question, QUERY_CUE)));
    messages
}

pub struct QueryGenerator {
    llm: Arc<dyn LanguageModel>,
    dialect: Dialect,
}

impl QueryGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, dialect: Dialect) -> Self {
        Self { llm, dialect }
    }

    pub async fn generate(
        &self,
        question: &str,
        table_info: &str,
        examples: &[FewShotExample],
        history: &[ChatMessage],
    ) -> Result<String> {
        let messages = build_prompt(self.dialect, table_info, examples, history, question);
        debug!("Generation prompt has {} messages", messages.len());
        let raw = self.llm.complete(&messages).await?;
        debug!("Raw generated query: {}", raw);
        Ok(raw)
    }
}
