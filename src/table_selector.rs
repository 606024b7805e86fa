//! Table Selector
//!
//! Asks the language model which catalog tables might be relevant to a
//! question. The model is pushed towards over-inclusion; its answer must
//! satisfy the `TableSelection` contract or the request fails. There is no
//! fallback to "all tables".

use crate::catalog::SchemaCatalog;
use crate::error::{PipelineError, Result};
use crate::llm::{ChatMessage, LanguageModel, OutputSchema};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Tables chosen for one request. Ordering carries no meaning.
pub type SelectedTables = BTreeSet<String>;

/// Shape the structured model output must deserialize into.
#[derive(Debug, Clone, Deserialize)]
pub struct TableSelection {
    pub name: Vec<String>,
}

pub fn table_selection_schema() -> OutputSchema {
    OutputSchema {
        name: "Table".to_string(),
        description: "Table in SQL database.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "List of Name of tables in SQL database."
                }
            },
            "required": ["name"]
        }),
    }
}

pub fn selection_prompt(question: &str, table_details: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!(
            "Return the names of ALL the SQL tables that MIGHT be relevant to the user question.\n\
             The tables are:\n\n\
             {}\n\
             Remember to include ALL POTENTIALLY RELEVANT tables, even if you're not sure that they're needed.",
            table_details
        )),
        ChatMessage::user(question),
    ]
}

/// Validate raw structured output against the contract and the catalog.
pub fn validate_selection(raw: serde_json::Value, catalog: &SchemaCatalog) -> Result<SelectedTables> {
    let selection: TableSelection = serde_json::from_value(raw).map_err(|e| {
        PipelineError::MalformedModelOutput(format!("table selection must be {{\"name\": [string]}}: {}", e))
    })?;

    let mut tables = SelectedTables::new();
    for name in &selection.name {
        let resolved = catalog.resolve(name).ok_or_else(|| {
            PipelineError::MalformedModelOutput(format!("unknown table '{}' in selection", name))
        })?;
        tables.insert(resolved.to_string());
    }
    Ok(tables)
}

pub struct TableSelector {
    llm: Arc<dyn LanguageModel>,
    catalog: Arc<SchemaCatalog>,
    schema: OutputSchema,
}

impl TableSelector {
    pub fn new(llm: Arc<dyn LanguageModel>, catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            llm,
            catalog,
            schema: table_selection_schema(),
        }
    }

    pub async fn select(&self, question: &str, table_details: &str) -> Result<SelectedTables> {
        let messages = selection_prompt(question, table_details);
        let raw = self.llm.complete_structured(&messages, &self.schema).await?;
        debug!("Table selection output: {}", raw);

        let tables = validate_selection(raw, &self.catalog)?;
        info!("Selected tables: {:?}", tables);
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableDescription;
    use async_trait::async_trait;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::new(
            ["customers", "orders", "payments", "productLines"]
                .iter()
                .map(|n| TableDescription {
                    table_name: n.to_string(),
                    description: format!("{} table", n),
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_dedupes_and_resolves() {
        let raw = serde_json::json!({"name": ["customers", "Customers", "productlines"]});
        let tables = validate_selection(raw, &catalog()).unwrap();
        assert_eq!(
            tables.into_iter().collect::<Vec<_>>(),
            vec!["customers".to_string(), "productLines".to_string()]
        );
    }

    #[test]
    fn test_validate_rejects_wrong_shapes() {
        for raw in [
            serde_json::json!(["customers"]),
            serde_json::json!({"name": "customers"}),
            serde_json::json!({"name": [1, 2]}),
            serde_json::json!({"tables": ["customers"]}),
            serde_json::json!(null),
        ] {
            let err = validate_selection(raw.clone(), &catalog()).unwrap_err();
            assert!(matches!(err, PipelineError::MalformedModelOutput(_)), "{}", raw);
        }
    }

    #[test]
    fn test_validate_rejects_unknown_tables() {
        let raw = serde_json::json!({"name": ["customers", "invoices"]});
        let err = validate_selection(raw, &catalog()).unwrap_err();
        assert!(err.to_string().contains("invoices"));
    }

    #[test]
    fn test_prompt_asks_for_over_inclusion() {
        let messages = selection_prompt("How many orders?", &catalog().details());
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("ALL POTENTIALLY RELEVANT"));
        assert!(messages[0].content.contains("Table Name:orders"));
        assert_eq!(messages[1], ChatMessage::user("How many orders?"));
    }

    struct FixedSelection(serde_json::Value);

    #[async_trait]
    impl LanguageModel for FixedSelection {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            unreachable!("table selection only uses structured output")
        }

        async fn complete_structured(
            &self,
            _messages: &[ChatMessage],
            schema: &OutputSchema,
        ) -> Result<serde_json::Value> {
            assert_eq!(schema.name, "Table");
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_select_includes_every_mentioned_concept() {
        let llm = Arc::new(FixedSelection(serde_json::json!({"name": ["customers", "payments"]})));
        let catalog = Arc::new(catalog());
        let selector = TableSelector::new(llm, catalog.clone());
        let tables = selector
            .select("Which customers made payments over 1000?", &catalog.details())
            .await
            .unwrap();
        assert!(tables.contains("customers"));
        assert!(tables.contains("payments"));
    }
}
