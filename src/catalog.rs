//! Schema Catalog
//!
//! Static description of the tables the pipeline may query. Loaded once at
//! startup from a CSV file with a `table_name,description` header.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub table_name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    tables: Vec<TableDescription>,
}

impl SchemaCatalog {
    /// Build a catalog, rejecting empty or duplicate table names.
    pub fn new(tables: Vec<TableDescription>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut cleaned = Vec::with_capacity(tables.len());
        for table in tables {
            let name = table.table_name.trim().to_string();
            if name.is_empty() {
                return Err(PipelineError::Catalog("table name must not be empty".to_string()));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(PipelineError::Catalog(format!("duplicate table name '{}'", name)));
            }
            cleaned.push(TableDescription {
                table_name: name,
                description: table.description.trim().to_string(),
            });
        }
        Ok(Self { tables: cleaned })
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::Catalog(format!("failed to open {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_csv_reader(file)?;
        info!("Loaded schema catalog with {} tables from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn from_csv_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut tables = Vec::new();
        for record in csv_reader.deserialize::<TableDescription>() {
            let table = record
                .map_err(|e| PipelineError::Catalog(format!("invalid catalog row: {}", e)))?;
            tables.push(table);
        }
        Self::new(tables)
    }

    pub fn tables(&self) -> &[TableDescription] {
        &self.tables
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.table_name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TableDescription> {
        self.resolve(name)
            .and_then(|resolved| self.tables.iter().find(|t| t.table_name == resolved))
    }

    /// Map a name produced by the model onto the catalog spelling.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let wanted = name
            .trim()
            .trim_matches(|c| c == '`' || c == '"' || c == '\'')
            .trim();
        self.tables
            .iter()
            .find(|t| t.table_name.eq_ignore_ascii_case(wanted))
            .map(|t| t.table_name.as_str())
    }

    /// Serialized form handed to the table selector.
    pub fn details(&self) -> String {
        self.tables
            .iter()
            .map(|t| format!("Table Name:{}\nTable Description:{}\n\n", t.table_name, t.description))
            .collect()
    }
}
