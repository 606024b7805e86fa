//! SQL dialect the pipeline targets.
//!
//! One dialect per running process. The dialect decides the wording of the
//! generator prompt, which characters quote identifiers and strings, and how
//! the sanitizer validates its output.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{Dialect as ParserDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    MySql,
    Postgres,
}

impl Dialect {
    /// Infer the dialect from a database connection URL scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::Config("database URL has no scheme".to_string()))?;

        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            other => Err(PipelineError::Config(format!(
                "unsupported database scheme '{}' (expected mysql or postgres)",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::MySql => "MySQL",
            Dialect::Postgres => "PostgreSQL",
        }
    }

    pub fn identifier_quote(&self) -> char {
        match self {
            Dialect::MySql => '`',
            Dialect::Postgres => '"',
        }
    }

    /// Characters that open a string literal.
    pub fn string_delimiters(&self) -> &'static [char] {
        match self {
            Dialect::MySql => &['\'', '"'],
            Dialect::Postgres => &['\''],
        }
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        let quote = self.identifier_quote();
        let escaped = name.replace(quote, &format!("{}{}", quote, quote));
        format!("{}{}{}", quote, escaped, quote)
    }

    /// Whether `sql` parses as at least one statement in this dialect.
    pub fn parses(&self, sql: &str) -> bool {
        let parsed = match self {
            Dialect::MySql => parse_with(&MySqlDialect {}, sql),
            Dialect::Postgres => parse_with(&PostgreSqlDialect {}, sql),
        };
        parsed.map(|count| count > 0).unwrap_or(false)
    }
}

fn parse_with(dialect: &dyn ParserDialect, sql: &str) -> std::result::Result<usize, String> {
    Parser::parse_sql(dialect, sql)
        .map(|statements| statements.len())
        .map_err(|e| e.to_string())
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
