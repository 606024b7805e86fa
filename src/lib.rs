//! talk2sql: natural-language questions answered from a relational database.
//!
//! A question flows through table selection and few-shot example selection
//! (concurrently), prompt assembly and query generation, sanitization,
//! execution and answer rephrasing. The language model, the embedding model
//! and the database sit behind traits so that each can be replaced.

pub mod catalog;
pub mod config;
pub mod database;
pub mod dialect;
pub mod embedding;
pub mod error;
pub mod few_shot;
pub mod generator;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod rephraser;
pub mod sanitizer;
pub mod server;
pub mod table_selector;
pub mod vector_store;

pub use error::{PipelineError, Result};
pub use pipeline::{ChatService, QueryPipeline};
