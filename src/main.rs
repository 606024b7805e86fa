use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use talk2sql::config::AppConfig;
use talk2sql::pipeline::ChatService;
use talk2sql::server;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "talk2sql")]
#[command(about = "Answer natural-language questions from a SQL database")]
struct Args {
    /// Table catalog CSV (table_name,description)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Few-shot examples JSON (defaults to the bundled set)
    #[arg(long, global = true)]
    examples: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,
    },
    /// Answer a single question
    Ask {
        question: String,

        /// Also print the executed SQL
        #[arg(long)]
        show_sql: bool,
    },
    /// Interactive conversation on stdin
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env().context("failed to load configuration")?;
    if let Some(catalog) = args.catalog {
        config.catalog_path = catalog;
    }
    if let Some(examples) = args.examples {
        config.examples_path = Some(examples);
    }
    info!("Configuration: {:?}", config);

    let service = ChatService::from_config(&config)
        .await
        .context("failed to start the pipeline")?;

    match args.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            server::serve(Arc::new(service), config.server.clone()).await?;
        }
        Command::Ask { question, show_sql } => {
            let reply = service.ask(None, &question).await?;
            if show_sql {
                println!("SQL:\n{}\n", reply.trace.sql);
            }
            println!("{}", reply.answer);
        }
        Command::Chat => chat(&service).await?,
    }
    Ok(())
}

async fn chat(service: &ChatService) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session_id: Option<String> = None;

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        match service.ask(session_id.as_deref(), question).await {
            Ok(reply) => {
                println!("{}\n", reply.answer);
                session_id = Some(reply.session_id);
            }
            Err(e) => eprintln!("error: {}\n", e),
        }
    }
    Ok(())
}
