use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use sql_query_assistant::config::AppConfig;
use sql_query_assistant::logging::init_logging;
use sql_query_assistant::models::ExecutionResult;
use sql_query_assistant::QueryAssistant;

#[derive(Parser)]
#[command(author, version, about = "Ask questions about your database in plain language", long_about = None)]
struct Cli {
    /// Question to answer
    #[arg(short, long)]
    query: Option<String>,

    /// Question text, when --query is not used
    #[arg(trailing_var_arg = true)]
    text: Vec<String>,

    /// Re-embed every table before doing anything else
    #[arg(long)]
    rebuild_cache: bool,

    /// Keep schema vectors in memory only for this run
    #[arg(long)]
    no_cache: bool,

    /// List the tables in the catalog
    #[arg(long)]
    list_tables: bool,

    /// Print connection pool usage
    #[arg(long)]
    show_pool_status: bool,

    /// Completion service API key (falls back to DEEPSEEK_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Use the built-in sample dataset instead of the configured database
    #[arg(long)]
    test_mode: bool,

    /// Extra configuration file (JSON, YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn question(&self) -> Option<String> {
        self.query.clone().or_else(|| {
            let joined = self.text.join(" ");
            (!joined.trim().is_empty()).then_some(joined)
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.no_cache {
        config.cache.enabled = false;
    }

    // Initialize logging
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let _guard = init_logging(
        Some(&level),
        config.logging.file_path.as_deref().map(Path::new),
        config.logging.format == "json",
    )?;

    info!("Starting sql-query-assistant");

    let question = cli.question();
    let api_key = if question.is_some() {
        config.resolve_api_key(cli.api_key.as_deref())?
    } else {
        // Maintenance commands never call the completion service
        config.resolve_api_key(cli.api_key.as_deref()).unwrap_or_default()
    };

    let assistant = QueryAssistant::from_config(&config, api_key, cli.test_mode)
        .context("Failed to initialise the assistant")?;

    let mut did_something = false;
    let mut failure = None;

    if cli.rebuild_cache {
        let summary = assistant.rebuild_cache(true).await?;
        println!(
            "Cache rebuilt: {} embedded, {} reused, {} degraded, {} failed, {} pruned ({:.2} ms)",
            summary.rebuilt,
            summary.reused,
            summary.degraded,
            summary.failed.len(),
            summary.pruned,
            summary.elapsed.as_secs_f64() * 1000.0
        );
        did_something = true;
    }

    if cli.list_tables {
        for name in assistant.list_tables() {
            println!("{name}");
        }
        did_something = true;
    }

    if let Some(question) = question {
        match assistant.answer(&question).await {
            Ok(result) => print_result(&result),
            Err(err) => {
                warn!(stage = %err.stage, "Question not answered");
                println!("查询失败 [{}]: {}", err.stage, err.kind);
                if let Some(sql) = &err.sql {
                    println!("SQL: {sql}");
                }
                failure = Some(err);
            }
        }
        println!();
        print!("{}", assistant.performance_report());
        did_something = true;
    }

    if cli.show_pool_status {
        let status = assistant.pool_status();
        println!(
            "Pool: {}/{} open, {} idle, {} leased, {} acquired, {} timeouts, {} discarded",
            status.connections,
            status.max_size,
            status.idle,
            status.leased,
            status.acquired_total,
            status.timeouts_total,
            status.discarded_total
        );
        did_something = true;
    }

    if !did_something {
        println!("Nothing to do. Pass a question or --help for options.");
    }

    if let Some(err) = failure {
        bail!("Question not answered: {} at {}", err.kind, err.stage);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    println!("SQL: {}", result.sql);
    println!("Tables: {}", result.tables.join(", "));
    println!();

    if result.rows.is_empty() {
        println!("(no rows)");
    } else {
        println!("{}", result.columns.join(" | "));
        for row in &result.rows {
            let line = row
                .values
                .iter()
                .map(|(_, value)| value.to_string())
                .collect::<Vec<_>>()
                .join(" | ");
            println!("{line}");
        }
        println!("({} rows)", result.row_count);
    }

    println!();
    print!("{}", result.performance_report());
}
