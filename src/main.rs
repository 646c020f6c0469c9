use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use webpilot::{Config, Engine, TaskStatus};

#[derive(Parser)]
#[command(name = "webpilot", about = "Natural-language browser automation", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a natural-language instruction.
    Run {
        /// The instruction, e.g. "search laptops under 50000".
        instruction: String,
        /// Reuse a specific task id instead of generating one.
        #[arg(long)]
        task_id: Option<String>,
        /// Print the full result as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// List previously executed tasks, newest first.
    History,
    /// Show a stored task result as JSON.
    Show { task_id: String },
    /// Print session memory statistics.
    Stats,
    /// Wipe session memory.
    ClearMemory,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let engine = Engine::from_config(&config)?;

    match cli.command {
        Command::Run {
            instruction,
            task_id,
            json,
        } => {
            let result = engine.execute(&instruction, task_id).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("task {} finished: {}", result.task_id, result.status);
                if let Some(message) = &result.error_message {
                    println!("  {message}");
                }
                println!(
                    "  {} records in {:.2}s",
                    result.records.len(),
                    result.execution_time
                );
                for record in &result.records {
                    println!(
                        "  - {} | {} | {}",
                        record.title.as_deref().unwrap_or("-"),
                        record.price.as_deref().unwrap_or("-"),
                        record.url.as_deref().unwrap_or("-"),
                    );
                }
            }
            if result.status == TaskStatus::Error {
                std::process::exit(1);
            }
        }
        Command::History => {
            for summary in engine.store().list()? {
                println!(
                    "{}  {}  {:>7}  {:>3} records  {}",
                    summary.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    summary.task_id,
                    summary.status,
                    summary.result_count,
                    summary.instruction,
                );
            }
        }
        Command::Show { task_id } => match engine.store().load(&task_id)? {
            Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            None => {
                eprintln!("no stored result for task {task_id}");
                std::process::exit(1);
            }
        },
        Command::Stats => {
            let stats = engine.memory().await.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::ClearMemory => {
            engine.memory().await.clear();
            println!("session memory cleared");
        }
    }

    Ok(())
}
