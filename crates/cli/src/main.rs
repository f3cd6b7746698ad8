use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobchain_core::saga::read_chain;
use jobchain_core::storage::RecordStore;
use jobchain_core::{InstanceId, JobKey};
use std::path::PathBuf;

mod config;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "jobchain")]
#[command(about = "Inspect jobs of the jobchain saga engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "jobchain.toml", env = "JOBCHAIN_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "JOBCHAIN_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the job record and the step records of a job
    Status {
        job_type: String,
        unique_value: String,

        /// Field of the job data the job is keyed by
        #[arg(long)]
        uniq_field: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobchain=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("Data directory: {}", args.data_dir.display());

    let config = CliConfig::load(&args.config, args.data_dir)?;

    match args.command {
        Command::Status {
            job_type,
            unique_value,
            uniq_field,
        } => {
            let field = uniq_field.unwrap_or_else(|| config.engine.jobs.uniq_field.clone());
            let store = config.open_store()?;

            let key = JobKey::new(&job_type, &field, &unique_value);
            let value = store.get(key.as_str()).await?;
            let instance = InstanceId::new(&job_type, &unique_value);
            let tasks = read_chain(&store, &instance).await?;

            let report = serde_json::json!({
                "key": key,
                "value": value,
                "instance": instance,
                "tasks": tasks,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to render status")?
            );
        }
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config.engine).context("Failed to render configuration")?;
            println!("# data_dir = {}", config.data_dir.display());
            print!("{}", rendered);
        }
    }

    Ok(())
}
