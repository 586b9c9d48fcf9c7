use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;

use config::ReelflowConfig;

#[derive(Parser, Debug)]
#[command(name = "reelflow")]
#[command(about = "DAG pipeline runner for movie datasets", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "reelflow.toml", env = "REELFLOW_CONFIG")]
    config: PathBuf,

    /// Data directory for state, staging and warehouse files
    #[arg(short, long, default_value = "./data", env = "REELFLOW_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run and drive it to completion
    Start {
        /// Logical run partition, e.g. a date
        #[arg(short, long, default_value = "default")]
        partition: String,

        /// Override the configured pipeline version
        #[arg(long)]
        pipeline_version: Option<String>,
    },
    /// Show the state of a run
    Status {
        run_id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a run
    Cancel { run_id: String },
    /// Continue an interrupted run
    Resume {
        run_id: String,

        /// Pipeline version the run was started with, if overridden
        #[arg(long)]
        pipeline_version: Option<String>,
    },
    /// Check the pipeline definition without running it
    Validate,
    /// List runs, most recent first
    Runs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(commands::EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reelflow=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(commands::error_exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    tracing::debug!("Data directory: {}", cli.data_dir.display());
    let config = ReelflowConfig::load(&cli.config, cli.data_dir)?;

    match cli.command {
        Command::Start {
            partition,
            pipeline_version,
        } => commands::start(config, partition, pipeline_version).await,
        Command::Status { run_id, json } => commands::status(config, &run_id, json),
        Command::Cancel { run_id } => commands::cancel(config, &run_id),
        Command::Resume {
            run_id,
            pipeline_version,
        } => commands::resume(config, &run_id, pipeline_version).await,
        Command::Validate => commands::validate(config),
        Command::Runs => commands::runs(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from([
            "reelflow",
            "--data-dir",
            "/tmp/reelflow",
            "start",
            "--partition",
            "2024-05-21",
            "--pipeline-version",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, PathBuf::from("/tmp/reelflow"));
        assert!(matches!(
            cli.command,
            Command::Start { ref partition, pipeline_version: Some(ref v) }
                if partition == "2024-05-21" && v == "3"
        ));
    }

    #[test]
    fn test_parse_resume_with_version() {
        let cli = Cli::try_parse_from([
            "reelflow",
            "resume",
            "8f0c5c2e-7d7b-4a51-9b0e-2f4f5e0f4c11",
            "--pipeline-version",
            "5",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Command::Resume { pipeline_version: Some(ref v), .. } if v == "5"
        ));
    }

    #[test]
    fn test_bad_invocation_is_rejected() {
        assert!(Cli::try_parse_from(["reelflow", "status"]).is_err());
        assert!(Cli::try_parse_from(["reelflow", "explode"]).is_err());
    }
}
