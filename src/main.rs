//! Stage Chain CLI
//!
//! Run a chain of batch-processing stages over a dataset in an object store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stage_chain::{build_runtime, mark_input, open_chain, plan_chain, run_chain, Config};

#[derive(Parser)]
#[command(name = "stage-chain")]
#[command(about = "Run a chain of batch-processing stages over an object store", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Tag batch outputs as test runs
    #[arg(long, global = true)]
    test_mode: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chain (default if no command specified)
    Run,

    /// Show each stage's batch plan without executing anything
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration and the stage chain
    Validate,

    /// Write the raw input's length marker from its record count
    MarkInput,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli.config, cli.concurrency, cli.test_mode)?;
            run_command(config)?;
        }

        Some(Commands::Plan { json }) => {
            let config = load_config(&cli.config, cli.concurrency, cli.test_mode)?;
            plan_command(config, json)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::MarkInput) => {
            let config = load_config(&cli.config, None, false)?;
            let runtime = build_runtime(config.processing.worker_threads)?;
            let length = runtime.block_on(mark_input(&config))?;
            println!("Input marked with length {}", length);
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf, concurrency: Option<usize>, test_mode: bool) -> Result<Config> {
    let mut config = Config::from_file(path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.concurrency = c;
    }
    if test_mode {
        config.processing.test_mode = true;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(run_chain(config))?;
    println!("{}", stats);
    Ok(())
}

fn plan_command(config: Config, json: bool) -> Result<()> {
    let runtime = build_runtime(config.processing.worker_threads)?;
    let plans = runtime.block_on(plan_chain(&config))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    println!("\n=== Chain Plan ===");
    for plan in &plans {
        println!("{}", plan);
        if let Some(jobs) = &plan.jobs {
            for job in jobs {
                println!(
                    "  [{}, {}) {} {}",
                    job.first_index,
                    job.last_index,
                    if job.done { "done   " } else { "pending" },
                    job.output
                );
            }
        }
    }
    println!("==================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let chain = open_chain(&config)?;
    println!(
        "Configuration is valid: {} stages, final output {}",
        chain.len(),
        chain.terminal().output
    );
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Stage Chain Configuration

# === INPUT: Raw records the first stage reads ===
input:
  # JSON array of records. Its length marker (<path>.length) must exist
  # before the chain can start; `stage-chain mark-input` writes it.
  path: "raw/records.json"

# === OUTPUT: Where the last stage writes ===
output:
  path: "final/records.json"

  # Prefix for the outputs of intermediate stages
  intermediate_prefix: "intermediate/"

# === STORE: Choose ONE of local_path, bucket or memory ===
store:
  # Option 1: Local filesystem root
  local_path: "/tmp/stage-chain"

  # Option 2: S3 bucket (comment out local_path and uncomment these)
  # bucket: "my-bucket"
  # region: "us-west-2"
  # endpoint_url: "http://localhost:4566"
  # anonymous: false

# === STAGES: Run in order, each reading the previous one's output ===
# Each stage sets batch_size OR batch_count. A stage that sets neither
# inherits the previous stage's sizing; overrides missing from a stage
# are inherited the same way.
stages:
  - name: clean
    batch_size: 1000

  - name: classify
    overrides:
      model: small

  - name: summarize
    batch_count: 4

# Alternatively, load the stage list from a JSON or YAML file
# chain_file: "chain.json"

# === PROCESSING: Performance tuning ===
processing:
  # Batches executed concurrently
  concurrency: 8

  # Batch outputs fetched concurrently when combining
  fetch_concurrency: 16

  # Tag batch outputs as test runs (keeps them apart from production outputs)
  test_mode: false

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Print progress metrics during the run
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"

  # Retry configuration for failed batches
  retry:
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
