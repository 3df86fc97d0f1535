#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use lapidary::config::PipelineConfig;
use lapidary::events::StderrSink;
use lapidary::gateway::{ProviderGateway, StderrUsageSink};
use lapidary::ops::{OperatorDeps, OperatorExecutor};
use lapidary::optimize::{OptimizeOptions, Optimizer};

#[derive(Parser)]
#[command(name = "lapidary", version, about = "LLM pipeline optimizer CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a pipeline on sampled data and write an optimized config
    Optimize {
        /// Pipeline YAML to optimize
        config: PathBuf,
        /// Concurrency bound for probe and per-record fan-out
        #[arg(long)]
        max_threads: Option<usize>,
        /// Records sampled per step input
        #[arg(long)]
        sample_size: Option<usize>,
        /// Model used for the optimizer's own analysis calls
        #[arg(long)]
        model: Option<String>,
        /// Output path for the optimized config
        #[arg(long, default_value = "optimized_config.yaml")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lapidary=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Optimize {
            config,
            max_threads,
            sample_size,
            model,
            out,
        } => {
            let pipeline = PipelineConfig::from_path(&config)?;

            let mut options = OptimizeOptions::default();
            if let Some(max_threads) = max_threads {
                options.max_threads = max_threads.max(1);
            }
            if let Some(sample_size) = sample_size {
                options.sample_size = sample_size;
            }
            if let Some(model) = model {
                options.model = model;
            }

            let gateway = Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink))?);
            let executor = Arc::new(OperatorExecutor::new(OperatorDeps {
                gateway: gateway.clone(),
                default_model: pipeline.default_model.clone(),
                max_threads: options.max_threads,
            }));

            let optimizer = Optimizer::new(
                pipeline,
                gateway,
                executor,
                Arc::new(StderrSink),
                options,
            );
            optimizer.optimize_to_path(&out).await?;
            Ok(())
        }
    }
}
