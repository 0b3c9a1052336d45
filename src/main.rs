use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use anvil::agent::CommandAgent;
use anvil::config::PipelineConfig;
use anvil::orchestrator::{Pipeline, PipelineState};

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "LLM pipeline orchestrator - drive a ticket from interrogation to ship")]
struct Cli {
    /// Ticket identifier to drive through the pipeline
    ticket: String,

    /// Resume from an existing run's log directory
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Shell-style KEY=VALUE config file
    #[arg(long, default_value = "pipeline.conf")]
    config: PathBuf,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = if cli.config.exists() {
        match PipelineConfig::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{} {err:#}", console::style("error:").red().bold());
                std::process::exit(1);
            }
        }
    } else {
        PipelineConfig::empty()
    };

    let state = match &cli.resume {
        Some(log_dir) => match PipelineState::resume(log_dir, &config) {
            Ok(state) => {
                if state.ticket != cli.ticket {
                    warn!(
                        checkpoint = %state.ticket,
                        requested = %cli.ticket,
                        "resuming a run for a different ticket"
                    );
                }
                println!("Resuming pipeline for: {} (from {})", state.ticket, log_dir.display());
                state
            }
            Err(err) => {
                eprintln!("{} {err:#}", console::style("error:").red().bold());
                std::process::exit(1);
            }
        },
        None => PipelineState::new(cli.ticket.as_str(), &config),
    };

    println!("Starting pipeline for: {}", state.ticket);
    println!("Max cost: ${:.2}", state.max_cost);
    println!("Logs: {}", state.log_dir.display());

    let agent = Arc::new(CommandAgent::from_config(&config));
    let mut pipeline = Pipeline::new(config, agent, state);

    let outcome = pipeline.run().await;
    pipeline.finalize(&outcome);

    if let Err(err) = outcome {
        eprintln!("\n{} {err}", console::style("Pipeline failed:").red().bold());
        std::process::exit(err.exit_code());
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
