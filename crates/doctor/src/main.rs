//! flux-doctor CLI.
//!
//! Automates the GitOps diagnostic runbook: checks Flux Kustomization
//! readiness (triggering reconciles in propagation order when blocked) and
//! verifies ConfigMap changes reach a running Deployment via rollout restart
//! and an optional HTTP smoke probe.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cluster;
mod commands;
mod error;
mod report;
mod runner;

use commands::config_check::ConfigCheckCommand;
use commands::flux_check::FluxCheckCommand;

/// Diagnose Flux reconciliation and ConfigMap propagation issues.
#[derive(Parser)]
#[command(
    name = "flux-doctor",
    version,
    about = "GitOps diagnostic runner",
    long_about = "Diagnose Flux reconciliation failures and ConfigMap/Deployment\n\
                  propagation issues.\n\n\
                  All checks are read-only apart from the two triggers the runbook\n\
                  itself uses: the Flux reconcile-request annotation and the rollout\n\
                  restart annotation.\n\n\
                  Exit codes: 0 = healthy, 1 = degraded state diagnosed, 2 = fatal."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check Flux Kustomization readiness, triggering reconciles if blocked.
    FluxCheck(FluxCheckCommand),

    /// Verify a ConfigMap change propagates to its Deployment.
    ConfigCheck(ConfigCheckCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,flux_doctor=debug")
    } else {
        EnvFilter::new("warn,flux_doctor=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::FluxCheck(cmd) => cmd.run().await,
        Commands::ConfigCheck(cmd) => cmd.run().await,
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    };
    std::process::exit(code);
}
