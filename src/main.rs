//! Drover CLI entry point.

use clap::Parser;
use std::process::ExitCode;

use drover::cli::app::CoreGraph;
use drover::cli::{commands, Cli, Commands};
use drover::domain::errors::CoreError;
use drover::infrastructure::config::ConfigLoader;
use drover::infrastructure::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let _log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let graph = match CoreGraph::assemble(config).await {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(8);
        }
    };
    if let Err(e) = graph.start().await {
        eprintln!("error: {e:#}");
        return ExitCode::from(8);
    }

    let result = match cli.command {
        Commands::Team(args) => {
            commands::team::handle(&graph.orchestrator, args.command, cli.json).await
        }
        Commands::Agent(args) => {
            commands::agent::handle(&graph.lifecycle, args.command, cli.json).await
        }
        Commands::Event(args) => {
            commands::event::handle(&graph.bus, &graph.events, args.command, cli.json).await
        }
        Commands::Budget(args) => {
            commands::budget::handle(&graph.budget, args.command, cli.json).await
        }
        Commands::Run => run_foreground(&graph).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error);
            ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(1))
        }
    }
}

/// Run until interrupted, then shut the lifecycle down gracefully.
async fn run_foreground(graph: &CoreGraph) -> Result<(), CoreError> {
    tracing::info!("drover orchestrator running; press ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    graph
        .lifecycle
        .shutdown(std::time::Duration::from_secs(graph.config.orchestrator.shutdown_grace_secs))
        .await
}

fn report_error(error: &CoreError) {
    match error {
        CoreError::Internal { correlation_id, .. } => {
            // Internal detail stays in the logs; the operator gets the
            // correlation id to find it.
            eprintln!("error: internal error (correlation {correlation_id})");
        }
        other => eprintln!("error [{}]: {other}", other.kind()),
    }
}
