//! CLI definitions and command handling.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::engine::Engine;
use crate::error::RunError;
use crate::planner::PlanOptions;

/// Default bind address for `--serve`.
const DEFAULT_ADDR: &str = "127.0.0.1:8700";

/// Exit code for configuration problems (bad flags, missing keys).
const EXIT_CONFIGURATION: i32 = 4;

/// Multi-model LLM orchestrator.
#[derive(Parser, Debug)]
#[command(name = "ai3")]
#[command(about = "Plan, route, execute, verify and assemble LLM work across providers")]
#[command(version)]
#[command(
    long_about = "ai3 decomposes a prompt into a task graph, routes each task to the \
best available model, executes tasks concurrently under global and per-provider caps, \
verifies and repairs outputs, and assembles a single response.\n\nExample usage:\n  \
ai3 \"Summarize the latest Rust release notes\"\n  ai3 --stream \"Draft a launch plan\"\n  \
ai3 --serve"
)]
pub struct Cli {
    /// Prompt to orchestrate; required unless --serve is given.
    pub prompt: Option<String>,

    /// Print run events as JSON lines instead of just the final response.
    #[arg(long)]
    pub stream: bool,

    /// Global cap on concurrently executing tasks.
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,

    /// Per-provider cap on concurrently executing tasks.
    #[arg(long, value_name = "N")]
    pub max_concurrency_per_provider: Option<usize>,

    /// Model used by the planner.
    #[arg(long, value_name = "M")]
    pub planner_model: Option<String>,

    /// Disable artifact verification (and with it, repair).
    #[arg(long)]
    pub no_verify: bool,

    /// Repair budget for tasks that do not set their own.
    #[arg(long, value_name = "N")]
    pub repair_limit: Option<u32>,

    /// Start the HTTP server instead of running a prompt.
    #[arg(long)]
    pub serve: bool,

    /// Bind address for --serve.
    #[arg(long, default_value = DEFAULT_ADDR, env = "AI3_ADDR")]
    pub addr: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Applies flag overrides on top of environment-derived settings.
fn settings_from(cli: &Cli) -> Result<Settings, RunError> {
    let mut settings =
        Settings::from_env().map_err(|e| RunError::Configuration(e.to_string()))?;

    if let Some(n) = cli.max_concurrency {
        settings.max_concurrency = n;
    }
    if let Some(n) = cli.max_concurrency_per_provider {
        settings.max_concurrency_per_provider = n;
    }
    if let Some(model) = &cli.planner_model {
        settings.planner_model = model.clone();
    }
    if cli.no_verify {
        settings.verify = false;
    }
    if let Some(n) = cli.repair_limit {
        settings.repair_limit = n;
    }
    Ok(settings)
}

/// Runs the CLI to completion and returns the process exit code:
/// 0 success, 1 plan error, 2 all candidates failed, 3 cancelled or timed
/// out, 4 configuration error.
pub async fn run_with_cli(cli: Cli) -> i32 {
    let settings = match settings_from(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return EXIT_CONFIGURATION;
        }
    };

    let engine = match Engine::from_settings(settings) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "Could not start engine");
            return e.exit_code();
        }
    };

    if cli.serve {
        return serve(engine, &cli.addr).await;
    }

    let prompt = match &cli.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            error!("No prompt given; pass a prompt or --serve");
            return EXIT_CONFIGURATION;
        }
    };

    // Ctrl-C cancels the run; the engine fails outstanding tasks and
    // persists the partial trace before exiting.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    if cli.stream {
        run_streaming(engine, prompt, cancel).await
    } else {
        run_oneshot(engine, prompt, cancel).await
    }
}

async fn run_oneshot(engine: Arc<Engine>, prompt: String, cancel: CancellationToken) -> i32 {
    match engine
        .run_cancellable(&prompt, PlanOptions::default(), cancel)
        .await
    {
        Ok(outcome) => {
            println!("{}", outcome.content);
            for warning in &outcome.warnings {
                warn!(warning = %warning, "Partial result");
            }
            info!(
                run_id = %outcome.run_id,
                confidence = outcome.confidence,
                tasks_executed = outcome.stats.tasks_executed,
                tasks_repaired = outcome.stats.tasks_repaired,
                tasks_failed = outcome.stats.tasks_failed,
                tokens_in = outcome.stats.tokens_in,
                tokens_out = outcome.stats.tokens_out,
                "Run complete"
            );
            0
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            e.exit_code()
        }
    }
}

async fn run_streaming(engine: Arc<Engine>, prompt: String, cancel: CancellationToken) -> i32 {
    let (mut rx, handle) = engine.run_stream(prompt, PlanOptions::default(), cancel);

    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Could not serialize event"),
        }
    }

    match handle.await {
        Ok(Ok(_)) => 0,
        Ok(Err(e)) => {
            error!(error = %e, "Run failed");
            e.exit_code()
        }
        Err(e) => {
            error!(error = %e, "Run task panicked");
            2
        }
    }
}

async fn serve(engine: Arc<Engine>, addr: &str) -> i32 {
    let addr: std::net::SocketAddr = match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %addr, error = %e, "Invalid bind address");
            return EXIT_CONFIGURATION;
        }
    };
    match crate::server::serve(engine, addr).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Server failed");
            EXIT_CONFIGURATION
        }
    }
}
