//! testbridge CLI
//!
//! Discovers and runs a workspace's tests through the runner plugins and
//! prints the reconciled tree or the run results.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testbridge_common::TestProvider;
use testbridge_host::run::RunEvent;
use testbridge_host::{
    reconciler, CommandSpawner, HostConfig, RunProfile, TestRun, TracingOutput, TracingTelemetry,
    WorkspaceTestAdapter,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "testbridge")]
#[command(about = "testbridge - test discovery and execution through runner subprocesses")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TESTBRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Python interpreter
    #[arg(long, env = "TESTBRIDGE_PYTHON", global = true)]
    python: Option<String>,

    /// Directory holding the runner plugins
    #[arg(long, env = "TESTBRIDGE_PLUGIN_DIR", global = true)]
    plugin_dir: Option<PathBuf>,

    /// Test framework
    #[arg(long, global = true)]
    framework: Option<TestProvider>,

    /// Output format
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Indented tree / one line per result
    #[default]
    Text,
    /// JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover tests and print the tree
    Discover {
        /// Workspace folder
        workspace: PathBuf,
    },

    /// Discover, then run tests (every test when no ids are given)
    Run {
        /// Workspace folder
        workspace: PathBuf,

        /// Entity ids to run; folders and files expand to their tests
        ids: Vec<String>,

        /// Run as a debug session (pytest output is not captured)
        #[arg(long)]
        no_capture: bool,

        /// Collect per-file coverage (pytest only)
        #[arg(long, conflicts_with = "no_capture")]
        coverage: bool,
    },

    /// Write the effective configuration to a file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for results
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let (plain, json) = if cli.log_json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HostConfig::default(),
    };
    if let Some(python) = cli.python {
        config.python = python;
    }
    if let Some(plugin_dir) = cli.plugin_dir {
        config.plugin_dir = plugin_dir;
    }
    if let Some(framework) = cli.framework {
        config.testing.framework = framework;
    }

    match cli.command {
        Commands::InitConfig { path } => {
            config.save(&path)?;
            info!("Wrote configuration to {}", path.display());
            Ok(())
        }
        Commands::Discover { workspace } => {
            let adapter = build_adapter(&workspace, &config)?;
            let cancel = cancel_on_interrupt();
            adapter
                .discover_tests(&cancel)
                .await
                .map_err(|e| anyhow!("Discovery failed: {}", e))?;
            print_tree(&adapter, cli.format)?;
            Ok(())
        }
        Commands::Run {
            workspace,
            ids,
            no_capture,
            coverage,
        } => {
            let adapter = build_adapter(&workspace, &config)?;
            let cancel = cancel_on_interrupt();
            adapter
                .discover_tests(&cancel)
                .await
                .map_err(|e| anyhow!("Discovery failed: {}", e))?;

            let includes = if ids.is_empty() {
                vec![reconciler::workspace_root_id(adapter.workspace())]
            } else {
                ids
            };
            let profile = if coverage {
                RunProfile::Coverage
            } else if no_capture {
                RunProfile::Debug
            } else {
                RunProfile::Run
            };
            let run = adapter
                .execute_tests(&includes, &cancel, profile)
                .await
                .map_err(|e| anyhow!("Execution failed: {}", e))?;

            print_run(&run, cli.format)?;
            let summary = run.summary();
            if summary.failed + summary.errored > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn build_adapter(workspace: &Path, config: &HostConfig) -> anyhow::Result<WorkspaceTestAdapter> {
    // Absolute but not canonical: a symlinked workspace must keep its path
    let workspace = if workspace.is_absolute() {
        workspace.to_path_buf()
    } else {
        std::env::current_dir()?.join(workspace)
    };
    if !workspace.is_dir() {
        return Err(testbridge_common::Error::WorkspaceNotFound(workspace.display().to_string()).into());
    }
    std::fs::create_dir_all(config.pipe_dir())?;

    info!(
        "testbridge v{} using {} for {}",
        testbridge_common::VERSION,
        config.testing.framework,
        workspace.display()
    );
    Ok(WorkspaceTestAdapter::for_runner(
        workspace,
        config,
        Arc::new(CommandSpawner),
        Arc::new(TracingOutput),
        Arc::new(TracingTelemetry),
    ))
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt; cancelling");
                token.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });
    cancel
}

fn print_tree(adapter: &WorkspaceTestAdapter, format: OutputFormat) -> anyhow::Result<()> {
    let tree = adapter.tree().lock();
    match format {
        OutputFormat::Text => print!("{}", tree.render()),
        OutputFormat::Json => {
            let mut entities: Vec<_> = tree.entities().collect();
            entities.sort_by(|a, b| a.id.cmp(&b.id));
            println!("{}", serde_json::to_string_pretty(&entities)?);
        }
    }
    Ok(())
}

fn print_run(run: &TestRun, format: OutputFormat) -> anyhow::Result<()> {
    let started: Vec<String> = run
        .events()
        .into_iter()
        .filter_map(|event| match event {
            RunEvent::Started(id) => Some(id),
            _ => None,
        })
        .collect();

    match format {
        OutputFormat::Text => {
            for id in &started {
                match run.result(id) {
                    Some(result) => {
                        println!("{:<8} {}", result.state.to_string(), id);
                        if let Some(message) = result.message {
                            for line in message.text.lines().filter(|l| !l.trim().is_empty()) {
                                println!("         {}", line.trim_end());
                            }
                        }
                    }
                    None => println!("{:<8} {}", "not run", id),
                }
            }
            let s = run.summary();
            println!(
                "\n{} passed, {} failed, {} errored, {} skipped, {} not run",
                s.passed, s.failed, s.errored, s.skipped, s.not_run
            );
            let coverage = run.coverage();
            if !coverage.is_empty() {
                println!();
                for file in coverage {
                    println!(
                        "{:>5}/{:<5} {}",
                        file.lines.covered, file.lines.total, file.path
                    );
                }
            }
        }
        OutputFormat::Json => {
            let results: serde_json::Map<String, serde_json::Value> = started
                .iter()
                .map(|id| -> serde_json::Result<(String, serde_json::Value)> {
                    let value = run
                        .result(id)
                        .map(serde_json::to_value)
                        .transpose()?
                        .unwrap_or(serde_json::Value::Null);
                    Ok((id.clone(), value))
                })
                .collect::<serde_json::Result<_>>()?;
            let report = serde_json::json!({
                "run": run.id(),
                "started_at": run.started_at(),
                "summary": run.summary(),
                "results": results,
                "subtests": run.subtests(),
                "coverage": run.coverage(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
