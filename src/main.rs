//! devops-agent CLI entry point.
//!
//! `monitor` runs the log-watching daemon; the other subcommands are
//! one-shot helpers around the same configuration and model endpoint.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use devops_agent::config::{self, AgentConfig, RuntimePaths};
use devops_agent::credentials;
use devops_agent::logging;
use devops_agent::monitor::analysis::{AnalysisClient, AnalysisRequest};
use devops_agent::monitor::engine::MonitorLoop;
use devops_agent::monitor::sink::{ConsoleSink, FanoutSink, JsonlSink, TracingSink};
use devops_agent::monitor::wake;
use devops_agent::prompts;
use devops_agent::providers::openrouter::{OpenRouterApi, OpenRouterProvider};
use devops_agent::providers::LlmProvider;
use devops_agent::setup::{self, SetupOptions};

/// Timeout for setup-time calls (key validation, model catalog).
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// DevOps AI agent for error analysis and tool installation.
#[derive(Parser)]
#[command(name = "devops-agent", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run first-time setup or reconfigure.
    Setup {
        /// OpenRouter API key.
        #[arg(long)]
        api_key: Option<String>,
        /// Model ID to use.
        #[arg(long)]
        model: Option<String>,
    },
    /// Analyze an error.
    Analyze {
        /// Path to an error log file.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Error text to analyze.
        #[arg(short, long, conflicts_with = "file")]
        text: Option<String>,
    },
    /// Get installation instructions for a tool.
    Install {
        /// Name of the tool to install.
        #[arg(short, long)]
        tool: Option<String>,
    },
    /// List the available models.
    Models,
    /// Start continuous error monitoring.
    Monitor,
    /// Scan the configured log files once and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = config::runtime_paths()?;

    let _logging_guard = match cli.command {
        Command::Monitor => Some(logging::init_daemon(&paths.logs_dir)?),
        _ => {
            logging::init_cli();
            None
        }
    };

    match cli.command {
        Command::Setup { api_key, model } => {
            handle_setup(&paths, SetupOptions { api_key, model }).await
        }
        Command::Analyze { file, text } => {
            let config = ensure_config(&paths).await?;
            handle_analyze(&config, file.as_deref(), text).await
        }
        Command::Install { tool } => {
            let config = ensure_config(&paths).await?;
            handle_install(&config, tool).await
        }
        Command::Models => {
            let config = ensure_config(&paths).await?;
            handle_models(&config).await
        }
        Command::Monitor => {
            let config = ensure_config(&paths).await?;
            handle_monitor(&config, &paths).await
        }
        Command::Check => {
            let config = ensure_config(&paths).await?;
            handle_check(&config).await
        }
    }
}

/// Run the setup wizard and save the result.
async fn handle_setup(paths: &RuntimePaths, options: SetupOptions) -> anyhow::Result<()> {
    let existing = if paths.config_toml.exists() {
        match config::load_config(&paths.config_toml) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "existing config unreadable, starting from defaults");
                None
            }
        }
    } else {
        None
    };
    let base_url = existing
        .as_ref()
        .map(|c| c.analysis.base_url.clone())
        .unwrap_or_else(|| config::AnalysisConfig::default().base_url);
    let api = OpenRouterApi::new(base_url, SETUP_TIMEOUT).context("failed to build HTTP client")?;

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();
    let config = setup::run_wizard(&api, options, existing, &mut input, &mut out).await?;

    writeln!(out, "\nSaving configuration...")?;
    config
        .save(&paths.config_toml)
        .with_context(|| format!("failed to save {}", paths.config_toml.display()))?;
    writeln!(out, "\nSetup completed successfully!")?;
    Ok(())
}

/// Load the configuration, running the wizard first if none exists.
async fn ensure_config(paths: &RuntimePaths) -> anyhow::Result<AgentConfig> {
    if !paths.config_toml.exists() {
        info!("no configuration found, running first-time setup");
        handle_setup(paths, SetupOptions::default()).await?;
    }

    let mut config = config::load_config(&paths.config_toml)?;
    let creds = credentials::load_optional_credentials(&paths.env_file)
        .with_context(|| format!("failed to load {}", paths.env_file.display()))?;
    if let Some(key) = credentials::resolve_api_key(&config.api_key, &creds) {
        config.api_key = key;
    }
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", paths.config_toml.display()))?;
    Ok(config)
}

fn build_provider(config: &AgentConfig) -> Arc<dyn LlmProvider> {
    Arc::new(OpenRouterProvider::new(
        config.analysis.base_url.clone(),
        config.model.clone(),
        config.api_key.clone(),
    ))
}

/// Read lines from `input` until a line reading `DONE` or end of input.
fn read_until_done<R: BufRead>(input: R) -> io::Result<String> {
    let mut lines = Vec::new();
    for line in input.lines() {
        let line = line?;
        if line.trim() == "DONE" {
            break;
        }
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

/// One-shot analysis of a file, a string, or pasted text.
async fn handle_analyze(
    config: &AgentConfig,
    file: Option<&Path>,
    text: Option<String>,
) -> anyhow::Result<()> {
    let (source_id, error_text) = match (file, text) {
        (Some(path), _) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            (path.display().to_string(), contents)
        }
        (None, Some(text)) => ("cli".to_owned(), text),
        (None, None) => {
            println!("Enter the error text to analyze (type 'DONE' on a new line when finished):");
            let text = read_until_done(io::stdin().lock()).context("failed to read stdin")?;
            ("stdin".to_owned(), text)
        }
    };
    if error_text.trim().is_empty() {
        anyhow::bail!("nothing to analyze");
    }

    let client = AnalysisClient::new(build_provider(config), &config.analysis);
    let request = AnalysisRequest::one_shot(source_id, &error_text);
    println!("\nAnalyzing error...\n");
    let result = client.analyze(&request).await;
    let analysis = result
        .outcome
        .with_context(|| format!("analysis {} failed", result.correlation_id))?;
    println!("{analysis}");
    Ok(())
}

/// Ask the model for installation instructions.
async fn handle_install(config: &AgentConfig, tool: Option<String>) -> anyhow::Result<()> {
    let tool = match tool {
        Some(tool) => tool,
        None => {
            print!("Enter the name of the tool to install: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read stdin")?;
            line.trim().to_owned()
        }
    };
    if tool.is_empty() {
        anyhow::bail!("no tool name given");
    }

    let client = AnalysisClient::new(build_provider(config), &config.analysis);
    println!("\nGetting installation instructions for {tool}...\n");
    let result = client.ask(prompts::install_instructions(&tool)).await;
    let instructions = result
        .outcome
        .context("failed to get installation instructions")?;
    println!("{instructions}");
    Ok(())
}

/// Print the model catalog.
async fn handle_models(config: &AgentConfig) -> anyhow::Result<()> {
    let api = OpenRouterApi::new(config.analysis.base_url.clone(), SETUP_TIMEOUT)
        .context("failed to build HTTP client")?;
    let models = api
        .list_models(&config.api_key, &config.catalog.fallback_models)
        .await;
    for (i, model) in models.iter().enumerate() {
        let marker = if *model == config.model { " (current)" } else { "" };
        println!("{}. {model}{marker}", i.saturating_add(1));
    }
    Ok(())
}

/// Run the monitor loop until Ctrl-C.
async fn handle_monitor(config: &AgentConfig, paths: &RuntimePaths) -> anyhow::Result<()> {
    let monitoring = &config.error_monitoring;
    if !monitoring.enabled {
        info!("error monitoring is disabled in configuration");
        return Ok(());
    }
    if monitoring.log_files.is_empty() {
        anyhow::bail!(
            "no log files configured; add paths to error_monitoring.log_files in {}",
            paths.config_toml.display()
        );
    }

    let jsonl = JsonlSink::open(&paths.results_jsonl)
        .with_context(|| format!("failed to open {}", paths.results_jsonl.display()))?;
    let sink = Arc::new(FanoutSink::new().with(TracingSink).with(jsonl));
    let monitor = MonitorLoop::from_config(
        config,
        build_provider(config),
        sink,
        Some(paths.cursor_state.clone()),
    )
    .context("failed to start monitor")?;
    let handle = monitor.handle();

    let _watcher = if monitoring.wake_on_change {
        match wake::spawn_change_watcher(&monitor.source_paths(), handle.wake_signal()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "change notifications unavailable, polling only");
                None
            }
        }
    } else {
        None
    };

    info!(
        model = %config.model,
        files = ?monitoring.log_files,
        "starting error monitoring"
    );

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        shutdown.shutdown();
    });

    monitor.run().await;
    Ok(())
}

/// Scan the configured files once and print results.
async fn handle_check(config: &AgentConfig) -> anyhow::Result<()> {
    if config.error_monitoring.log_files.is_empty() {
        anyhow::bail!("no log files configured under error_monitoring.log_files");
    }
    let sink = Arc::new(ConsoleSink::stdout());
    let mut monitor = MonitorLoop::from_config(config, build_provider(config), sink, None)
        .context("failed to build monitor")?;

    let summary = monitor.tick().await;
    monitor.stop();
    println!(
        "\nScanned {} lines: {} matches, {} analyzed, {} suppressed, {} failed, {} unreadable sources",
        summary.lines_read,
        summary.matches,
        summary.analyzed,
        summary.suppressed,
        summary.failed,
        summary.source_errors
    );
    Ok(())
}
