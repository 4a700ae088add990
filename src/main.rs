//! Bee Code 命令行入口
//!
//! 解析任务输入与配置、构建编排器并运行主循环；最终回答写到 stdout，日志写到 stderr，
//! 退出码区分 DONE / CANCELLED / GUARD_STOPPED 与各类失败。

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use bee_code::config::load_config;
use bee_code::core::{exit_codes, AgentError, Outcome, Session, SessionBuilder, ShutdownManager};
use bee_code::input::resolve_task;
use bee_code::memory::MemoryStore;
use bee_code::react::{load_session, LoopEvent, SessionReport, SoloMode};

#[derive(Parser)]
#[command(
    name = "bee-code",
    version,
    about = "Tool-using coding agent: drives a model through a multi-turn task until it finishes"
)]
struct Cli {
    /// Read the task from a file (wins over --prompt and piped input).
    #[arg(long, value_name = "PATH")]
    prompt_file: Option<PathBuf>,

    /// Inline task text.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Model identifier; overrides CURRENT_MODEL and the config file.
    #[arg(short, long)]
    model: Option<String>,

    /// Auto-continue policy for text-only turns: on, off or auto.
    #[arg(long, value_name = "MODE")]
    solo_mode: Option<SoloMode>,

    /// Extra config file layered over config/default.toml.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Working directory for tools (defaults to the current directory).
    #[arg(short, long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Resume a persisted session by id; the task, if given, is appended as a follow-up.
    #[arg(long, value_name = "SESSION_ID")]
    resume: Option<String>,

    /// Override app.storage_root.
    #[arg(long, value_name = "DIR")]
    storage_root: Option<PathBuf>,

    /// Unattended run (solo mode `auto` resolves to on).
    #[arg(long)]
    batch: bool,

    /// Debug logging unless RUST_LOG is set.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    bee_code::observability::init(cli.verbose);

    let code = match run(cli).await {
        Ok(report) => {
            tracing::info!(
                session = %report.session_id,
                turns = report.turns,
                trajectory = %report.trajectory_path.display(),
                "run complete"
            );
            match &report.outcome {
                Outcome::Done { answer } => println!("{answer}"),
                Outcome::Cancelled => eprintln!(
                    "cancelled; resume with --resume {}",
                    report.session_id
                ),
                Outcome::GuardStopped(g) => eprintln!("{g}"),
            }
            report.outcome.exit_code()
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            err.downcast_ref::<AgentError>()
                .map(AgentError::exit_code)
                .unwrap_or(exit_codes::FAILURE)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<SessionReport> {
    let mut config = load_config(cli.config.clone())?;
    if let Some(mode) = cli.solo_mode {
        config.guard.solo_mode = mode;
    }
    if let Some(root) = cli.storage_root.clone() {
        config.app.storage_root = root;
    }

    let stdin = std::io::stdin();
    let stdin_is_terminal = stdin.is_terminal();
    let unattended = cli.batch || !stdin_is_terminal;

    let mut builder = SessionBuilder::new(config).unattended(unattended);
    if let Some(model) = cli.model.clone() {
        builder = builder.with_model(model);
    }
    let adapter = builder.route_adapter()?;
    let store = builder.session_store();

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LoopEvent>();
    tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&ev) {
                tracing::debug!(event = %line, "loop event");
            }
        }
    });

    if let Some(id) = cli.resume.as_deref() {
        let follow_up = if cli.prompt_file.is_some() || cli.prompt.is_some() {
            Some(resolve_task(cli.prompt_file.as_deref(), cli.prompt.as_deref(), stdin, true)?.0)
        } else {
            None
        };
        let (session, memory) = load_session(&store, id)?;
        let mut orchestrator = builder
            .build(session, memory, adapter)?
            .with_cancel(shutdown.token())
            .with_events(event_tx);
        return Ok(orchestrator.resume(follow_up.as_deref()).await?);
    }

    let (task, source) = resolve_task(
        cli.prompt_file.as_deref(),
        cli.prompt.as_deref(),
        stdin.lock(),
        stdin_is_terminal,
    )?;
    tracing::debug!(source = ?source, "task input");

    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let workdir = workdir
        .canonicalize()
        .map_err(|e| AgentError::Config(format!("workdir {}: {e}", workdir.display())))?;

    let mut orchestrator = builder
        .build(Session::new(workdir), MemoryStore::new(), adapter)?
        .with_cancel(shutdown.token())
        .with_events(event_tx);
    Ok(orchestrator.run(&task).await?)
}
