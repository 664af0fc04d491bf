//! # scribe
//!
//! CLI wrapper over the scribe engine: run a goal end-to-end with the
//! offline capabilities, inspect snapshots, or serve the HTTP API.
//!
//! Exit codes: 0 success, 2 invalid arguments, 3 run failed, 4 cancelled,
//! 5 internal error.

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use scribe_core::engine::{Engine, RunSnapshot};
use scribe_core::event::{EventPayload, SubscriberItem};
use scribe_core::memory::MemoryState;
use scribe_core::scripted::offline_registry;
use scribe_core::viz::{render, VizFormat};
use scribe_core::{EngineError, GraphView, Mode, RunManager, ScribeConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 2;
const EXIT_RUN_FAILED: u8 = 3;
const EXIT_CANCELLED: u8 = 4;
const EXIT_INTERNAL: u8 = 5;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Recursive planning engine for long-form generation", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding run snapshots and caches.
    #[arg(long, global = true, default_value = "./scribe-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliMode {
    Story,
    Report,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Story => Mode::Story,
            CliMode::Report => Mode::Report,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ShowFormat {
    Text,
    Dot,
    Mermaid,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a goal to completion and print or save the artifact
    Run {
        /// Root goal, e.g. "write a report on urban beekeeping"
        goal: String,

        #[arg(long, value_enum, default_value = "report")]
        mode: CliMode,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the artifact here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Suppress per-step progress lines
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the status of a stored run
    Status {
        /// Run id under the data directory
        run_id: String,
    },

    /// Inspect a run snapshot (graph and article)
    Show {
        /// Run id under the data directory
        run_id: String,

        #[arg(long, value_enum, default_value = "text")]
        format: ShowFormat,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            goal,
            mode,
            config,
            output,
            quiet,
        } => cmd_run(&cli.data_dir, goal, mode.into(), config, output, quiet).await,
        Commands::Status { run_id } => cmd_status(&cli.data_dir, &run_id),
        Commands::Show { run_id, format } => cmd_show(&cli.data_dir, &run_id, format),
        Commands::Serve { addr } => cmd_serve(&cli.data_dir, &addr).await,
    };
    ExitCode::from(code)
}

async fn cmd_run(
    data_dir: &Path,
    goal: String,
    mode: Mode,
    config_path: Option<PathBuf>,
    output: Option<PathBuf>,
    quiet: bool,
) -> u8 {
    let mut config = match config_path {
        Some(path) => match ScribeConfig::from_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_USAGE;
            }
        },
        None => ScribeConfig::for_mode(mode),
    };
    config.mode = mode;
    config = config.with_env_overrides();
    if config.cache.dir.is_none() {
        config.cache.dir = Some(data_dir.join("cache"));
    }

    let run_id = uuid_like();
    let engine = match Engine::new(run_id.clone(), goal, config, offline_registry()) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            eprintln!("error: {err}");
            return EXIT_INTERNAL;
        }
    };

    if !quiet {
        let mut events = Box::pin(engine.bus().subscribe(0));
        tokio::spawn(async move {
            while let Some(item) = events.next().await {
                if let SubscriberItem::Event(record) = item {
                    match &record.payload {
                        EventPayload::StepStarted { nid, action } => {
                            eprintln!("  -> {nid} {action}");
                        }
                        EventPayload::StepFinished { nid, action, status } => {
                            eprintln!("  <- {nid} {action} [{status}]");
                        }
                        EventPayload::RunFinished { reason, .. } => {
                            eprintln!("run finished: {reason:?}");
                        }
                        _ => {}
                    }
                }
            }
        });
    }

    // Ctrl-C requests cooperative cancellation; in-flight calls drain.
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let outcome = engine.run_until_done().await;
    let snapshot_dir = data_dir.join(&run_id);
    if let Err(err) = engine.save_snapshot(&snapshot_dir) {
        eprintln!("warning: failed to write snapshot: {err}");
    }

    match outcome {
        Ok(artifact) => {
            match output {
                Some(path) => {
                    if let Err(err) = std::fs::write(&path, &artifact) {
                        eprintln!("error: failed to write {}: {err}", path.display());
                        return EXIT_INTERNAL;
                    }
                    eprintln!("artifact written to {}", path.display());
                }
                None => println!("{artifact}"),
            }
            eprintln!("run {run_id} complete");
            EXIT_OK
        }
        Err(EngineError::Cancelled) => {
            eprintln!("run {run_id} cancelled");
            EXIT_CANCELLED
        }
        Err(err) => {
            eprintln!("run {run_id} failed: {err}");
            EXIT_RUN_FAILED
        }
    }
}

fn load_run(data_dir: &Path, run_id: &str) -> Result<(RunSnapshot, MemoryState, String), u8> {
    let dir = data_dir.join(run_id);
    if !scribe_store::snapshot_exists(&dir) {
        eprintln!("error: no run '{run_id}' under {}", data_dir.display());
        return Err(EXIT_USAGE);
    }
    scribe_store::load_snapshot(&dir).map_err(|err| {
        eprintln!("error: unreadable snapshot: {err}");
        EXIT_INTERNAL
    })
}

fn cmd_status(data_dir: &Path, run_id: &str) -> u8 {
    let (snapshot, _, _) = match load_run(data_dir, run_id) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let arena = &snapshot.arena;
    let (finished, total) = arena.progress();
    let root_status = arena
        .get(arena.root())
        .map(|n| n.status.to_string())
        .unwrap_or_default();
    let done = scribe_store::is_done(&data_dir.join(run_id));

    println!("run:        {run_id}");
    println!("mode:       {}", snapshot.config.mode);
    println!("root:       {root_status}");
    println!("nodes:      {finished}/{total} finished");
    println!("completed:  {}", if done { "yes" } else { "no" });
    EXIT_OK
}

fn cmd_show(data_dir: &Path, run_id: &str, format: ShowFormat) -> u8 {
    let (snapshot, _, article) = match load_run(data_dir, run_id) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let view = snapshot.arena.hierarchy_view();
    match format {
        ShowFormat::Text => {
            print_tree(&view, 0);
            if !article.is_empty() {
                println!("\n--- article ---\n{article}");
            }
        }
        ShowFormat::Dot => print!("{}", render(&view, VizFormat::Dot)),
        ShowFormat::Mermaid => print!("{}", render(&view, VizFormat::Mermaid)),
    }
    EXIT_OK
}

fn print_tree(view: &GraphView, depth: usize) {
    let indent = "  ".repeat(depth);
    let deps = if view.dependencies.is_empty() {
        String::new()
    } else {
        format!(" (after {})", view.dependencies.join(", "))
    };
    println!(
        "{indent}{} [{}] {}: {}{deps}",
        view.nid, view.status, view.task_type, view.goal
    );
    for child in &view.children {
        print_tree(child, depth + 1);
    }
}

async fn cmd_serve(data_dir: &Path, addr: &str) -> u8 {
    let manager = match RunManager::new(data_dir, offline_registry()) {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            eprintln!("error: {err}");
            return EXIT_INTERNAL;
        }
    };
    match scribe_server::serve(manager, addr).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("error: {err}");
            EXIT_INTERNAL
        }
    }
}

fn uuid_like() -> String {
    // Run ids come from the manager in server mode; the CLI mints its own.
    uuid::Uuid::new_v4().to_string()
}
