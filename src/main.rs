//! Frameflow CLI - run frame pipelines across a worker pool.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use frameflow::config::{PoolMode, RunConfig};
use frameflow::execution::{Runner, run_worker_process};
use frameflow::logging;
use frameflow::plugin::{PluginKind, PluginRegistry};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// One process per worker
    Process,
    /// One thread per worker
    Thread,
}

impl From<ModeArg> for PoolMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Process => PoolMode::Process,
            ModeArg::Thread => PoolMode::Thread,
        }
    }
}

#[derive(Parser)]
#[command(name = "frameflow", version)]
#[command(about = "Per-frame processing pipelines for live detector data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the app described by a configuration file
    Run {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Stop after this many items; runs until interrupted otherwise
        #[arg(long)]
        frames: Option<u64>,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,

        /// Override the configured pool mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },

    /// List registered plugins
    Plugins {
        /// Plugin directory to scan, in addition to the built-ins
        #[arg(long = "dir")]
        dirs: Vec<PathBuf>,

        /// Only list plugins of this kind
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Worker process entry point (started by the controller)
    #[command(hide = true)]
    Worker {
        /// Inherited controller socket
        #[arg(long)]
        fd: RawFd,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    /// Produces frames from an index
    Input,
    /// Transforms frames
    Processing,
    /// Consumes frames
    Output,
}

impl From<KindArg> for PluginKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Input => PluginKind::Input,
            KindArg::Processing => PluginKind::Processing,
            KindArg::Output => PluginKind::Output,
        }
    }
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Run {
            config,
            frames,
            workers,
            mode,
        } => run(config, frames, workers, mode),
        Command::Plugins { dirs, kind } => list_plugins(dirs, kind),
        Command::Worker { fd } => worker(fd),
    }
}

fn run(
    path: PathBuf,
    frames: Option<u64>,
    workers: Option<usize>,
    mode: Option<ModeArg>,
) -> Result<()> {
    let mut config = RunConfig::load(&path)
        .with_context(|| format!("loading configuration {}", path.display()))?;
    if let Some(workers) = workers {
        config.pool.workers = workers;
    }
    if let Some(mode) = mode {
        config.pool.mode = mode.into();
    }
    config.validate()?;
    logging::init(&config.log_level);

    let runner = Runner::new(config);
    let stop = runner.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!("stopping; waiting for workers to finish");
        stop.stop();
    })
    .context("installing Ctrl-C handler")?;

    let (_app, summary) = runner.run(frames)?;
    println!(
        "completed {} item(s), {} failed, in {:.2?}",
        summary.completed, summary.failed, summary.elapsed
    );
    if summary.completed == 0 && summary.failed > 0 {
        bail!("every item failed");
    }
    Ok(())
}

fn list_plugins(dirs: Vec<PathBuf>, kind: Option<KindArg>) -> Result<()> {
    logging::init("warn");
    let registry = PluginRegistry::with_builtins();
    for dir in &dirs {
        let report = registry
            .discover(dir, false)
            .with_context(|| format!("scanning {}", dir.display()))?;
        for (path, reason) in &report.rejected {
            eprintln!("skipped {}: {reason}", path.display());
        }
    }

    let names = match kind {
        Some(kind) => registry.plugins_of_kind(kind.into()),
        None => registry.list_plugins(),
    };
    for name in names {
        if let Some(class) = registry.class(&name) {
            println!(
                "{:<20} {:<11} {}",
                class.name,
                class.kind.to_string(),
                class.description
            );
        }
    }
    Ok(())
}

fn worker(fd: RawFd) -> Result<()> {
    logging::init("info");
    // Ctrl-C reaches the whole process group; the controller decides when
    // workers stop.
    ctrlc::set_handler(|| {}).context("ignoring Ctrl-C in worker")?;
    // SAFETY: the controller passes the inherited socket's descriptor number
    // and nothing else in this process owns it.
    let socket = UnixStream::from(unsafe { OwnedFd::from_raw_fd(fd) });
    run_worker_process(socket)?;
    Ok(())
}
