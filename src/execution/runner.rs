//! Controller main loop: prepare the app, start the pool, feed indices,
//! collect results, shut down.

use super::app::App;
use super::pool::WorkerPool;
use crate::apps::{build_controller, build_worker};
use crate::config::{PoolMode, RunConfig};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long the controller blocks on the result queue per iteration.
const RESULT_POLL: Duration = Duration::from_millis(100);

/// Items kept queued per worker.
const ITEMS_PER_WORKER: usize = 2;

/// Counts for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Items with a successful result.
    pub completed: u64,
    /// Items whose cycle failed.
    pub failed: u64,
    /// Wall time from pool start to shutdown.
    pub elapsed: Duration,
}

/// Requests an orderly end of a running [`Runner`].
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Stop submitting new items; outstanding items are still collected.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs a configured app across a worker pool.
#[derive(Debug)]
pub struct Runner {
    config: RunConfig,
    worker_exe: Option<PathBuf>,
    stop: StopHandle,
}

impl Runner {
    /// Runner for `config`.
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            worker_exe: None,
            stop: StopHandle::default(),
        }
    }

    /// Executable started for process workers; defaults to the current one.
    pub fn with_worker_executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(exe.into());
        self
    }

    /// Handle for ending the run from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run until `frames` items have been processed, or until stopped if
    /// `frames` is `None`. Returns the controller app with everything it
    /// collected.
    pub fn run(&self, frames: Option<u64>) -> Result<(Box<dyn App>, RunSummary)> {
        let config = &self.config;
        let registry = config.plugins.build_registry()?;
        let mut app = build_controller(config, registry.clone())?;
        app.prepare()?;
        let buffer = app.shared_buffer();

        let pool = match config.pool.mode {
            PoolMode::Thread => {
                let worker_config = config.clone();
                let worker_buffer = buffer.clone();
                WorkerPool::spawn_threads(
                    config.pool.workers,
                    config.pool.worker_config(),
                    buffer,
                    move |_| build_worker(&worker_config, registry.clone(), worker_buffer.clone()),
                )?
            }
            PoolMode::Process => {
                let exe = match &self.worker_exe {
                    Some(exe) => exe.clone(),
                    None => std::env::current_exe()?,
                };
                WorkerPool::spawn_processes(exe, config, buffer)?
            }
        };

        let summary = drive(
            app.as_mut(),
            pool,
            frames,
            config.pool.finish_timeout(),
            &self.stop,
        )?;
        Ok((app, summary))
    }
}

/// Feed `pool` from `app.start_index()` and hand every result to
/// `app.store_result`.
///
/// At most `workers * 2` items are outstanding so that a stop leaves little
/// queued work behind. A worker that exits on its own ends the run: the rest
/// are stopped and the worker's error is returned.
pub fn drive(
    app: &mut dyn App,
    mut pool: WorkerPool,
    frames: Option<u64>,
    finish_timeout: Duration,
    stop: &StopHandle,
) -> Result<RunSummary> {
    let started = Instant::now();
    let first = app.start_index();
    let limit = frames.map(|n| first.saturating_add(n));
    let window = pool.workers() * ITEMS_PER_WORKER;
    let mut summary = RunSummary::default();
    let mut next = first;
    let mut outstanding = 0usize;
    let mut stopped_early = false;

    info!(app = app.name(), first, ?frames, workers = pool.workers(), "Run started");
    loop {
        if pool.poll_finished() > 0 {
            warn!(
                finished = pool.finished_count(),
                outstanding, "Worker exited before the run completed"
            );
            pool.stop();
            pool.wait_finished(finish_timeout)?;
            return Err(Error::Disconnected(
                "worker exited before the run completed".into(),
            ));
        }
        while !stop.is_stopped() && outstanding < window && limit.is_none_or(|l| next < l) {
            pool.submit(next)?;
            next += 1;
            outstanding += 1;
        }
        if outstanding == 0 {
            break;
        }

        let (index, result) = match pool.recv_result(RESULT_POLL) {
            Ok(Some(r)) => r,
            Ok(None) if stop.is_stopped() => {
                // Held items may wait forever on a quiet directory.
                pool.stop();
                stopped_early = true;
                break;
            }
            Ok(None) => continue,
            Err(Error::Disconnected(reason)) => {
                warn!(%reason, outstanding, "Workers gone before the run completed");
                pool.wait_finished(finish_timeout)?;
                return Err(Error::Disconnected(reason));
            }
            Err(e) => return Err(e),
        };
        outstanding -= 1;
        if result.is_failed() {
            summary.failed += 1;
        } else {
            summary.completed += 1;
        }
        app.store_result(index, result)?;
    }

    if !stopped_early {
        pool.submit_terminal()?;
    }
    pool.wait_finished(finish_timeout)?;
    summary.elapsed = started.elapsed();
    info!(
        completed = summary.completed,
        failed = summary.failed,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Run finished"
    );
    Ok(summary)
}
