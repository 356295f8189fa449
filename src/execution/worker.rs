//! The per-worker processing loop.

use super::app::App;
use super::item::{ItemResult, WorkItem};
use crate::error::{Error, Result};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default sleep at the end of every cycle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default wait for the next input item.
pub const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_millis(10);

/// Timing knobs for a [`WorkerLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep at the end of every cycle.
    pub poll_interval: Duration,
    /// Bounded wait when pulling from the input channel.
    pub input_timeout: Duration,
    /// Fallback compute budget for apps that do not declare one.
    pub compute_budget: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            input_timeout: DEFAULT_INPUT_TIMEOUT,
            compute_budget: None,
        }
    }
}

/// The four channels a worker communicates through.
#[derive(Clone)]
pub struct WorkerChannels {
    /// Work items from the controller.
    pub input: Receiver<WorkItem>,
    /// `(index, result)` pairs back to the controller.
    pub output: Sender<(u64, ItemResult)>,
    /// Termination tokens.
    pub stop: Receiver<()>,
    /// Exit acknowledgement; carries the worker id.
    pub finished: Sender<usize>,
}

/// Controller-side ends matching a set of [`WorkerChannels`].
pub struct ControllerChannels {
    /// Send work items.
    pub input: Sender<WorkItem>,
    /// Receive results.
    pub output: Receiver<(u64, ItemResult)>,
    /// Send termination tokens.
    pub stop: Sender<()>,
    /// Receive exit acknowledgements.
    pub finished: Receiver<usize>,
}

/// Create a connected pair of channel sets.
///
/// Worker ends can be cloned for any number of workers; each worker consumes
/// items and stop tokens from the shared queues.
pub fn channel_pair() -> (ControllerChannels, WorkerChannels) {
    let (input_tx, input_rx) = kanal::unbounded();
    let (output_tx, output_rx) = kanal::unbounded();
    let (stop_tx, stop_rx) = kanal::unbounded();
    let (finished_tx, finished_rx) = kanal::unbounded();
    (
        ControllerChannels {
            input: input_tx,
            output: output_rx,
            stop: stop_tx,
            finished: finished_rx,
        },
        WorkerChannels {
            input: input_rx,
            output: output_tx,
            stop: stop_rx,
            finished: finished_tx,
        },
    )
}

/// Drives one [`App`] instance until stopped.
///
/// Each cycle:
///
/// 1. A pending stop token ends the loop.
/// 2. If the previous cycle advanced, pull the next item, waiting at most
///    `input_timeout`; a timeout yields [`WorkItem::Idle`], a terminal marker
///    ends the loop.
/// 3. `pre_cycle(item)`, then `carry_on()`. A closed gate keeps the item.
/// 4. Compute and send `(index, result)`.
/// 5. Sleep `poll_interval`.
///
/// On exit exactly one finished token is sent, whatever the reason.
pub struct WorkerLoop {
    id: usize,
    app: Box<dyn App>,
    channels: WorkerChannels,
    config: WorkerConfig,
}

impl WorkerLoop {
    /// Create a loop for worker `id`.
    pub fn new(
        id: usize,
        app: Box<dyn App>,
        channels: WorkerChannels,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            app,
            channels,
            config,
        }
    }

    /// Run until a stop token, a terminal marker, or a run-terminating error.
    pub fn run(mut self) -> Result<()> {
        let result = self.run_cycles();
        if let Err(e) = &result {
            error!(worker = self.id, app = self.app.name(), error = %e, "Worker terminated");
        }
        if self.channels.finished.send(self.id).is_err() {
            warn!(worker = self.id, "Controller gone before finished acknowledgement");
        }
        result
    }

    fn run_cycles(&mut self) -> Result<()> {
        self.app.prepare()?;
        info!(worker = self.id, app = self.app.name(), "Worker started");

        let budget = self.app.compute_budget().or(self.config.compute_budget);
        let mut item = WorkItem::Idle;
        let mut advance = true;
        let mut processed = 0u64;

        loop {
            if !matches!(self.channels.stop.try_recv(), Ok(None)) {
                debug!(worker = self.id, "Stop token received");
                break;
            }

            if advance {
                item = match self.channels.input.recv_timeout(self.config.input_timeout) {
                    Ok(next) => next,
                    Err(ReceiveErrorTimeout::Timeout) => WorkItem::Idle,
                    Err(_) => {
                        debug!(worker = self.id, "Input channel closed");
                        break;
                    }
                };
                if item == WorkItem::Stop {
                    debug!(worker = self.id, "Terminal marker received");
                    break;
                }
            }

            self.app.pre_cycle(item);
            let gate = self.app.carry_on();
            advance = match (gate, item) {
                (true, WorkItem::Index(index)) => {
                    let result = self.compute(index, budget)?;
                    self.channels
                        .output
                        .send((index, result))
                        .map_err(|_| Error::Disconnected("output channel closed".into()))?;
                    processed += 1;
                    true
                }
                (_, WorkItem::Idle) => true,
                _ => false,
            };

            std::thread::sleep(self.config.poll_interval);
        }

        info!(worker = self.id, processed, "Worker stopped");
        Ok(())
    }

    /// Compute one item. Errors that end the run are returned; any other
    /// failure becomes [`ItemResult::Failed`].
    fn compute(&mut self, index: u64, budget: Option<Duration>) -> Result<ItemResult> {
        let start = Instant::now();
        let result = self.app.compute(index);
        let elapsed = start.elapsed();
        if let Some(budget) = budget.filter(|b| elapsed > *b) {
            warn!(
                worker = self.id,
                index,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "Compute exceeded its budget"
            );
        }

        match result {
            Ok(result) => {
                let elapsed_us = elapsed.as_micros() as u64;
                debug!(worker = self.id, index, elapsed_us, "Computed item");
                Ok(result)
            }
            Err(e) if e.terminates_run() => Err(e),
            Err(e) => {
                warn!(worker = self.id, index, error = %e, "Cycle failed");
                Ok(ItemResult::Failed {
                    message: e.to_string(),
                })
            }
        }
    }
}
