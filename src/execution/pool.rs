//! Controller-side worker pool.
//!
//! Workers run either as threads of the controller process or as separate
//! processes re-executing the `frameflow worker` entry point. In both cases
//! the controller sees the same four queues: work items in, `(index, result)`
//! pairs out, stop tokens, and finished acknowledgements.
//!
//! Process workers are connected by one Unix socket each. Per worker the
//! controller runs a feeder thread (work queue to socket, one item in flight
//! at a time) and a reader thread (socket to result and finished queues).

use super::app::App;
use super::item::{ItemResult, WorkItem};
use super::protocol::{ControlMessage, read_message, write_message};
use super::worker::{WorkerConfig, WorkerLoop, channel_pair};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::memory::SharedFrameBuffer;
use crate::memory::ipc::send_segment_handle;
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use rustix::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often an idle feeder checks whether its worker is still connected.
const FEEDER_POLL: Duration = Duration::from_millis(50);

/// A running set of workers.
pub struct WorkerPool {
    workers: usize,
    input: Sender<WorkItem>,
    output: Receiver<(u64, ItemResult)>,
    stop: Sender<()>,
    finished: Receiver<usize>,
    finished_count: usize,
    backend: Backend,
    errors: Arc<Mutex<Vec<String>>>,
    buffer: Option<Arc<SharedFrameBuffer>>,
}

enum Backend {
    Threads(Vec<JoinHandle<Result<()>>>),
    Processes(Vec<ProcessWorker>),
}

struct ProcessWorker {
    id: usize,
    child: Child,
    writer: Arc<Mutex<UnixStream>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Run `workers` worker loops as threads.
    ///
    /// `factory` builds each worker's private app on its own thread. `buffer`
    /// is held until every worker has acknowledged shutdown.
    pub fn spawn_threads<F>(
        workers: usize,
        config: WorkerConfig,
        buffer: Option<Arc<SharedFrameBuffer>>,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(usize) -> Result<Box<dyn App>> + Send + Sync + 'static,
    {
        if workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        let (ctrl, chans) = channel_pair();
        let factory = Arc::new(factory);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let chans = chans.clone();
            let factory = factory.clone();
            let handle = thread::Builder::new()
                .name(format!("frameflow-worker-{id}"))
                .spawn(move || match factory(id) {
                    Ok(app) => WorkerLoop::new(id, app, chans, config).run(),
                    Err(e) => {
                        error!(worker = id, error = %e, "Failed to build worker app");
                        let _ = chans.finished.send(id);
                        Err(e)
                    }
                })?;
            handles.push(handle);
        }
        info!(workers, "Started thread workers");

        Ok(Self {
            workers,
            input: ctrl.input,
            output: ctrl.output,
            stop: ctrl.stop,
            finished: ctrl.finished,
            finished_count: 0,
            backend: Backend::Threads(handles),
            errors: Arc::new(Mutex::new(Vec::new())),
            buffer,
        })
    }

    /// Run `config.pool.workers` workers as child processes of `exe`.
    ///
    /// Each child is started as `exe worker --fd N` with one end of a socket
    /// pair inherited as descriptor `N`. It receives an `Init` message with
    /// the run configuration, then the frame buffer descriptor if there is
    /// one.
    pub fn spawn_processes(
        exe: impl AsRef<Path>,
        config: &RunConfig,
        buffer: Option<Arc<SharedFrameBuffer>>,
    ) -> Result<Self> {
        let exe = exe.as_ref();
        let workers = config.pool.workers;
        if workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        let config_text = config.to_toml_string()?;
        let (ctrl, chans) = channel_pair();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut procs = Vec::with_capacity(workers);

        for id in 0..workers {
            let (parent, child_end) = UnixStream::pair()?;
            // The child end must survive exec.
            rustix::io::fcntl_setfd(&child_end, rustix::io::FdFlags::empty())?;
            let child = Command::new(exe)
                .arg("worker")
                .arg("--fd")
                .arg(child_end.as_raw_fd().to_string())
                .stdin(Stdio::null())
                .spawn()
                .map_err(|e| {
                    Error::Config(format!("cannot start worker {}: {e}", exe.display()))
                })?;
            drop(child_end);
            debug!(worker = id, pid = child.id(), "Spawned worker process");

            let mut writer = parent.try_clone()?;
            write_message(
                &mut writer,
                &ControlMessage::Init {
                    worker: id as u32,
                    config: config_text.clone(),
                    buffer_len: buffer.as_ref().map_or(0, |b| b.region_len() as u64),
                },
            )?;
            if let Some(buffer) = &buffer {
                send_segment_handle(&parent, buffer.as_fd(), buffer.region_len())?;
            }

            let writer = Arc::new(Mutex::new(writer));
            let (credit_tx, credit_rx) = kanal::unbounded::<()>();

            let reader = {
                let socket = parent.try_clone()?;
                let output = chans.output.clone();
                let finished = chans.finished.clone();
                let errors = errors.clone();
                thread::Builder::new()
                    .name(format!("frameflow-reader-{id}"))
                    .spawn(move || read_worker(id, socket, output, finished, credit_tx, errors))?
            };
            let feeder = {
                let input = chans.input.clone();
                let writer = writer.clone();
                thread::Builder::new()
                    .name(format!("frameflow-feeder-{id}"))
                    .spawn(move || feed_worker(id, input, writer, credit_rx))?
            };

            procs.push(ProcessWorker {
                id,
                child,
                writer,
                threads: vec![reader, feeder],
            });
        }
        info!(workers, exe = %exe.display(), "Started worker processes");

        Ok(Self {
            workers,
            input: ctrl.input,
            output: ctrl.output,
            stop: ctrl.stop,
            finished: ctrl.finished,
            finished_count: 0,
            backend: Backend::Processes(procs),
            errors,
            buffer,
        })
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Finished acknowledgements received so far.
    pub fn finished_count(&self) -> usize {
        self.finished_count
    }

    /// The shared frame buffer, until teardown.
    pub fn buffer(&self) -> Option<&Arc<SharedFrameBuffer>> {
        self.buffer.as_ref()
    }

    /// Queue one frame index.
    pub fn submit(&self, index: u64) -> Result<()> {
        self.input
            .send(WorkItem::Index(index))
            .map_err(|_| Error::Disconnected("work queue closed".into()))
    }

    /// Queue one terminal marker per worker, after all submitted items.
    pub fn submit_terminal(&self) -> Result<()> {
        for _ in 0..self.workers {
            self.input
                .send(WorkItem::Stop)
                .map_err(|_| Error::Disconnected("work queue closed".into()))?;
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next result.
    ///
    /// Returns `Ok(None)` on timeout and [`Error::Disconnected`] once every
    /// worker has exited and no results remain.
    pub fn recv_result(&mut self, timeout: Duration) -> Result<Option<(u64, ItemResult)>> {
        match self.output.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(ReceiveErrorTimeout::Timeout) => {
                self.drain_finished();
                if self.finished_count >= self.workers && self.output.is_empty() {
                    Err(Error::Disconnected("all workers have exited".into()))
                } else {
                    Ok(None)
                }
            }
            Err(_) => Err(Error::Disconnected("all workers have exited".into())),
        }
    }

    /// Ask every worker to exit at the start of its next cycle.
    ///
    /// Items already queued are left unprocessed.
    pub fn stop(&self) {
        match &self.backend {
            Backend::Threads(_) => {
                for _ in 0..self.workers {
                    let _ = self.stop.send(());
                }
            }
            Backend::Processes(procs) => {
                for proc in procs {
                    let mut writer = proc.writer.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Err(e) = write_message(&mut *writer, &ControlMessage::Stop) {
                        debug!(worker = proc.id, error = %e, "Stop not delivered");
                    }
                }
            }
        }
        info!(workers = self.workers, "Stop requested");
    }

    /// Wait for every worker's finished acknowledgement, then reap the
    /// workers and release the shared frame buffer.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceUnavailable`] if not all workers finish in time; the
    /// buffer is kept in that case. Otherwise the first run-terminating error
    /// reported by a worker, if any.
    pub fn wait_finished(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.finished_count < self.workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ResourceUnavailable(format!(
                    "{} of {} workers finished",
                    self.finished_count, self.workers
                )));
            }
            match self.finished.recv_timeout(remaining) {
                Ok(id) => {
                    self.finished_count += 1;
                    debug!(worker = id, "Worker finished");
                }
                Err(ReceiveErrorTimeout::Timeout) => {}
                Err(_) => break,
            }
        }

        let mut first_error = None;
        match &mut self.backend {
            Backend::Threads(handles) => {
                for handle in handles.drain(..) {
                    match handle.join() {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            first_error.get_or_insert(e);
                        }
                        Err(_) => {
                            first_error
                                .get_or_insert(Error::Disconnected("worker panicked".into()));
                        }
                    }
                }
            }
            Backend::Processes(procs) => {
                for proc in procs.iter_mut() {
                    match proc.child.wait() {
                        Ok(status) if !status.success() => {
                            warn!(worker = proc.id, %status, "Worker process exited abnormally");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(worker = proc.id, error = %e, "Cannot reap worker"),
                    }
                    for handle in proc.threads.drain(..) {
                        let _ = handle.join();
                    }
                }
                let errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(message) = errors.first() {
                    first_error = Some(Error::Plugin {
                        plugin: "worker".into(),
                        message: message.clone(),
                    });
                }
            }
        }

        if self.buffer.take().is_some() {
            debug!("Released shared frame buffer");
        }
        info!(workers = self.workers, "All workers finished");
        first_error.map_or(Ok(()), Err)
    }

    /// Collect finished acknowledgements without blocking and return the
    /// total so far.
    ///
    /// Before `stop` or `submit_terminal`, a non-zero count means a worker
    /// ended on its own after a run-terminating error or a crash.
    pub fn poll_finished(&mut self) -> usize {
        self.drain_finished();
        self.finished_count
    }

    fn drain_finished(&mut self) {
        while let Ok(Some(id)) = self.finished.try_recv() {
            self.finished_count += 1;
            debug!(worker = id, "Worker finished");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.finished_count >= self.workers {
            return;
        }
        self.stop();
        if let Backend::Processes(procs) = &mut self.backend {
            for proc in procs.iter_mut() {
                if matches!(proc.child.try_wait(), Ok(None)) {
                    warn!(worker = proc.id, "Killing unfinished worker process");
                    let _ = proc.child.kill();
                    let _ = proc.child.wait();
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.backend {
            Backend::Threads(_) => "threads",
            Backend::Processes(_) => "processes",
        };
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("mode", &mode)
            .field("finished", &self.finished_count)
            .finish()
    }
}

/// Forward work items to one worker process, one in flight at a time.
fn feed_worker(
    id: usize,
    input: Receiver<WorkItem>,
    writer: Arc<Mutex<UnixStream>>,
    credit: Receiver<()>,
) {
    loop {
        let item = match input.recv_timeout(FEEDER_POLL) {
            Ok(item) => item,
            Err(ReceiveErrorTimeout::Timeout) if credit.is_disconnected() => break,
            Err(ReceiveErrorTimeout::Timeout) => continue,
            Err(_) => break,
        };
        let msg = match item {
            WorkItem::Index(index) => ControlMessage::Work { index },
            WorkItem::Stop => ControlMessage::Terminal,
            WorkItem::Idle => continue,
        };
        let sent = {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            write_message(&mut *writer, &msg)
        };
        if let Err(e) = sent {
            warn!(worker = id, ?item, error = %e, "Worker unreachable; item dropped");
            break;
        }
        if item == WorkItem::Stop || credit.recv().is_err() {
            break;
        }
    }
    debug!(worker = id, "Feeder exiting");
}

/// Translate one worker's socket messages into the controller's queues.
fn read_worker(
    id: usize,
    mut socket: UnixStream,
    output: Sender<(u64, ItemResult)>,
    finished: Sender<usize>,
    credit: Sender<()>,
    errors: Arc<Mutex<Vec<String>>>,
) {
    let mut acknowledged = false;
    loop {
        match read_message(&mut socket) {
            Ok(Some(ControlMessage::Output { index, result })) => {
                if output.send((index, result)).is_err() {
                    break;
                }
                let _ = credit.send(());
            }
            Ok(Some(ControlMessage::Error { message })) => {
                error!(worker = id, %message, "Worker reported an error");
                errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message);
            }
            Ok(Some(ControlMessage::Finished { .. })) => {
                acknowledged = true;
                let _ = finished.send(id);
            }
            Ok(Some(other)) => warn!(worker = id, ?other, "Unexpected message from worker"),
            Ok(None) => break,
            Err(e) => {
                warn!(worker = id, error = %e, "Worker connection failed");
                break;
            }
        }
    }
    if !acknowledged {
        warn!(worker = id, "Worker exited without acknowledgement");
        let _ = finished.send(id);
    }
}
