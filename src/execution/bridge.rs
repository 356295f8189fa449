//! Worker-process side of the controller socket.
//!
//! The child reads `Init`, receives the frame buffer descriptor if one is
//! announced, then runs an ordinary [`WorkerLoop`] whose channels are fed by
//! two relay threads:
//!
//! ```text
//!   socket ──reader──▶ input / stop ──▶ WorkerLoop ──▶ output ──writer──▶ socket
//! ```

use super::item::WorkItem;
use super::protocol::{ControlMessage, read_message, write_message};
use super::worker::{WorkerLoop, channel_pair};
use crate::apps::build_worker;
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::memory::SharedFrameBuffer;
use crate::memory::ipc::recv_segment_handle;
use kanal::Sender;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Serve one controller connection until the worker loop ends.
///
/// Always tries to send `Finished` last, preceded by `Error` if the loop
/// ended with a run-terminating error.
pub fn run_worker_process(socket: UnixStream) -> Result<()> {
    let mut reader = socket.try_clone()?;
    let (worker, config, buffer_len) = match read_message(&mut reader)? {
        Some(ControlMessage::Init {
            worker,
            config,
            buffer_len,
        }) => (worker, config, buffer_len),
        Some(other) => {
            return Err(Error::Protocol(format!("expected Init, got {other:?}")));
        }
        None => return Err(Error::Disconnected("controller closed before Init".into())),
    };
    let config = RunConfig::from_toml_str(&config)?;

    let buffer = if buffer_len > 0 {
        let (fd, size) = recv_segment_handle(&socket)?;
        if size as u64 != buffer_len {
            return Err(Error::Protocol(format!(
                "announced a {buffer_len} byte buffer, received {size}"
            )));
        }
        // SAFETY: the descriptor was created by the controller as a
        // SharedFrameBuffer of exactly `size` bytes.
        Some(Arc::new(unsafe { SharedFrameBuffer::from_fd(fd, size)? }))
    } else {
        None
    };
    info!(worker, buffer = buffer.is_some(), "Worker process initialized");

    let (ctrl, chans) = channel_pair();
    let (input, stop) = (ctrl.input, ctrl.stop);
    thread::Builder::new()
        .name("frameflow-commands".into())
        .spawn(move || relay_commands(reader, input, stop))?;

    let output = ctrl.output;
    let mut out_socket = socket.try_clone()?;
    let writer = thread::Builder::new()
        .name("frameflow-results".into())
        .spawn(move || -> UnixStream {
            while let Ok((index, result)) = output.recv() {
                let msg = ControlMessage::Output { index, result };
                if let Err(e) = write_message(&mut out_socket, &msg) {
                    warn!(index, error = %e, "Result not delivered");
                    break;
                }
            }
            out_socket
        })?;

    let result = config.plugins.build_registry().and_then(|registry| {
        let app = build_worker(&config, registry, buffer)?;
        WorkerLoop::new(worker as usize, app, chans, config.pool.worker_config()).run()
    });

    let mut socket = writer
        .join()
        .map_err(|_| Error::Disconnected("result writer panicked".into()))?;
    if let Err(e) = &result {
        write_message(
            &mut socket,
            &ControlMessage::Error {
                message: e.to_string(),
            },
        )?;
    }
    write_message(&mut socket, &ControlMessage::Finished { worker })?;
    debug!(worker, "Sent finished acknowledgement");
    result
}

fn relay_commands(mut socket: UnixStream, input: Sender<WorkItem>, stop: Sender<()>) {
    loop {
        let item = match read_message(&mut socket) {
            Ok(Some(ControlMessage::Work { index })) => WorkItem::Index(index),
            Ok(Some(ControlMessage::Terminal)) => WorkItem::Stop,
            Ok(Some(ControlMessage::Stop)) => {
                let _ = stop.send(());
                continue;
            }
            Ok(Some(other)) => {
                warn!(?other, "Unexpected message from controller");
                continue;
            }
            Ok(None) => {
                debug!("Controller closed the connection");
                let _ = stop.send(());
                return;
            }
            Err(e) => {
                error!(error = %e, "Controller connection failed");
                let _ = stop.send(());
                return;
            }
        };
        if input.send(item).is_err() {
            return;
        }
    }
}
