//! Control protocol between the controller and worker processes.
//!
//! Messages are serialized with rkyv and sent over the worker's Unix socket
//! with a 4-byte little-endian length prefix.

use super::item::ItemResult;
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// Control message sent between the controller and a worker process.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    /// First message to a new worker.
    ///
    /// If `buffer_len` is non-zero the shared frame buffer descriptor follows
    /// over `SCM_RIGHTS`.
    Init {
        /// Worker id assigned by the controller.
        worker: u32,
        /// The run configuration as TOML.
        config: String,
        /// Size of the shared frame buffer region, 0 if there is none.
        buffer_len: u64,
    },

    /// A frame index to process. Controller to worker.
    Work {
        /// The frame index.
        index: u64,
    },

    /// Terminal marker: no more work. Controller to worker.
    Terminal,

    /// Stop token: exit at the start of the next cycle. Controller to worker.
    Stop,

    /// Result for one item. Worker to controller.
    Output {
        /// The frame index.
        index: u64,
        /// What the worker produced.
        result: ItemResult,
    },

    /// The worker loop has exited. Worker to controller; always last.
    Finished {
        /// Worker id.
        worker: u32,
    },

    /// Run-terminating error in the worker. Worker to controller.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Frame a message for sending.
///
/// Returns a buffer with length prefix followed by the serialized message.
pub fn frame_message(msg: &ControlMessage) -> Result<Vec<u8>> {
    let serialized = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| Error::Protocol(format!("serialization failed: {e}")))?;
    let len = u32::try_from(serialized.len())
        .map_err(|_| Error::Protocol(format!("message of {} bytes too large", serialized.len())))?;

    let mut framed = Vec::with_capacity(4 + serialized.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&serialized);
    Ok(framed)
}

/// Unframe a message from a buffer.
///
/// Returns the message and the number of bytes consumed, or `None` if the
/// buffer does not yet hold a complete message.
pub fn unframe_message(buf: &[u8]) -> Result<Option<(ControlMessage, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let msg = decode(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}

fn decode(bytes: &[u8]) -> Result<ControlMessage> {
    // rkyv needs an aligned buffer.
    let mut aligned = rkyv::util::AlignedVec::<8>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<ControlMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Protocol(format!("deserialization failed: {e}")))
}

/// Write one framed message.
pub fn write_message(writer: &mut impl Write, msg: &ControlMessage) -> Result<()> {
    let framed = frame_message(msg)?;
    writer.write_all(&framed).map_err(disconnect)?;
    writer.flush().map_err(disconnect)
}

/// Read one framed message.
///
/// Reads exactly the bytes of one message, never more, so descriptors sent
/// after it on the same socket stay in the queue. Returns `None` if the peer
/// closed the connection between messages.
pub fn read_message(reader: &mut impl Read) -> Result<Option<ControlMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(disconnect(e)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(disconnect)?;
    decode(&body).map(Some)
}

fn disconnect(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            Error::Disconnected(e.to_string())
        }
        _ => Error::Io(e),
    }
}
