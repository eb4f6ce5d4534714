//! StreamPipe: a pipe over any async byte stream.
//!
//! Each emission is framed as a 4-byte big-endian length followed by a JSON
//! body `{ "event": ..., "payload": ... }`. A reader task delivers incoming
//! frames to listeners in arrival order; a writer task drains an unbounded
//! queue so `emit` never blocks the caller.

use crate::pipe::{Listener, ListenerTable, Pipe};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Buffer size of each direction of [`StreamPipe::pair`].
const PAIR_BUFFER: usize = 64 * 1024;

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
}

/// One pipe emission on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    pub payload: Value,
}

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Reject bodies over [`MAX_FRAME_SIZE`], saturating the reported size.
fn check_frame_size(body_len: usize) -> Result<(), FrameError> {
    if body_len > MAX_FRAME_SIZE as usize {
        return Err(FrameError::FrameTooLarge {
            size: u32::try_from(body_len).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Write a framed emission to a stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    check_frame_size(bytes.len() - 4)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed emission from a stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// A pipe backed by a reader/writer pair, e.g. the halves of a TCP stream.
#[derive(Clone)]
pub struct StreamPipe {
    label: Arc<str>,
    outbound: mpsc::UnboundedSender<Frame>,
    listeners: ListenerTable,
    closed: Arc<AtomicBool>,
}

impl StreamPipe {
    /// Start the reader and writer tasks. Must run inside a tokio runtime.
    pub fn spawn<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label: Arc<str> = Arc::from(label.into());
        let (outbound, rx) = mpsc::unbounded_channel();
        let listeners = ListenerTable::default();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(
            Arc::clone(&label),
            reader,
            listeners.clone(),
            Arc::clone(&closed),
        ));
        tokio::spawn(write_loop(Arc::clone(&label), writer, rx, Arc::clone(&closed)));

        Self {
            label,
            outbound,
            listeners,
            closed,
        }
    }

    /// Two pipes connected back to back through an in-memory stream.
    pub fn pair() -> (Self, Self) {
        let (left, right) = tokio::io::duplex(PAIR_BUFFER);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::spawn("pair-left", left_read, left_write),
            Self::spawn("pair-right", right_read, right_write),
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether either direction of the underlying stream has shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Pipe for StreamPipe {
    fn emit(&self, event: &str, payload: Value) {
        let frame = Frame {
            event: event.to_string(),
            payload,
        };
        if self.outbound.send(frame).is_err() {
            debug!(pipe = %self.label, event, "Stream pipe closed, dropping emission");
        }
    }

    fn listen(&self, event: &str, listener: Listener) {
        self.listeners.add(event, listener);
    }
}

async fn read_loop<R>(label: Arc<str>, mut reader: R, listeners: ListenerTable, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if listeners.dispatch(&frame.event, frame.payload) == 0 {
                    debug!(pipe = %label, event = %frame.event, "No listener for frame");
                }
            }
            Err(FrameError::ConnectionClosed) => {
                debug!(pipe = %label, "Stream pipe reached end of stream");
                break;
            }
            Err(e) => {
                warn!(pipe = %label, error = %e, "Stream pipe read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}

async fn write_loop<W>(
    label: Arc<str>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(pipe = %label, error = %e, "Stream pipe write failed");
            closed.store(true, Ordering::Release);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
