//! Socket ownership, buffered reads, and the serialized write queue.
//!
//! [`Transport`] owns one `TcpStream` and its read buffer and hands back
//! whole units only: a complete parsed handshake or a complete frame.
//! Incomplete input is never surfaced: the decode layer reports it as
//! `Ok(None)` and the transport reads more, suspending on socket
//! readiness in between.
//!
//! [`WriteQueue`] is the per-connection FIFO of outbound byte blobs. Any
//! task may push (handler sends, broadcasts, heartbeats); only the
//! connection's driver pops and writes, one blob at a time, so at most
//! one socket write is in flight per connection.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::error::SockError;
use crate::frame::{Frame, FrameCodec};
use crate::handshake::UpgradeRequest;

/// Owns the stream and read buffer of one connection.
#[derive(Debug)]
pub(crate) struct Transport {
    stream: TcpStream,
    read_buf: BytesMut,
    codec: FrameCodec,
    handshake: Option<UpgradeRequest>,
    max_receive_size: usize,
}

impl Transport {
    pub(crate) fn new(stream: TcpStream, max_receive_size: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(max_receive_size + 1),
            codec: FrameCodec::server().max_receive_size(max_receive_size),
            handshake: None,
            max_receive_size,
        }
    }

    /// Reads until a full HTTP request head (terminated by CRLF-CRLF) is
    /// buffered, parses it, and caches the result. Subsequent calls
    /// return the cached request.
    pub(crate) async fn read_handshake(&mut self) -> Result<UpgradeRequest, SockError> {
        if let Some(request) = &self.handshake {
            return Ok(request.clone());
        }
        loop {
            if let Some(end) = find_head_end(&self.read_buf) {
                let head = self.read_buf.split_to(end);
                let text = std::str::from_utf8(&head)
                    .map_err(|_| SockError::DataFormat("handshake is not valid UTF-8".into()))?;
                let request = UpgradeRequest::parse(text)?;
                trace!(service = %request.service, host = %request.host, "handshake parsed");
                self.handshake = Some(request.clone());
                return Ok(request);
            }
            if self.read_buf.len() > self.max_receive_size {
                return Err(SockError::Oversize {
                    size: self.read_buf.len(),
                    max: self.max_receive_size,
                });
            }
            self.read_more().await?;
        }
    }

    /// Reads the next complete frame, unmasked and validated.
    pub(crate) async fn read_frame(&mut self) -> Result<Frame, SockError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                trace!(opcode = ?frame.opcode, len = frame.payload.len(), fin = frame.fin, "frame read");
                return Ok(frame);
            }
            self.read_more().await?;
        }
    }

    /// Writes the whole blob or fails; there is no partial success.
    pub(crate) async fn write(&mut self, bytes: &[u8]) -> Result<(), SockError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn read_more(&mut self) -> Result<(), SockError> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(SockError::EndOfStream);
        }
        Ok(())
    }
}

/// Locates the end of the HTTP head (the index just past CRLF-CRLF).
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// FIFO of outbound byte blobs, shared between the connection driver and
/// everything that enqueues (handlers, broadcast, the maintenance
/// sweep).
///
/// The mutex is held only for push/pop, never across a socket write. A
/// push stores a wakeup permit in the `Notify`, so a driver that checks
/// the queue and then waits cannot miss a blob enqueued in between.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    blobs: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

impl WriteQueue {
    /// Appends a blob and wakes the driver.
    pub(crate) fn push(&self, blob: Bytes) {
        self.blobs.lock().push_back(blob);
        self.notify.notify_one();
    }

    /// Takes the oldest blob, if any.
    pub(crate) fn pop(&self) -> Option<Bytes> {
        self.blobs.lock().pop_front()
    }

    /// True when nothing is queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Wakes the driver without enqueueing anything, so it re-examines
    /// connection flags (close requests, cancellation).
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    /// Suspends until a push occurs (or consumes a stored permit from a
    /// push that already happened).
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }
}
