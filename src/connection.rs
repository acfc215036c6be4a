//! Per-connection state machine and driver task.
//!
//! Every accepted socket gets one [`Connection`] driven to completion by
//! its own task: `Startup` (handshake) → `Connected` (frame exchange) →
//! `Closing` (bounded drain) → `Closed`. A second, per-connection
//! dispatch task runs the user handler, so application code can never
//! stall the I/O loop; messages are handed over in arrival order.
//!
//! All outbound bytes (handshake responses, data frames, pongs, close
//! frames, broadcasts, heartbeats) go through the connection's
//! [`WriteQueue`], and only the driver writes to the socket, so writes
//! are serialized and in enqueue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::close::{CloseHandshake, CloseReason};
use crate::config::ServerConfig;
use crate::error::SockError;
use crate::frame::{self, CloseCode, Frame, Opcode};
use crate::handler::{Session, SessionHandler};
use crate::handshake::{bad_request, AcceptResponse};
use crate::transport::{Transport, WriteQueue};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ConnState {
    /// Awaiting the HTTP upgrade handshake.
    Startup,
    /// Handshake complete; frames are exchanged.
    Connected,
    /// A close was sent or received; draining remaining writes.
    Closing,
    /// Terminal. The server sweep purges the registry entry.
    Closed,
}

/// State shared between the driver task, the user handler's `Session`
/// handle, and the server's maintenance sweep.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    id: u64,
    queue: WriteQueue,
    state: Mutex<ConnState>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    close_requested_at: Mutex<Option<Instant>>,
    close_requested: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionShared {
    pub(crate) fn new(id: u64, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            queue: WriteQueue::default(),
            state: Mutex::new(ConnState::Startup),
            created_at: now,
            last_activity: Mutex::new(now),
            close_requested_at: Mutex::new(None),
            close_requested: AtomicBool::new(false),
            cancel,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub(crate) fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn close_requested_at(&self) -> Option<Instant> {
        *self.close_requested_at.lock()
    }

    /// Request cancellation of the connection's I/O.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Enqueue a text frame, unless the connection is no longer open for
    /// data.
    pub(crate) fn enqueue_text(&self, text: &str) {
        if self.state() != ConnState::Connected {
            trace!(conn_id = self.id, "dropping send on non-connected state");
            return;
        }
        self.enqueue(Frame::text(Bytes::from(text.to_owned())));
    }

    /// Enqueue an unsolicited heartbeat pong and count it as activity.
    pub(crate) fn enqueue_heartbeat(&self) {
        if self.state() != ConnState::Connected {
            return;
        }
        trace!(conn_id = self.id, "heartbeat");
        self.enqueue(Frame::pong(Bytes::new()));
        self.touch_activity();
    }

    /// Ask the driver to run the close handshake. Idempotent; callable
    /// from any task.
    pub(crate) fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.queue.wake();
    }

    fn take_close_request(&self) -> bool {
        self.close_requested.swap(false, Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    /// Moves to `Closing` (never backwards) and stamps the close request
    /// time once.
    fn mark_closing(&self) {
        let mut state = self.state.lock();
        if *state < ConnState::Closing {
            *state = ConnState::Closing;
        }
        drop(state);
        let mut requested = self.close_requested_at.lock();
        if requested.is_none() {
            *requested = Some(Instant::now());
        }
    }

    fn enqueue(&self, frame: Frame) {
        match frame::to_wire(frame) {
            Ok(blob) => self.queue.push(blob),
            Err(err) => {
                error!(conn_id = self.id, error = %err, "failed to serialize frame");
            }
        }
    }

    pub(crate) fn queue(&self) -> &WriteQueue {
        &self.queue
    }
}

/// The driver: owns the transport and walks the state machine.
pub(crate) struct Connection {
    shared: Arc<ConnectionShared>,
    transport: Transport,
    config: ServerConfig,
    close: CloseHandshake,
    fragments: BytesMut,
    dispatch_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        transport: Transport,
        config: ServerConfig,
        dispatch_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            shared,
            transport,
            config,
            close: CloseHandshake::new(),
            fragments: BytesMut::new(),
            dispatch_tx: Some(dispatch_tx),
        }
    }

    /// Drives the connection to completion. Errors terminate only this
    /// connection and are logged here: warnings for peer behavior,
    /// errors for library anomalies.
    pub(crate) async fn run(mut self) {
        let result = self.drive().await;
        let budget = self.config.shutdown_timeout;
        self.drain(budget).await;
        self.shared.set_state(ConnState::Closed);
        // Dropping the sender ends the dispatch task, which then fires
        // the handler's on_close.
        self.dispatch_tx.take();
        match result {
            Ok(()) => debug!(conn_id = self.shared.id, "connection closed"),
            Err(err) if err.is_internal() => {
                error!(conn_id = self.shared.id, error = %err, "connection failed");
            }
            Err(err) => {
                warn!(conn_id = self.shared.id, error = %err, "connection terminated");
            }
        }
    }

    async fn drive(&mut self) -> Result<(), SockError> {
        self.startup().await?;
        self.connected().await
    }

    /// `Startup`: read and answer the HTTP upgrade, bounded by the
    /// handshake timeout.
    async fn startup(&mut self) -> Result<(), SockError> {
        let cancel = self.shared.cancel.clone();
        let request = tokio::select! {
            () = cancel.cancelled() => return Err(SockError::Cancelled),
            result = timeout(self.config.handshake_timeout, self.transport.read_handshake()) => {
                match result {
                    Ok(Ok(request)) => request,
                    Ok(Err(err)) => {
                        if matches!(err, SockError::DataFormat(_) | SockError::Oversize { .. }) {
                            self.reject((1, 1)).await;
                        }
                        return Err(err);
                    }
                    Err(_) => return Err(SockError::timed_out("handshake")),
                }
            }
        };

        if request.service != self.config.service {
            warn!(
                conn_id = self.shared.id,
                service = %request.service,
                "rejecting unknown service"
            );
            self.reject(request.http_version).await;
            return Err(SockError::DataFormat(format!(
                "unknown service '{}'",
                request.service
            )));
        }

        let response = AcceptResponse::for_request(&request);
        self.shared.queue.push(Bytes::from(response.response_bytes()));
        self.flush().await?;
        self.shared.set_state(ConnState::Connected);
        self.shared.touch_activity();
        debug!(
            conn_id = self.shared.id,
            service = %request.service,
            host = %request.host,
            "connection established"
        );
        Ok(())
    }

    /// Enqueues a 400 and flushes it best-effort.
    async fn reject(&mut self, http_version: (u8, u8)) {
        self.shared
            .queue
            .push(Bytes::from(bad_request(http_version, &[])));
        let _ = self.flush().await;
    }

    /// `Connected`: exchange frames until a close begins, an error
    /// terminates the connection, or cancellation arrives.
    async fn connected(&mut self) -> Result<(), SockError> {
        let shared = self.shared.clone();
        let cancel = shared.cancel.clone();
        loop {
            if cancel.is_cancelled() && self.close.is_open() {
                self.begin_close(CloseReason::going_away());
            }
            if shared.take_close_request() && self.close.is_open() {
                self.begin_close(CloseReason::normal());
            }
            self.flush().await?;
            if !self.close.is_open() {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => {}
                () = shared.queue().wait() => {}
                result = self.transport.read_frame() => {
                    match result {
                        Ok(frame) => self.handle_frame(frame)?,
                        Err(err) => return self.fail(err),
                    }
                }
            }
        }
    }

    /// Applies one inbound frame to the state machine.
    fn handle_frame(&mut self, frame: Frame) -> Result<(), SockError> {
        match frame.opcode {
            Opcode::Text | Opcode::Continuation => {
                let total = self.fragments.len() + frame.payload.len();
                if total > self.config.max_receive_size {
                    return self.fail(SockError::Oversize {
                        size: total,
                        max: self.config.max_receive_size,
                    });
                }
                self.fragments.extend_from_slice(&frame.payload);
                if frame.fin {
                    let Ok(text) = std::str::from_utf8(&self.fragments) else {
                        self.begin_close(CloseReason::new(CloseCode::Inconsistent, None));
                        return Err(SockError::DataFormat(
                            "text message is not valid UTF-8".into(),
                        ));
                    };
                    let message = text.to_owned();
                    self.fragments.clear();
                    self.dispatch(message)?;
                }
            }
            Opcode::Ping => {
                trace!(conn_id = self.shared.id, "ping");
                self.enqueue_frame(Frame::pong(frame.payload));
            }
            Opcode::Pong => {
                self.shared.touch_activity();
            }
            Opcode::Close => {
                match self.close.receive_close(&frame) {
                    Ok(Some(echo)) => self.enqueue_frame(echo),
                    Ok(None) => {}
                    Err(err) => return self.fail(err),
                }
                self.shared.mark_closing();
                if let Some(reason) = self.close.peer_reason() {
                    debug!(
                        conn_id = self.shared.id,
                        code = ?reason.code,
                        reason = reason.text.as_deref().unwrap_or(""),
                        "peer requested close"
                    );
                }
            }
            Opcode::Binary => {
                return self.fail(SockError::Unsupported("binary frames"));
            }
        }
        Ok(())
    }

    /// Hands a complete message to the dispatch task, preserving arrival
    /// order.
    fn dispatch(&mut self, message: String) -> Result<(), SockError> {
        let Some(tx) = &self.dispatch_tx else {
            return Err(SockError::Internal("dispatch channel already closed".into()));
        };
        tx.send(message)
            .map_err(|_| SockError::Internal("dispatch task terminated early".into()))
    }

    /// Terminates the connection with `err`, first enqueueing the close
    /// frame that tells the peer why.
    fn fail(&mut self, err: SockError) -> Result<(), SockError> {
        match close_code_for(&err) {
            Some(code) => self.begin_close(CloseReason::new(code, None)),
            None => {
                // Peer is already gone; no close frame will arrive anywhere.
                self.close.force_close(CloseReason::going_away());
                self.shared.mark_closing();
            }
        }
        Err(err)
    }

    fn begin_close(&mut self, reason: CloseReason) {
        if let Some(frame) = self.close.initiate(reason) {
            self.enqueue_frame(frame);
        }
        self.shared.mark_closing();
    }

    fn enqueue_frame(&mut self, frame: Frame) {
        match frame::to_wire(frame) {
            Ok(blob) => self.shared.queue.push(blob),
            Err(err) => {
                error!(conn_id = self.shared.id, error = %err, "failed to serialize frame");
            }
        }
    }

    /// Writes out everything queued, one blob at a time, each bounded by
    /// the read/write timeout.
    async fn flush(&mut self) -> Result<(), SockError> {
        while let Some(blob) = self.shared.queue.pop() {
            match timeout(self.config.read_write_timeout, self.transport.write(&blob)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(SockError::timed_out("write")),
            }
        }
        Ok(())
    }

    /// `Closing`: best-effort drain of the remaining queue within
    /// `budget`.
    async fn drain(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        while let Some(blob) = self.shared.queue.pop() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(conn_id = self.shared.id, "drain budget exhausted; dropping queued writes");
                return;
            }
            let per_write = remaining.min(self.config.read_write_timeout);
            match timeout(per_write, self.transport.write(&blob)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    trace!(conn_id = self.shared.id, error = %err, "write failed during drain");
                    return;
                }
                Err(_) => {
                    warn!(conn_id = self.shared.id, "write timed out during drain");
                    return;
                }
            }
        }
    }
}

/// Close code announced to the peer for a terminating error, when one
/// makes sense.
fn close_code_for(err: &SockError) -> Option<CloseCode> {
    match err {
        SockError::DataFormat(_) => Some(CloseCode::Protocol),
        SockError::Oversize { .. } => Some(CloseCode::TooBig),
        SockError::Unsupported(_) => Some(CloseCode::Unsupported),
        SockError::Internal(_) | SockError::Unknown => Some(CloseCode::Unexpected),
        SockError::EndOfStream
        | SockError::ClosedStream
        | SockError::ClosedSocket
        | SockError::Socket(_)
        | SockError::Cancelled => None,
    }
}

/// Runs the user handler, one message at a time, then fires `on_close`
/// when the driver hangs up.
pub(crate) async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut handler: Box<dyn SessionHandler>,
    session: Session,
) {
    while let Some(message) = rx.recv().await {
        handler.on_message(&session, &message);
    }
    handler.on_close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(ConnState::Startup < ConnState::Connected);
        assert!(ConnState::Connected < ConnState::Closing);
        assert!(ConnState::Closing < ConnState::Closed);
    }

    #[test]
    fn close_codes_for_errors() {
        assert_eq!(
            close_code_for(&SockError::DataFormat("x".into())),
            Some(CloseCode::Protocol)
        );
        assert_eq!(
            close_code_for(&SockError::Oversize { size: 1, max: 0 }),
            Some(CloseCode::TooBig)
        );
        assert_eq!(
            close_code_for(&SockError::Unsupported("binary frames")),
            Some(CloseCode::Unsupported)
        );
        assert_eq!(
            close_code_for(&SockError::Internal("bug".into())),
            Some(CloseCode::Unexpected)
        );
        assert_eq!(close_code_for(&SockError::EndOfStream), None);
        assert_eq!(close_code_for(&SockError::Cancelled), None);
    }

    #[test]
    fn mark_closing_stamps_once_and_never_regresses() {
        let shared = ConnectionShared::new(7, CancellationToken::new());
        shared.set_state(ConnState::Connected);
        shared.mark_closing();
        let first = shared.close_requested_at().unwrap();
        assert_eq!(shared.state(), ConnState::Closing);

        shared.mark_closing();
        assert_eq!(shared.close_requested_at(), Some(first));

        shared.set_state(ConnState::Closed);
        shared.mark_closing();
        assert_eq!(shared.state(), ConnState::Closed);
    }

    #[test]
    fn sends_are_dropped_outside_connected() {
        let shared = ConnectionShared::new(8, CancellationToken::new());
        shared.enqueue_text("too early");
        assert!(shared.queue().is_empty());

        shared.set_state(ConnState::Connected);
        shared.enqueue_text("now it flows");
        assert!(!shared.queue().is_empty());

        shared.set_state(ConnState::Closing);
        shared.queue().pop();
        shared.enqueue_text("too late");
        assert!(shared.queue().is_empty());
    }

    #[test]
    fn heartbeat_refreshes_activity() {
        let shared = ConnectionShared::new(9, CancellationToken::new());
        shared.set_state(ConnState::Connected);
        let before = shared.last_activity();
        std::thread::sleep(Duration::from_millis(5));
        shared.enqueue_heartbeat();
        assert!(shared.last_activity() > before);
        assert!(!shared.queue().is_empty());
    }
}
