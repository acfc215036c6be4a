//! The listening server: accept loop, connection registry, maintenance
//! sweep, broadcast, and ordered shutdown.
//!
//! Concurrency model: one accept task, one maintenance ticker, and one
//! driver task plus one dispatch task per connection. The registry is a
//! mutex-protected map; every operation that iterates it (broadcast,
//! sweep, stop) takes a snapshot under the lock and then works lock-free.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{dispatch_loop, ConnState, Connection, ConnectionShared};
use crate::error::SockError;
use crate::handler::{HandlerFactory, Session};
use crate::transport::Transport;

/// A WebSocket server bound to one port and one service name.
///
/// # Example
///
/// ```no_run
/// use textsock::{Server, ServerConfig, Session, SessionHandler};
///
/// struct Echo;
///
/// impl SessionHandler for Echo {
///     fn on_message(&mut self, session: &Session, text: &str) {
///         session.send(&format!("I got: {text}"));
///     }
/// }
///
/// # async fn run() -> Result<(), textsock::SockError> {
/// let server = Server::new(ServerConfig::new(9001), || {
///     Box::new(Echo) as Box<dyn SessionHandler>
/// });
/// server.start().await?;
/// // ... later:
/// server.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Server state shared with accept/sweep tasks and `Session` handles.
pub(crate) struct ServerShared {
    config: ServerConfig,
    factory: Box<dyn HandlerFactory>,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    running: AtomicBool,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

struct ConnectionEntry {
    shared: Arc<ConnectionShared>,
    driver: JoinHandle<()>,
}

impl Server {
    /// Creates a server from a configuration and a handler factory. The
    /// factory is invoked once per accepted connection.
    #[must_use]
    pub fn new(config: ServerConfig, factory: impl HandlerFactory) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                factory: Box::new(factory),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                local_addr: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listener and spawns the accept loop and maintenance
    /// ticker.
    ///
    /// # Errors
    ///
    /// A bind failure is the only fatal startup error; everything later
    /// (per-connection trouble, accept hiccups) degrades gracefully.
    pub async fn start(&self) -> Result<(), SockError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(SockError::Internal("server already started".into()));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.shared.config.port))
            .await
            .map_err(SockError::from)?;
        let addr = listener.local_addr()?;
        *self.shared.local_addr.lock() = Some(addr);
        info!(%addr, service = %self.shared.config.service, "server listening");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(accept_loop(self.shared.clone(), listener)));
        tasks.push(tokio::spawn(maintenance_loop(self.shared.clone())));
        Ok(())
    }

    /// The bound address, once `start` has succeeded. Useful when the
    /// configured port is 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Enqueues a text frame on every currently registered connection.
    ///
    /// Connections joining mid-broadcast may or may not receive the
    /// message; within each connection, ordering against other sends is
    /// preserved.
    pub fn broadcast(&self, text: &str) {
        self.shared.broadcast(text);
    }

    /// Ids of connections that completed the handshake and are open for
    /// data.
    #[must_use]
    pub fn connected_users(&self) -> Vec<u64> {
        self.shared
            .connections
            .lock()
            .values()
            .filter(|entry| entry.shared.state() == ConnState::Connected)
            .map(|entry| entry.shared.id())
            .collect()
    }

    /// Stops the server: closes the listener, cancels every connection,
    /// and waits up to the shutdown timeout for their drivers to drain.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when some connection failed to drain within the
    /// shutdown timeout (those drivers are aborted).
    pub async fn stop(&self) -> Result<(), SockError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("server stopping");
        self.shared.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let entries: Vec<ConnectionEntry> = {
            let mut connections = self.shared.connections.lock();
            connections.drain().map(|(_, entry)| entry).collect()
        };

        // Poll for drain completion instead of consuming the handles one
        // by one, so the timeout bounds the whole stop.
        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        let mut drained = true;
        loop {
            if entries.iter().all(|entry| entry.driver.is_finished()) {
                break;
            }
            if Instant::now() >= deadline {
                drained = false;
                break;
            }
            tokio::time::sleep(self.shared.config.data_poll_interval).await;
        }

        for entry in entries {
            if entry.driver.is_finished() {
                let _ = entry.driver.await;
            } else {
                warn!(conn_id = entry.shared.id(), "aborting connection that did not drain");
                entry.driver.abort();
            }
        }

        if drained {
            info!("server stopped");
            Ok(())
        } else {
            Err(SockError::timed_out("shutdown drain"))
        }
    }
}

impl ServerShared {
    pub(crate) fn broadcast(&self, text: &str) {
        let snapshot: Vec<Arc<ConnectionShared>> = self
            .connections
            .lock()
            .values()
            .map(|entry| entry.shared.clone())
            .collect();
        debug!(connections = snapshot.len(), "broadcast");
        for conn in snapshot {
            conn.enqueue_text(text);
        }
    }
}

/// Accepts sockets until cancelled; a failed accept backs off instead of
/// killing the loop.
async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => admit(&shared, stream, peer),
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(shared.config.accept_poll_interval).await;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Registers a freshly accepted socket: socket options, id allocation,
/// handler construction, and the two per-connection tasks.
fn admit(shared: &Arc<ServerShared>, stream: TcpStream, peer: SocketAddr) {
    apply_socket_options(&stream, &shared.config);

    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let conn = Arc::new(ConnectionShared::new(id, shared.cancel.child_token()));
    debug!(conn_id = id, %peer, "connection accepted");

    let session = Session {
        id,
        conn: Arc::downgrade(&conn),
        server: Arc::downgrade(shared),
    };
    let handler = shared.factory.create();
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatch_loop(dispatch_rx, handler, session));

    let transport = Transport::new(stream, shared.config.max_receive_size);
    let connection = Connection::new(
        conn.clone(),
        transport,
        shared.config.clone(),
        dispatch_tx,
    );
    let driver = tokio::spawn(connection.run());

    shared
        .connections
        .lock()
        .insert(id, ConnectionEntry { shared: conn, driver });
}

fn apply_socket_options(stream: &TcpStream, config: &ServerConfig) {
    let sock = SockRef::from(stream);
    if let Err(err) = sock.set_recv_buffer_size(config.receive_buffer_size) {
        warn!(error = %err, "failed to set receive buffer size");
    }
    if let Err(err) = sock.set_send_buffer_size(config.send_buffer_size) {
        warn!(error = %err, "failed to set send buffer size");
    }
}

/// Periodic liveness and cleanup pass over a registry snapshot.
async fn maintenance_loop(shared: Arc<ServerShared>) {
    let period = gcd_period(
        shared.config.handshake_timeout,
        shared.config.ping_interval,
    );
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = ticker.tick() => sweep(&shared),
        }
    }
    debug!("maintenance loop stopped");
}

fn sweep(shared: &Arc<ServerShared>) {
    let now = Instant::now();
    let snapshot: Vec<Arc<ConnectionShared>> = shared
        .connections
        .lock()
        .values()
        .map(|entry| entry.shared.clone())
        .collect();

    let mut reap = Vec::new();
    for conn in snapshot {
        match conn.state() {
            ConnState::Closed => reap.push(conn.id()),
            ConnState::Startup => {
                if now.duration_since(conn.created_at()) > shared.config.handshake_timeout {
                    warn!(conn_id = conn.id(), "handshake timed out");
                    conn.cancel();
                }
            }
            ConnState::Connected => {
                if now.duration_since(conn.last_activity()) >= shared.config.ping_interval {
                    conn.enqueue_heartbeat();
                }
            }
            ConnState::Closing => {
                let stuck = conn
                    .close_requested_at()
                    .is_some_and(|at| now.duration_since(at) > shared.config.read_write_timeout);
                if stuck {
                    warn!(conn_id = conn.id(), "close did not complete in time");
                    conn.cancel();
                }
            }
        }
    }

    if !reap.is_empty() {
        let mut connections = shared.connections.lock();
        for id in reap {
            if connections.remove(&id).is_some() {
                debug!(conn_id = id, "connection purged");
            }
        }
    }
}

/// Sweep period: the greatest common divisor of the two deadlines it
/// enforces, so neither is overshot by more than one tick.
fn gcd_period(a: Duration, b: Duration) -> Duration {
    let mut x = a.as_millis() as u64;
    let mut y = b.as_millis() as u64;
    while y != 0 {
        let r = x % y;
        x = y;
        y = r;
    }
    if x == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_millis(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_period_of_defaults() {
        assert_eq!(
            gcd_period(Duration::from_secs(10), Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        assert_eq!(
            gcd_period(Duration::from_secs(10), Duration::from_secs(4)),
            Duration::from_secs(2)
        );
        assert_eq!(
            gcd_period(Duration::from_millis(1500), Duration::from_secs(1)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn gcd_period_survives_zero() {
        assert_eq!(
            gcd_period(Duration::ZERO, Duration::ZERO),
            Duration::from_millis(100)
        );
        assert_eq!(
            gcd_period(Duration::ZERO, Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        use crate::handler::{Session, SessionHandler};

        struct Null;
        impl SessionHandler for Null {
            fn on_message(&mut self, _session: &Session, _text: &str) {}
        }

        let server = Server::new(ServerConfig::new(0), || {
            Box::new(Null) as Box<dyn SessionHandler>
        });
        let first = server.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let second = server.shared.next_id.fetch_add(1, Ordering::SeqCst);
        assert!(second > first);
    }
}
