//! Server configuration.

use std::time::Duration;

/// Configuration for a [`crate::Server`].
///
/// Only the port is mandatory; every other knob has a sensible default
/// and a builder-style setter.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use textsock::ServerConfig;
///
/// let config = ServerConfig::new(9001)
///     .service("chat")
///     .ping_interval(Duration::from_secs(30))
///     .max_receive_size(64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Service name clients must address (the last non-empty segment of
    /// their request path).
    pub service: String,
    /// How long `stop` and a closing connection wait for queued writes
    /// to drain.
    pub shutdown_timeout: Duration,
    /// Idle time after which a heartbeat is sent on a connection.
    pub ping_interval: Duration,
    /// Bound on a single socket write (and the handshake read).
    pub read_write_timeout: Duration,
    /// How long a connection may sit in the handshake phase.
    pub handshake_timeout: Duration,
    /// Backoff after a failed `accept` call.
    pub accept_poll_interval: Duration,
    /// Re-check interval while draining a closing connection.
    pub data_poll_interval: Duration,
    /// Socket receive buffer size (`SO_RCVBUF`) applied on accept.
    pub receive_buffer_size: usize,
    /// Socket send buffer size (`SO_SNDBUF`) applied on accept.
    pub send_buffer_size: usize,
    /// Largest handshake or whole frame accepted, and the cap on a
    /// reassembled message.
    pub max_receive_size: usize,
}

impl ServerConfig {
    /// Creates a configuration for the given port with default values
    /// for everything else.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            service: "chat".to_string(),
            shutdown_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
            read_write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            accept_poll_interval: Duration::from_millis(100),
            data_poll_interval: Duration::from_millis(100),
            receive_buffer_size: 2048,
            send_buffer_size: 16_384,
            max_receive_size: 16_384,
        }
    }

    /// Sets the service name.
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the shutdown/drain timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the single-operation read/write timeout.
    #[must_use]
    pub fn read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = timeout;
        self
    }

    /// Sets the handshake deadline.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the accept-failure backoff.
    #[must_use]
    pub fn accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    /// Sets the drain re-check interval.
    #[must_use]
    pub fn data_poll_interval(mut self, interval: Duration) -> Self {
        self.data_poll_interval = interval;
        self
    }

    /// Sets the socket receive buffer size.
    #[must_use]
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Sets the socket send buffer size.
    #[must_use]
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Sets the maximum handshake/frame/message size.
    #[must_use]
    pub fn max_receive_size(mut self, size: usize) -> Self {
        self.max_receive_size = size;
        self
    }
}
