//! The application-facing session surface.
//!
//! Applications implement [`SessionHandler`] for their per-connection
//! logic and hand the server a [`HandlerFactory`] that produces one
//! handler per accepted connection. The handler receives a [`Session`]
//! capability handle for talking back: `send` and `close` act on the
//! owning connection, `broadcast` on every connection the server knows.
//!
//! # Example
//!
//! ```
//! use textsock::{Session, SessionHandler};
//!
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn on_message(&mut self, session: &Session, text: &str) {
//!         session.send(&format!("I got: {text}"));
//!     }
//! }
//! ```

use std::sync::Weak;

use crate::connection::ConnectionShared;
use crate::server::ServerShared;

/// Per-connection application logic.
///
/// `on_message` runs on a dispatch task separate from the connection's
/// I/O loop, so a slow handler delays its own connection's messages but
/// never stalls reads or other connections. Messages arrive in the order
/// the peer sent them.
pub trait SessionHandler: Send + 'static {
    /// Called once for every complete text message.
    fn on_message(&mut self, session: &Session, text: &str);

    /// Called exactly once when the connection is torn down.
    fn on_close(&mut self) {}
}

/// Produces one handler per accepted connection.
///
/// Implemented for free by any `Fn() -> Box<dyn SessionHandler>` closure.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Build a fresh handler for a new connection.
    fn create(&self) -> Box<dyn SessionHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn SessionHandler> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn SessionHandler> {
        self()
    }
}

/// Capability handle a handler uses to act on its connection.
///
/// Holds only weak references, so a handler can never keep its
/// connection or the server alive past their own lifetimes. All methods
/// enqueue work and return immediately; once the connection is closing,
/// sends are silently dropped.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) id: u64,
    pub(crate) conn: Weak<ConnectionShared>,
    pub(crate) server: Weak<ServerShared>,
}

impl Session {
    /// The connection's process-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue a text frame on this connection.
    pub fn send(&self, text: &str) {
        if let Some(conn) = self.conn.upgrade() {
            conn.enqueue_text(text);
        }
    }

    /// Enqueue a text frame on every connection the server knows.
    pub fn broadcast(&self, text: &str) {
        if let Some(server) = self.server.upgrade() {
            server.broadcast(text);
        }
    }

    /// Request a normal close of this connection. Idempotent.
    pub fn close(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.request_close();
        }
    }
}
