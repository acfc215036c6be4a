//! Textsock: a server-side, text-frame WebSocket (RFC 6455) library.
//!
//! # Overview
//!
//! Textsock accepts TCP connections, performs the HTTP upgrade
//! handshake, and exchanges text frames with each peer, dispatching
//! complete messages to a per-connection [`SessionHandler`]. The server
//! keeps connections alive with heartbeats, enforces handshake and drain
//! deadlines, supports broadcast, and shuts down cooperatively.
//!
//! # Core pieces
//!
//! - [`frame`]: the frame codec: bit-exact header parsing and
//!   serialization, masking, size classes, control-frame rules
//! - [`handshake`]: the HTTP upgrade codec: request validation,
//!   `Sec-WebSocket-Accept`, 101/400 responses
//! - [`close`]: the close handshake state machine
//! - [`handler`]: the application surface, `SessionHandler` plus the
//!   `Session` capability handle
//! - [`server`]: listener, accept loop, connection registry,
//!   maintenance sweep, broadcast, shutdown
//! - [`config`]: tunables and their defaults
//!
//! # Example
//!
//! ```no_run
//! use textsock::{Server, ServerConfig, Session, SessionHandler};
//!
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn on_message(&mut self, session: &Session, text: &str) {
//!         session.send(&format!("I got: {text}"));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), textsock::SockError> {
//!     let server = Server::new(ServerConfig::new(9001).service("chat"), || {
//!         Box::new(Echo) as Box<dyn SessionHandler>
//!     });
//!     server.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
//!     server.stop().await
//! }
//! ```
//!
//! # Scope
//!
//! Text frames only: binary frames close the connection with 1003, and
//! no extensions or subprotocols are negotiated. There is no client
//! mode and no TLS; the transport is plain TCP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod close;
pub mod config;
mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod server;
mod transport;

pub use close::{CloseHandshake, CloseReason, CloseState};
pub use config::ServerConfig;
pub use error::SockError;
pub use frame::{apply_mask, CloseCode, Frame, FrameCodec, Opcode, Role};
pub use handler::{HandlerFactory, Session, SessionHandler};
pub use handshake::{bad_request, compute_accept_key, AcceptResponse, UpgradeRequest};
pub use server::Server;
