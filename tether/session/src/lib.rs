//! Persistent-connection messaging server.
//!
//! Accepts long-lived TCP (optionally TLS) connections, frames traffic with
//! the `tether-wire` envelope codec, and exposes three send semantics to the
//! embedding application:
//!
//! - [`Server::send`]: fire-and-forget, resolves when the frame is written
//! - [`Server::send_async`]: queued send with a completion signal
//! - [`Server::send_and_wait`]: correlated request/reply with a timeout
//!
//! Connected peers are tracked by `ip:port` in a registry; events (connect,
//! disconnect, inbound message) fan out to registered observers, and inbound
//! sync requests are answered by an installable [`ReplyHandler`].

#![warn(clippy::all)]

pub mod correlator;
pub mod error;
pub mod events;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;

pub use error::{CallError, SendError, StartError};
pub use events::{DisconnectReason, ReplyHandler, ServerEventHandler};
pub use server::{Server, ServerConfig};
pub use session::SessionCommand;
pub use stats::{ServerStats, StatsSnapshot};
pub use transport::{SecurityConfig, TlsSettings};

pub use tether_wire::{Envelope, EnvelopeFlags, Metadata};
