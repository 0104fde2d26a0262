//! Session and server error types.
//!
//! Start-up failures are split into distinguishable variants so an embedding
//! application can react without parsing free text. Ordinary network
//! conditions (peer gone, timeout) surface as `SendError`/`CallError`, never
//! as panics.

use std::net::SocketAddr;
use tether_wire::WireError;
use thiserror::Error;

/// Failures starting the server.
#[derive(Error, Debug)]
pub enum StartError {
    /// The listen address/port is unavailable
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Certificate or private key could not be loaded or applied
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Invalid configuration (including double start)
    #[error("configuration error: {0}")]
    Config(String),
}

/// Failures of a fire-and-forget send.
#[derive(Error, Debug)]
pub enum SendError {
    /// No session is registered for the peer address
    #[error("no connected client at {0}")]
    UnknownClient(String),

    /// The target session is no longer writable
    #[error("session closed")]
    SessionClosed,

    /// The envelope could not be encoded
    #[error(transparent)]
    Encode(#[from] WireError),
}

/// Failures of a synchronous send-and-wait call.
#[derive(Error, Debug)]
pub enum CallError {
    /// No reply arrived before the caller-supplied deadline
    #[error("timed out waiting for reply")]
    Timeout,

    /// The target session went away before a reply arrived
    #[error("peer disconnected before replying")]
    PeerDisconnected,

    /// The request could not be sent at all
    #[error(transparent)]
    Send(#[from] SendError),
}
