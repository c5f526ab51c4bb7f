//! Error types for the REPL client.
//!
//! Every user-visible outcome reduces to one of three shapes:
//! - a fatal connection failure (`Connect`, `Io`, `Protocol`, `ConnectionClosed`),
//!   after which the connection is unusable;
//! - a named operation failure reported by the agent (`Remote`);
//! - a successful value, returned as `Ok`.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

use std::io;

use replink_protocol::ProtocolError;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised by the connection, session client and lifecycle manager.
#[derive(Error, Debug)]
pub enum ClientError {
    /// An operation was invoked while no connection exists.
    ///
    /// Raised before any frame is written.
    #[error("Not connected to the REPL server")]
    NotConnected,

    /// Another connect attempt currently owns the connect guard.
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// Opening the TCP socket failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The connection closed (deliberately or after a fault) before a reply
    /// for the request arrived.
    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,

    /// A request id is already waiting for a reply.
    #[error("Request id already pending: {0}")]
    DuplicateRequestId(String),

    /// The agent answered with an `err` field.
    #[error("{op} failed: {message}")]
    Remote {
        op: String,
        message: String,
        ex: Option<String>,
    },

    /// Frame encoding or decoding failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file or environment override could not be applied.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// True for failures that leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::ConnectionClosed
                | ClientError::Protocol(_)
                | ClientError::Io(_)
        )
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
