//! replink client - session client and connection lifecycle
//!
//! # Architecture
//!
//! 1. **Connection**: owns the socket; a background reader task decodes
//!    frames, captures the session token, completes pending requests and
//!    broadcasts every frame to listeners
//! 2. **SessionClient**: typed REPL operations and evaluation-mode detection
//! 3. **SessionManager**: connect/disconnect lifecycle, the connect guard and
//!    the context-bound flag
//!
//! Every request carries the current session token, which is empty until the
//! server answers the initial clone request.

pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod manager;
pub mod session;

pub use config::ClientConfig;
pub use connection::Connection;
pub use error::{ClientError, Result};
pub use listeners::{Listeners, MessageReceiver, Subscription};
pub use manager::{ConnectionState, SessionManager};
pub use session::{EvalMode, Reply, SessionClient, DEFAULT_DESCRIBE_TIMEOUT, HOT_SWAP_COMPLETED};
