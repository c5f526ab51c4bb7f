//! TCP connection to the REPL server.
//!
//! A [`Connection`] owns the write half of the socket and a background reader
//! task. For every decoded frame the reader, in order:
//! 1. captures `new-session` when the frame answers the initial clone request;
//! 2. completes the pending request registered under the frame's `id`, if the
//!    frame carries `value`, `err`, `ex` or `status` (captured `out` frames
//!    sent ahead of the result only reach listeners);
//! 3. notifies every broadcast listener.
//!
//! A read fault is fatal: the reader logs it, stops, and every request still
//! waiting resolves with [`ClientError::ConnectionClosed`]. This also holds if
//! the reader task unwinds. There is no automatic reconnect.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use replink_protocol::{new_request_id, BencodeCodec, Message, Request};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ClientError, Result};
use crate::listeners::{Listeners, MessageReceiver, Subscription};

type FrameWriter = FramedWrite<OwnedWriteHalf, BencodeCodec>;
type FrameReader = FramedRead<OwnedReadHalf, BencodeCodec>;

// ============================================================================
// Shared State
// ============================================================================

/// Requests waiting for a reply. Closed once the reader stops.
#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiting: HashMap<String, oneshot::Sender<Message>>,
}

/// State touched by both the reader task and callers.
struct Shared {
    session: watch::Sender<String>,
    pending: Mutex<PendingTable>,
    listeners: Arc<Listeners>,
    alive: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, clone_id: &str, message: Message) {
        trace!(id = ?message.id(), op = ?message.op(), "Frame received");

        if message.id() == Some(clone_id) {
            if let Some(session) = message.new_session() {
                debug!(session = %session, "Session established");
                self.session.send_replace(session.to_string());
            }
        }

        let waiter = message
            .id()
            .filter(|_| message.settles_request())
            .and_then(|id| self.pending().waiting.remove(id));
        if let Some(tx) = waiter {
            let _ = tx.send(message.clone());
        }

        self.listeners.notify(&message);
    }

    /// Marks the connection dead and drops every waiting request.
    fn shut_down(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let dropped = {
            let mut pending = self.pending();
            pending.closed = true;
            std::mem::take(&mut pending.waiting)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping pending requests");
        }
        self.session.send_replace(String::new());
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Live connection with its reader task.
pub struct Connection {
    addr: String,
    clone_id: String,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Connection {
    /// Opens a connection with its own listener registry.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_listeners(host, port, Arc::new(Listeners::new())).await
    }

    /// Opens a connection that broadcasts into an existing registry.
    ///
    /// Sends the clone request (with an empty session) before returning.
    pub async fn connect_with_listeners(
        host: &str,
        port: u16,
        listeners: Arc<Listeners>,
    ) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!(addr = %addr, "Connecting to REPL server");

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (session, _) = watch::channel(String::new());
        let shared = Arc::new(Shared {
            session,
            pending: Mutex::new(PendingTable::default()),
            listeners,
            alive: AtomicBool::new(true),
        });

        let clone_id = new_request_id();
        let mut writer = FramedWrite::new(write_half, BencodeCodec::new());
        writer
            .send(Request::clone_session().into_message(&clone_id, ""))
            .await?;

        let cancel = CancellationToken::new();
        tokio::spawn(read_loop(
            FramedRead::new(read_half, BencodeCodec::new()),
            Arc::clone(&shared),
            clone_id.clone(),
            cancel.clone(),
        ));

        info!(addr = %addr, "Connected to REPL server");
        Ok(Self {
            addr,
            clone_id,
            writer: tokio::sync::Mutex::new(Some(writer)),
            shared,
            cancel,
        })
    }

    /// `host:port` this connection was opened to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Id of the initial clone request.
    pub fn clone_id(&self) -> &str {
        &self.clone_id
    }

    /// True until closed or until the reader stops.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Current session token; empty before the clone reply arrives.
    pub fn session(&self) -> String {
        self.shared.session.borrow().clone()
    }

    /// Waits until a session token is known.
    ///
    /// Returns `None` on timeout.
    pub async fn wait_for_session(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.shared.session.subscribe();
        let wait = async {
            rx.wait_for(|session| !session.is_empty())
                .await
                .map(|session| session.clone())
                .ok()
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Writes one frame.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_alive() {
            return Err(ClientError::ConnectionClosed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::ConnectionClosed)?;
        writer.send(message).await?;
        trace!(id = ?message.id(), op = ?message.op(), "Frame sent");
        Ok(())
    }

    /// Registers interest in the reply carrying `id`.
    ///
    /// Must be called before the request is sent so a fast reply cannot be
    /// missed.
    pub fn expect_reply(&self, id: &str) -> Result<oneshot::Receiver<Message>> {
        let mut pending = self.shared.pending();
        if pending.closed {
            return Err(ClientError::ConnectionClosed);
        }
        if pending.waiting.contains_key(id) {
            return Err(ClientError::DuplicateRequestId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.waiting.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Forgets a registration whose request was never sent.
    pub fn cancel_reply(&self, id: &str) {
        self.shared.pending().waiting.remove(id);
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().waiting.len()
    }

    /// Sends `request` under a fresh id and waits for the first reply.
    pub async fn request(&self, request: Request) -> Result<Message> {
        let id = new_request_id();
        let message = request.into_message(&id, &self.session());
        let rx = self.expect_reply(&id)?;

        if let Err(e) = self.send(&message).await {
            self.cancel_reply(&id);
            return Err(e);
        }

        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Sends `request` under a fresh id without waiting; returns the id.
    pub async fn send_detached(&self, request: Request) -> Result<String> {
        let id = new_request_id();
        let message = request.into_message(&id, &self.session());
        self.send(&message).await?;
        Ok(id)
    }

    /// Registers a broadcast listener.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.listeners.add(handler)
    }

    /// Channel-backed broadcast listener.
    pub fn subscribe(&self) -> MessageReceiver {
        self.shared.listeners.subscribe()
    }

    /// Stops the reader, closes the socket and clears the session.
    ///
    /// Safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = <FrameWriter as SinkExt<Message>>::close(&mut writer).await {
                debug!(error = %e, "Error closing write half");
            }
            info!(addr = %self.addr, "Connection closed");
        }
        self.shared.shut_down();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("alive", &self.is_alive())
            .field("session", &self.session())
            .finish()
    }
}

// ============================================================================
// Reader Task
// ============================================================================

/// Shuts the connection down when the reader exits, including by unwinding.
struct ReaderExit(Arc<Shared>);

impl Drop for ReaderExit {
    fn drop(&mut self) {
        self.0.shut_down();
    }
}

async fn read_loop(
    mut frames: FrameReader,
    shared: Arc<Shared>,
    clone_id: String,
    cancel: CancellationToken,
) {
    let _exit = ReaderExit(Arc::clone(&shared));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader cancelled");
                break;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(message)) => shared.dispatch(&clone_id, message),
            Some(Err(e)) => {
                warn!(error = %e, "Connection fault, reader stopping");
                break;
            }
            None => {
                info!("REPL server closed the connection");
                break;
            }
        }
    }
}
