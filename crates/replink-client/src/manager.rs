//! Connection lifecycle management.
//!
//! [`SessionManager`] owns at most one [`SessionClient`] and walks it through
//! `Disconnected -> Connecting -> Connected -> Disconnected`. Broadcast
//! listeners are registered on the manager and survive reconnects.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use replink_protocol::{BeanInfo, Message, Request};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::listeners::{Listeners, MessageReceiver, Subscription};
use crate::session::{EvalMode, Reply, SessionClient, DEFAULT_DESCRIBE_TIMEOUT};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Releases the connect guard when the attempt ends, however it ends.
struct ConnectGuard<'a>(&'a AtomicBool);

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// True when a bind-context reply reports success.
fn reports_bound(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Owns the current REPL session and its flags.
#[derive(Debug)]
pub struct SessionManager {
    host: String,
    port: u16,
    client: RwLock<Option<Arc<SessionClient>>>,
    connecting: AtomicBool,
    context_bound: AtomicBool,
    listeners: Arc<Listeners>,
    describe_timeout: Duration,
}

impl SessionManager {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client: RwLock::new(None),
            connecting: AtomicBool::new(false),
            context_bound: AtomicBool::new(false),
            listeners: Arc::new(Listeners::new()),
            describe_timeout: DEFAULT_DESCRIBE_TIMEOUT,
        }
    }

    /// Bounds how long [`connect`](Self::connect) waits to learn the
    /// evaluation mode.
    #[must_use]
    pub fn with_describe_timeout(mut self, timeout: Duration) -> Self {
        self.describe_timeout = timeout;
        self
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.host.clone(), config.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn current(&self) -> Option<Arc<SessionClient>> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace(&self, client: Option<Arc<SessionClient>>) -> Option<Arc<SessionClient>> {
        let mut slot = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, client)
    }

    /// Live client, or [`ClientError::NotConnected`].
    fn client(&self) -> Result<Arc<SessionClient>> {
        self.current()
            .filter(|client| client.is_alive())
            .ok_or(ClientError::NotConnected)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connects unless already connected.
    ///
    /// A second call while an attempt is running fails with
    /// [`ClientError::ConnectInProgress`]. On failure the manager is left
    /// fully disconnected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClientError::ConnectInProgress);
        }
        let _guard = ConnectGuard(&self.connecting);

        // a connection that died on its own still occupies the slot
        if let Some(stale) = self.replace(None) {
            stale.close().await;
        }
        self.context_bound.store(false, Ordering::SeqCst);

        match SessionClient::connect_with_listeners(
            &self.host,
            self.port,
            Arc::clone(&self.listeners),
            self.describe_timeout,
        )
        .await
        {
            Ok(client) => {
                self.replace(Some(Arc::new(client)));
                info!(host = %self.host, port = self.port, "Session manager connected");
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Closes the current connection. Safe to call when not connected.
    pub async fn disconnect(&self) {
        self.context_bound.store(false, Ordering::SeqCst);
        if let Some(client) = self.replace(None) {
            client.close().await;
            info!("Session manager disconnected");
        }
    }

    /// Disconnects, then connects again.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|client| client.is_alive())
    }

    pub fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// True after a bind-context reply of `true` on the current connection.
    pub fn is_context_bound(&self) -> bool {
        self.is_connected() && self.context_bound.load(Ordering::SeqCst)
    }

    /// Detected mode, [`EvalMode::Legacy`] when disconnected.
    pub fn eval_mode(&self) -> EvalMode {
        self.current()
            .map(|client| client.eval_mode())
            .unwrap_or_default()
    }

    /// Session token, empty when disconnected or not yet established.
    pub fn session(&self) -> String {
        self.current()
            .map(|client| client.session())
            .unwrap_or_default()
    }

    pub async fn wait_for_session(&self, timeout: Duration) -> Result<Option<String>> {
        Ok(self.client()?.wait_for_session(timeout).await)
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.listeners.add(handler)
    }

    pub fn subscribe(&self) -> MessageReceiver {
        self.listeners.subscribe()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Sends any request; an agent error comes back as [`Reply::Error`].
    pub async fn call(&self, request: Request) -> Result<Reply> {
        self.client()?.call(request).await
    }

    pub async fn eval(&self, code: &str) -> Result<Option<String>> {
        self.client()?.eval(code).await
    }

    pub async fn eval_detached(&self, code: &str) -> Result<String> {
        self.client()?.eval_detached(code).await
    }

    pub async fn java_eval(&self, code: &str) -> Result<Option<String>> {
        self.client()?.java_eval(code).await
    }

    pub async fn hot_swap(&self, source: &str) -> Result<String> {
        self.client()?.hot_swap(source).await
    }

    /// Binds the application context and records whether it took.
    pub async fn bind_context(&self, expr: Option<&str>) -> Result<Option<String>> {
        let value = self.client()?.bind_context(expr).await?;
        let bound = reports_bound(value.as_deref());
        self.context_bound.store(bound, Ordering::SeqCst);
        debug!(bound, "Context bind completed");
        Ok(value)
    }

    pub async fn list_beans(&self) -> Result<Vec<BeanInfo>> {
        self.client()?.list_beans().await
    }

    pub async fn snapshots(&self) -> Result<Option<String>> {
        self.client()?.snapshots().await
    }

    pub async fn snapshot_save(&self, name: &str, expr: &str) -> Result<Option<String>> {
        self.client()?.snapshot_save(name, expr).await
    }

    pub async fn snapshot_load(&self, name: &str, var: Option<&str>) -> Result<Option<String>> {
        self.client()?.snapshot_load(name, var).await
    }

    pub async fn snapshot_list(&self) -> Result<Vec<String>> {
        self.client()?.snapshot_list().await
    }

    pub async fn snapshot_delete(&self, name: &str) -> Result<Option<String>> {
        self.client()?.snapshot_delete(name).await
    }

    pub async fn snapshot_pin(&self, name: &str, expr: &str) -> Result<Option<String>> {
        self.client()?.snapshot_pin(name, expr).await
    }

    pub async fn snapshot_save_json(&self, name: &str, expr: &str) -> Result<Option<String>> {
        self.client()?.snapshot_save_json(name, expr).await
    }

    pub async fn snapshot_materialize(
        &self,
        name: &str,
        type_fqn: &str,
        target: Option<&str>,
    ) -> Result<Option<String>> {
        self.client()?
            .snapshot_materialize(name, type_fqn, target)
            .await
    }

    pub async fn snapshot_info(&self, name: &str) -> Result<Option<String>> {
        self.client()?.snapshot_info(name).await
    }

    pub async fn reset_session(&self) -> Result<Option<String>> {
        self.client()?.reset_session().await
    }
}
