//! Typed REPL operations on top of a [`Connection`].

use std::sync::Arc;
use std::time::Duration;

use replink_protocol::{
    advertised_ops, fields, parse_bean_listing, parse_snapshot_listing, BeanInfo, Message, Op,
    Request,
};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::listeners::{Listeners, MessageReceiver, Subscription};

/// Value reported for a successful hot swap that carried no value.
pub const HOT_SWAP_COMPLETED: &str = "HotSwap completed";

// ============================================================================
// Reply
// ============================================================================

/// Outcome of a single request, as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The reply carried a `value`.
    Value(String),
    /// Neither `value` nor `err`: success with an implicit result.
    Done,
    /// The reply carried an `err`.
    Error { err: String, ex: Option<String> },
}

impl Reply {
    /// `err` wins over `value`.
    pub fn from_message(message: &Message) -> Self {
        if let Some(err) = message.err() {
            return Reply::Error {
                err: err.to_string(),
                ex: message.ex().map(str::to_string),
            };
        }
        match message.value() {
            Some(value) => Reply::Value(value.to_string()),
            None => Reply::Done,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Reply::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Converts an agent error into [`ClientError::Remote`] tagged with `op`.
    pub fn into_result(self, op: Op) -> Result<Option<String>> {
        match self {
            Reply::Value(value) => Ok(Some(value)),
            Reply::Done => Ok(None),
            Reply::Error { err, ex } => Err(ClientError::Remote {
                op: op.to_string(),
                message: err,
                ex,
            }),
        }
    }
}

// ============================================================================
// Evaluation Mode
// ============================================================================

/// Which evaluation op the server supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Server advertises `eval`: bindings persist across evaluations.
    Stateful,
    /// One-shot `java-eval`.
    #[default]
    Legacy,
}

impl EvalMode {
    /// Picks the mode from a describe reply's `ops` value.
    pub fn from_advertised_ops(ops: &str) -> Self {
        if advertised_ops(ops).contains(&Op::Eval.as_str()) {
            EvalMode::Stateful
        } else {
            EvalMode::Legacy
        }
    }

    pub fn eval_op(self) -> Op {
        match self {
            EvalMode::Stateful => Op::Eval,
            EvalMode::Legacy => Op::JavaEval,
        }
    }
}

// ============================================================================
// Session Client
// ============================================================================

/// How long connect waits for the describe reply before assuming
/// [`EvalMode::Legacy`].
pub const DEFAULT_DESCRIBE_TIMEOUT: Duration = Duration::from_secs(2);

/// REPL session: a connection plus the detected evaluation mode.
#[derive(Debug)]
pub struct SessionClient {
    connection: Connection,
    mode: EvalMode,
}

impl SessionClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_listeners(
            host,
            port,
            Arc::new(Listeners::new()),
            DEFAULT_DESCRIBE_TIMEOUT,
        )
        .await
    }

    /// Connects, then asks the server to describe itself.
    ///
    /// Returns once the describe reply has settled the evaluation mode. A
    /// server that does not answer within `describe_timeout` is treated as
    /// [`EvalMode::Legacy`].
    pub async fn connect_with_listeners(
        host: &str,
        port: u16,
        listeners: Arc<Listeners>,
        describe_timeout: Duration,
    ) -> Result<Self> {
        let connection = Connection::connect_with_listeners(host, port, listeners).await?;

        let id = replink_protocol::new_request_id();
        let describe = connection.expect_reply(&id)?;
        let message = Request::describe().into_message(&id, &connection.session());
        if let Err(e) = connection.send(&message).await {
            connection.close().await;
            return Err(e);
        }

        let mode = match tokio::time::timeout(describe_timeout, describe).await {
            Ok(Ok(reply)) => reply
                .get(fields::OPS)
                .map(EvalMode::from_advertised_ops)
                .unwrap_or_default(),
            Ok(Err(_)) => {
                debug!("Connection closed before describe reply");
                connection.close().await;
                return Err(ClientError::ConnectionClosed);
            }
            Err(_) => {
                connection.cancel_reply(&id);
                warn!(
                    timeout = ?describe_timeout,
                    "No describe reply, assuming legacy evaluation"
                );
                EvalMode::default()
            }
        };
        info!(mode = ?mode, "Evaluation mode detected");

        Ok(Self { connection, mode })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.mode
    }

    pub fn session(&self) -> String {
        self.connection.session()
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    pub async fn wait_for_session(&self, timeout: Duration) -> Option<String> {
        self.connection.wait_for_session(timeout).await
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.connection.on_message(handler)
    }

    pub fn subscribe(&self) -> MessageReceiver {
        self.connection.subscribe()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Sends any request and returns the agent's reply.
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let op = request.op;
        let reply = self.connection.request(request).await?;
        let reply = Reply::from_message(&reply);
        if let Reply::Error { err, .. } = &reply {
            debug!(op = %op, err = %err, "Operation failed remotely");
        }
        Ok(reply)
    }

    async fn call_value(&self, request: Request) -> Result<Option<String>> {
        let op = request.op;
        self.call(request).await?.into_result(op)
    }

    /// Evaluates `code` with the op matching the detected mode.
    pub async fn eval(&self, code: &str) -> Result<Option<String>> {
        self.call_value(Request::evaluate(self.eval_mode().eval_op(), code))
            .await
    }

    /// Evaluates without waiting; replies reach broadcast listeners only.
    ///
    /// Returns the request id so listeners can match the reply.
    pub async fn eval_detached(&self, code: &str) -> Result<String> {
        self.connection
            .send_detached(Request::evaluate(self.eval_mode().eval_op(), code))
            .await
    }

    /// One-shot evaluation regardless of the detected mode.
    pub async fn java_eval(&self, code: &str) -> Result<Option<String>> {
        self.call_value(Request::evaluate(Op::JavaEval, code)).await
    }

    /// Recompiles and redefines a class from source.
    pub async fn hot_swap(&self, source: &str) -> Result<String> {
        let value = self.call_value(Request::class_reload(source)).await?;
        Ok(value.unwrap_or_else(|| HOT_SWAP_COMPLETED.to_string()))
    }

    /// Binds the application context, optionally through `expr`.
    pub async fn bind_context(&self, expr: Option<&str>) -> Result<Option<String>> {
        self.call_value(Request::bind_spring(expr)).await
    }

    pub async fn list_beans(&self) -> Result<Vec<BeanInfo>> {
        let value = self.call_value(Request::list_beans()).await?;
        Ok(value.as_deref().map(parse_bean_listing).unwrap_or_default())
    }

    /// Legacy snapshot summary.
    pub async fn snapshots(&self) -> Result<Option<String>> {
        self.call_value(Request::snapshots()).await
    }

    pub async fn snapshot_save(&self, name: &str, expr: &str) -> Result<Option<String>> {
        self.call_value(Request::snapshot_save(name, expr)).await
    }

    pub async fn snapshot_load(&self, name: &str, var: Option<&str>) -> Result<Option<String>> {
        self.call_value(Request::snapshot_load(name, var)).await
    }

    pub async fn snapshot_list(&self) -> Result<Vec<String>> {
        let value = self.call_value(Request::snapshot_list_simple()).await?;
        Ok(value
            .as_deref()
            .map(parse_snapshot_listing)
            .unwrap_or_default())
    }

    pub async fn snapshot_delete(&self, name: &str) -> Result<Option<String>> {
        self.call_value(Request::snapshot_delete(name)).await
    }

    pub async fn snapshot_pin(&self, name: &str, expr: &str) -> Result<Option<String>> {
        self.call_value(Request::snapshot_pin(name, expr)).await
    }

    pub async fn snapshot_save_json(&self, name: &str, expr: &str) -> Result<Option<String>> {
        self.call_value(Request::snapshot_save_json(name, expr))
            .await
    }

    pub async fn snapshot_materialize(
        &self,
        name: &str,
        type_fqn: &str,
        target: Option<&str>,
    ) -> Result<Option<String>> {
        self.call_value(Request::snapshot_materialize(name, type_fqn, target))
            .await
    }

    pub async fn snapshot_info(&self, name: &str) -> Result<Option<String>> {
        self.call_value(Request::snapshot_info(name)).await
    }

    /// Drops every binding held by the remote session.
    pub async fn reset_session(&self) -> Result<Option<String>> {
        self.call_value(Request::reset_session()).await
    }
}
