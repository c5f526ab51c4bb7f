//! Integration tests for the REPL client against an in-process fake server.
//!
//! The fake server speaks the same bencode framing as the dev-runtime agent,
//! records every request it receives, and answers through a handler closure.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use replink_client::{
    ClientError, Connection, ConnectionState, EvalMode, SessionManager, HOT_SWAP_COMPLETED,
};
use replink_protocol::{BencodeCodec, Message, Op, Request};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SESSION: &str = "sess-1";

/// Upper bound for conditions that settle asynchronously
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

const SHORT_DESCRIBE_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

type Handler = Arc<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

/// Fake REPL server bound to an ephemeral localhost port.
struct TestServer {
    port: u16,
    received: Arc<Mutex<Vec<Message>>>,
    cancel: CancellationToken,
}

impl TestServer {
    async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        Self::spawn_with_describe_delay(handler, Duration::ZERO).await
    }

    /// Like [`TestServer::spawn`], but holds every describe reply back.
    async fn spawn_with_describe_delay<F>(handler: F, describe_delay: Duration) -> Self
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let handler: Handler = Arc::new(handler);

        let accept_received = Arc::clone(&received);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { break };
                tokio::spawn(serve(
                    stream,
                    Arc::clone(&handler),
                    Arc::clone(&accept_received),
                    describe_delay,
                    accept_cancel.clone(),
                ));
            }
        });

        Self {
            port,
            received,
            cancel,
        }
    }

    /// Server answering like a dev-runtime agent.
    async fn agent(stateful: bool) -> Self {
        Self::spawn(agent_handler(stateful)).await
    }

    fn manager(&self) -> SessionManager {
        SessionManager::new("127.0.0.1", self.port)
    }

    /// Manager for servers that never answer describe.
    fn impatient_manager(&self) -> SessionManager {
        self.manager().with_describe_timeout(SHORT_DESCRIBE_TIMEOUT)
    }

    fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    fn received_op(&self, op: &str) -> Vec<Message> {
        self.received()
            .into_iter()
            .filter(|m| m.op() == Some(op))
            .collect()
    }

    /// Drops every open server-side connection.
    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    stream: TcpStream,
    handler: Handler,
    received: Arc<Mutex<Vec<Message>>>,
    describe_delay: Duration,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, BencodeCodec::new());
    let mut sink = FramedWrite::new(write_half, BencodeCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };
        let Some(Ok(request)) = next else { break };
        received.lock().unwrap().push(request.clone());
        if request.op() == Some("describe") && !describe_delay.is_zero() {
            sleep(describe_delay).await;
        }
        for reply in handler(&request) {
            if sink.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Answers the way the dev-runtime agent does: every reply is a sequence of
/// frames under the request id, ending with `status: done`.
///
/// Evaluated code containing `println` produces an `out` frame first; code
/// containing `fail` produces an `err` frame instead of a value.
fn agent_handler(stateful: bool) -> impl Fn(&Message) -> Vec<Message> + Send + Sync + 'static {
    move |request: &Message| {
        let id = request.id().unwrap_or_default().to_string();
        let frame = || {
            Message::new()
                .with("id", id.clone())
                .with("session", request.session().unwrap_or_default())
        };
        let done = frame().with("status", "done");

        match request.op().unwrap_or_default() {
            "clone" => vec![Message::new()
                .with("id", id.clone())
                .with("new-session", SESSION)
                .with("status", "done")],
            "describe" => {
                let ops = if stateful {
                    "clone,describe,java-eval,eval"
                } else {
                    "clone,describe,java-eval"
                };
                vec![Message::new()
                    .with("id", id.clone())
                    .with("ops", ops)
                    .with("status", "done")]
            }
            "eval" | "java-eval" => {
                let code = request.get("code").unwrap_or_default();
                let mut frames = Vec::new();
                if code.contains("println") {
                    frames.push(frame().with("out", "printed\n"));
                }
                if code.contains("fail") {
                    frames.push(frame().with("err", "boom"));
                } else {
                    frames.push(frame().with("value", format!("={code}")));
                }
                frames.push(done);
                frames
            }
            // a successful reload without a message carries no value
            "class-reload" => vec![frame(), done],
            "bind-spring" => {
                if request.get("expr") == Some("missing") {
                    vec![
                        frame().with("err", "java.lang.ClassNotFoundException: missing"),
                        frame().with("value", "false"),
                        done,
                    ]
                } else {
                    vec![frame().with("value", "true"), done]
                }
            }
            "list-beans" => vec![
                frame().with(
                    "value",
                    "orderService\tcom.acme.OrderService\n\nclock\tjava.time.Clock\n",
                ),
                done,
            ],
            "snapshot-list-simple" => vec![frame().with("value", "orders\ncustomer\n"), done],
            op => vec![frame().with("value", format!("ok:{op}")), done],
        }
    }
}

/// Polls `condition` until it holds or the settle timeout passes.
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < SETTLE_TIMEOUT {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}

// ============================================================================
// Session Establishment Tests
// ============================================================================

#[tokio::test]
async fn test_session_captured_from_clone_reply() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();

    manager.connect().await.expect("connect");
    let session = manager
        .wait_for_session(SETTLE_TIMEOUT)
        .await
        .expect("connected");

    assert_eq!(session.as_deref(), Some(SESSION));
    assert_eq!(manager.session(), SESSION);

    let clones = server.received_op("clone");
    assert_eq!(clones.len(), 1);
    assert_eq!(clones[0].session(), Some(""));
}

#[tokio::test]
async fn test_requests_before_session_carry_empty_session() {
    // never answers clone, so no session is ever established
    let server = TestServer::spawn(|request| match request.op() {
        Some("java-eval") => vec![Message::new()
            .with("id", request.id().unwrap_or_default())
            .with("value", "1")],
        _ => Vec::new(),
    })
    .await;
    let manager = server.impatient_manager();
    manager.connect().await.unwrap();

    let value = manager.eval("1").await.unwrap();

    assert_eq!(value.as_deref(), Some("1"));
    let evals = server.received_op("java-eval");
    assert_eq!(evals[0].session(), Some(""));
    assert_eq!(manager.session(), "");
}

#[tokio::test]
async fn test_requests_after_session_carry_token() {
    let server = TestServer::agent(false).await;
    let manager = server.manager();
    manager.connect().await.unwrap();
    manager.wait_for_session(SETTLE_TIMEOUT).await.unwrap();

    manager.java_eval("40 + 2").await.unwrap();

    let evals = server.received_op("java-eval");
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].session(), Some(SESSION));
    assert!(!evals[0].id().unwrap_or_default().is_empty());
}

// ============================================================================
// Correlation and Dispatch Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_correlate_out_of_order() {
    const REQUESTS: usize = 4;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // collects every eval, then answers them newest first
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, BencodeCodec::new());
        let mut sink = FramedWrite::new(write_half, BencodeCodec::new());

        let mut evals = Vec::new();
        while evals.len() < REQUESTS {
            let request = frames.next().await.unwrap().unwrap();
            if request.op() == Some("eval") {
                evals.push(request);
            }
        }
        for request in evals.iter().rev() {
            let reply = Message::new()
                .with("id", request.id().unwrap())
                .with("value", request.get("code").unwrap());
            sink.send(reply).await.unwrap();
        }
        // hold the socket open until the client is done
        let _ = frames.next().await;
    });

    let connection = Connection::connect("127.0.0.1", port).await.unwrap();
    let (a, b, c, d) = tokio::join!(
        connection.request(Request::evaluate(Op::Eval, "a")),
        connection.request(Request::evaluate(Op::Eval, "b")),
        connection.request(Request::evaluate(Op::Eval, "c")),
        connection.request(Request::evaluate(Op::Eval, "d")),
    );

    assert_eq!(a.unwrap().value(), Some("a"));
    assert_eq!(b.unwrap().value(), Some("b"));
    assert_eq!(c.unwrap().value(), Some("c"));
    assert_eq!(d.unwrap().value(), Some("d"));
    assert_eq!(connection.pending_count(), 0);
    connection.close().await;
}

#[tokio::test]
async fn test_pending_request_completes_before_listeners_run() {
    let server = TestServer::agent(true).await;
    let connection = Arc::new(Connection::connect("127.0.0.1", server.port).await.unwrap());

    let pending_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&pending_seen);
    let observed = Arc::clone(&connection);
    let subscription = connection.on_message(move |message| {
        if message.value().is_some() {
            seen.lock().unwrap().push(observed.pending_count());
        }
    });

    let reply = connection
        .request(Request::evaluate(Op::Eval, "x"))
        .await
        .unwrap();

    assert_eq!(reply.value(), Some("=x"));
    assert!(eventually(|| !pending_seen.lock().unwrap().is_empty()).await);
    assert_eq!(pending_seen.lock().unwrap()[0], 0);

    drop(subscription);
    connection.close().await;
}

#[tokio::test]
async fn test_listeners_see_every_frame() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    let mut frames = manager.subscribe();

    manager.connect().await.unwrap();
    manager.wait_for_session(SETTLE_TIMEOUT).await.unwrap();
    manager.eval("7").await.unwrap();

    let mut saw_session = false;
    let mut saw_value = false;
    while let Ok(Some(message)) = tokio::time::timeout(SETTLE_TIMEOUT, frames.recv()).await {
        saw_session |= message.new_session() == Some(SESSION);
        saw_value |= message.value() == Some("=7");
        if saw_session && saw_value {
            break;
        }
    }
    assert!(saw_session);
    assert!(saw_value);
}

#[tokio::test]
async fn test_detached_eval_reply_reaches_listeners_only() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    let _subscription = manager.on_message(move |message| {
        if let Some(id) = message.id() {
            sink.lock().unwrap().push(id.to_string());
        }
    });

    let id = manager.eval_detached("fire-and-forget").await.unwrap();

    assert!(eventually(|| replies.lock().unwrap().contains(&id)).await);
}

#[tokio::test]
async fn test_listener_survives_reconnect() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();

    let sessions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&sessions);
    let _subscription = manager.on_message(move |message| {
        if message.new_session().is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    manager.connect().await.unwrap();
    assert!(eventually(|| sessions.load(Ordering::SeqCst) == 1).await);
    manager.reconnect().await.unwrap();
    assert!(eventually(|| sessions.load(Ordering::SeqCst) == 2).await);
}

// ============================================================================
// Operation Tests
// ============================================================================

#[tokio::test]
async fn test_stateful_mode_detected_and_used() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    assert_eq!(manager.eval_mode(), EvalMode::Stateful);
    let value = manager.eval("1 + 1").await.unwrap();

    assert_eq!(value.as_deref(), Some("=1 + 1"));
    assert_eq!(server.received_op("eval").len(), 1);
    assert!(server.received_op("java-eval").is_empty());
}

#[tokio::test]
async fn test_legacy_mode_uses_java_eval() {
    let server = TestServer::agent(false).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    manager.eval("2").await.unwrap();

    assert_eq!(manager.eval_mode(), EvalMode::Legacy);
    assert_eq!(server.received_op("java-eval").len(), 1);
    assert!(server.received_op("eval").is_empty());
}

#[tokio::test]
async fn test_slow_describe_settles_mode_before_connect_returns() {
    let server =
        TestServer::spawn_with_describe_delay(agent_handler(true), Duration::from_millis(50)).await;
    let manager = server.manager();

    manager.connect().await.unwrap();
    manager.eval("first").await.unwrap();

    assert_eq!(manager.eval_mode(), EvalMode::Stateful);
    assert_eq!(server.received_op("eval").len(), 1);
    assert!(server.received_op("java-eval").is_empty());
}

#[tokio::test]
async fn test_silent_describe_falls_back_to_legacy() {
    let server = TestServer::spawn(|request| match request.op() {
        Some("describe") => Vec::new(),
        _ => agent_handler(true)(request),
    })
    .await;
    let manager = server.impatient_manager();

    manager.connect().await.unwrap();
    manager.eval("1").await.unwrap();

    assert_eq!(manager.eval_mode(), EvalMode::Legacy);
    assert_eq!(server.received_op("java-eval").len(), 1);
}

#[tokio::test]
async fn test_remote_error_is_named_failure() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    let err = manager.java_eval("fail").await.unwrap_err();

    match err {
        ClientError::Remote { op, message, ex } => {
            assert_eq!(op, "java-eval");
            assert_eq!(message, "boom");
            assert_eq!(ex, None);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // an application error leaves the connection usable
    assert!(manager.is_connected());
    assert!(manager.java_eval("ok").await.is_ok());
}

#[tokio::test]
async fn test_output_before_error_reports_named_failure() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    let mut frames = manager.subscribe();
    manager.connect().await.unwrap();

    let err = manager
        .java_eval("System.out.println(\"x\"); fail();")
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Remote { ref message, .. } if message == "boom"));
    assert!(!err.is_fatal());

    let mut saw_out = false;
    while let Ok(Some(message)) = tokio::time::timeout(SETTLE_TIMEOUT, frames.recv()).await {
        if message.out() == Some("printed\n") {
            saw_out = true;
            break;
        }
    }
    assert!(saw_out);
}

#[tokio::test]
async fn test_output_before_value_keeps_value() {
    let server = TestServer::agent(true).await;
    let connection = Connection::connect("127.0.0.1", server.port).await.unwrap();

    let reply = connection
        .request(Request::evaluate(Op::Eval, "System.out.println(1); 2"))
        .await
        .unwrap();

    assert_eq!(reply.out(), None);
    assert_eq!(reply.value(), Some("=System.out.println(1); 2"));
    assert!(eventually(|| connection.pending_count() == 0).await);
    connection.close().await;
}

#[tokio::test]
async fn test_panicking_listener_leaves_connection_usable() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    let _subscription = manager.on_message(|message| {
        if message.out().is_some() {
            panic!("listener failure");
        }
    });
    manager.connect().await.unwrap();

    let first = tokio::time::timeout(SETTLE_TIMEOUT, manager.eval("System.out.println(1); 1"))
        .await
        .expect("first eval timed out");
    let second = tokio::time::timeout(SETTLE_TIMEOUT, manager.eval("2"))
        .await
        .expect("second eval timed out");

    assert_eq!(first.unwrap().as_deref(), Some("=System.out.println(1); 1"));
    assert_eq!(second.unwrap().as_deref(), Some("=2"));
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_hot_swap_without_value_reports_completed() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    let result = manager
        .hot_swap("package a; public class B {}")
        .await
        .unwrap();

    assert_eq!(result, HOT_SWAP_COMPLETED);
    let reloads = server.received_op("class-reload");
    assert_eq!(reloads[0].get("code"), Some("package a; public class B {}"));
}

#[tokio::test]
async fn test_bind_context_sets_flag_until_disconnect() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();
    assert!(!manager.is_context_bound());

    manager.bind_context(Some("ctx")).await.unwrap();
    assert!(manager.is_context_bound());
    assert_eq!(server.received_op("bind-spring")[0].get("expr"), Some("ctx"));

    manager.disconnect().await;
    assert!(!manager.is_context_bound());
}

#[tokio::test]
async fn test_bind_error_before_value_is_failure() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    let err = manager.bind_context(Some("missing")).await.unwrap_err();

    assert!(matches!(err, ClientError::Remote { ref op, .. } if op == "bind-spring"));
    assert!(!manager.is_context_bound());
    // trailing frames of the failed bind reach listeners only
    assert_eq!(manager.eval("3").await.unwrap().as_deref(), Some("=3"));
}

#[tokio::test]
async fn test_list_beans_and_snapshots() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    let beans = manager.list_beans().await.unwrap();
    assert_eq!(beans.len(), 2);
    assert_eq!(beans[1].name, "clock");
    assert_eq!(beans[1].class_name, "java.time.Clock");

    let names = manager.snapshot_list().await.unwrap();
    assert_eq!(names, vec!["orders".to_string(), "customer".to_string()]);

    let saved = manager.snapshot_save("orders", "repo.findAll()").await.unwrap();
    assert_eq!(saved.as_deref(), Some("ok:snapshot-save"));
    let save = &server.received_op("snapshot-save")[0];
    assert_eq!(save.get("name"), Some("orders"));
    assert_eq!(save.get("expr"), Some("repo.findAll()"));

    manager
        .snapshot_materialize("orders", "java.util.List", None)
        .await
        .unwrap();
    assert!(!server.received_op("snapshot-materialize")[0].contains_key("target"));

    let reset = manager.reset_session().await.unwrap();
    assert_eq!(reset.as_deref(), Some("ok:reset-session"));
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_connect_failure_leaves_manager_disconnected() {
    // grab a free port, then release it so nothing listens there
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let manager = SessionManager::new("127.0.0.1", port);

    let err = manager.connect().await.unwrap_err();

    assert!(matches!(err, ClientError::Connect { .. }));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(matches!(
        manager.eval("1").await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(eventually(|| server.received_op("describe").len() == 1).await);
    assert_eq!(server.received_op("clone").len(), 1);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();

    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.session(), "");
}

#[tokio::test]
async fn test_close_resolves_waiting_request() {
    // answers clone only; evaluations hang forever
    let server = TestServer::spawn(|request| match request.op() {
        Some("clone") => vec![Message::new()
            .with("id", request.id().unwrap_or_default())
            .with("new-session", SESSION)],
        _ => Vec::new(),
    })
    .await;
    let connection = Arc::new(Connection::connect("127.0.0.1", server.port).await.unwrap());

    let waiting = Arc::clone(&connection);
    let request =
        tokio::spawn(async move { waiting.request(Request::evaluate(Op::Eval, "slow")).await });
    assert!(eventually(|| connection.pending_count() == 1).await);

    connection.close().await;
    connection.close().await;

    let result = request.await.unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    assert!(!connection.is_alive());
    assert_eq!(connection.session(), "");
    assert!(matches!(
        connection.send(&Message::new()).await,
        Err(ClientError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_server_close_is_fatal() {
    let server = TestServer::agent(true).await;
    let manager = server.manager();
    manager.connect().await.unwrap();
    manager.wait_for_session(SETTLE_TIMEOUT).await.unwrap();

    server.shutdown();

    assert!(eventually(|| !manager.is_connected()).await);
    assert!(matches!(
        manager.eval("1").await,
        Err(ClientError::NotConnected)
    ));
}
