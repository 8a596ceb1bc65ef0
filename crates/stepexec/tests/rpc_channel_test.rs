// crates/stepexec/tests/rpc_channel_test.rs

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepexec::rpc::LineSink;
use stepexec::{RpcChannel, RpcError, RpcMessage, RpcRequest, RpcResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// The worker's end of an in-memory transport.
struct Worker {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Worker {
    async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next_response(&mut self) -> Option<RpcResponse> {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("worker read timed out")
            .unwrap()?;
        match serde_json::from_str(&line).unwrap() {
            RpcMessage::RpcResponse(response) => Some(response),
            other => panic!("unexpected message {other:?}"),
        }
    }
}

fn connect(channel: &Arc<RpcChannel>, passthrough: Option<LineSink>) -> Worker {
    let (host, worker) = tokio::io::duplex(4096);
    let (host_reader, host_writer) = tokio::io::split(host);
    channel.serve(host_reader, host_writer, passthrough);

    let (worker_reader, worker_writer) = tokio::io::split(worker);
    Worker {
        lines: BufReader::new(worker_reader).lines(),
        writer: worker_writer,
    }
}

fn adding_channel() -> Arc<RpcChannel> {
    let channel = Arc::new(RpcChannel::new("test"));
    channel.register_handler("add", |args: Value| async move {
        let a = args["a"].as_i64().ok_or_else(|| RpcError::Handler("a is required".into()))?;
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    channel
}

#[tokio::test]
async fn test_request_gets_exactly_one_response_with_its_id() {
    init_tracing();
    let channel = adding_channel();
    let mut worker = connect(&channel, None);

    worker
        .send(json!({ "type": "rpc_request", "id": "X", "method": "add", "args": { "a": 1, "b": 2 } }))
        .await;

    let response = worker.next_response().await.unwrap();
    assert_eq!(response, RpcResponse::success("X", json!(3)));
}

#[tokio::test]
async fn test_unknown_method_fails_the_request() {
    let channel = adding_channel();
    let mut worker = connect(&channel, None);

    worker
        .send(json!({ "type": "rpc_request", "id": "Z", "method": "nope", "args": null }))
        .await;

    let response = worker.next_response().await.unwrap();
    assert_eq!(response.id, "Z");
    assert_eq!(response.error.as_deref(), Some("Handler for method nope not found"));
}

#[tokio::test]
async fn test_handler_errors_are_returned_as_text() {
    let channel = adding_channel();
    let mut worker = connect(&channel, None);

    worker
        .send(json!({ "type": "rpc_request", "id": "E", "method": "add", "args": {} }))
        .await;

    let response = worker.next_response().await.unwrap();
    assert_eq!(response.error.as_deref(), Some("a is required"));
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let channel = adding_channel();
    let mut worker = connect(&channel, None);

    worker
        .send(json!({ "type": "rpc_request", "method": "add", "args": { "a": 1 } }))
        .await;
    worker
        .send(json!({ "type": "rpc_request", "id": "Y", "method": "add", "args": { "a": 5 } }))
        .await;

    let response = worker.next_response().await.unwrap();
    assert_eq!(response.id, "Y");

    let direct = channel
        .dispatch(RpcRequest::notification("add", json!({ "a": 1 })))
        .await;
    assert!(direct.is_none());
}

#[tokio::test]
async fn test_malformed_request_with_id_is_answered() {
    let channel = adding_channel();
    let mut worker = connect(&channel, None);

    worker.send(json!({ "type": "rpc_request", "id": "M" })).await;

    let response = worker.next_response().await.unwrap();
    assert_eq!(response.id, "M");
    assert!(response.error.unwrap().starts_with("Malformed RPC message"));
}

#[tokio::test]
async fn test_other_lines_reach_passthrough() {
    let channel = adding_channel();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: LineSink = Arc::new(move |line: &str| {
        let _ = tx.send(line.to_string());
    });
    let mut worker = connect(&channel, Some(sink));

    worker.writer.write_all(b"plain text\n").await.unwrap();
    worker.send(json!({ "level": "info", "msg": "hello" })).await;

    assert_eq!(rx.recv().await.unwrap(), "plain text");
    assert_eq!(rx.recv().await.unwrap(), r#"{"level":"info","msg":"hello"}"#);
}

#[tokio::test]
async fn test_nothing_is_written_after_close() {
    init_tracing();
    let channel = Arc::new(RpcChannel::new("test"));
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        let finished = finished.clone();
        channel.register_handler("slow", move |_args| {
            let release = release.clone();
            let finished = finished.clone();
            async move {
                release.notified().await;
                finished.store(true, Ordering::SeqCst);
                Ok(json!("late"))
            }
        });
    }
    let mut worker = connect(&channel, None);

    worker
        .send(json!({ "type": "rpc_request", "id": "S", "method": "slow", "args": null }))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    channel.close();
    release.notify_one();
    channel.drain().await;
    assert!(finished.load(Ordering::SeqCst));

    // The host side may already be gone, so the write itself is allowed to fail.
    let _ = worker
        .writer
        .write_all(b"{\"type\":\"rpc_request\",\"id\":\"T\",\"method\":\"slow\"}\n")
        .await;

    assert!(worker.next_response().await.is_none());
    assert!(channel.is_closed());
}

#[tokio::test]
async fn test_requests_still_run_after_responses_stop() {
    init_tracing();
    let channel = adding_channel();
    let calls = Arc::new(AtomicBool::new(false));
    {
        let calls = calls.clone();
        channel.register_handler("mark", move |_args| {
            let calls = calls.clone();
            async move {
                calls.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: LineSink = Arc::new(move |line: &str| {
        let _ = tx.send(line.to_string());
    });
    let mut worker = connect(&channel, Some(sink));

    channel.stop_responding();
    assert!(!channel.is_responding());
    assert!(!channel.is_closed());

    worker
        .send(json!({ "type": "rpc_request", "id": "A", "method": "mark", "args": null }))
        .await;
    worker.writer.write_all(b"tail log\n").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "tail log");

    channel.drain().await;
    assert!(calls.load(Ordering::SeqCst));

    worker.writer.shutdown().await.unwrap();
    assert!(worker.next_response().await.is_none());
}
