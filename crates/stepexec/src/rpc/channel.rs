use super::message::{RpcError, RpcMessage, RpcRequest, RpcResponse};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use stepcore::closed_tracker;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Receives every line that is not an RPC request.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Method-dispatch protocol between the host and one worker.
///
/// Requests are read as newline-delimited JSON and each one is handled on
/// its own task, so a slow handler does not hold up later requests.
/// Responses go back over the same transport. Once responses are stopped,
/// or the channel is closed, nothing more is written, even by handlers that
/// finish late.
pub struct RpcChannel {
    label: String,
    handlers: RwLock<HashMap<String, RpcHandler>>,
    closed: CancellationToken,
    responses: CancellationToken,
    in_flight: TaskTracker,
}

impl RpcChannel {
    pub fn new(label: impl Into<String>) -> Self {
        let closed = CancellationToken::new();
        let responses = closed.child_token();
        Self {
            label: label.into(),
            handlers: RwLock::new(HashMap::new()),
            closed,
            responses,
            in_flight: closed_tracker(),
        }
    }

    /// Register `handler` for `method`, replacing any previous handler.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.write().insert(method.into(), handler);
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.read().contains_key(method)
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.read().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Run the handler for `request`. Notifications produce no response.
    pub async fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let RpcRequest { id, method, args } = request;
        let handler = self.handlers.read().get(&method).cloned();

        let outcome = match handler {
            Some(handler) => handler(args).await,
            None => Err(RpcError::HandlerNotFound { method: method.clone() }),
        };

        if let Err(e) = &outcome {
            tracing::warn!(channel = %self.label, method = %method, "rpc request failed: {}", e);
        }

        let id = id.filter(|id| !id.is_empty())?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(e) => RpcResponse::failure(id, &e),
        })
    }

    /// Read requests from `reader` and write responses to `writer` until the
    /// reader is exhausted or the channel is closed.
    ///
    /// Lines that are not RPC requests go to `passthrough` when given.
    pub fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W, passthrough: Option<LineSink>) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = self.clone();
        tokio::spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel::<RpcResponse>();
            let writer_task = tokio::spawn(write_responses(writer, rx, channel.responses.clone(), channel.label.clone()));

            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    biased;
                    _ = channel.closed.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => channel.on_line(&line, &tx, passthrough.as_ref()),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(channel = %channel.label, "rpc reader stopped: {}", e);
                        break;
                    }
                }
            }

            drop(tx);
            let _ = writer_task.await;
        })
    }

    /// Stop reading and writing. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::trace!(channel = %self.label, "closing rpc channel");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop writing responses while still reading what the peer already sent.
    ///
    /// Used once the peer is gone: its last requests are still dispatched but
    /// their answers are dropped.
    pub fn stop_responding(&self) {
        if !self.responses.is_cancelled() {
            tracing::trace!(channel = %self.label, "rpc responses stopped");
            self.responses.cancel();
        }
    }

    pub fn is_responding(&self) -> bool {
        !self.responses.is_cancelled()
    }

    /// Wait for every request handler started so far.
    pub async fn drain(&self) {
        self.in_flight.wait().await;
    }

    fn on_line(self: &Arc<Self>, line: &str, tx: &mpsc::UnboundedSender<RpcResponse>, passthrough: Option<&LineSink>) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                match passthrough {
                    Some(sink) => sink(trimmed),
                    None => tracing::warn!(channel = %self.label, "Failed to parse RPC message: {} (raw line: {})", e, trimmed),
                }
                return;
            }
        };

        if value.get("type").and_then(Value::as_str) != Some("rpc_request") {
            if let Some(sink) = passthrough {
                sink(trimmed);
            }
            return;
        }

        let id = value.get("id").and_then(Value::as_str).map(str::to_string);
        let request = match serde_json::from_value::<RpcMessage>(value) {
            Ok(RpcMessage::RpcRequest(request)) => request,
            Ok(RpcMessage::RpcResponse(_)) => return,
            Err(e) => {
                let err = RpcError::Malformed(e.to_string());
                tracing::warn!(channel = %self.label, "{}", err);
                if let Some(id) = id.filter(|_| self.is_responding()) {
                    let _ = tx.send(RpcResponse::failure(id, &err));
                }
                return;
            }
        };

        let channel = self.clone();
        let tx = tx.clone();
        self.in_flight.spawn(async move {
            if let Some(response) = channel.dispatch(request).await {
                if !channel.is_responding() {
                    tracing::trace!(channel = %channel.label, id = %response.id, "dropping response after close");
                    return;
                }
                let _ = tx.send(response);
            }
        });
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<RpcResponse>,
    stopped: CancellationToken,
    label: String,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let response = tokio::select! {
            biased;
            _ = stopped.cancelled() => break,
            response = rx.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };

        let mut line = match serde_json::to_string(&RpcMessage::RpcResponse(response)) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(channel = %label, "failed to encode rpc response: {}", e);
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(channel = %label, "rpc writer stopped: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(channel = %label, "rpc writer stopped: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
