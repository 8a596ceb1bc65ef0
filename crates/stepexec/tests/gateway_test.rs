// crates/stepexec/tests/gateway_test.rs
//
// Workers are small `sh` scripts launched through a runner that forwards the
// JSON payload as the script's first argument.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepcore::{
    DataStream, Event, EventBus, EventConfig, ExecutionError, Invocation, LogLevel, LogStream,
    MemoryStateStore, MemoryStream, StateStore, Step, StepConfig, StepExecutor, StepLogger,
    StoreError, StreamRegistry, Subscription,
};
use stepexec::{ExecutionGateway, GatewayConfig, RunnerSpec, RunnerTable, TransportKind};
use stepruntime::{RuntimeConfig, StepRuntime};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

struct Fixture {
    dir: TempDir,
    bus: Arc<EventBus>,
    state: Arc<MemoryStateStore>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
            bus: Arc::new(EventBus::new()),
            state: Arc::new(MemoryStateStore::new()),
        }
    }

    fn runner(&self) -> PathBuf {
        let path = self.dir.path().join("runner.sh");
        if !path.exists() {
            std::fs::write(&path, "exec sh \"$1\" \"$2\"\n").unwrap();
        }
        path
    }

    fn gateway(&self, transport: TransportKind) -> ExecutionGateway {
        let mut runners = RunnerTable::empty();
        runners.register("sh", RunnerSpec::new("sh", self.runner()).with_transport(transport));
        let config = GatewayConfig {
            drain_timeout_ms: 2000,
            ..Default::default()
        };
        ExecutionGateway::new(self.bus.clone(), self.state.clone(), config).with_runners(runners)
    }

    fn script(&self, name: &str, body: &str) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path_str(&path)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn event_step(file_path: &str, emits: &[&str]) -> Step {
    Step::new(
        file_path,
        StepConfig::Event(EventConfig {
            name: "Worker".into(),
            subscribes: vec!["start".into()],
            emits: emits.iter().map(|e| (*e).into()).collect(),
            flows: vec!["f1".into()],
            ..Default::default()
        }),
    )
}

fn invocation(step: Step, data: Value) -> Invocation {
    Invocation::for_event(step, "t1", data, StepLogger::new("t1", vec!["f1".into()]))
}

#[tokio::test]
async fn test_payload_reaches_worker_and_result_comes_back() {
    let fx = Fixture::new();
    let file = fx.script(
        "echo.sh",
        r#"printf '{"type":"rpc_request","method":"result","args":%s}\n' "$1"
"#,
    );
    let gateway = fx.gateway(TransportKind::Stdio);

    let result = gateway
        .execute(invocation(event_step(&file, &[]), json!({ "x": 1 })))
        .await
        .unwrap();

    assert_eq!(
        result,
        Some(json!({
            "data": { "x": 1 },
            "flows": ["f1"],
            "traceId": "t1",
            "contextInFirstArg": false,
            "streams": []
        }))
    );
    assert_eq!(gateway.arena().active_count(), 0);
}

#[tokio::test]
async fn test_stdio_worker_uses_state_capabilities() {
    let fx = Fixture::new();
    let file = fx.script(
        "state.sh",
        r#"printf '%s\n' '{"type":"rpc_request","id":"1","method":"state.set","args":{"traceId":"t1","key":"k","value":42}}'
read -r reply
printf '%s\n' '{"type":"rpc_request","id":"2","method":"state.get","args":{"traceId":"t1","key":"k"}}'
read -r reply
printf '{"type":"rpc_request","method":"result","args":{"reply":%s}}\n' "$reply"
"#,
    );
    let gateway = fx.gateway(TransportKind::Stdio);

    let result = gateway
        .execute(invocation(event_step(&file, &[]), json!({})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result["reply"]["type"], "rpc_response");
    assert_eq!(result["reply"]["id"], "2");
    assert_eq!(result["reply"]["result"], 42);
    assert_eq!(fx.state.get("t1", "k").await.unwrap(), Some(json!(42)));
}

#[tokio::test]
async fn test_nonzero_exit_rejects_even_with_result() {
    let fx = Fixture::new();
    let file = fx.script(
        "fail.sh",
        r#"printf '%s\n' '{"type":"rpc_request","method":"result","args":{"ignored":true}}'
exit 2
"#,
    );
    let gateway = fx.gateway(TransportKind::Stdio);

    let err = gateway
        .execute(invocation(event_step(&file, &[]), json!({})))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), Some(2));
    assert_eq!(err.to_string(), "Process exited with code 2");
}

#[tokio::test]
async fn test_missing_interpreter_is_distinct_from_crash() {
    let fx = Fixture::new();
    let file = fx.script("any.sh", "exit 0\n");
    let mut runners = RunnerTable::empty();
    runners.register("sh", RunnerSpec::new("stepflow-no-such-interpreter", fx.runner()));
    let gateway = ExecutionGateway::new(fx.bus.clone(), fx.state.clone(), GatewayConfig::default())
        .with_runners(runners);

    let err = gateway
        .execute(invocation(event_step(&file, &[]), json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::ExecutableNotFound { ref command } if command == "stepflow-no-such-interpreter"));
    assert_eq!(gateway.arena().active_count(), 0);
}

#[tokio::test]
async fn test_unsupported_extension_is_rejected_before_spawn() {
    let fx = Fixture::new();
    let gateway = fx.gateway(TransportKind::Stdio);

    let err = gateway
        .execute(invocation(event_step("steps/handler.go", &[]), json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::UnsupportedRuntime { .. }));
}

#[tokio::test]
async fn test_emit_is_limited_to_declared_topics() {
    let fx = Fixture::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    for topic in ["done", "other"] {
        let tx = tx.clone();
        fx.bus.subscribe(Subscription::new(topic, "probe", "probe.ts", move |event: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        }));
    }

    let file = fx.script(
        "emit.sh",
        r#"printf '%s\n' '{"type":"rpc_request","id":"1","method":"emit","args":{"topic":"done","data":{"n":1}}}'
read -r reply
printf '%s\n' '{"type":"rpc_request","id":"2","method":"emit","args":{"type":"other","data":{}}}'
read -r reply
"#,
    );
    let gateway = fx.gateway(TransportKind::Stdio);

    gateway
        .execute(invocation(event_step(&file, &["done"]), json!({})))
        .await
        .unwrap();
    fx.bus.wait_idle().await;

    let event = rx.try_recv().unwrap();
    assert_eq!(event.topic, "done");
    assert_eq!(event.trace_id, "t1");
    assert_eq!(event.flows, vec!["f1"]);
    assert_eq!(event.data, json!({ "n": 1 }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_deadline_kills_hung_worker() {
    let fx = Fixture::new();
    let file = fx.script("hang.sh", "exec sleep 30\n");
    let gateway = fx.gateway(TransportKind::Stdio);
    let started = Instant::now();

    let err = gateway
        .execute(invocation(event_step(&file, &[]), json!({})).with_deadline(Some(Duration::from_millis(200))))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::DeadlineExceeded { after_ms: 200 }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(gateway.arena().active_count(), 0);
}

#[tokio::test]
async fn test_close_request_is_a_soft_landing() {
    let fx = Fixture::new();
    let file = fx.script(
        "close.sh",
        r#"printf '%s\n' '{"type":"rpc_request","method":"result","args":"partial"}'
printf '%s\n' '{"type":"rpc_request","method":"close","args":null}'
exec sleep 30
"#,
    );
    let gateway = fx.gateway(TransportKind::Stdio);
    let started = Instant::now();

    let result = gateway
        .execute(invocation(event_step(&file, &[]), json!({})))
        .await
        .unwrap();

    assert_eq!(result, Some(json!("partial")));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_stream_methods_are_registered_per_stream() {
    let fx = Fixture::new();
    let mut streams = StreamRegistry::new();
    let todo = Arc::new(MemoryStream::new());
    streams.register("todo", todo.clone());

    let file = fx.script(
        "stream.sh",
        r#"printf '%s\n' '{"type":"rpc_request","id":"1","method":"streams.todo.create","args":{"groupId":"g","id":"a","data":{"title":"x"}}}'
read -r reply
printf '%s\n' '{"type":"rpc_request","id":"2","method":"streams.todo.getGroup","args":{"groupId":"g"}}'
read -r reply
printf '{"type":"rpc_request","method":"result","args":%s}\n' "$reply"
"#,
    );
    let gateway = fx.gateway(TransportKind::Stdio).with_streams(streams);

    let result = gateway
        .execute(invocation(event_step(&file, &[]), json!({})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result["result"], json!([{ "title": "x" }]));
    assert_eq!(todo.get("g", "a").await.unwrap(), Some(json!({ "title": "x" })));
}

/// Stream whose reads take a while, so they finish after a fast worker exits.
#[derive(Default)]
struct SlowStream {
    reads: AtomicUsize,
}

#[async_trait]
impl DataStream for SlowStream {
    async fn get(&self, _group_id: &str, _id: &str) -> Result<Option<Value>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Some(json!("late")))
    }

    async fn set(&self, _group_id: &str, _id: &str, data: Value) -> Result<Value, StoreError> {
        Ok(data)
    }

    async fn delete(&self, _group_id: &str, _id: &str) -> Result<Option<Value>, StoreError> {
        Ok(None)
    }

    async fn get_group(&self, _group_id: &str) -> Result<Vec<Value>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_no_response_is_written_after_worker_exits() {
    let fx = Fixture::new();
    let slow = Arc::new(SlowStream::default());
    let mut streams = StreamRegistry::new();
    streams.register("slow", slow.clone());

    // A background reader keeps the worker's stdin open after the worker itself exits.
    let late = fx.dir.path().join("late.txt");
    let file = fx.script(
        "early_exit.sh",
        &format!(
            r#"exec 4<&0
cat <&4 >'{}' 2>/dev/null &
printf '%s\n' '{{"type":"rpc_request","id":"9","method":"streams.slow.get","args":{{"groupId":"g","id":"a"}}}}'
exit 0
"#,
            late.display()
        ),
    );
    let gateway = fx.gateway(TransportKind::Stdio).with_streams(streams);

    let result = gateway
        .execute(invocation(event_step(&file, &[]), json!({})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(result, None);
    assert_eq!(slow.reads.load(Ordering::SeqCst), 1);
    let written = std::fs::read_to_string(&late).unwrap_or_default();
    assert!(!written.contains("rpc_response"), "late response reached the worker: {written}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_ipc_worker_talks_on_fd_3_and_logs_on_stdout() {
    let fx = Fixture::new();
    let file = fx.script(
        "ipc.sh",
        r#"printf '%s\n' '{"type":"rpc_request","id":"1","method":"state.set","args":{"traceId":"t1","key":"k","value":"v"}}' >&3
read -r reply <&3
echo "plain log line"
echo '{"level":"warn","msg":"structured","extra":1}'
echo "oops" >&2
printf '{"type":"rpc_request","method":"result","args":{"fd":"%s","mode":"%s","reply":%s}}\n' "$NODE_CHANNEL_FD" "$NODE_CHANNEL_SERIALIZATION_MODE" "$reply" >&3
"#,
    );
    let gateway = fx.gateway(TransportKind::Ipc);
    let logs = LogStream::new(64);
    let mut records = logs.subscribe();
    let logger = StepLogger::new("t1", vec!["f1".into()]).with_sink(logs).child("Worker", file.clone());

    let result = gateway
        .execute(Invocation::for_event(event_step(&file, &[]), "t1", json!({}), logger))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result["fd"], "3");
    assert_eq!(result["mode"], "json");
    assert_eq!(result["reply"]["result"], "v");

    let mut seen = Vec::new();
    while let Ok(record) = records.try_recv() {
        seen.push((record.level, record.msg));
    }
    assert!(seen.contains(&(LogLevel::Info, "plain log line".to_string())));
    assert!(seen.contains(&(LogLevel::Warn, "structured".to_string())));
    assert!(seen.contains(&(LogLevel::Error, "oops".to_string())));
}

#[tokio::test]
async fn test_runtime_chains_steps_through_workers() {
    let fx = Fixture::new();
    let first = fx.script(
        "first.sh",
        r#"printf '%s\n' '{"type":"rpc_request","id":"1","method":"emit","args":{"topic":"done","data":{"from":"first"}}}'
read -r reply
"#,
    );
    let second = fx.script(
        "second.sh",
        r#"printf '%s\n' '{"type":"rpc_request","id":"1","method":"state.set","args":{"traceId":"t1","key":"seen","value":true}}'
read -r reply
"#,
    );

    let gateway = Arc::new(fx.gateway(TransportKind::Stdio));
    let runtime = StepRuntime::new(fx.bus.clone(), gateway.clone(), RuntimeConfig::default());

    runtime.create_step(event_step(&first, &["done"])).unwrap();
    let mut listener = event_step(&second, &[]);
    if let StepConfig::Event(config) = &mut listener.config {
        config.subscribes = vec!["done".into()];
    }
    runtime.create_step(listener).unwrap();

    runtime.emit("start", json!({}), Some("t1".into()));
    runtime.wait_idle().await;

    assert_eq!(fx.state.get("t1", "seen").await.unwrap(), Some(json!(true)));
    assert_eq!(gateway.arena().active_count(), 0);
    runtime.shutdown().await;
}
