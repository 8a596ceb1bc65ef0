use crate::arena::{WorkerArena, WorkerPhase};
use crate::capabilities::Capabilities;
use crate::config::GatewayConfig;
use crate::rpc::{LineSink, RpcChannel};
use crate::runner::RunnerTable;
use crate::transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    EventBus, ExecutionError, Invocation, StateStore, StepExecutor, StepLogger, StreamRegistry,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// The single JSON argument every worker receives.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvocationPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    flows: &'a [String],
    trace_id: &'a str,
    context_in_first_arg: bool,
    streams: Vec<StreamRef>,
}

#[derive(Serialize)]
struct StreamRef {
    name: String,
}

enum Stop {
    Exited(io::Result<std::process::ExitStatus>),
    CloseRequested,
    DeadlineExceeded,
}

#[derive(Clone, Copy)]
enum Output {
    Stdout,
    Stderr,
}

/// Runs each invocation in its own worker process and serves the worker's
/// capability calls until it exits.
pub struct ExecutionGateway {
    runners: RunnerTable,
    state: Arc<dyn StateStore>,
    streams: StreamRegistry,
    bus: Arc<EventBus>,
    arena: WorkerArena,
    config: GatewayConfig,
}

impl ExecutionGateway {
    pub fn new(bus: Arc<EventBus>, state: Arc<dyn StateStore>, config: GatewayConfig) -> Self {
        Self {
            runners: RunnerTable::from_config(&config),
            state,
            streams: StreamRegistry::new(),
            bus,
            arena: WorkerArena::new(),
            config,
        }
    }

    pub fn with_runners(mut self, runners: RunnerTable) -> Self {
        self.runners = runners;
        self
    }

    pub fn with_streams(mut self, streams: StreamRegistry) -> Self {
        self.streams = streams;
        self
    }

    pub fn runners(&self) -> &RunnerTable {
        &self.runners
    }

    pub fn arena(&self) -> &WorkerArena {
        &self.arena
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn payload(&self, invocation: &Invocation) -> Result<String, ExecutionError> {
        let payload = InvocationPayload {
            data: invocation.data.as_ref(),
            flows: invocation.step.flows(),
            trace_id: &invocation.trace_id,
            context_in_first_arg: invocation.context_in_first_arg,
            streams: self
                .streams
                .names()
                .into_iter()
                .map(|name| StreamRef { name })
                .collect(),
        };
        Ok(serde_json::to_string(&payload)?)
    }

    async fn run(&self, invocation: Invocation) -> Result<Option<Value>, ExecutionError> {
        let step = &invocation.step;
        let logger = invocation.logger.clone();
        let runner = self.runners.resolve(&step.file_path)?;
        let payload = self.payload(&invocation)?;

        let guard = self.arena.admit(step.file_path.clone(), invocation.trace_id.clone());

        let mut adapter = transport::adapter_for(runner.transport);
        let mut command = Command::new(&runner.command);
        command
            .args(runner.args(&step.file_path, &payload))
            .kill_on_drop(true);
        adapter.prepare(&mut command)?;

        tracing::debug!(
            worker = %guard.id(),
            command = %runner.command,
            transport = ?adapter.kind(),
            step = %step.name(),
            "[step execution] spawning process"
        );

        let mut child = command.spawn().map_err(|e| spawn_error(&runner.command, e))?;
        guard.set_pid(child.id());
        let io = adapter.connect(&mut child)?;

        let channel = Arc::new(RpcChannel::new(step.file_path.clone()));
        let result = Arc::new(Mutex::new(None));
        let close = CancellationToken::new();
        Capabilities {
            step: step.clone(),
            trace_id: invocation.trace_id.clone(),
            logger: logger.clone(),
            state: self.state.clone(),
            streams: self.streams.clone(),
            bus: self.bus.clone(),
            result: result.clone(),
            close: close.clone(),
        }
        .register(&channel);

        let passthrough_logger = logger.clone();
        let passthrough: LineSink = Arc::new(move |line: &str| log_line(&passthrough_logger, line));
        let mut server = channel.serve(io.reader, io.writer, Some(passthrough));
        guard.advance(WorkerPhase::ChannelOpen);

        let mut pumps = Vec::new();
        if let Some(stdout) = io.output {
            pumps.push(tokio::spawn(pump_lines(stdout, logger.clone(), Output::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, logger.clone(), Output::Stderr)));
        }
        guard.advance(WorkerPhase::AwaitingExit);

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status),
            _ = close.cancelled() => Stop::CloseRequested,
            _ = deadline_elapsed(invocation.deadline) => Stop::DeadlineExceeded,
        };

        let deadline_hit = matches!(stop, Stop::DeadlineExceeded);
        let mut wait_error = None;
        let exit_code = match stop {
            Stop::Exited(Ok(status)) => status.code(),
            Stop::Exited(Err(e)) => {
                terminate(&mut child).await;
                wait_error = Some(e);
                None
            }
            Stop::CloseRequested => {
                logger.debug("[step execution] worker requested close");
                terminate(&mut child).await;
                None
            }
            Stop::DeadlineExceeded => {
                terminate(&mut child).await;
                None
            }
        };

        // The worker is gone: keep reading its last lines, but answer nothing.
        channel.stop_responding();

        // Let the tail of the worker's output and any last requests land before closing.
        let drained = tokio::time::timeout(self.config.drain_timeout(), async {
            let _ = (&mut server).await;
            channel.drain().await;
            for pump in pumps.iter_mut() {
                let _ = pump.await;
            }
        })
        .await;
        channel.close();
        if drained.is_err() {
            tracing::debug!(worker = %guard.id(), "worker output not drained in time");
            server.abort();
            for pump in &pumps {
                pump.abort();
            }
        }

        guard.advance(WorkerPhase::Settled);

        if let Some(e) = wait_error {
            return Err(ExecutionError::SpawnFailed(e));
        }
        if deadline_hit {
            let after_ms = invocation
                .deadline
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default();
            return Err(ExecutionError::DeadlineExceeded { after_ms });
        }

        match exit_code {
            Some(0) | None => Ok(result.lock().take()),
            Some(code) => Err(ExecutionError::ExitCode { code }),
        }
    }
}

#[async_trait]
impl StepExecutor for ExecutionGateway {
    async fn execute(&self, invocation: Invocation) -> Result<Option<Value>, ExecutionError> {
        self.run(invocation).await
    }
}

fn spawn_error(command: &str, e: io::Error) -> ExecutionError {
    if e.kind() == io::ErrorKind::NotFound {
        ExecutionError::ExecutableNotFound {
            command: command.to_string(),
        }
    } else {
        ExecutionError::SpawnFailed(e)
    }
}

async fn deadline_elapsed(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!("failed to kill worker: {}", e);
    }
}

/// Worker output lines: JSON objects are log entries, anything else is plain text.
fn log_line(logger: &StepLogger, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(entry @ Value::Object(_)) => logger.log(&entry),
        _ => logger.info(trimmed),
    }
}

async fn pump_lines<R>(reader: R, logger: StepLogger, output: Output)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match output {
                Output::Stdout => log_line(&logger, &line),
                Output::Stderr if !line.trim().is_empty() => logger.error(line),
                Output::Stderr => {}
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("worker output closed: {}", e);
                break;
            }
        }
    }
}
