use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a worker-supplied level; unknown levels are treated as info.
    pub fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "fatal" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One structured log line produced by the runtime or a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub level: LogLevel,
    pub msg: String,
    pub trace_id: String,
    pub flows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fields: Value,
}

/// Fan-out of log records to live subscribers (UIs, test probes).
#[derive(Clone)]
pub struct LogStream {
    sender: broadcast::Sender<LogRecord>,
}

impl LogStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.sender.subscribe()
    }

    pub fn publish(&self, record: LogRecord) {
        let _ = self.sender.send(record);
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Logger scoped to one trace, optionally narrowed to one step.
#[derive(Clone)]
pub struct StepLogger {
    trace_id: String,
    flows: Vec<String>,
    step: Option<String>,
    file: Option<String>,
    sink: Option<LogStream>,
}

impl StepLogger {
    pub fn new(trace_id: impl Into<String>, flows: Vec<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            flows,
            step: None,
            file: None,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: LogStream) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Derive a logger for `step`, keeping the trace and sink.
    pub fn child(&self, step: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            flows: self.flows.clone(),
            step: Some(step.into()),
            file: Some(file.into()),
            sink: self.sink.clone(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn flows(&self) -> &[String] {
        &self.flows
    }

    pub fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.record(LogLevel::Debug, msg.into(), Value::Null);
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.record(LogLevel::Info, msg.into(), Value::Null);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.record(LogLevel::Warn, msg.into(), Value::Null);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.record(LogLevel::Error, msg.into(), Value::Null);
    }

    pub fn with_fields(&self, level: LogLevel, msg: impl Into<String>, fields: Value) {
        self.record(level, msg.into(), fields);
    }

    /// Forward a worker log entry of the shape `{level, msg, ...fields}`.
    pub fn log(&self, entry: &Value) {
        let Some(obj) = entry.as_object() else {
            self.record(LogLevel::Info, entry.to_string(), Value::Null);
            return;
        };

        let level = obj
            .get("level")
            .and_then(Value::as_str)
            .map(LogLevel::parse)
            .unwrap_or(LogLevel::Info);
        let msg = obj
            .get("msg")
            .or_else(|| obj.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut fields = obj.clone();
        for key in ["level", "msg", "message", "time", "traceId", "flows"] {
            fields.remove(key);
        }
        let fields = if fields.is_empty() {
            Value::Null
        } else {
            Value::Object(fields)
        };

        self.record(level, msg, fields);
    }

    fn record(&self, level: LogLevel, msg: String, fields: Value) {
        let step = self.step.as_deref().unwrap_or("-");
        let trace_id = self.trace_id.as_str();

        match level {
            LogLevel::Trace => tracing::trace!(trace_id, step, fields = %fields, "{}", msg),
            LogLevel::Debug => tracing::debug!(trace_id, step, fields = %fields, "{}", msg),
            LogLevel::Info => tracing::info!(trace_id, step, fields = %fields, "{}", msg),
            LogLevel::Warn => tracing::warn!(trace_id, step, fields = %fields, "{}", msg),
            LogLevel::Error => tracing::error!(trace_id, step, fields = %fields, "{}", msg),
        }

        if let Some(sink) = &self.sink {
            sink.publish(LogRecord {
                level,
                msg,
                trace_id: self.trace_id.clone(),
                flows: self.flows.clone(),
                step: self.step.clone(),
                file: self.file.clone(),
                time: Utc::now(),
                fields,
            });
        }
    }
}

impl std::fmt::Debug for StepLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLogger")
            .field("trace_id", &self.trace_id)
            .field("flows", &self.flows)
            .field("step", &self.step)
            .finish()
    }
}
