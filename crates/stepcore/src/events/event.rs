use crate::StepLogger;
use serde_json::Value;
use uuid::Uuid;

/// An event routed by topic through the [`EventBus`](super::EventBus).
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub data: Value,
    pub trace_id: String,
    pub flows: Vec<String>,
    pub logger: StepLogger,
}

impl Event {
    /// Build an event whose logger is scoped to `trace_id` and `flows`.
    pub fn new(topic: impl Into<String>, data: Value, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        Self {
            topic: topic.into(),
            data,
            logger: StepLogger::new(trace_id.clone(), Vec::new()),
            trace_id,
            flows: Vec::new(),
        }
    }

    pub fn with_flows(mut self, flows: Vec<String>) -> Self {
        self.logger = StepLogger::new(self.trace_id.clone(), flows.clone());
        self.flows = flows;
        self
    }

    pub fn with_logger(mut self, logger: StepLogger) -> Self {
        self.logger = logger;
        self
    }
}

/// Fresh correlation id for an external trigger.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}
