use crate::{ExecutionError, Step, StepLogger};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// One request to run a step.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step: Step,
    pub trace_id: String,
    /// Event payload; absent for context-only invocations.
    pub data: Option<Value>,
    /// The worker receives only a context object, no event payload.
    pub context_in_first_arg: bool,
    pub logger: StepLogger,
    /// Upper bound on the invocation's wall time. `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

impl Invocation {
    pub fn for_event(step: Step, trace_id: impl Into<String>, data: Value, logger: StepLogger) -> Self {
        Self {
            step,
            trace_id: trace_id.into(),
            data: Some(data),
            context_in_first_arg: false,
            logger,
            deadline: None,
        }
    }

    pub fn context_only(step: Step, trace_id: impl Into<String>, logger: StepLogger) -> Self {
        Self {
            step,
            trace_id: trace_id.into(),
            data: None,
            context_in_first_arg: true,
            logger,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Runs step invocations, returning the value the step reported as its result.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: Invocation) -> Result<Option<Value>, ExecutionError>;
}
