use crate::binder::StepBinder;
use crate::registry::{MutationOptions, StepEvent, StepRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    new_trace_id, Event, EventBus, Flow, LogRecord, LogStream, Step, StepExecutor, StepLogger,
    ValidationError,
};
use tokio::sync::broadcast;

/// Ties the registry, the bus and the binder together so that registry
/// mutations rewire bindings as they happen.
pub struct StepRuntime {
    registry: Arc<Mutex<StepRegistry>>,
    bus: Arc<EventBus>,
    binder: Arc<StepBinder>,
    logs: LogStream,
    config: RuntimeConfig,
}

impl StepRuntime {
    pub fn new(bus: Arc<EventBus>, executor: Arc<dyn StepExecutor>, config: RuntimeConfig) -> Self {
        let logs = LogStream::new(config.log_buffer_size);
        let binder = Arc::new(
            StepBinder::new(bus.clone(), executor)
                .with_deadline(config.default_deadline())
                .with_logs(logs.clone()),
        );

        let mut registry = StepRegistry::new();
        let on_created = binder.clone();
        registry.on_step(StepEvent::Created, move |step| on_created.bind(step));
        let on_updated = binder.clone();
        registry.on_step(StepEvent::Updated, move |step| on_updated.rebind(step));
        let on_removed = binder.clone();
        registry.on_step(StepEvent::Removed, move |step| on_removed.unbind(step));

        Self {
            registry: Arc::new(Mutex::new(registry)),
            bus,
            binder,
            logs,
            config,
        }
    }

    /// Must be called from within a Tokio runtime; cron steps start their timers here.
    pub fn create_step(&self, step: Step) -> Result<(), ValidationError> {
        self.registry.lock().create_step(step, MutationOptions::default())
    }

    pub fn update_step(&self, old: &Step, new: Step) -> Result<(), ValidationError> {
        self.registry.lock().update_step(old, new, MutationOptions::default())
    }

    pub fn delete_step(&self, step: &Step) {
        self.registry.lock().delete_step(step, MutationOptions::default())
    }

    /// Load a batch of steps, returning the ones that failed validation.
    pub fn load_steps(&self, steps: Vec<Step>) -> Vec<ValidationError> {
        let mut registry = self.registry.lock();
        let opts = MutationOptions { quiet: true };
        let mut rejected = Vec::new();
        for step in steps {
            if let Err(e) = registry.create_step(step, opts) {
                rejected.push(e);
            }
        }
        tracing::info!(
            "Loaded {} steps ({} active, {} dev)",
            registry.len(),
            registry.active_steps().len(),
            registry.dev_steps().len()
        );
        rejected
    }

    /// Emit an external event. A new trace is started when `trace_id` is `None`.
    pub fn emit(&self, topic: impl Into<String>, data: Value, trace_id: Option<String>) -> String {
        let trace_id = trace_id.unwrap_or_else(new_trace_id);
        let logger = StepLogger::new(trace_id.clone(), Vec::new()).with_sink(self.logs.clone());
        let event = Event::new(topic, data, trace_id.clone()).with_logger(logger);
        self.emit_event(event);
        trace_id
    }

    pub fn emit_event(&self, event: Event) -> usize {
        self.bus.emit(event, None)
    }

    /// Wait until cron-started runs and every scheduled handler have finished.
    pub async fn wait_idle(&self) {
        self.binder.wait_idle().await;
        self.bus.wait_idle().await;
    }

    /// Stop cron jobs, drop subscriptions and wait for in-flight work.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down step runtime");
        self.binder.close();
        self.wait_idle().await;
    }

    /// Read access to the registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&StepRegistry) -> R) -> R {
        f(&self.registry.lock())
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.registry.lock().flows().cloned().collect()
    }

    pub fn logs(&self) -> broadcast::Receiver<LogRecord> {
        self.logs.subscribe()
    }

    pub fn log_stream(&self) -> &LogStream {
        &self.logs
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn binder(&self) -> &Arc<StepBinder> {
        &self.binder
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Deadline applied to every invocation. `None` waits for the worker indefinitely.
    pub default_deadline_ms: Option<u64>,
    pub log_buffer_size: usize,
}

impl RuntimeConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: None,
            log_buffer_size: 1000,
        }
    }
}
