use crate::registry::StepRegistry;
use crate::schedule::{CronError, CronSchedule};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    closed_tracker, new_trace_id, Event, EventBus, Invocation, LogStream, Step, StepConfig, StepExecutor,
    StepLogger, Subscription,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct CronJob {
    expression: String,
    cancel: CancellationToken,
}

/// Wires event steps to the event bus and cron steps to timers.
///
/// Owns the per-file bookkeeping so that a step can be rebound when it
/// changes without touching other steps' bindings.
pub struct StepBinder {
    bus: Arc<EventBus>,
    executor: Arc<dyn StepExecutor>,
    deadline: Option<Duration>,
    logs: Option<LogStream>,
    handlers: Mutex<HashMap<String, Vec<String>>>,
    cron_jobs: Mutex<HashMap<String, CronJob>>,
    cron_runs: TaskTracker,
}

impl StepBinder {
    pub fn new(bus: Arc<EventBus>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            bus,
            executor,
            deadline: None,
            logs: None,
            handlers: Mutex::new(HashMap::new()),
            cron_jobs: Mutex::new(HashMap::new()),
            cron_runs: closed_tracker(),
        }
    }

    /// Deadline applied to every invocation started by this binder.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_logs(mut self, logs: LogStream) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Bind every active step currently held by `registry`.
    pub fn bind_all(&self, registry: &StepRegistry) {
        let event_steps = registry.event_steps();
        tracing::debug!("[step binder] creating step handlers for {} steps", event_steps.len());
        for step in event_steps {
            self.create_handler(step);
        }
        for step in registry.cron_steps() {
            let _ = self.create_cron_job(step);
        }
    }

    /// Bind a single step according to its type. Api and noop steps have no bindings.
    pub fn bind(&self, step: &Step) {
        match &step.config {
            StepConfig::Event(_) => self.create_handler(step),
            StepConfig::Cron(_) => {
                // Failures are logged by create_cron_job.
                let _ = self.create_cron_job(step);
            }
            StepConfig::Api(_) | StepConfig::Noop(_) => {}
        }
    }

    /// Drop every binding held for the step's file.
    pub fn unbind(&self, step: &Step) {
        self.remove_handler(step);
        self.remove_cron_job(step);
    }

    pub fn rebind(&self, step: &Step) {
        self.unbind(step);
        self.bind(step);
    }

    /// Subscribe an event step to each of its topics.
    pub fn create_handler(&self, step: &Step) {
        let StepConfig::Event(config) = &step.config else {
            tracing::warn!("[step binder] {} is not an event step", step.file_path);
            return;
        };

        if self.handlers.lock().contains_key(&step.file_path) {
            self.remove_handler(step);
        }

        tracing::debug!(
            file = %step.file_path,
            step = %config.name,
            "[step binder] establishing step subscriptions"
        );

        let mut topics: Vec<String> = Vec::new();
        for topic in &config.subscribes {
            if topics.contains(topic) {
                continue;
            }
            topics.push(topic.clone());

            let executor = self.executor.clone();
            let step = step.clone();
            let deadline = self.deadline;
            self.bus.subscribe(Subscription::new(
                topic.clone(),
                config.name.clone(),
                step.file_path.clone(),
                move |event: Event| {
                    let executor = executor.clone();
                    let step = step.clone();
                    async move { run_event_step(executor, step, event, deadline).await }
                },
            ));
        }

        self.handlers.lock().insert(step.file_path.clone(), topics);
    }

    pub fn remove_handler(&self, step: &Step) {
        let mut topics = self.handlers.lock().remove(&step.file_path).unwrap_or_default();
        if let StepConfig::Event(config) = &step.config {
            for topic in &config.subscribes {
                if !topics.contains(topic) {
                    topics.push(topic.clone());
                }
            }
        }

        for topic in topics {
            self.bus.unsubscribe(&topic, &step.file_path);
        }
    }

    /// Schedule a cron step. Invalid expressions are logged and the step is skipped.
    pub fn create_cron_job(&self, step: &Step) -> Result<(), CronError> {
        let StepConfig::Cron(config) = &step.config else {
            tracing::warn!("[cron handler] {} is not a cron step", step.file_path);
            return Ok(());
        };

        let schedule = match CronSchedule::parse(&config.cron) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!(
                    expression = %config.cron,
                    step = %config.name,
                    "[cron handler] invalid cron expression: {}",
                    e.reason
                );
                return Err(e);
            }
        };

        self.remove_cron_job(step);

        tracing::debug!(
            file = %step.file_path,
            step = %config.name,
            cron = %config.cron,
            "[cron handler] setting up cron job"
        );

        let cancel = CancellationToken::new();
        let job = CronLoop {
            schedule,
            step: step.clone(),
            executor: self.executor.clone(),
            deadline: self.deadline,
            logs: self.logs.clone(),
            runs: self.cron_runs.clone(),
            cancel: cancel.clone(),
            base_wall: Utc::now(),
            base: Instant::now(),
        };
        tokio::spawn(job.run());

        self.cron_jobs.lock().insert(
            step.file_path.clone(),
            CronJob {
                expression: config.cron.clone(),
                cancel,
            },
        );
        Ok(())
    }

    pub fn remove_cron_job(&self, step: &Step) {
        if let Some(job) = self.cron_jobs.lock().remove(&step.file_path) {
            tracing::debug!("[cron handler] removing cron job {} ({})", step.file_path, job.expression);
            job.cancel.cancel();
        }
    }

    /// File paths of the currently scheduled cron steps.
    pub fn cron_jobs(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.cron_jobs.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn bound_topics(&self, file_path: &str) -> Vec<String> {
        self.handlers.lock().get(file_path).cloned().unwrap_or_default()
    }

    /// Wait for cron-started invocations that are still running.
    pub async fn wait_idle(&self) {
        self.cron_runs.wait().await;
    }

    /// Stop every cron job and drop every event subscription.
    pub fn close(&self) {
        for (_, job) in self.cron_jobs.lock().drain() {
            job.cancel.cancel();
        }
        let handlers: Vec<(String, Vec<String>)> = self.handlers.lock().drain().collect();
        for (file_path, topics) in handlers {
            for topic in topics {
                self.bus.unsubscribe(&topic, &file_path);
            }
        }
    }
}

async fn run_event_step(
    executor: Arc<dyn StepExecutor>,
    step: Step,
    event: Event,
    deadline: Option<Duration>,
) {
    let logger = event.logger.child(step.name(), step.file_path.clone());
    tracing::debug!(
        topic = %event.topic,
        trace_id = %event.trace_id,
        step = %step.name(),
        "[step handler] received event"
    );

    let invocation =
        Invocation::for_event(step, event.trace_id, event.data, logger.clone()).with_deadline(deadline);

    // A failing step must not disturb the other subscribers of this event.
    if let Err(e) = executor.execute(invocation).await {
        logger.error(e.to_string());
    }
}

struct CronLoop {
    schedule: CronSchedule,
    step: Step,
    executor: Arc<dyn StepExecutor>,
    deadline: Option<Duration>,
    logs: Option<LogStream>,
    runs: TaskTracker,
    cancel: CancellationToken,
    base_wall: chrono::DateTime<Utc>,
    base: Instant,
}

impl CronLoop {
    /// Fire on every schedule point until cancelled.
    ///
    /// Firings are placed on the Tokio clock relative to the moment the job
    /// was created, so a paused test clock drives the schedule.
    async fn run(self) {
        let mut cursor = self.base_wall;
        loop {
            let Some(next) = self.schedule.next_after(&cursor) else {
                tracing::debug!("[cron handler] {} has no further firings", self.schedule.expression());
                return;
            };
            let offset = (next - self.base_wall).to_std().unwrap_or_default();

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(self.base + offset) => {}
            }
            cursor = next;

            self.fire();
        }
    }

    fn fire(&self) {
        let trace_id = new_trace_id();
        let mut logger = StepLogger::new(trace_id.clone(), self.step.flows().to_vec());
        if let Some(logs) = &self.logs {
            logger = logger.with_sink(logs.clone());
        }
        let logger = logger.child(self.step.name(), self.step.file_path.clone());

        let invocation = Invocation::context_only(self.step.clone(), trace_id, logger.clone())
            .with_deadline(self.deadline);
        let executor = self.executor.clone();

        self.runs.spawn(async move {
            if let Err(e) = executor.execute(invocation).await {
                logger.error(format!("[cron handler] error executing cron job: {e}"));
            }
        });
    }
}
