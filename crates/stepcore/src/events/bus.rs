use super::Event;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

/// Handler invoked for each event delivered to a subscription.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub handler_name: String,
    pub file_path: String,
    pub handler: EventHandler,
}

impl Subscription {
    pub fn new<F, Fut>(
        topic: impl Into<String>,
        handler_name: impl Into<String>,
        file_path: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            topic: topic.into(),
            handler_name: handler_name.into(),
            file_path: file_path.into(),
            handler: Arc::new(move |event| Box::pin(handler(event))),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("handler_name", &self.handler_name)
            .field("file_path", &self.file_path)
            .finish()
    }
}

/// Topic-keyed fan-out of events to subscribed handlers.
///
/// `emit` only schedules handlers; it never waits for them. Use
/// [`EventBus::wait_idle`] to wait until every scheduled handler, including
/// handlers scheduled by other handlers, has finished.
pub struct EventBus {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    tracker: TaskTracker,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            tracker: closed_tracker(),
        }
    }

    pub fn subscribe(&self, subscription: Subscription) {
        tracing::debug!(
            topic = %subscription.topic,
            handler = %subscription.handler_name,
            file = %subscription.file_path,
            "subscribing handler"
        );
        self.subscriptions
            .write()
            .entry(subscription.topic.clone())
            .or_default()
            .push(subscription);
    }

    /// Remove the subscriptions of `file_path` on `topic`, leaving other subscribers alone.
    pub fn unsubscribe(&self, topic: &str, file_path: &str) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(entries) = subscriptions.get_mut(topic) {
            entries.retain(|s| s.file_path != file_path);
            if entries.is_empty() {
                subscriptions.remove(topic);
            }
        }
    }

    /// Schedule every handler subscribed to `event.topic` and return how many were scheduled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn emit(&self, event: Event, origin: Option<&str>) -> usize {
        let handlers: Vec<(String, EventHandler)> = self
            .subscriptions
            .read()
            .get(&event.topic)
            .map(|entries| {
                entries
                    .iter()
                    .map(|s| (s.handler_name.clone(), s.handler.clone()))
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(
            topic = %event.topic,
            trace_id = %event.trace_id,
            origin = origin.unwrap_or("-"),
            handlers = handlers.len(),
            "emitting event"
        );

        let count = handlers.len();
        for (name, handler) in handlers {
            tracing::trace!(handler = %name, "scheduling handler");
            self.tracker.spawn(handler(event.clone()));
        }
        count
    }

    /// Wait until all scheduled handlers have finished.
    pub async fn wait_idle(&self) {
        self.tracker.wait().await;
    }

    pub fn subscribers(&self, topic: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A tracker that is closed from the start, so `wait` resolves whenever it
/// is empty. Closing does not stop `spawn`.
pub fn closed_tracker() -> TaskTracker {
    let tracker = TaskTracker::new();
    tracker.close();
    tracker
}
