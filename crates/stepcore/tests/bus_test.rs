// crates/stepcore/tests/bus_test.rs

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{Event, EventBus, Subscription};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn counting(
    topic: &str,
    file_path: &str,
    counter: Arc<AtomicUsize>,
) -> Subscription {
    Subscription::new(topic, file_path, file_path, move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    })
}

#[tokio::test]
async fn test_fan_out_and_unsubscribe() {
    init_tracing();
    let bus = EventBus::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    bus.subscribe(counting("T", "a.ts", first.clone()));
    bus.subscribe(counting("T", "b.ts", second.clone()));

    let scheduled = bus.emit(Event::new("T", json!({ "n": 1 }), "t1"), None);
    bus.wait_idle().await;

    assert_eq!(scheduled, 2);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    bus.unsubscribe("T", "a.ts");
    bus.emit(Event::new("T", json!({ "n": 2 }), "t2"), None);
    bus.wait_idle().await;

    assert_eq!(first.load(Ordering::SeqCst), 1, "unsubscribed handler must not run");
    assert_eq!(second.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_emit_without_subscribers_is_not_an_error() {
    let bus = EventBus::new();
    assert_eq!(bus.emit(Event::new("nobody", json!(null), "t1"), Some("origin.ts")), 0);
    bus.wait_idle().await;
    assert!(bus.topics().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_only_touches_matching_file() {
    let bus = EventBus::new();
    let counter = Arc::new(AtomicUsize::new(0));
    bus.subscribe(counting("T", "a.ts", counter.clone()));
    bus.subscribe(counting("U", "a.ts", counter.clone()));
    bus.subscribe(counting("T", "b.ts", counter.clone()));

    bus.unsubscribe("T", "a.ts");

    let remaining: Vec<String> = bus.subscribers("T").into_iter().map(|s| s.file_path).collect();
    assert_eq!(remaining, vec!["b.ts".to_string()]);
    assert_eq!(bus.subscribers("U").len(), 1);
}

#[tokio::test]
async fn test_wait_idle_covers_cascaded_emits() {
    let bus = Arc::new(EventBus::new());
    let reached = Arc::new(AtomicUsize::new(0));

    let relay_bus = bus.clone();
    bus.subscribe(Subscription::new("first", "relay", "relay.ts", move |event: Event| {
        let bus = relay_bus.clone();
        async move {
            tokio::task::yield_now().await;
            bus.emit(Event::new("second", event.data, event.trace_id), Some("relay.ts"));
        }
    }));
    bus.subscribe(counting("second", "sink.ts", reached.clone()));

    bus.emit(Event::new("first", json!("payload"), "t1"), None);
    bus.wait_idle().await;

    assert_eq!(reached.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_panic_does_not_stop_other_subscribers() {
    let bus = EventBus::new();
    let counter = Arc::new(AtomicUsize::new(0));

    bus.subscribe(Subscription::new("T", "boom", "boom.ts", |_event| async move {
        panic!("handler failure");
    }));
    bus.subscribe(counting("T", "ok.ts", counter.clone()));

    bus.emit(Event::new("T", json!(null), "t1"), None);
    bus.wait_idle().await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiters_all_return() {
    init_tracing();
    let bus = Arc::new(EventBus::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let slow = counter.clone();
    bus.subscribe(Subscription::new("T", "slow", "slow.ts", move |_event| {
        let slow = slow.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            slow.fetch_add(1, Ordering::SeqCst);
        }
    }));

    for round in 0..20 {
        bus.emit(Event::new("T", json!(round), "t1"), None);
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.wait_idle().await })
            })
            .collect();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("wait_idle hung")
                .unwrap();
        }
    }

    assert_eq!(counter.load(Ordering::SeqCst), 20);
}
