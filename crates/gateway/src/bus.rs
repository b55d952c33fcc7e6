//! In-process event bus for observability side-effects.
//!
//! Sessions publish lifecycle events (`asr.result`, `llm.response`,
//! `tts.speak`, and their `.error` variants); subscribers register
//! typed callbacks. Delivery is best-effort by design — core
//! correctness never depends on it. The async variant runs a small
//! worker pool over a bounded buffer and drops on overflow; a
//! panicking subscriber is contained per event.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

/// Well-known topics.
pub mod topics {
    pub const ASR_RESULT: &str = "asr.result";
    pub const ASR_ERROR: &str = "asr.error";
    pub const LLM_RESPONSE: &str = "llm.response";
    pub const LLM_ERROR: &str = "llm.error";
    pub const TTS_SPEAK: &str = "tts.speak";
    pub const TTS_ERROR: &str = "tts.error";
}

/// Async delivery workers.
const WORKER_COUNT: usize = 10;
/// Async buffer size; overflow drops the event.
const BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;
type SubscriberMap = Arc<RwLock<HashMap<String, Vec<Subscriber>>>>;

pub struct EventBus {
    subscribers: SubscriberMap,
    async_tx: mpsc::Sender<Event>,
}

impl EventBus {
    /// Create the bus and spawn its delivery workers (requires a
    /// running tokio runtime).
    pub fn new() -> Arc<Self> {
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let (async_tx, async_rx) = mpsc::channel::<Event>(BUFFER_SIZE);
        let async_rx = Arc::new(tokio::sync::Mutex::new(async_rx));

        for _ in 0..WORKER_COUNT {
            let rx = async_rx.clone();
            let subs = subscribers.clone();
            tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    match event {
                        Some(event) => deliver(&subs, &event),
                        None => break,
                    }
                }
            });
        }

        Arc::new(Self {
            subscribers,
            async_tx,
        })
    }

    /// Register a callback for one topic.
    pub fn subscribe<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Deliver inline on the caller's task.
    pub fn publish(&self, topic: &str, payload: Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
        };
        deliver(&self.subscribers, &event);
    }

    /// Queue for worker delivery; dropped with a warning on overflow.
    pub fn publish_async(&self, topic: &str, payload: Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.async_tx.try_send(event) {
            tracing::warn!(topic, "event bus buffer full, dropping event");
        }
    }
}

/// A misbehaving subscriber must not take the worker (or the
/// publishing session) down with it.
fn deliver(subs: &SubscriberMap, event: &Event) {
    let callbacks: Vec<Subscriber> = subs
        .read()
        .get(&event.topic)
        .map(|v| v.to_vec())
        .unwrap_or_default();

    for callback in callbacks {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
        if result.is_err() {
            tracing::error!(topic = %event.topic, "event subscriber panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sync_publish_delivers_inline() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(topics::ASR_RESULT, move |e| {
            assert_eq!(e.payload["text"], "hi");
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(topics::ASR_RESULT, serde_json::json!({"text": "hi"}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(topics::TTS_SPEAK, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(topics::LLM_RESPONSE, serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_poison_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(topics::LLM_ERROR, |_| panic!("bad subscriber"));
        let c = count.clone();
        bus.subscribe(topics::LLM_ERROR, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(topics::LLM_ERROR, serde_json::json!({}));
        // The second subscriber still ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_publish_reaches_workers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(topics::TTS_SPEAK, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_async(topics::TTS_SPEAK, serde_json::json!({}));
        // Give a worker a moment to pick it up.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("async event never delivered");
    }
}
