//! Handler-based subscription on top of the broadcast interface.
//!
//! A handler attaches to one channel and receives every envelope
//! published after attachment, with replayed deliveries deduplicated on
//! the embedded event id. Handler errors are logged and never tear down
//! the subscription.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use stratus_core::EventEnvelope;

use crate::{BusError, CoordinationBus, SeenEvents};

/// Window size for per-handler replay deduplication.
const DEDUPE_WINDOW: usize = 4096;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
    fn handler_name(&self) -> &'static str;
}

/// Subscribe `handler` to `channel`; the returned handle aborts the
/// forwarding task on drop-side cleanup by the caller.
pub async fn attach_handler(
    bus: &Arc<dyn CoordinationBus>,
    channel: &str,
    handler: Arc<dyn EventHandler>,
) -> Result<JoinHandle<()>, BusError> {
    let mut receiver = bus.subscribe(channel).await?;
    let channel = channel.to_string();

    Ok(tokio::spawn(async move {
        let mut seen = SeenEvents::new(DEDUPE_WINDOW);
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if !seen.observe(envelope.event_id) {
                        debug!(
                            channel = %channel,
                            event = %envelope.event_type,
                            "duplicate delivery dropped"
                        );
                        continue;
                    }
                    if let Err(err) = handler.handle_event(&envelope).await {
                        error!(
                            channel = %channel,
                            handler = handler.handler_name(),
                            event = %envelope.event_type,
                            error = %err,
                            "event handler failed"
                        );
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(channel = %channel, missed, "handler lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle_event(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handler_name(&self) -> &'static str {
            "counter"
        }
    }

    #[tokio::test]
    async fn handler_receives_published_events() {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let counter = Arc::new(Counter { calls: AtomicUsize::new(0) });
        let handle = attach_handler(&bus, "monitoring.events", counter.clone())
            .await
            .unwrap();

        let envelope = EventEnvelope::new("node.registered", "s", "p", serde_json::json!({}));
        bus.publish("monitoring.events", &envelope).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn replayed_event_is_delivered_once() {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let counter = Arc::new(Counter { calls: AtomicUsize::new(0) });
        let handle = attach_handler(&bus, "monitoring.events", counter.clone())
            .await
            .unwrap();

        let envelope = EventEnvelope::new("node.registered", "s", "p", serde_json::json!({}));
        bus.publish("monitoring.events", &envelope).await.unwrap();
        bus.publish("monitoring.events", &envelope).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        handle.abort();
    }
}
