//! In-process fan-out bus.
//!
//! Mirrors the delivery shape of the Kafka subscriptions inside a single
//! process: every subscriber sees every published event, each subscriber is
//! driven through the [`Dispatcher`], and one subscriber's failure never
//! affects another.

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::handler::EventHandler;
use crate::model::ChangeEvent;
use crate::store::{ChangeFeedPublisher, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Outcome of one event for one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subscriber: &'static str,
    pub outcome: DispatchOutcome,
}

pub struct Topic<E> {
    name: String,
    subscribers: RwLock<Vec<Arc<dyn EventHandler<E>>>>,
    dispatcher: Arc<Dispatcher>,
}

impl<E> Topic<E>
where
    E: Serialize + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            dispatcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>) {
        debug!(topic = %self.name, subscriber = handler.name(), "Subscriber added");
        self.subscribers.write().push(handler);
    }

    /// Deliver `event` to every subscriber concurrently.
    #[instrument(skip(self, event), fields(topic = %self.name))]
    pub async fn publish(&self, event: &E) -> Vec<Delivery> {
        // Snapshot so the lock is not held across the dispatch awaits
        let subscribers = self.subscribers.read().clone();

        let deliveries = subscribers.iter().map(|handler| async move {
            let outcome = self.dispatcher.dispatch(handler.as_ref(), event).await;
            Delivery {
                subscriber: handler.name(),
                outcome,
            }
        });

        let deliveries = futures::future::join_all(deliveries).await;
        metrics::counter!("pipeline.topic.published", "topic" => self.name.clone()).increment(1);
        deliveries
    }
}

#[async_trait]
impl ChangeFeedPublisher for Topic<ChangeEvent> {
    async fn publish_change(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        // Dead-lettered subscribers count as published; lost ones do not
        let deliveries = self.publish(event).await;

        match deliveries.iter().find(|d| d.outcome.is_undeliverable()) {
            Some(lost) => Err(StoreError::Unavailable(format!(
                "subscriber {} could not dead-letter the change",
                lost.subscriber
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::handler::HandlerError;
    use crate::memory::MemoryDeadLetterSink;
    use parking_lot::Mutex;

    struct Collect {
        name: &'static str,
        seen: Mutex<Vec<u32>>,
        fail: bool,
    }

    impl Collect {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl EventHandler<u32> for Collect {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, event: &u32) -> Result<(), HandlerError> {
            self.seen.lock().push(*event);
            if self.fail {
                return Err(HandlerError::Permanent("rejected".to_string()));
            }
            Ok(())
        }
    }

    fn dispatcher(sink: Arc<MemoryDeadLetterSink>) -> Arc<Dispatcher> {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            multiplier: 1.0,
            invocation_timeout_ms: 100,
        };
        Arc::new(Dispatcher::new(retry, sink))
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_event() {
        let topic = Topic::new("numbers", dispatcher(Arc::new(MemoryDeadLetterSink::new())));
        let a = Collect::new("a", false);
        let b = Collect::new("b", false);
        topic.subscribe(a.clone());
        topic.subscribe(b.clone());

        topic.publish(&1).await;
        topic.publish(&2).await;

        assert_eq!(*a.seen.lock(), vec![1, 2]);
        assert_eq!(*b.seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let topic = Topic::new("numbers", dispatcher(sink.clone()));
        let good = Collect::new("good", false);
        let bad = Collect::new("bad", true);
        topic.subscribe(bad.clone());
        topic.subscribe(good.clone());

        let deliveries = topic.publish(&7).await;

        assert_eq!(deliveries.len(), 2);
        assert!(deliveries
            .iter()
            .any(|d| d.subscriber == "good" && d.outcome.is_delivered()));
        assert!(deliveries
            .iter()
            .any(|d| d.subscriber == "bad" && !d.outcome.is_delivered()));
        assert_eq!(*good.seen.lock(), vec![7]);
        assert_eq!(sink.letters()[0].handler, "bad");
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let topic: Topic<u32> =
            Topic::new("empty", dispatcher(Arc::new(MemoryDeadLetterSink::new())));
        assert!(topic.publish(&1).await.is_empty());
    }

    struct RejectAll;

    #[async_trait]
    impl EventHandler<ChangeEvent> for RejectAll {
        fn name(&self) -> &'static str {
            "reject-all"
        }

        async fn handle(&self, _event: &ChangeEvent) -> Result<(), HandlerError> {
            Err(HandlerError::Permanent("rejected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_change_is_unpublished_when_dead_letter_fails() {
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let topic = Topic::new("changes", dispatcher(sink.clone()));
        topic.subscribe(Arc::new(RejectAll));
        let event = ChangeEvent {
            operation: crate::model::ChangeOperation::Insert,
            new_image: None,
        };

        assert!(topic.publish_change(&event).await.is_ok());

        sink.set_unavailable(true);
        let err = topic.publish_change(&event).await.unwrap_err();
        assert!(err.is_transient());
    }
}

