//! Change-notification bus.
//!
//! Every successful store mutation publishes an [`Event`] on the
//! `l01:events` channel. Publication is best-effort: a failed publish never
//! rolls back the write, and the event stays queryable in the log for
//! startup retry. Consumers dedupe on `event_id`.

use crate::models::Event;
use crate::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Channel all store change events are published on.
pub const EVENTS_CHANNEL: &str = "l01:events";

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Returns the number of live subscribers reached.
    async fn publish(&self, event: &Event) -> Result<usize, StoreError>;

    /// Subscribe to the channel. Events published after this call are
    /// delivered in publish order per subscriber.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Event>, StoreError>;
}

/// In-process bus used by default and in tests. Mirrors the wire contract of
/// the Redis implementation without the network hop.
pub struct LocalEventBus {
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: &Event) -> Result<usize, StoreError> {
        let mut subs = self.subscribers.write().await;
        let mut delivered = 0;
        subs.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => false,
        });
        debug!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            subscribers = delivered,
            "Published event on local bus"
        );
        Ok(delivered)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Event>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }
}

/// Redis-backed bus publishing JSON envelopes on `l01:events`.
#[cfg(feature = "redis")]
pub struct RedisEventBus {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisEventBus {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Bus(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &Event) -> Result<usize, StoreError> {
        use redis::AsyncCommands;

        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Bus(format!("Failed to get connection: {}", e)))?;

        let payload = serde_json::to_string(event)?;
        let subscribers: u32 = conn
            .publish(EVENTS_CHANNEL, payload)
            .await
            .map_err(|e| StoreError::Bus(format!("Failed to publish: {}", e)))?;

        debug!(
            event_type = %event.event_type,
            subscribers,
            "Published event on {}", EVENTS_CHANNEL
        );
        Ok(subscribers as usize)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Event>, StoreError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Bus(format!("Failed to get connection: {}", e)))?;

        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(EVENTS_CHANNEL)
            .await
            .map_err(|e| StoreError::Bus(format!("Failed to subscribe: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();
                match serde_json::from_str::<Event>(&payload) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Discarding undecodable event payload: {}", e);
                    }
                }
            }
            info!("Subscription to {} ended", EVENTS_CHANNEL);
        });

        info!("Subscribed to channel: {}", EVENTS_CHANNEL);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::empty_object;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event(event_type: &str) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_type: "workflow".to_string(),
            aggregate_id: "wf_test".to_string(),
            payload: empty_object(),
            metadata: empty_object(),
            version: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = LocalEventBus::new();
        let mut rx1 = bus.subscribe().await.unwrap();
        let mut rx2 = bus.subscribe().await.unwrap();

        let delivered = bus.publish(&sample_event("workflow.created")).await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap().event_type, "workflow.created");
        assert_eq!(rx2.recv().await.unwrap().event_type, "workflow.created");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = LocalEventBus::new();
        let rx = bus.subscribe().await.unwrap();
        drop(rx);

        let delivered = bus.publish(&sample_event("workflow.updated")).await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = LocalEventBus::new();
        let mut rx = bus.subscribe().await.unwrap();

        for i in 0..5 {
            let mut event = sample_event("workflow.updated");
            event.version = i + 1;
            bus.publish(&event).await.unwrap();
        }

        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().version, i + 1);
        }
    }
}
