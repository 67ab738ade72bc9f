//! Routes change events from the store bus to downstream layers.
//!
//! Each event's `aggregate_type` selects a target layer; delivery is a
//! `POST /events/<kind>` with a short timeout. Failed deliveries land on a
//! bounded per-target dead-letter queue (oldest evicted, eviction counted)
//! drained by an explicit retry.

use crate::IntegrationError;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workflow_store::Event;

pub const DEFAULT_DLQ_MAX_SIZE: usize = 1000;
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// aggregate_type -> (target service, event kind path segment)
fn route_for(aggregate_type: &str) -> Option<(&'static str, &'static str)> {
    match aggregate_type {
        "agent" => Some(("L02_runtime", "agent")),
        "tool" | "tool_execution" => Some(("L03_tool_execution", "tool")),
        "plan" => Some(("L05_planning", "plan")),
        "dataset" | "training_example" => Some(("L07_learning", "training")),
        "session" => Some(("L10_sessions", "session")),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EventRouterConfig {
    /// target service name -> base URL
    pub targets: HashMap<String, String>,
    pub dlq_max_size: usize,
    pub delivery_timeout: Duration,
    /// Below this many received events the health check does not judge the
    /// success rate.
    pub min_events_for_health: u64,
    /// Drain the DLQs once when a consumer starts.
    pub retry_on_startup: bool,
}

impl Default for EventRouterConfig {
    fn default() -> Self {
        let mut targets = HashMap::new();
        targets.insert("L02_runtime".to_string(), "http://localhost:8002".to_string());
        targets.insert(
            "L03_tool_execution".to_string(),
            "http://localhost:8003".to_string(),
        );
        targets.insert("L05_planning".to_string(), "http://localhost:8005".to_string());
        targets.insert("L07_learning".to_string(), "http://localhost:8007".to_string());
        targets.insert("L10_sessions".to_string(), "http://localhost:8010".to_string());
        Self {
            targets,
            dlq_max_size: DEFAULT_DLQ_MAX_SIZE,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            min_events_for_health: 10,
            retry_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub events_received: u64,
    pub events_routed: u64,
    pub events_by_type: HashMap<String, u64>,
    pub dlq_sizes: HashMap<String, usize>,
    pub dropped: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterHealth {
    pub healthy: bool,
    pub success_rate_percent: f64,
    pub events_received: u64,
    pub events_routed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub total: usize,
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct DlqEntry {
    event: Event,
    kind: &'static str,
}

#[derive(Default)]
struct Counters {
    events_received: u64,
    events_routed: u64,
    events_by_type: HashMap<String, u64>,
    dropped: HashMap<String, u64>,
}

pub struct EventRouter {
    config: EventRouterConfig,
    client: Mutex<Option<Client>>,
    counters: Mutex<Counters>,
    dlqs: Mutex<HashMap<String, VecDeque<DlqEntry>>>,
}

impl EventRouter {
    pub fn new(config: EventRouterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: Mutex::new(None),
            counters: Mutex::new(Counters::default()),
            dlqs: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(&self) {
        let mut client = self.client.lock();
        if client.is_none() {
            *client = Some(Client::new());
            info!("Event router started");
        }
    }

    pub fn stop(&self) {
        *self.client.lock() = None;
        info!("Event router stopped");
    }

    /// Spawn a consumer over a bus subscription. The task runs until the
    /// subscription closes.
    pub fn consume(self: Arc<Self>, mut rx: UnboundedReceiver<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.config.retry_on_startup {
                self.retry_dlq().await;
            }
            while let Some(event) = rx.recv().await {
                self.route_l01_event(&event).await;
            }
            info!("Event router consumer stopped");
        })
    }

    /// Route one event. Returns `true` when the downstream accepted it.
    /// Unknown aggregate types are counted but not forwarded.
    pub async fn route_l01_event(&self, event: &Event) -> bool {
        {
            let mut counters = self.counters.lock();
            counters.events_received += 1;
            *counters
                .events_by_type
                .entry(event.aggregate_type.clone())
                .or_insert(0) += 1;
        }

        let Some(client) = self.client.lock().clone() else {
            warn!("Event router not started, dropping event routing attempt");
            return false;
        };

        let Some((target, kind)) = route_for(&event.aggregate_type) else {
            debug!(
                aggregate_type = %event.aggregate_type,
                "No route for aggregate type"
            );
            return false;
        };

        let Some(base_url) = self.config.targets.get(target) else {
            warn!(target, "No endpoint configured for target");
            return false;
        };

        match self.deliver(&client, base_url, kind, event).await {
            Ok(()) => {
                self.counters.lock().events_routed += 1;
                true
            }
            Err(e) => {
                warn!(
                    target,
                    event_id = %event.event_id,
                    "Delivery failed, queueing on DLQ: {}", e
                );
                self.enqueue_dlq(target, DlqEntry {
                    event: event.clone(),
                    kind,
                });
                false
            }
        }
    }

    async fn deliver(
        &self,
        client: &Client,
        base_url: &str,
        kind: &str,
        event: &Event,
    ) -> Result<(), IntegrationError> {
        let url = format!("{}/events/{}", base_url.trim_end_matches('/'), kind);
        let response = client
            .post(&url)
            .timeout(self.config.delivery_timeout)
            .json(event)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IntegrationError::Timeout(self.config.delivery_timeout)
                } else {
                    IntegrationError::ConnectFailure(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(IntegrationError::RemoteError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    fn enqueue_dlq(&self, target: &str, entry: DlqEntry) {
        let mut dlqs = self.dlqs.lock();
        let queue = dlqs.entry(target.to_string()).or_default();
        if queue.len() >= self.config.dlq_max_size {
            queue.pop_front();
            let mut counters = self.counters.lock();
            *counters.dropped.entry(target.to_string()).or_insert(0) += 1;
        }
        queue.push_back(entry);
    }

    /// Drain every DLQ and retry delivery. Entries that fail again are
    /// re-queued. Returns per-target retry statistics.
    pub async fn retry_dlq(&self) -> HashMap<String, RetryStats> {
        let drained: Vec<(String, Vec<DlqEntry>)> = {
            let mut dlqs = self.dlqs.lock();
            dlqs.iter_mut()
                .map(|(target, queue)| (target.clone(), queue.drain(..).collect()))
                .collect()
        };

        let client = self.client.lock().clone();
        let mut results = HashMap::new();

        for (target, entries) in drained {
            let mut stats = RetryStats {
                total: entries.len(),
                ..Default::default()
            };

            let base_url = self.config.targets.get(&target).cloned();
            for entry in entries {
                stats.retried += 1;
                let delivered = match (&client, &base_url) {
                    (Some(client), Some(base_url)) => self
                        .deliver(client, base_url, entry.kind, &entry.event)
                        .await
                        .is_ok(),
                    _ => false,
                };
                if delivered {
                    stats.succeeded += 1;
                    self.counters.lock().events_routed += 1;
                } else {
                    stats.failed += 1;
                    self.enqueue_dlq(&target, entry);
                }
            }

            info!(
                target = %target,
                total = stats.total,
                succeeded = stats.succeeded,
                failed = stats.failed,
                "DLQ retry pass complete"
            );
            results.insert(target, stats);
        }

        results
    }

    pub fn get_metrics(&self) -> RouterMetrics {
        let counters = self.counters.lock();
        let dlqs = self.dlqs.lock();
        RouterMetrics {
            events_received: counters.events_received,
            events_routed: counters.events_routed,
            events_by_type: counters.events_by_type.clone(),
            dlq_sizes: dlqs.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            dropped: counters.dropped.clone(),
        }
    }

    pub fn get_health(&self) -> RouterHealth {
        let counters = self.counters.lock();
        let success_rate_percent = if counters.events_received == 0 {
            100.0
        } else {
            counters.events_routed as f64 / counters.events_received as f64 * 100.0
        };
        RouterHealth {
            healthy: success_rate_percent >= 95.0
                || counters.events_received < self.config.min_events_for_health,
            success_rate_percent,
            events_received: counters.events_received,
            events_routed: counters.events_routed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_event(aggregate_type: &str) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: format!("{}.created", aggregate_type),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: "agg-1".to_string(),
            payload: json!({"k": "v"}),
            metadata: json!({}),
            version: 1,
            timestamp: Utc::now(),
        }
    }

    fn router_with_target(target: &str, url: &str, dlq_max: usize) -> Arc<EventRouter> {
        let mut targets = HashMap::new();
        targets.insert(target.to_string(), url.to_string());
        let router = EventRouter::new(EventRouterConfig {
            targets,
            dlq_max_size: dlq_max,
            delivery_timeout: Duration::from_secs(2),
            min_events_for_health: 10,
            retry_on_startup: false,
        });
        router.start();
        router
    }

    #[tokio::test]
    async fn test_agent_event_routes_to_runtime_target() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/events/agent")
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        let router = router_with_target("L02_runtime", &server.url(), 10);
        assert!(router.route_l01_event(&sample_event("agent")).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dataset_event_routes_to_training_kind() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/events/training")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let router = router_with_target("L07_learning", &server.url(), 10);
        assert!(router.route_l01_event(&sample_event("dataset")).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_aggregate_is_counted_not_forwarded() {
        let router = router_with_target("L02_runtime", "http://localhost:1", 10);
        assert!(!router.route_l01_event(&sample_event("mystery")).await);

        let metrics = router.get_metrics();
        assert_eq!(metrics.events_received, 1);
        assert_eq!(metrics.events_routed, 0);
        assert_eq!(metrics.events_by_type["mystery"], 1);
        assert!(metrics.dlq_sizes.values().all(|&size| size == 0));
    }

    #[tokio::test]
    async fn test_failed_delivery_lands_on_dlq() {
        // Nothing is listening on this port.
        let router = router_with_target("L02_runtime", "http://127.0.0.1:1", 10);
        assert!(!router.route_l01_event(&sample_event("agent")).await);

        let metrics = router.get_metrics();
        assert_eq!(metrics.dlq_sizes["L02_runtime"], 1);
    }

    #[tokio::test]
    async fn test_dlq_is_bounded_and_counts_evictions() {
        let router = router_with_target("L02_runtime", "http://127.0.0.1:1", 2);
        for _ in 0..4 {
            router.route_l01_event(&sample_event("agent")).await;
        }

        let metrics = router.get_metrics();
        assert_eq!(metrics.dlq_sizes["L02_runtime"], 2);
        assert_eq!(metrics.dropped["L02_runtime"], 2);
    }

    #[tokio::test]
    async fn test_retry_dlq_redelivers() {
        let mut server = mockito::Server::new_async().await;
        // First attempt fails, retry succeeds.
        let failing = server
            .mock("POST", "/events/agent")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let router = router_with_target("L02_runtime", &server.url(), 10);
        assert!(!router.route_l01_event(&sample_event("agent")).await);
        failing.remove_async().await;

        let ok = server
            .mock("POST", "/events/agent")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let results = router.retry_dlq().await;
        let stats = &results["L02_runtime"];
        assert_eq!(stats.total, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(router.get_metrics().dlq_sizes["L02_runtime"], 0);
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_reflects_success_rate() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/events/agent")
            .with_status(200)
            .with_body("{}")
            .expect_at_least(1)
            .create_async()
            .await;

        let router = router_with_target("L02_runtime", &server.url(), 10);
        for _ in 0..5 {
            router.route_l01_event(&sample_event("agent")).await;
        }

        let health = router.get_health();
        assert!(health.healthy);
        assert_eq!(health.success_rate_percent, 100.0);
        assert_eq!(health.events_received, 5);
        assert_eq!(health.events_routed, 5);
    }

    #[tokio::test]
    async fn test_consumer_drains_bus_subscription() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/events/agent")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let router = router_with_target("L02_runtime", &server.url(), 10);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = router.clone().consume(rx);

        tx.send(sample_event("agent")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(router.get_metrics().events_routed, 1);
        mock.assert_async().await;
    }
}
