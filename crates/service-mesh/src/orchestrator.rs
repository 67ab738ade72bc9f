//! Request orchestration through the registry and circuit breakers.
//!
//! Routing order per call: resolve an instance, consult the breaker,
//! attach the trace headers, issue the request under its timeout, record
//! the outcome on the breaker, map failures onto the E11xxx vocabulary.

use crate::circuit::CircuitBreaker;
use crate::context::RequestContext;
use crate::registry::ServiceRegistry;
use crate::IntegrationError;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RequestOrchestrator {
    registry: Arc<ServiceRegistry>,
    breaker: Arc<CircuitBreaker>,
    client: Mutex<Option<Client>>,
    default_timeout: Duration,
}

impl RequestOrchestrator {
    pub fn new(registry: Arc<ServiceRegistry>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            registry,
            breaker,
            client: Mutex::new(None),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn start(&self) {
        let mut client = self.client.lock();
        if client.is_none() {
            *client = Some(Client::new());
            info!("Request orchestrator started");
        }
    }

    pub fn stop(&self) {
        *self.client.lock() = None;
        info!("Request orchestrator stopped");
    }

    fn client(&self) -> Result<Client, IntegrationError> {
        self.client
            .lock()
            .clone()
            .ok_or(IntegrationError::NotStarted)
    }

    /// Route one typed RPC to a service.
    pub async fn route_request(
        &self,
        service_name: &str,
        method: Method,
        path: &str,
        data: Option<Value>,
        context: Option<RequestContext>,
        timeout: Option<Duration>,
    ) -> Result<Value, IntegrationError> {
        let client = self.client()?;

        let instance = self
            .registry
            .get_instance(service_name)
            .ok_or_else(|| IntegrationError::ServiceNotFound(service_name.to_string()))?;

        if self.breaker.is_circuit_open(service_name) {
            return Err(IntegrationError::CircuitOpen(service_name.to_string()));
        }

        let context = context.unwrap_or_else(RequestContext::create);
        let timeout = timeout.unwrap_or(self.default_timeout);
        let url = format!(
            "{}/{}",
            instance.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        debug!(
            service = service_name,
            %method,
            url = %url,
            trace_id = %context.trace_id,
            "Routing request"
        );

        let mut request = client.request(method, &url).timeout(timeout);
        for (name, value) in context.headers() {
            request = request.header(name, value);
        }
        if let Some(body) = &data {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure(service_name);
                return Err(if e.is_timeout() {
                    IntegrationError::Timeout(timeout)
                } else if e.is_connect() {
                    IntegrationError::ConnectFailure(e.to_string())
                } else {
                    IntegrationError::RemoteError {
                        status: 0,
                        message: e.to_string(),
                    }
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            self.breaker.record_success(service_name);
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            return Ok(body);
        }

        self.breaker.record_failure(service_name);
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(IntegrationError::RemoteRejected {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(IntegrationError::RemoteError {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Fan one request out to several services concurrently. Per-service
    /// failures are captured in the result map, never aborting siblings.
    pub async fn broadcast_request(
        &self,
        service_names: &[&str],
        method: Method,
        path: &str,
        data: Option<Value>,
        context: Option<RequestContext>,
        timeout: Option<Duration>,
    ) -> HashMap<String, Result<Value, IntegrationError>> {
        let context = context.unwrap_or_else(RequestContext::create);

        let calls = service_names.iter().map(|name| {
            let method = method.clone();
            let data = data.clone();
            let child = context.child();
            async move {
                let result = self
                    .route_request(name, method, path, data, Some(child), timeout)
                    .await;
                if let Err(e) = &result {
                    warn!(service = name, code = e.code(), "Broadcast target failed: {}", e);
                }
                (name.to_string(), result)
            }
        });

        futures::future::join_all(calls).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceInstance;

    fn orchestrator_for(endpoint: &str) -> RequestOrchestrator {
        let registry = ServiceRegistry::new();
        registry.register(ServiceInstance::new("svc-1", "L02_runtime", endpoint));
        let orchestrator =
            RequestOrchestrator::new(registry, CircuitBreaker::with_settings(5, Duration::from_secs(30)));
        orchestrator.start();
        orchestrator
    }

    #[tokio::test]
    async fn test_route_request_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result": "success"}"#)
            .create_async()
            .await;

        let orchestrator = orchestrator_for(&server.url());
        let result = orchestrator
            .route_request(
                "L02_runtime",
                Method::POST,
                "/api/test",
                Some(serde_json::json!({"key": "value"})),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result["result"], "success");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_trace_headers_are_propagated() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .match_header("X-Trace-ID", "trace_fixed")
            .match_header("X-Correlation-ID", mockito::Matcher::Any)
            .match_header("X-Request-ID", mockito::Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let orchestrator = orchestrator_for(&server.url());
        let mut context = RequestContext::create();
        context.trace_id = "trace_fixed".to_string();

        orchestrator
            .route_request("L02_runtime", Method::GET, "/health", None, Some(context), None)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_service_maps_to_e11001() {
        let orchestrator = orchestrator_for("http://localhost:1");
        let err = orchestrator
            .route_request("ghost_service", Method::GET, "/x", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E11001");
    }

    #[tokio::test]
    async fn test_4xx_maps_to_e11200_and_5xx_to_e11300() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bad")
            .with_status(422)
            .with_body("nope")
            .create_async()
            .await;
        server
            .mock("GET", "/boom")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let orchestrator = orchestrator_for(&server.url());

        let err = orchestrator
            .route_request("L02_runtime", Method::GET, "/bad", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E11200");

        let err = orchestrator
            .route_request("L02_runtime", Method::GET, "/boom", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E11300");
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/boom")
            .with_status(500)
            .expect_at_least(1)
            .create_async()
            .await;

        let registry = ServiceRegistry::new();
        registry.register(ServiceInstance::new("svc-1", "L02_runtime", &server.url()));
        let breaker = CircuitBreaker::with_settings(3, Duration::from_secs(30));
        let orchestrator = RequestOrchestrator::new(registry, breaker.clone());
        orchestrator.start();
        assert_eq!(breaker.snapshot_all().len(), 0);

        for _ in 0..3 {
            let _ = orchestrator
                .route_request("L02_runtime", Method::GET, "/boom", None, None, None)
                .await;
        }

        let err = orchestrator
            .route_request("L02_runtime", Method::GET, "/boom", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E11101");
    }

    #[tokio::test]
    async fn test_broadcast_captures_per_service_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let registry = ServiceRegistry::new();
        registry.register(ServiceInstance::new("svc-1", "L02_runtime", &server.url()));
        let orchestrator =
            RequestOrchestrator::new(registry, CircuitBreaker::with_settings(5, Duration::from_secs(30)));
        orchestrator.start();

        let results = orchestrator
            .broadcast_request(
                &["L02_runtime", "L03_tool_execution"],
                Method::GET,
                "/health",
                None,
                None,
                None,
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results["L02_runtime"].is_ok());
        assert_eq!(
            results["L03_tool_execution"].as_ref().unwrap_err().code(),
            "E11001"
        );
    }

    #[tokio::test]
    async fn test_route_without_start_fails() {
        let registry = ServiceRegistry::new();
        let orchestrator = RequestOrchestrator::new(
            registry,
            CircuitBreaker::with_settings(5, Duration::from_secs(30)),
        );
        let err = orchestrator
            .route_request("L02_runtime", Method::GET, "/x", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::NotStarted));
    }
}
