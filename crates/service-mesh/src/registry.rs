//! Service registry with per-instance health tracking.
//!
//! Registration is idempotent keyed on `service_id`. Lookup returns the
//! first instance that is healthy or degraded unless the caller asks for
//! everything; callers layer their own balancing on top.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ServiceStatus {
    /// Whether the instance may receive traffic.
    pub fn routable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_id: String,
    pub service_name: String,
    pub endpoint: String,
    pub status: ServiceStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            status: ServiceStatus::Healthy,
            last_heartbeat: Utc::now(),
        }
    }
}

/// In-memory map of `service_name -> instances`, guarded by a single mutex.
/// Read-heavy paths take a snapshot clone instead of holding the lock.
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Vec<ServiceInstance>>>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(HashMap::new()),
        })
    }

    /// Register or refresh an instance. An existing registration with the
    /// same `service_id` is replaced in place.
    pub fn register(&self, instance: ServiceInstance) {
        let mut services = self.services.lock();
        let instances = services
            .entry(instance.service_name.clone())
            .or_default();

        if let Some(existing) = instances
            .iter_mut()
            .find(|i| i.service_id == instance.service_id)
        {
            *existing = instance;
        } else {
            info!(
                service_name = %instance.service_name,
                service_id = %instance.service_id,
                endpoint = %instance.endpoint,
                "Registered service instance"
            );
            instances.push(instance);
        }
    }

    /// Remove an instance; repeat removals are no-ops.
    pub fn deregister(&self, service_id: &str) -> bool {
        let mut services = self.services.lock();
        let mut removed = false;
        for instances in services.values_mut() {
            let before = instances.len();
            instances.retain(|i| i.service_id != service_id);
            removed |= instances.len() != before;
        }
        services.retain(|_, v| !v.is_empty());
        if removed {
            debug!(service_id, "Deregistered service instance");
        }
        removed
    }

    /// First routable instance of a service ("first-healthy").
    pub fn get_instance(&self, service_name: &str) -> Option<ServiceInstance> {
        self.services
            .lock()
            .get(service_name)?
            .iter()
            .find(|i| i.status.routable())
            .cloned()
    }

    /// All instances of a service, regardless of health.
    pub fn get_all_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .lock()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Update health and heartbeat for one instance.
    pub fn record_heartbeat(&self, service_id: &str, status: ServiceStatus) -> bool {
        let mut services = self.services.lock();
        for instances in services.values_mut() {
            if let Some(instance) = instances.iter_mut().find(|i| i.service_id == service_id) {
                instance.status = status;
                instance.last_heartbeat = Utc::now();
                return true;
            }
        }
        false
    }

    /// Copy-on-write snapshot of the whole registry.
    pub fn snapshot(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.services.lock().clone()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
        }
    }
}
