//! Per-target circuit breakers.
//!
//! One breaker per logical target, all behind a single mutex. The state
//! machine:
//!
//! closed --failure x threshold--> open --recovery elapsed--> half_open
//! half_open --success--> closed (failure_count reset)
//! half_open --failure--> open (failure stamp refreshed)

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    last_failure_time: Option<Instant>,
}

impl Circuit {
    fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold,
            recovery_timeout,
            last_failure_time: None,
        }
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Arc<Self> {
        Self::with_settings(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }

    pub fn with_settings(failure_threshold: u32, recovery_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            circuits: Mutex::new(HashMap::new()),
            failure_threshold,
            recovery_timeout,
        })
    }

    fn with_circuit<R>(&self, name: &str, f: impl FnOnce(&mut Circuit) -> R) -> R {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(name.to_string())
            .or_insert_with(|| Circuit::new(self.failure_threshold, self.recovery_timeout));
        f(circuit)
    }

    pub fn record_success(&self, name: &str) {
        self.with_circuit(name, |circuit| {
            circuit.success_count += 1;
            match circuit.state {
                CircuitState::Closed => {
                    circuit.failure_count = 0;
                }
                CircuitState::HalfOpen => {
                    circuit.state = CircuitState::Closed;
                    circuit.failure_count = 0;
                    info!(circuit = name, "Circuit closed after successful probe");
                }
                CircuitState::Open => {}
            }
        });
    }

    pub fn record_failure(&self, name: &str) {
        self.with_circuit(name, |circuit| match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= circuit.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.last_failure_time = Some(Instant::now());
                    warn!(
                        circuit = name,
                        failures = circuit.failure_count,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.last_failure_time = Some(Instant::now());
                warn!(circuit = name, "Probe failed, circuit reopened");
            }
            CircuitState::Open => {
                circuit.last_failure_time = Some(Instant::now());
            }
        });
    }

    /// The single predicate the request orchestrator consults. An open
    /// circuit whose recovery window has elapsed flips to half-open and
    /// admits one probe.
    pub fn is_circuit_open(&self, name: &str) -> bool {
        self.with_circuit(name, |circuit| match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let recovered = circuit
                    .last_failure_time
                    .map(|t| t.elapsed() >= circuit.recovery_timeout)
                    .unwrap_or(false);
                if recovered {
                    circuit.state = CircuitState::HalfOpen;
                    info!(circuit = name, "Circuit half-open, admitting probe");
                    false
                } else {
                    true
                }
            }
        })
    }

    pub fn get_state(&self, name: &str) -> Option<CircuitSnapshot> {
        let circuits = self.circuits.lock();
        circuits.get(name).map(|circuit| CircuitSnapshot {
            name: name.to_string(),
            state: circuit.state,
            failure_count: circuit.failure_count,
            success_count: circuit.success_count,
            failure_threshold: circuit.failure_threshold,
            recovery_timeout_secs: circuit.recovery_timeout.as_secs(),
        })
    }

    pub fn reset(&self, name: &str) {
        self.with_circuit(name, |circuit| {
            circuit.state = CircuitState::Closed;
            circuit.failure_count = 0;
            circuit.last_failure_time = None;
        });
    }

    pub fn snapshot_all(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock();
        circuits
            .iter()
            .map(|(name, circuit)| CircuitSnapshot {
                name: name.clone(),
                state: circuit.state,
                failure_count: circuit.failure_count,
                success_count: circuit.success_count,
                failure_threshold: circuit.failure_threshold,
                recovery_timeout_secs: circuit.recovery_timeout.as_secs(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_below_threshold_stay_closed() {
        let breaker = CircuitBreaker::with_settings(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure("svc");
        }
        assert!(!breaker.is_circuit_open("svc"));
        assert_eq!(breaker.get_state("svc").unwrap().state, CircuitState::Closed);
    }

    #[test]
    fn test_threshold_failures_open_circuit() {
        let breaker = CircuitBreaker::with_settings(5, Duration::from_secs(30));
        for _ in 0..5 {
            breaker.record_failure("svc");
        }
        assert!(breaker.is_circuit_open("svc"));
        assert_eq!(breaker.get_state("svc").unwrap().state, CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let breaker = CircuitBreaker::with_settings(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure("svc");
        }
        breaker.record_success("svc");
        assert_eq!(breaker.get_state("svc").unwrap().failure_count, 0);

        // The count starts over; four more failures must not trip it.
        for _ in 0..4 {
            breaker.record_failure("svc");
        }
        assert!(!breaker.is_circuit_open("svc"));
    }

    #[test]
    fn test_recovery_window_admits_probe_then_closes() {
        let breaker = CircuitBreaker::with_settings(2, Duration::from_millis(20));
        breaker.record_failure("svc");
        breaker.record_failure("svc");
        assert!(breaker.is_circuit_open("svc"));

        std::thread::sleep(Duration::from_millis(30));

        // Recovery elapsed: probe admitted in half-open.
        assert!(!breaker.is_circuit_open("svc"));
        assert_eq!(
            breaker.get_state("svc").unwrap().state,
            CircuitState::HalfOpen
        );

        breaker.record_success("svc");
        let snapshot = breaker.get_state("svc").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::with_settings(2, Duration::from_millis(20));
        breaker.record_failure("svc");
        breaker.record_failure("svc");
        std::thread::sleep(Duration::from_millis(30));
        assert!(!breaker.is_circuit_open("svc"));

        breaker.record_failure("svc");
        assert!(breaker.is_circuit_open("svc"));
        assert_eq!(breaker.get_state("svc").unwrap().state, CircuitState::Open);
    }

    #[test]
    fn test_breakers_are_independent_per_target() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_secs(30));
        breaker.record_failure("svc-a");
        assert!(breaker.is_circuit_open("svc-a"));
        assert!(!breaker.is_circuit_open("svc-b"));
    }
}
