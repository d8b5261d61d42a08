use super::service::{HealthReport, Service, ServiceState};
use crate::bus::{Event, EventBus, EventType};
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct ServiceHealthRecord {
    pub state: ServiceState,
    pub last_check: String,
    pub latency_ms: u64,
    pub consecutive_unhealthy: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Shared view of per-service health, written by the health loop and read
/// by the dashboard writer and `status`.
#[derive(Default, Clone)]
pub struct ServiceBoard {
    inner: Arc<Mutex<BTreeMap<String, ServiceHealthRecord>>>,
}

impl ServiceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, name: &str, state: ServiceState) {
        let mut inner = self.inner.lock().expect("service board lock");
        let record = inner.entry(name.to_string()).or_default();
        record.state = state;
        record.last_check = now_rfc3339();
    }

    pub fn set_error(&self, name: &str, error: &str) {
        let mut inner = self.inner.lock().expect("service board lock");
        let record = inner.entry(name.to_string()).or_default();
        record.state = ServiceState::Error;
        record.last_error = Some(error.to_string());
        record.last_check = now_rfc3339();
    }

    pub fn snapshot(&self) -> BTreeMap<String, ServiceHealthRecord> {
        self.inner.lock().expect("service board lock").clone()
    }

    fn apply_probe(&self, name: &str, report: &HealthReport) -> (ServiceState, u32) {
        let mut inner = self.inner.lock().expect("service board lock");
        let record = inner.entry(name.to_string()).or_default();
        record.last_check = now_rfc3339();
        record.latency_ms = report.latency_ms;
        if report.healthy {
            record.consecutive_unhealthy = 0;
            if record.state == ServiceState::Unhealthy {
                record.state = ServiceState::Running;
            }
            record.last_error = None;
        } else {
            record.consecutive_unhealthy += 1;
            record.last_error = Some(report.details.clone());
            if record.consecutive_unhealthy >= UNHEALTHY_THRESHOLD {
                record.state = ServiceState::Unhealthy;
            }
        }
        (record.state, record.consecutive_unhealthy)
    }
}

/// Runs one service's health probe on its own thread so a stuck check
/// cannot wedge the loop. Expiry counts as an unhealthy probe.
pub fn probe_with_timeout(service: &Arc<dyn Service>, timeout: Duration) -> HealthReport {
    let (tx, rx) = mpsc::channel();
    let probed = Arc::clone(service);
    let started = Instant::now();
    thread::spawn(move || {
        let _ = tx.send(probed.health_check());
    });
    match rx.recv_timeout(timeout) {
        Ok(mut report) => {
            report.latency_ms = started.elapsed().as_millis() as u64;
            report
        }
        Err(_) => HealthReport {
            healthy: false,
            latency_ms: timeout.as_millis() as u64,
            details: format!("health probe exceeded {}ms", timeout.as_millis()),
        },
    }
}

/// One health sweep over all services. Three consecutive unhealthy probes
/// mark a service UNHEALTHY and publish `service.error`; recovery is an
/// operator action, never an auto-restart.
pub fn run_health_sweep(
    services: &[Arc<dyn Service>],
    board: &ServiceBoard,
    bus: &Arc<EventBus>,
    timeout: Duration,
) {
    for service in services {
        let name = service.name();
        let report = probe_with_timeout(service, timeout);
        let (state, strikes) = board.apply_probe(&name, &report);
        bus.publish(
            Event::new(EventType::HealthStatus, "orchestrator")
                .with_payload("service", json!(name))
                .with_payload("healthy", json!(report.healthy))
                .with_payload("latency_ms", json!(report.latency_ms)),
        );
        if state == ServiceState::Unhealthy && strikes == UNHEALTHY_THRESHOLD {
            bus.publish(
                Event::new(EventType::ServiceError, "orchestrator")
                    .with_payload("service", json!(name))
                    .with_payload("details", json!(report.details)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::errors::RuntimeError;

    struct StubService {
        name: String,
        healthy: bool,
        delay: Duration,
    }

    impl Service for StubService {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn start(&self) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn stop(&self) {}

        fn health_check(&self) -> HealthReport {
            thread::sleep(self.delay);
            HealthReport {
                healthy: self.healthy,
                latency_ms: 0,
                details: if self.healthy {
                    "ok".to_string()
                } else {
                    "stub failure".to_string()
                },
            }
        }
    }

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(
            std::env::temp_dir().join("vaultflow-health-tests"),
            64,
            64,
        ))
    }

    #[test]
    fn slow_probe_times_out_as_unhealthy() {
        let service: Arc<dyn Service> = Arc::new(StubService {
            name: "slow".to_string(),
            healthy: true,
            delay: Duration::from_millis(300),
        });
        let report = probe_with_timeout(&service, Duration::from_millis(50));
        assert!(!report.healthy);
        assert!(report.details.contains("exceeded"));
    }

    #[test]
    fn three_strikes_mark_unhealthy_and_publish_service_error() {
        let service: Arc<dyn Service> = Arc::new(StubService {
            name: "flaky".to_string(),
            healthy: false,
            delay: Duration::ZERO,
        });
        let services = vec![service];
        let board = ServiceBoard::new();
        let bus = bus();

        for _ in 0..2 {
            run_health_sweep(&services, &board, &bus, Duration::from_millis(200));
            assert_ne!(
                board.snapshot()["flaky"].state,
                ServiceState::Unhealthy,
                "not yet at threshold"
            );
        }
        run_health_sweep(&services, &board, &bus, Duration::from_millis(200));
        assert_eq!(board.snapshot()["flaky"].state, ServiceState::Unhealthy);

        let errors = bus
            .history(0, 64)
            .into_iter()
            .filter(|(_, e)| e.event_type == EventType::ServiceError)
            .count();
        assert_eq!(errors, 1, "service.error fires once at the threshold");
    }

    #[test]
    fn recovery_resets_the_strike_counter() {
        let board = ServiceBoard::new();
        let bad = HealthReport {
            healthy: false,
            latency_ms: 1,
            details: "down".to_string(),
        };
        let good = HealthReport {
            healthy: true,
            latency_ms: 1,
            details: "ok".to_string(),
        };
        board.apply_probe("svc", &bad);
        board.apply_probe("svc", &bad);
        board.apply_probe("svc", &good);
        let record = board.snapshot()["svc"].clone();
        assert_eq!(record.consecutive_unhealthy, 0);
        assert!(record.last_error.is_none());
    }
}
