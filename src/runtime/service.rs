use crate::shared::errors::RuntimeError;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Unhealthy,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    pub details: String,
}

/// Capability set every managed service exposes to the orchestrator.
pub trait Service: Send + Sync {
    fn name(&self) -> String;

    fn start(&self) -> Result<(), RuntimeError>;

    fn stop(&self);

    fn health_check(&self) -> HealthReport;
}

/// Context handed to a worker loop: the stop flag and a heartbeat cell
/// the loop must refresh.
pub struct WorkerContext {
    pub stop: Arc<AtomicBool>,
    pub beat: Arc<AtomicI64>,
}

impl WorkerContext {
    pub fn beat_now(&self) {
        self.beat.store(now_secs(), Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

type WorkerLoop = Box<dyn FnOnce(WorkerContext) + Send>;

/// A service backed by one worker thread. Health is heartbeat freshness:
/// a live thread that has beaten within the staleness window is healthy.
pub struct WorkerService {
    name: String,
    stale_after: Duration,
    runner: Mutex<Option<WorkerLoop>>,
    stop: Arc<AtomicBool>,
    beat: Arc<AtomicI64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerService {
    pub fn new(name: &str, stale_after: Duration, runner: WorkerLoop) -> Self {
        Self {
            name: name.to_string(),
            stale_after,
            runner: Mutex::new(Some(runner)),
            stop: Arc::new(AtomicBool::new(false)),
            beat: Arc::new(AtomicI64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

impl Service for WorkerService {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> Result<(), RuntimeError> {
        let runner = self
            .runner
            .lock()
            .expect("worker runner lock")
            .take()
            .ok_or_else(|| RuntimeError::ServiceStart {
                service: self.name.clone(),
                reason: "service was already started".to_string(),
            })?;
        self.stop.store(false, Ordering::Relaxed);
        self.beat.store(now_secs(), Ordering::Relaxed);
        let context = WorkerContext {
            stop: Arc::clone(&self.stop),
            beat: Arc::clone(&self.beat),
        };
        let handle = std::thread::spawn(move || runner(context));
        *self.handle.lock().expect("worker handle lock") = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().expect("worker handle lock").take() {
            let _ = handle.join();
        }
    }

    fn health_check(&self) -> HealthReport {
        let handle = self.handle.lock().expect("worker handle lock");
        let alive = handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if !alive {
            return HealthReport {
                healthy: false,
                latency_ms: 0,
                details: "worker thread is not running".to_string(),
            };
        }
        let age = now_secs().saturating_sub(self.beat.load(Ordering::Relaxed));
        let fresh = age <= self.stale_after.as_secs() as i64;
        HealthReport {
            healthy: fresh,
            latency_ms: 0,
            details: format!("last heartbeat {age}s ago"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn worker_service_runs_and_stops_its_loop() {
        let service = WorkerService::new(
            "ticker",
            Duration::from_secs(5),
            Box::new(|ctx| {
                while !ctx.stopped() {
                    ctx.beat_now();
                    thread::sleep(Duration::from_millis(20));
                }
            }),
        );
        service.start().expect("start");
        thread::sleep(Duration::from_millis(80));
        assert!(service.health_check().healthy);

        service.stop();
        assert!(!service.health_check().healthy);
    }

    #[test]
    fn double_start_is_refused() {
        let service = WorkerService::new("oneshot", Duration::from_secs(5), Box::new(|_ctx| {}));
        service.start().expect("start");
        assert!(service.start().is_err());
        service.stop();
    }

    #[test]
    fn stale_heartbeat_reports_unhealthy() {
        let service = WorkerService::new(
            "sleeper",
            Duration::from_secs(0),
            Box::new(|ctx| {
                while !ctx.stopped() {
                    thread::sleep(Duration::from_millis(20));
                }
            }),
        );
        service.start().expect("start");
        thread::sleep(Duration::from_millis(1_100));
        assert!(!service.health_check().healthy);
        service.stop();
    }
}
