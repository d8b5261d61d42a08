use super::{Event, EventType};
use crate::shared::logging::append_runtime_log;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type Handler = Box<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Dispatched inline on the publisher's thread. A failing handler is
    /// logged and isolated from other subscribers.
    Sync,
    /// Dispatched from a dedicated worker thread fed by a bounded queue.
    Async,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub cancelled: u64,
}

const OVERFLOW_NOTICE_INTERVAL: Duration = Duration::from_secs(60);

/// Counters and log sink shared between the bus and its worker threads.
struct BusShared {
    vault_root: PathBuf,
    delivered: AtomicU64,
    dropped: AtomicU64,
    cancelled: AtomicU64,
}

struct SubscriberQueue {
    deque: Mutex<VecDeque<Event>>,
    cond: Condvar,
    draining: AtomicBool,
    cancelled: AtomicBool,
    idle: Mutex<bool>,
    idle_cond: Condvar,
}

struct Subscriber {
    name: String,
    types: BTreeSet<EventType>,
    mode: SubscribeMode,
    handler: Arc<Handler>,
    queue: Option<Arc<SubscriberQueue>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_overflow_notice: Mutex<Option<Instant>>,
}

impl Subscriber {
    fn accepts(&self, event_type: EventType) -> bool {
        self.types.is_empty() || self.types.contains(&event_type)
    }
}

struct RecordedEvent {
    seq: u64,
    event: Event,
}

/// In-process publish/subscribe broker. `publish` enqueues for every
/// current subscriber and returns without waiting on handler execution;
/// each subscriber's single FIFO queue yields per-event-type ordering.
pub struct EventBus {
    shared: Arc<BusShared>,
    queue_capacity: usize,
    history_capacity: usize,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    history: Mutex<VecDeque<RecordedEvent>>,
    next_seq: AtomicU64,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(
        vault_root: impl Into<PathBuf>,
        history_capacity: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            shared: Arc::new(BusShared {
                vault_root: vault_root.into(),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
            queue_capacity: queue_capacity.max(1),
            history_capacity: history_capacity.max(1),
            subscribers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, name: &str, types: &[EventType], mode: SubscribeMode, handler: Handler) {
        let handler = Arc::new(handler);
        let queue = match mode {
            SubscribeMode::Sync => None,
            SubscribeMode::Async => Some(Arc::new(SubscriberQueue {
                deque: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                draining: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                idle: Mutex::new(true),
                idle_cond: Condvar::new(),
            })),
        };
        let subscriber = Arc::new(Subscriber {
            name: name.to_string(),
            types: types.iter().copied().collect(),
            mode,
            handler: handler.clone(),
            queue: queue.clone(),
            worker: Mutex::new(None),
            last_overflow_notice: Mutex::new(None),
        });

        if let Some(queue) = queue {
            let shared = Arc::clone(&self.shared);
            let worker_name = name.to_string();
            let worker = thread::spawn(move || {
                run_subscriber_worker(shared, worker_name, queue, handler);
            });
            *subscriber.worker.lock().expect("subscriber worker lock") = Some(worker);
        }

        self.subscribers
            .write()
            .expect("subscriber table lock")
            .push(subscriber);
    }

    /// Queues `event` for every matching subscriber. Sync subscribers run
    /// inline; async subscribers only have the event appended to their
    /// bounded queue, dropping the oldest entry on overflow.
    pub fn publish(&self, event: Event) {
        self.publish_inner(event, true);
    }

    fn publish_inner(&self, event: Event, allow_overflow_notice: bool) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.record_history(event.clone());

        let subscribers: Vec<Arc<Subscriber>> = self
            .subscribers
            .read()
            .expect("subscriber table lock")
            .iter()
            .filter(|s| s.accepts(event.event_type))
            .cloned()
            .collect();

        let mut overflowed: Vec<String> = Vec::new();
        for subscriber in subscribers {
            match subscriber.mode {
                SubscribeMode::Sync => {
                    if let Err(err) = (subscriber.handler)(&event) {
                        append_runtime_log(
                            &self.shared.vault_root,
                            "error",
                            "bus.handler",
                            &format!("subscriber={} error={err}", subscriber.name),
                        );
                    } else {
                        self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                SubscribeMode::Async => {
                    let queue = subscriber.queue.as_ref().expect("async subscriber queue");
                    let mut deque = queue.deque.lock().expect("subscriber queue lock");
                    if deque.len() >= self.queue_capacity {
                        deque.pop_front();
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        if allow_overflow_notice && self.note_overflow(&subscriber) {
                            overflowed.push(subscriber.name.clone());
                        }
                    }
                    deque.push_back(event.clone());
                    *queue.idle.lock().expect("idle flag lock") = false;
                    drop(deque);
                    queue.cond.notify_one();
                }
            }
        }

        for name in overflowed {
            let notice = Event::new(EventType::BusOverflow, "event_bus")
                .with_payload("subscriber", serde_json::Value::String(name));
            self.publish_inner(notice, false);
        }
    }

    /// Returns true when a notice is due for this subscriber (at most one
    /// per minute).
    fn note_overflow(&self, subscriber: &Subscriber) -> bool {
        let mut last = subscriber
            .last_overflow_notice
            .lock()
            .expect("overflow notice lock");
        let due = last
            .map(|at| at.elapsed() >= OVERFLOW_NOTICE_INTERVAL)
            .unwrap_or(true);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    fn record_history(&self, event: Event) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock().expect("history lock");
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(RecordedEvent { seq, event });
    }

    /// Events with sequence number strictly greater than `since_seq`,
    /// oldest first, at most `limit`.
    pub fn history(&self, since_seq: u64, limit: usize) -> Vec<(u64, Event)> {
        let history = self.history.lock().expect("history lock");
        history
            .iter()
            .filter(|r| r.seq > since_seq)
            .take(limit)
            .map(|r| (r.seq, r.event.clone()))
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Drains subscriber queues within `deadline`. Events still queued at
    /// expiry are cancelled and counted; workers exit once their queue is
    /// observed empty or cancelled.
    pub fn shutdown(&self, deadline: Duration) -> BusStats {
        let subscribers: Vec<Arc<Subscriber>> = self
            .subscribers
            .read()
            .expect("subscriber table lock")
            .iter()
            .cloned()
            .collect();

        for subscriber in &subscribers {
            if let Some(queue) = subscriber.queue.as_ref() {
                queue.draining.store(true, Ordering::Relaxed);
                queue.cond.notify_all();
            }
        }

        let expiry = Instant::now() + deadline;
        for subscriber in &subscribers {
            let Some(queue) = subscriber.queue.as_ref() else {
                continue;
            };
            let mut idle = queue.idle.lock().expect("idle flag lock");
            while !*idle {
                let remaining = expiry.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (guard, _timeout) = queue
                    .idle_cond
                    .wait_timeout(idle, remaining.min(Duration::from_millis(50)))
                    .expect("idle wait");
                idle = guard;
            }
        }

        for subscriber in &subscribers {
            if let Some(queue) = subscriber.queue.as_ref() {
                queue.cancelled.store(true, Ordering::Relaxed);
                queue.cond.notify_all();
                let remaining = queue.deque.lock().expect("subscriber queue lock").len() as u64;
                if remaining > 0 {
                    self.shared.cancelled.fetch_add(remaining, Ordering::Relaxed);
                    append_runtime_log(
                        &self.shared.vault_root,
                        "warn",
                        "bus.shutdown.cancelled",
                        &format!("subscriber={} remaining={remaining}", subscriber.name),
                    );
                }
            }
            if let Some(worker) = subscriber
                .worker
                .lock()
                .expect("subscriber worker lock")
                .take()
            {
                let _ = worker.join();
            }
        }

        self.stats()
    }
}

fn run_subscriber_worker(
    shared: Arc<BusShared>,
    name: String,
    queue: Arc<SubscriberQueue>,
    handler: Arc<Handler>,
) {
    loop {
        let next = {
            let mut deque = queue.deque.lock().expect("subscriber queue lock");
            loop {
                if queue.cancelled.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(event) = deque.pop_front() {
                    break Some(event);
                }
                {
                    let mut idle = queue.idle.lock().expect("idle flag lock");
                    *idle = true;
                    queue.idle_cond.notify_all();
                }
                if queue.draining.load(Ordering::Relaxed) {
                    break None;
                }
                let (guard, _timeout) = queue
                    .cond
                    .wait_timeout(deque, Duration::from_millis(200))
                    .expect("subscriber queue wait");
                deque = guard;
            }
        };

        let Some(event) = next else {
            return;
        };
        if let Err(err) = (handler)(&event) {
            append_runtime_log(
                &shared.vault_root,
                "error",
                "bus.handler",
                &format!("subscriber={name} error={err}"),
            );
        } else {
            shared.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_bus(history: usize, queue: usize) -> EventBus {
        let dir = std::env::temp_dir().join("vaultflow-bus-tests");
        EventBus::new(dir, history, queue)
    }

    #[test]
    fn sync_subscriber_failure_does_not_affect_others() {
        let bus = test_bus(16, 16);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            "failing",
            &[EventType::ActionGenerated],
            SubscribeMode::Sync,
            Box::new(|_| Err("boom".to_string())),
        );
        bus.subscribe(
            "healthy",
            &[EventType::ActionGenerated],
            SubscribeMode::Sync,
            Box::new(move |event| tx.send(event.event_id.clone()).map_err(|e| e.to_string())),
        );

        bus.publish(Event::new(EventType::ActionGenerated, "test"));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn async_subscriber_receives_in_fifo_order() {
        let bus = test_bus(16, 16);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            "collector",
            &[EventType::PlanCreated],
            SubscribeMode::Async,
            Box::new(move |event| {
                tx.send(event.payload.get("n").and_then(|v| v.as_u64()).unwrap_or(0))
                    .map_err(|e| e.to_string())
            }),
        );

        for n in 0..5u64 {
            bus.publish(
                Event::new(EventType::PlanCreated, "test").with_payload("n", serde_json::json!(n)),
            );
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv_timeout(Duration::from_secs(2)).expect("event"));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        bus.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn overflow_drops_oldest_for_that_subscriber_only() {
        let bus = test_bus(64, 2);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().expect("gate");
        let (tx, rx) = mpsc::channel();
        let worker_gate = Arc::clone(&gate);
        bus.subscribe(
            "slow",
            &[EventType::FileCreated],
            SubscribeMode::Async,
            Box::new(move |event| {
                let _g = worker_gate.lock().expect("gate");
                tx.send(event.payload.get("n").and_then(|v| v.as_u64()).unwrap_or(0))
                    .map_err(|e| e.to_string())
            }),
        );

        // The worker may claim the first event before blocking on the
        // gate; everything after fills the bounded queue.
        for n in 0..6u64 {
            bus.publish(
                Event::new(EventType::FileCreated, "test").with_payload("n", serde_json::json!(n)),
            );
            thread::sleep(Duration::from_millis(20));
        }
        drop(held);

        let mut seen = Vec::new();
        while let Ok(n) = rx.recv_timeout(Duration::from_millis(500)) {
            seen.push(n);
        }
        assert!(
            seen.len() <= 3,
            "bounded queue should have dropped events: {seen:?}"
        );
        assert_eq!(seen.last(), Some(&5));
        assert!(bus.stats().dropped >= 1);

        let overflow_notices = bus
            .history(0, 64)
            .into_iter()
            .filter(|(_, e)| e.event_type == EventType::BusOverflow)
            .count();
        assert_eq!(overflow_notices, 1, "overflow notice must be de-duplicated");
        bus.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn history_is_bounded_and_filtered_by_seq() {
        let bus = test_bus(3, 16);
        for _ in 0..5 {
            bus.publish(Event::new(EventType::HealthCheck, "test"));
        }
        let all = bus.history(0, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all.first().map(|(seq, _)| *seq), Some(3));

        let newer = bus.history(4, 10);
        assert_eq!(newer.len(), 1);
    }

    #[test]
    fn shutdown_counts_cancelled_events() {
        let bus = Arc::new(test_bus(16, 16));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().expect("gate");
        let worker_gate = Arc::clone(&gate);
        bus.subscribe(
            "stuck",
            &[EventType::FileCreated],
            SubscribeMode::Async,
            Box::new(move |_| {
                let _g = worker_gate.lock().expect("gate");
                Ok(())
            }),
        );
        for _ in 0..4 {
            bus.publish(Event::new(EventType::FileCreated, "test"));
        }
        thread::sleep(Duration::from_millis(50));
        let stats_thread = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.shutdown(Duration::from_millis(200)))
        };
        thread::sleep(Duration::from_millis(300));
        drop(held);
        let stats = stats_thread.join().expect("shutdown join");
        assert!(stats.cancelled >= 1, "stats: {stats:?}");
    }
}
