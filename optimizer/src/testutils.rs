use crate::store::{InMemoryRelayStore, RelayStore, StoreError};
use crate::types::{Datacenter, Relay, RelayId};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Relay in its own datacenter `datacenter_id`.
pub fn test_relay(name: &str, address: &str, datacenter_id: u64) -> Relay {
    Relay::new(
        name,
        address.parse().expect("valid socket address"),
        Datacenter {
            id: datacenter_id,
            name: format!("dc.{datacenter_id}"),
            latitude: 1.0,
            longitude: 2.0,
        },
    )
}

/// Counts counter increments by metric name, ignoring labels.
#[derive(Default)]
pub struct TestRecorder {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl TestRecorder {
    pub fn new() -> Self {
        TestRecorder::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .get(name)
            .map(|value| value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Recorder for TestRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let value = self
            .counters
            .lock()
            .entry(key.name().to_string())
            .or_default()
            .clone();
        Counter::from_arc(value)
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// In-memory relay store whose fetches and lookups can be made to fail.
#[derive(Default)]
pub struct FlakyRelayStore {
    pub inner: InMemoryRelayStore,
    failing_fetches: AtomicUsize,
    failing_lookups: Mutex<HashSet<RelayId>>,
}

impl FlakyRelayStore {
    pub fn new(relays: Vec<Relay>) -> Self {
        FlakyRelayStore {
            inner: InMemoryRelayStore::new(relays),
            ..Default::default()
        }
    }

    /// The next `count` calls to `get_all` fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn fail_lookup(&self, id: RelayId) {
        self.failing_lookups.lock().insert(id);
    }
}

impl RelayStore for FlakyRelayStore {
    fn get_all(&self) -> Result<Vec<Relay>, StoreError> {
        let remaining = self.failing_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("scripted fetch failure".into()));
        }
        self.inner.get_all()
    }

    fn get(&self, id: RelayId) -> Result<Relay, StoreError> {
        if self.failing_lookups.lock().contains(&id) {
            return Err(StoreError::Unavailable("scripted lookup failure".into()));
        }
        self.inner.get(id)
    }
}
