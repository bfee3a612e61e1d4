//! Live state of every reconciled relay, keyed by normalized address.
//!
//! Structural changes go through [`RelayMap::lock`], which holds the map's
//! exclusive lock for as long as the returned guard lives. Each entry carries
//! its own lock for the hot traffic fields. The map lock is always taken
//! before an entry lock and never while an entry lock is held.
use crate::metrics_defs::{RELAY_MAP_ALREADY_EXISTS, RELAY_MAP_RELAYS, RELAY_MAP_UPDATE_NOT_FOUND};
use crate::types::{Datacenter, Relay, RelayId, Seller, TrafficStats};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use shared::{counter, gauge};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of traffic samples retained per relay between two stats publishes.
pub const TRAFFIC_STATS_BUFFER_SIZE: usize = 10;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RelayMapError {
    #[error("relay {0} already exists")]
    AlreadyExists(String),
    #[error("relay {0} not found")]
    NotFound(String),
}

#[derive(Debug)]
struct TrafficState {
    last_update_time: DateTime<Utc>,
    cpu_usage: f32,
    mem_usage: f32,
    traffic: VecDeque<TrafficStats>,
    peak: TrafficStats,
    last_publish: Instant,
}

/// Traffic accumulated by one relay since the previous stats publish.
#[derive(Clone, Debug, PartialEq)]
pub struct TrafficSummary {
    pub total: TrafficStats,
    pub peak: TrafficStats,
    pub elapsed: Duration,
    pub cpu_usage: f32,
    pub mem_usage: f32,
}

#[derive(Debug)]
pub struct RelayEntry {
    pub id: RelayId,
    pub name: String,
    pub address: String,
    pub public_key: Vec<u8>,
    pub seller: Seller,
    pub datacenter: Datacenter,
    pub max_sessions: u32,
    pub version: String,
    pub nic_speed_mbps: u32,
    state: Mutex<TrafficState>,
}

impl RelayEntry {
    pub fn from_relay(relay: &Relay) -> Self {
        RelayEntry {
            id: relay.address_id(),
            name: relay.name.clone(),
            address: relay.address.to_string(),
            public_key: relay.public_key.clone(),
            seller: relay.seller.clone(),
            datacenter: relay.datacenter.clone(),
            max_sessions: relay.max_sessions,
            version: relay.version.clone(),
            nic_speed_mbps: relay.nic_speed_mbps,
            state: Mutex::new(TrafficState {
                last_update_time: Utc::now(),
                cpu_usage: 0.0,
                mem_usage: 0.0,
                traffic: VecDeque::with_capacity(TRAFFIC_STATS_BUFFER_SIZE),
                peak: TrafficStats::default(),
                last_publish: Instant::now(),
            }),
        }
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.state.lock().last_update_time
    }

    pub fn usage(&self) -> (f32, f32) {
        let state = self.state.lock();
        (state.cpu_usage, state.mem_usage)
    }

    fn record(&self, traffic: TrafficStats, cpu_usage: f32, mem_usage: f32) {
        let mut state = self.state.lock();
        if state.traffic.len() == TRAFFIC_STATS_BUFFER_SIZE {
            state.traffic.pop_front();
        }
        state.traffic.push_back(traffic);

        state.peak.session_count = state.peak.session_count.max(traffic.session_count);
        state.peak.envelope_up_kbps = state.peak.envelope_up_kbps.max(traffic.envelope_up_kbps);
        state.peak.envelope_down_kbps =
            state.peak.envelope_down_kbps.max(traffic.envelope_down_kbps);

        state.cpu_usage = cpu_usage;
        state.mem_usage = mem_usage;
        state.last_update_time = Utc::now();
    }

    /// Sums the buffered traffic and clears the buffer and peak.
    pub fn drain_traffic(&self) -> TrafficSummary {
        let mut state = self.state.lock();
        let total = state
            .traffic
            .iter()
            .fold(TrafficStats::default(), |acc, sample| acc.add(sample));
        let now = Instant::now();
        let summary = TrafficSummary {
            total,
            peak: state.peak,
            elapsed: now.duration_since(state.last_publish),
            cpu_usage: state.cpu_usage,
            mem_usage: state.mem_usage,
        };

        state.traffic.clear();
        state.peak = TrafficStats::default();
        state.last_publish = now;

        summary
    }
}

#[derive(Default)]
pub struct RelayMap {
    relays: RwLock<HashMap<String, Arc<RelayEntry>>>,
}

impl RelayMap {
    pub fn new() -> Self {
        RelayMap::default()
    }

    /// Takes the exclusive map lock.
    pub fn lock(&self) -> RelayMapGuard<'_> {
        RelayMapGuard {
            relays: self.relays.write(),
        }
    }

    pub fn get(&self, address: &str) -> Option<Arc<RelayEntry>> {
        self.relays.read().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.read().is_empty()
    }

    /// IDs of all relays whose seller is not excluded, sorted ascending so the
    /// matrix ordering is stable between cycles.
    pub fn all_relay_ids(&self, excluded_sellers: &[String]) -> Vec<RelayId> {
        let relays = self.relays.read();
        let mut ids: Vec<RelayId> = relays
            .values()
            .filter(|relay| {
                !excluded_sellers
                    .iter()
                    .any(|seller| seller.eq_ignore_ascii_case(&relay.seller.name))
            })
            .map(|relay| relay.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every entry. The map lock is released before returning.
    pub fn all_relay_data(&self) -> Vec<Arc<RelayEntry>> {
        let mut entries: Vec<_> = self.relays.read().values().cloned().collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }
}

pub struct RelayMapGuard<'a> {
    relays: RwLockWriteGuard<'a, HashMap<String, Arc<RelayEntry>>>,
}

impl RelayMapGuard<'_> {
    pub fn get(&self, address: &str) -> Option<Arc<RelayEntry>> {
        self.relays.get(address).cloned()
    }

    pub fn add(&mut self, entry: RelayEntry) -> Result<(), RelayMapError> {
        if self.relays.contains_key(&entry.address) {
            tracing::warn!(relay_address = %entry.address, "relay already exists in relay map");
            counter!(RELAY_MAP_ALREADY_EXISTS).increment(1);
            return Err(RelayMapError::AlreadyExists(entry.address));
        }

        self.relays.insert(entry.address.clone(), Arc::new(entry));
        gauge!(RELAY_MAP_RELAYS).set(self.relays.len() as f64);
        Ok(())
    }

    pub fn remove(&mut self, address: &str) -> Option<Arc<RelayEntry>> {
        let removed = self.relays.remove(address);
        gauge!(RELAY_MAP_RELAYS).set(self.relays.len() as f64);
        removed
    }

    /// Records a traffic sample and usage percentages. Never creates an entry.
    pub fn update(
        &mut self,
        address: &str,
        traffic: TrafficStats,
        cpu_usage: f32,
        mem_usage: f32,
    ) -> Result<(), RelayMapError> {
        let Some(entry) = self.relays.get(address) else {
            tracing::warn!(relay_address = %address, "relay not found in relay map");
            counter!(RELAY_MAP_UPDATE_NOT_FOUND).increment(1);
            return Err(RelayMapError::NotFound(address.to_string()));
        };

        entry.record(traffic, cpu_usage, mem_usage);
        Ok(())
    }
}
