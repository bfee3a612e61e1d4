//! Keeps the relay map aligned with the persistent relay inventory.
use crate::Shutdown;
use crate::metrics_defs::{
    RELAY_CACHE_ADDED, RELAY_CACHE_FETCH_FAILED, RELAY_CACHE_REMOVED, RELAY_INIT_LOOKUP_FAILED,
};
use crate::relay_map::{RelayEntry, RelayMap};
use crate::stats_database::StatsDatabase;
use crate::store::{RelayStore, StoreError};
use crate::types::{Relay, RelayId};
use shared::counter;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Consecutive failed ticks after which reconciliation gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("failed to fetch relay inventory: {0}")]
    Fetch(#[from] StoreError),

    #[error("relay {0:016x} appears more than once in the inventory")]
    DuplicateRelay(RelayId),

    #[error("relay {address} carries id {id:016x} instead of its address id")]
    IdMismatch { id: RelayId, address: SocketAddr },

    #[error("giving up after {count} consecutive failures, last error: {last}")]
    TooManyFailures {
        count: u32,
        #[source]
        last: Box<ReconcileError>,
    },
}

/// Relays added and removed since the previous inventory.
#[derive(Debug, Default, PartialEq)]
pub struct RelayDiff {
    pub added: Vec<Relay>,
    pub removed: Vec<(RelayId, SocketAddr)>,
}

/// Last inventory applied to the relay map.
#[derive(Debug, Default)]
pub struct RelayCache {
    relays: HashMap<RelayId, SocketAddr>,
}

impl RelayCache {
    /// Replaces the cached inventory and returns what changed. The cache is
    /// left untouched when the inventory is rejected.
    pub fn set_all(&mut self, relays: Vec<Relay>) -> Result<RelayDiff, ReconcileError> {
        let mut next = HashMap::with_capacity(relays.len());
        let mut added = Vec::new();
        for relay in relays {
            if relay.id != relay.address_id() {
                return Err(ReconcileError::IdMismatch {
                    id: relay.id,
                    address: relay.address,
                });
            }
            if next.insert(relay.id, relay.address).is_some() {
                return Err(ReconcileError::DuplicateRelay(relay.id));
            }
            match self.relays.get(&relay.id) {
                Some(address) if *address == relay.address => {}
                _ => added.push(relay),
            }
        }

        // A relay that moved to a new address is removed and re-added.
        let mut removed: Vec<_> = self
            .relays
            .iter()
            .filter(|(id, address)| next.get(id) != Some(address))
            .map(|(&id, &address)| (id, address))
            .collect();
        removed.sort_unstable();

        self.relays = next;
        Ok(RelayDiff { added, removed })
    }

    /// Drops a relay so the next inventory reports it as added again.
    pub fn forget(&mut self, id: RelayId) {
        self.relays.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

pub struct Reconciler {
    relay_map: Arc<RelayMap>,
    stats_db: Arc<StatsDatabase>,
    relay_store: Arc<dyn RelayStore>,
    cache: RelayCache,
    consecutive_failures: u32,
}

impl Reconciler {
    pub fn new(
        relay_map: Arc<RelayMap>,
        stats_db: Arc<StatsDatabase>,
        relay_store: Arc<dyn RelayStore>,
    ) -> Self {
        Reconciler {
            relay_map,
            stats_db,
            relay_store,
            cache: RelayCache::default(),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// One reconciliation pass. Only returns an error once the failure limit
    /// is reached.
    pub fn tick(&mut self) -> Result<(), ReconcileError> {
        let diff = match self.fetch_diff() {
            Ok(diff) => diff,
            Err(err) => {
                self.consecutive_failures += 1;
                counter!(RELAY_CACHE_FETCH_FAILED).increment(1);
                tracing::warn!(
                    error = %err,
                    consecutive_failures = self.consecutive_failures,
                    "relay inventory reconciliation failed"
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(ReconcileError::TooManyFailures {
                        count: self.consecutive_failures,
                        last: Box::new(err),
                    });
                }
                return Ok(());
            }
        };
        self.consecutive_failures = 0;

        for (id, address) in &diff.removed {
            self.remove_relay(*id, &address.to_string());
        }
        for relay in &diff.added {
            if !self.init_relay(relay.id) {
                self.cache.forget(relay.id);
            }
        }

        // samples of relays that never made it into the map, or left it
        let known: HashSet<RelayId> = self.relay_map.all_relay_ids(&[]).into_iter().collect();
        self.stats_db.retain_relays(&known);

        Ok(())
    }

    fn fetch_diff(&mut self) -> Result<RelayDiff, ReconcileError> {
        let relays = self.relay_store.get_all()?;
        self.cache.set_all(relays)
    }

    fn init_relay(&self, id: RelayId) -> bool {
        let relay = match self.relay_store.get(id) {
            Ok(relay) => relay,
            Err(err) => {
                tracing::error!(relay_id = id, error = %err, "failed to load added relay");
                counter!(RELAY_INIT_LOOKUP_FAILED).increment(1);
                return false;
            }
        };

        let entry = RelayEntry::from_relay(&relay);
        if self.relay_map.lock().add(entry).is_ok() {
            tracing::info!(relay_name = %relay.name, relay_address = %relay.address, "relay added");
            counter!(RELAY_CACHE_ADDED).increment(1);
        }
        true
    }

    fn remove_relay(&self, id: RelayId, address: &str) {
        if self.relay_map.lock().remove(address).is_some() {
            tracing::info!(relay_address = %address, "relay removed");
            counter!(RELAY_CACHE_REMOVED).increment(1);
        }
        self.stats_db.delete_entry(id);
    }

    /// Ticks every `interval` until shutdown or until the failure limit is hit.
    pub async fn run(mut self, interval: Duration, shutdown: Shutdown) -> Result<(), ReconcileError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if shutdown.is_triggered() {
                tracing::info!("relay reconciliation shutting down");
                return Ok(());
            }

            if let Err(err) = self.tick() {
                tracing::error!(error = %err, "relay reconciliation stopped");
                return Err(err);
            }
        }
    }
}
