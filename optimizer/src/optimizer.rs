//! One optimization cycle: relay metadata, cost matrix, route matrix.
//!
//! A cycle reads the relay map and the stats database but never mutates
//! them. Failed cycles yield a [`CycleError`] and leave the last good result
//! of the same kind in place.
use crate::Shutdown;
use crate::config::OptimizerConfig;
use crate::matrix::{CostMatrix, MatrixError, RelayMetadata, RouteMatrix};
use crate::metrics_defs::{
    COST_MATRIX_BYTES, COST_MATRIX_DURATION, COST_MATRIX_INVOCATIONS, COST_MATRIX_LONG_UPDATES,
    MATRIX_METADATA_LOOKUP_FAILED, MATRIX_STORE_FAILED, ROUTE_MATRIX_BYTES,
    ROUTE_MATRIX_DATACENTERS, ROUTE_MATRIX_DURATION, ROUTE_MATRIX_INVOCATIONS,
    ROUTE_MATRIX_LONG_UPDATES, ROUTE_MATRIX_NO_ROUTES, ROUTE_MATRIX_RELAYS, ROUTE_MATRIX_ROUTES,
};
use crate::path_selection::{self, PathSelector};
use crate::relay_map::RelayMap;
use crate::stats_database::StatsDatabase;
use crate::store::{Matrix, MatrixArchive, MatrixStore, RelayStore, StoreError, archive_path};
use crate::types::RelayId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shared::metrics_defs::MetricDef;
use shared::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cycles slower than this are counted as long updates.
pub const LONG_UPDATE_THRESHOLD: Duration = Duration::from_secs(1);

/// Relays per segment once there are more relays than processing units.
const RELAYS_PER_SEGMENT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatrixKind {
    /// Every relay except excluded sellers, default cost threshold
    Default,
    /// Every relay, customer cost threshold
    Customer,
}

impl MatrixKind {
    pub const ALL: [MatrixKind; 2] = [MatrixKind::Default, MatrixKind::Customer];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatrixKind::Default => "default",
            MatrixKind::Customer => "customer",
        }
    }

    pub fn cost_matrix_type(&self) -> &'static str {
        match self {
            MatrixKind::Default => "cost",
            MatrixKind::Customer => "customer_cost",
        }
    }

    pub fn route_matrix_type(&self) -> &'static str {
        match self {
            MatrixKind::Default => "route",
            MatrixKind::Customer => "customer_route",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error("optimization produced no routes for {relays} relays")]
    NoRouteEntries { relays: usize },

    #[error("could not serialize the {matrix} matrix: {source}")]
    Serialization {
        matrix: &'static str,
        #[source]
        source: MatrixError,
    },
}

/// Result of a successful cycle. Both matrices share the same relay ordering.
#[derive(Clone, Debug)]
pub struct OptimizedMatrices {
    pub cost_matrix: Arc<CostMatrix>,
    pub route_matrix: Arc<RouteMatrix>,
}

/// Number of segments the relay set is split into for path selection.
pub fn num_segments(num_relays: usize, num_cpus: usize) -> usize {
    if num_cpus < num_relays {
        (num_relays / RELAYS_PER_SEGMENT).max(1)
    } else {
        num_relays
    }
}

fn record_cycle(duration: MetricDef, long_updates: MetricDef, kind: MatrixKind, elapsed: Duration) {
    histogram!(duration, "matrix" => kind.as_str()).record(elapsed.as_secs_f64());
    if elapsed > LONG_UPDATE_THRESHOLD {
        counter!(long_updates, "matrix" => kind.as_str()).increment(1);
    }
}

pub struct Optimizer {
    id: u64,
    created_at: DateTime<Utc>,
    config: OptimizerConfig,
    relay_map: Arc<RelayMap>,
    stats_db: Arc<StatsDatabase>,
    relay_store: Arc<dyn RelayStore>,
    path_selector: PathSelector,
    num_threads: usize,
    latest: RwLock<HashMap<MatrixKind, OptimizedMatrices>>,
}

impl Optimizer {
    pub fn new(
        config: OptimizerConfig,
        relay_map: Arc<RelayMap>,
        stats_db: Arc<StatsDatabase>,
        relay_store: Arc<dyn RelayStore>,
    ) -> Self {
        let num_threads = match config.num_threads {
            0 => num_cpus::get(),
            n => n,
        };

        Optimizer {
            id: rand::random(),
            created_at: Utc::now(),
            config,
            relay_map,
            stats_db,
            relay_store,
            path_selector: path_selection::optimize,
            num_threads,
            latest: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_path_selector(mut self, path_selector: PathSelector) -> Self {
        self.path_selector = path_selector;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn relay_ids(&self, kind: MatrixKind) -> Vec<RelayId> {
        match kind {
            MatrixKind::Default => self.relay_map.all_relay_ids(&self.config.excluded_sellers),
            MatrixKind::Customer => self.relay_map.all_relay_ids(&[]),
        }
    }

    /// Looks up every relay in the store, keeping the order of `relay_ids`.
    /// Relays that cannot be loaded keep their slot with default metadata.
    pub fn relay_metadata(&self, relay_ids: &[RelayId]) -> RelayMetadata {
        let mut relays = RelayMetadata::with_capacity(relay_ids.len());
        for &id in relay_ids {
            match self.relay_store.get(id) {
                Ok(relay) => relays.push(id, Some(&relay)),
                Err(err) => {
                    tracing::warn!(relay_id = id, error = %err, "failed to load relay metadata");
                    counter!(MATRIX_METADATA_LOOKUP_FAILED).increment(1);
                    relays.push(id, None);
                }
            }
        }
        relays
    }

    pub fn cost_matrix(&self, kind: MatrixKind, relays: Arc<RelayMetadata>) -> Result<CostMatrix, CycleError> {
        counter!(COST_MATRIX_INVOCATIONS, "matrix" => kind.as_str()).increment(1);
        let start = Instant::now();

        let costs = self.stats_db.get_costs(
            &relays.ids,
            self.config.max_jitter,
            self.config.max_packet_loss,
        );
        let matrix = CostMatrix::new(relays, costs, self.config.matrix_buffer_size).map_err(|source| {
            tracing::error!(matrix = "cost", error = %source, "failed to serialize cost matrix");
            CycleError::Serialization {
                matrix: "cost",
                source,
            }
        })?;

        record_cycle(COST_MATRIX_DURATION, COST_MATRIX_LONG_UPDATES, kind, start.elapsed());
        gauge!(COST_MATRIX_BYTES, "matrix" => kind.as_str()).set(matrix.data().len() as f64);
        Ok(matrix)
    }

    pub fn optimize(
        &self,
        kind: MatrixKind,
        cost_matrix: &CostMatrix,
        cost_threshold: i32,
    ) -> Result<RouteMatrix, CycleError> {
        counter!(ROUTE_MATRIX_INVOCATIONS, "matrix" => kind.as_str()).increment(1);
        let start = Instant::now();

        let relays = cost_matrix.relays().clone();
        let num_relays = relays.len();
        let entries = (self.path_selector)(
            num_relays,
            num_segments(num_relays, self.num_threads),
            cost_matrix.costs(),
            cost_threshold,
            &relays.datacenter_ids,
        );

        if entries.iter().all(|entry| entry.routes.is_empty()) {
            tracing::warn!(matrix = kind.as_str(), relays = num_relays, "optimization produced no routes");
            counter!(ROUTE_MATRIX_NO_ROUTES, "matrix" => kind.as_str()).increment(1);
            return Err(CycleError::NoRouteEntries { relays: num_relays });
        }

        let matrix = RouteMatrix::new(relays, entries, self.config.matrix_buffer_size).map_err(|source| {
            tracing::error!(matrix = "route", error = %source, "failed to serialize route matrix");
            CycleError::Serialization {
                matrix: "route",
                source,
            }
        })?;

        record_cycle(ROUTE_MATRIX_DURATION, ROUTE_MATRIX_LONG_UPDATES, kind, start.elapsed());
        let label = kind.as_str();
        gauge!(ROUTE_MATRIX_BYTES, "matrix" => label).set(matrix.data().len() as f64);
        gauge!(ROUTE_MATRIX_RELAYS, "matrix" => label).set(num_relays as f64);
        gauge!(ROUTE_MATRIX_DATACENTERS, "matrix" => label)
            .set(matrix.relays().datacenter_count() as f64);
        gauge!(ROUTE_MATRIX_ROUTES, "matrix" => label).set(matrix.total_routes() as f64);
        Ok(matrix)
    }

    fn build(&self, kind: MatrixKind) -> Result<OptimizedMatrices, CycleError> {
        let relay_ids = self.relay_ids(kind);
        let relays = Arc::new(self.relay_metadata(&relay_ids));
        let cost_matrix = self.cost_matrix(kind, relays)?;

        let cost_threshold = match kind {
            MatrixKind::Default => self.config.cost_threshold,
            MatrixKind::Customer => self.config.customer_cost_threshold,
        };
        let route_matrix = self.optimize(kind, &cost_matrix, cost_threshold)?;

        Ok(OptimizedMatrices {
            cost_matrix: Arc::new(cost_matrix),
            route_matrix: Arc::new(route_matrix),
        })
    }

    /// Builds the default cost and route matrices.
    pub fn route_matrix(&self) -> Result<OptimizedMatrices, CycleError> {
        self.build(MatrixKind::Default)
    }

    /// Builds the customer matrices: no seller exclusion and the customer
    /// cost threshold.
    pub fn customer_route_matrix(&self) -> Result<OptimizedMatrices, CycleError> {
        self.build(MatrixKind::Customer)
    }

    /// Runs a cycle and, on success, replaces the latest result of that kind.
    pub fn refresh(&self, kind: MatrixKind) -> Result<OptimizedMatrices, CycleError> {
        let matrices = self.build(kind)?;
        self.latest.write().insert(kind, matrices.clone());
        Ok(matrices)
    }

    /// Last successful result of a kind.
    pub fn latest(&self, kind: MatrixKind) -> Option<OptimizedMatrices> {
        self.latest.read().get(&kind).cloned()
    }

    /// Stores both matrices and, when configured, archives them.
    pub fn persist(
        &self,
        kind: MatrixKind,
        matrices: &OptimizedMatrices,
        matrix_store: &dyn MatrixStore,
        archive: Option<&dyn MatrixArchive>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let outputs = [
            (kind.cost_matrix_type(), matrices.cost_matrix.data().clone()),
            (kind.route_matrix_type(), matrices.route_matrix.data().clone()),
        ];

        for (matrix_type, data) in outputs {
            if let Some(archive) = archive {
                archive.archive(&archive_path(self.id, now, matrix_type), &data)?;
            }
            matrix_store.update_matrix(Matrix {
                optimizer_id: self.id,
                created_at: self.created_at,
                updated_at: now,
                matrix_type: matrix_type.to_string(),
                data,
            })?;
        }

        Ok(())
    }

    /// Runs both matrix kinds every interval until shutdown. Cycles run on
    /// the blocking pool; a failed cycle keeps the previous result.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        matrix_store: Arc<dyn MatrixStore>,
        archive: Option<Arc<dyn MatrixArchive>>,
        shutdown: Shutdown,
    ) -> Result<(), tokio::task::JoinError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if shutdown.is_triggered() {
                tracing::info!("matrix loop shutting down");
                return Ok(());
            }

            for kind in MatrixKind::ALL {
                let optimizer = self.clone();
                let result = tokio::task::spawn_blocking(move || optimizer.refresh(kind)).await?;

                let matrices = match result {
                    Ok(matrices) => matrices,
                    Err(err) => {
                        tracing::debug!(matrix = kind.as_str(), error = %err, "keeping previous matrices");
                        continue;
                    }
                };

                if let Err(err) = self.persist(kind, &matrices, matrix_store.as_ref(), archive.as_deref()) {
                    tracing::error!(matrix = kind.as_str(), error = %err, "failed to persist matrices");
                    counter!(MATRIX_STORE_FAILED).increment(1);
                }
            }
        }
    }

    /// Serialized analysis of the latest route matrix of a kind.
    pub fn latest_analysis(&self, kind: MatrixKind) -> Option<Bytes> {
        let matrices = self.latest(kind)?;
        match matrices.route_matrix.analysis_json() {
            Ok(json) => Some(Bytes::from(json)),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize route matrix analysis");
                None
            }
        }
    }
}
