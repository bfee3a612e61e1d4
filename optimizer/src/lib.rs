pub mod config;
pub mod ingest;
pub mod matrix;
pub mod metrics_defs;
pub mod optimizer;
pub mod path_selection;
pub mod publish;
pub mod reconciler;
pub mod relay_map;
pub mod stats_database;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::config::{Config, MatrixStoreConfig, OptimizerConfig, RelayStoreConfig, SubscriberConfig};
use crate::ingest::{IngestError, RelayUpdateHandler, RelayUpdateSubscriber, UdpSubscriber};
use crate::optimizer::Optimizer;
use crate::publish::{PingStatsEntry, PublishError, RelayStatsEntry, StatsPublisher, Thresholds};
use crate::reconciler::{ReconcileError, Reconciler};
use crate::relay_map::RelayMap;
use crate::stats_database::StatsDatabase;
use crate::store::{
    FilesystemArchive, FilesystemMatrixStore, InMemoryMatrixStore, JsonFileRelayStore, MatrixArchive,
    MatrixStore, RelayStore,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(thiserror::Error, Debug)]
pub enum OptimizerError {
    #[error("invalid config: {0}")]
    Config(#[from] config::ValidationError),

    #[error("relay reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("relay update ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("stats publishing failed: {0}")]
    Publish(#[from] PublishError),

    #[error("matrix task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Cooperative stop signal shared by all loops. Loops observe it at their
/// next tick.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// External collaborators of the control plane.
pub struct Services {
    pub relay_store: Arc<dyn RelayStore>,
    pub matrix_store: Arc<dyn MatrixStore>,
    pub archive: Option<Arc<dyn MatrixArchive>>,
    pub ping_publisher: Arc<dyn StatsPublisher<PingStatsEntry>>,
    pub relay_publisher: Arc<dyn StatsPublisher<RelayStatsEntry>>,
}

/// Builds the stores and subscriber named by `config` and runs until
/// shutdown or the first fatal error.
pub async fn run(
    config: Config,
    ping_publisher: Arc<dyn StatsPublisher<PingStatsEntry>>,
    relay_publisher: Arc<dyn StatsPublisher<RelayStatsEntry>>,
    shutdown: Shutdown,
) -> Result<(), OptimizerError> {
    config.validate()?;

    let relay_store: Arc<dyn RelayStore> = match &config.relay_store {
        RelayStoreConfig::File { path } => Arc::new(JsonFileRelayStore::new(path.clone())),
    };
    let matrix_store: Arc<dyn MatrixStore> = match &config.matrix_store {
        MatrixStoreConfig::Filesystem { base_dir } => Arc::new(FilesystemMatrixStore::new(base_dir.clone())),
        MatrixStoreConfig::Memory => Arc::new(InMemoryMatrixStore::new()),
    };
    let archive = config.archive.as_ref().map(|archive| {
        Arc::new(FilesystemArchive::new(archive.base_dir.clone())) as Arc<dyn MatrixArchive>
    });
    let subscriber = match &config.subscriber {
        SubscriberConfig::Udp { host, port } => UdpSubscriber::new(host, *port),
    };

    let services = Services {
        relay_store,
        matrix_store,
        archive,
        ping_publisher,
        relay_publisher,
    };
    run_services(config.optimizer, services, subscriber, shutdown).await
}

/// Runs reconciliation, ingestion, matrix generation and both stats loops
/// over shared relay state.
pub async fn run_services<S>(
    config: OptimizerConfig,
    services: Services,
    subscriber: S,
    shutdown: Shutdown,
) -> Result<(), OptimizerError>
where
    S: RelayUpdateSubscriber + 'static,
{
    let Services {
        relay_store,
        matrix_store,
        archive,
        ping_publisher,
        relay_publisher,
    } = services;
    let relay_map = Arc::new(RelayMap::new());
    let stats_db = Arc::new(StatsDatabase::new(config.sample_ttl()));
    let thresholds = Thresholds {
        max_jitter: config.max_jitter,
        max_packet_loss: config.max_packet_loss,
    };

    let reconciler = Reconciler::new(relay_map.clone(), stats_db.clone(), relay_store.clone());
    let handler = RelayUpdateHandler::new(relay_map.clone(), stats_db.clone());
    let optimizer = Arc::new(Optimizer::new(
        config.clone(),
        relay_map.clone(),
        stats_db.clone(),
        relay_store,
    ));
    tracing::info!(
        optimizer_id = optimizer.id(),
        relays_excluded = ?config.excluded_sellers,
        "starting relay optimizer"
    );

    let reconcile_task = async {
        reconciler
            .run(config.relay_cache_interval(), shutdown.clone())
            .await
            .map_err(OptimizerError::from)
    };
    let ingest_task = async {
        ingest::run_ingest(handler, subscriber, shutdown.clone())
            .await
            .map_err(OptimizerError::from)
    };
    let matrix_task = async {
        optimizer
            .run(
                config.matrix_interval(),
                matrix_store,
                archive,
                shutdown.clone(),
            )
            .await
            .map_err(OptimizerError::from)
    };
    let ping_stats_task = async {
        publish::run_ping_stats_loop(
            stats_db.clone(),
            ping_publisher,
            config.ping_stats_interval(),
            thresholds,
            shutdown.clone(),
        )
        .await
        .map_err(OptimizerError::from)
    };
    let relay_stats_task = async {
        publish::run_relay_stats_loop(
            relay_map.clone(),
            stats_db.clone(),
            relay_publisher,
            config.relay_stats_interval(),
            thresholds,
            shutdown.clone(),
        )
        .await
        .map_err(OptimizerError::from)
    };

    let result = tokio::try_join!(
        reconcile_task,
        ingest_task,
        matrix_task,
        ping_stats_task,
        relay_stats_task
    );
    if let Err(err) = &result {
        tracing::error!(error = %err, "relay optimizer stopped");
        shutdown.trigger();
    }
    result.map(|_| ())
}
