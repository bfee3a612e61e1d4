//! Periodic ping and relay stats publishing.
//!
//! Both loops fail fast: the first publisher error stops the loop and is
//! returned to the caller.
use crate::Shutdown;
use crate::metrics_defs::{PING_STATS_PUBLISHED, RELAY_STATS_PUBLISHED};
use crate::relay_map::{RelayEntry, RelayMap, TrafficSummary};
use crate::stats_database::{StatsDatabase, StatsSnapshot};
use crate::types::RelayId;
use async_trait::async_trait;
use serde::Serialize;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("publisher is closed")]
    Closed,

    #[error("publish failed: {0}")]
    Transport(String),
}

/// Jitter (ms) and packet loss (percent) limits of a routable pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub max_jitter: f32,
    pub max_packet_loss: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PingStatsEntry {
    pub relay_a: RelayId,
    pub relay_b: RelayId,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
    pub routable: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RelayStatsEntry {
    pub id: RelayId,
    pub cpu_usage: f32,
    pub mem_usage: f32,
    pub bandwidth_sent_mbps: f32,
    pub bandwidth_received_mbps: f32,
    pub envelope_sent_mbps: f32,
    pub envelope_received_mbps: f32,
    pub bandwidth_sent_percent: f32,
    pub bandwidth_received_percent: f32,
    pub envelope_sent_percent: f32,
    pub envelope_received_percent: f32,
    pub num_sessions: u64,
    pub max_sessions: u32,
    pub num_routable: u32,
    pub num_unroutable: u32,
}

/// Analytics sink for one kind of stats entry.
#[async_trait]
pub trait StatsPublisher<E: Send + 'static>: Send + Sync {
    async fn publish(&self, entries: Vec<E>) -> Result<(), PublishError>;
}

/// Discards every batch.
pub struct NoopPublisher;

#[async_trait]
impl<E: Send + 'static> StatsPublisher<E> for NoopPublisher {
    async fn publish(&self, _entries: Vec<E>) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Hands batches to a bounded queue. Publishing waits while the queue is
/// full and fails once the receiving side is gone.
pub struct QueuePublisher<E> {
    tx: mpsc::Sender<Vec<E>>,
}

impl<E> QueuePublisher<E> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<E>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (QueuePublisher { tx }, rx)
    }
}

#[async_trait]
impl<E: Send + 'static> StatsPublisher<E> for QueuePublisher<E> {
    async fn publish(&self, entries: Vec<E>) -> Result<(), PublishError> {
        self.tx.send(entries).await.map_err(|_| PublishError::Closed)
    }
}

/// One entry per unordered relay pair, using the worse of both directions.
pub fn extract_ping_stats(snapshot: &StatsSnapshot, thresholds: Thresholds) -> Vec<PingStatsEntry> {
    let ids = snapshot.relay_ids();
    let mut entries = Vec::new();
    for (i, &relay_a) in ids.iter().enumerate() {
        for &relay_b in &ids[i + 1..] {
            let sample = snapshot.get_pair_sample(relay_a, relay_b);
            if !sample.is_valid() {
                continue;
            }
            entries.push(PingStatsEntry {
                relay_a,
                relay_b,
                rtt: sample.rtt,
                jitter: sample.jitter,
                packet_loss: sample.packet_loss,
                routable: sample.is_routable(thresholds.max_jitter, thresholds.max_packet_loss),
            });
        }
    }
    entries
}

fn percent_of(mbps: f32, capacity_mbps: u32) -> f32 {
    if capacity_mbps == 0 {
        return 0.0;
    }
    mbps / capacity_mbps as f32 * 100.0
}

pub fn relay_stats_entry(
    relay: &RelayEntry,
    summary: &TrafficSummary,
    num_routable: u32,
    num_unroutable: u32,
) -> RelayStatsEntry {
    let elapsed = summary.elapsed.as_secs_f64();
    let mbps = |bytes: u64| {
        if elapsed > 0.0 {
            (bytes as f64 * 8.0 / 1_000_000.0 / elapsed) as f32
        } else {
            0.0
        }
    };
    let bandwidth_sent_mbps = mbps(summary.total.bytes_sent);
    let bandwidth_received_mbps = mbps(summary.total.bytes_received);
    let envelope_sent_mbps = summary.peak.envelope_up_kbps as f32 / 1000.0;
    let envelope_received_mbps = summary.peak.envelope_down_kbps as f32 / 1000.0;
    let nic = relay.nic_speed_mbps;

    RelayStatsEntry {
        id: relay.id,
        cpu_usage: summary.cpu_usage,
        mem_usage: summary.mem_usage,
        bandwidth_sent_mbps,
        bandwidth_received_mbps,
        envelope_sent_mbps,
        envelope_received_mbps,
        bandwidth_sent_percent: percent_of(bandwidth_sent_mbps, nic),
        bandwidth_received_percent: percent_of(bandwidth_received_mbps, nic),
        envelope_sent_percent: percent_of(envelope_sent_mbps, nic),
        envelope_received_percent: percent_of(envelope_received_mbps, nic),
        num_sessions: summary.peak.session_count,
        max_sessions: relay.max_sessions,
        num_routable,
        num_unroutable,
    }
}

/// Drains every relay's traffic and counts the peers it could route through.
/// The routable count only looks at the measured samples, not at the route
/// matrix.
pub fn build_relay_stats(
    relays: &[Arc<RelayEntry>],
    snapshot: &StatsSnapshot,
    thresholds: Thresholds,
) -> Vec<RelayStatsEntry> {
    let peers = relays.len().saturating_sub(1) as u32;
    relays
        .iter()
        .map(|relay| {
            let num_routable = relays
                .iter()
                .filter(|other| other.id != relay.id)
                .filter(|other| {
                    snapshot
                        .get_pair_sample(relay.id, other.id)
                        .is_routable(thresholds.max_jitter, thresholds.max_packet_loss)
                })
                .count() as u32;
            let summary = relay.drain_traffic();
            relay_stats_entry(relay, &summary, num_routable, peers - num_routable)
        })
        .collect()
}

fn publish_ticker(interval: Duration) -> tokio::time::Interval {
    // first publish after one full interval
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub async fn run_ping_stats_loop(
    stats_db: Arc<StatsDatabase>,
    publisher: Arc<dyn StatsPublisher<PingStatsEntry>>,
    interval: Duration,
    thresholds: Thresholds,
    shutdown: Shutdown,
) -> Result<(), PublishError> {
    let mut ticker = publish_ticker(interval);
    loop {
        ticker.tick().await;
        if shutdown.is_triggered() {
            tracing::info!("ping stats publishing shutting down");
            return Ok(());
        }

        let snapshot = stats_db.make_copy();
        let entries = extract_ping_stats(&snapshot, thresholds);
        if entries.is_empty() {
            continue;
        }

        let count = entries.len();
        if let Err(err) = publisher.publish(entries).await {
            tracing::error!(error = %err, "failed to publish ping stats");
            return Err(err);
        }
        counter!(PING_STATS_PUBLISHED).increment(count as u64);
    }
}

pub async fn run_relay_stats_loop(
    relay_map: Arc<RelayMap>,
    stats_db: Arc<StatsDatabase>,
    publisher: Arc<dyn StatsPublisher<RelayStatsEntry>>,
    interval: Duration,
    thresholds: Thresholds,
    shutdown: Shutdown,
) -> Result<(), PublishError> {
    let mut ticker = publish_ticker(interval);
    loop {
        ticker.tick().await;
        if shutdown.is_triggered() {
            tracing::info!("relay stats publishing shutting down");
            return Ok(());
        }

        let relays = relay_map.all_relay_data();
        let snapshot = stats_db.make_copy();
        let entries = build_relay_stats(&relays, &snapshot, thresholds);
        if entries.is_empty() {
            continue;
        }

        let count = entries.len();
        if let Err(err) = publisher.publish(entries).await {
            tracing::error!(error = %err, "failed to publish relay stats");
            return Err(err);
        }
        counter!(RELAY_STATS_PUBLISHED).increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::test_relay;
    use crate::types::{PingSample, TrafficStats};

    const THRESHOLDS: Thresholds = Thresholds {
        max_jitter: 10.0,
        max_packet_loss: 1.0,
    };

    fn ping(relay_id: RelayId, rtt: f32, jitter: f32) -> PingSample {
        PingSample {
            relay_id,
            rtt,
            jitter,
            packet_loss: 0.0,
        }
    }

    fn relay_map(nic_speed_mbps: u32) -> (Arc<RelayMap>, Vec<RelayId>) {
        let map = Arc::new(RelayMap::new());
        let mut ids = Vec::new();
        let mut guard = map.lock();
        for (i, address) in ["10.0.0.1:40000", "10.0.0.2:40000", "10.0.0.3:40000"]
            .iter()
            .enumerate()
        {
            let mut relay = test_relay(&format!("relay.{i}"), address, i as u64 + 1);
            relay.nic_speed_mbps = nic_speed_mbps;
            relay.max_sessions = 100;
            ids.push(relay.id);
            guard.add(RelayEntry::from_relay(&relay)).unwrap();
        }
        drop(guard);
        (map, ids)
    }

    #[test]
    fn test_extract_ping_stats() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 1.0), ping(3, 20.0, 1.0)]);
        db.process_stats(2, &[ping(1, 12.0, 20.0)]);
        db.process_stats(3, &[ping(1, 25.0, 1.0)]);

        let entries = extract_ping_stats(&db.make_copy(), THRESHOLDS);
        assert_eq!(
            entries,
            vec![
                PingStatsEntry {
                    relay_a: 1,
                    relay_b: 2,
                    rtt: 12.0,
                    jitter: 20.0,
                    packet_loss: 0.0,
                    routable: false,
                },
                PingStatsEntry {
                    relay_a: 1,
                    relay_b: 3,
                    rtt: 25.0,
                    jitter: 1.0,
                    packet_loss: 0.0,
                    routable: true,
                },
            ]
        );
    }

    #[test]
    fn test_relay_stats_entry_rates() {
        let relay = RelayEntry::from_relay(&{
            let mut relay = test_relay("relay.a", "10.0.0.1:40000", 1);
            relay.nic_speed_mbps = 1000;
            relay.max_sessions = 50;
            relay
        });
        let summary = TrafficSummary {
            total: TrafficStats {
                bytes_sent: 125_000_000,
                bytes_received: 12_500_000,
                ..Default::default()
            },
            peak: TrafficStats {
                session_count: 7,
                envelope_up_kbps: 250_000,
                envelope_down_kbps: 100_000,
                ..Default::default()
            },
            elapsed: Duration::from_secs(10),
            cpu_usage: 30.0,
            mem_usage: 40.0,
        };

        let entry = relay_stats_entry(&relay, &summary, 1, 1);
        assert_eq!(entry.bandwidth_sent_mbps, 100.0);
        assert_eq!(entry.bandwidth_received_mbps, 10.0);
        assert_eq!(entry.bandwidth_sent_percent, 10.0);
        assert_eq!(entry.envelope_sent_mbps, 250.0);
        assert_eq!(entry.envelope_received_percent, 10.0);
        assert_eq!(entry.num_sessions, 7);
        assert_eq!(entry.max_sessions, 50);
        assert_eq!(entry.cpu_usage, 30.0);
    }

    #[test]
    fn test_unknown_nic_speed_reports_zero_percent() {
        let relay = RelayEntry::from_relay(&test_relay("relay.a", "10.0.0.1:40000", 1));
        let summary = TrafficSummary {
            total: TrafficStats::default(),
            peak: TrafficStats {
                envelope_up_kbps: 5000,
                ..Default::default()
            },
            elapsed: Duration::ZERO,
            cpu_usage: 0.0,
            mem_usage: 0.0,
        };
        let entry = relay_stats_entry(&relay, &summary, 0, 0);
        assert_eq!(entry.envelope_sent_mbps, 5.0);
        assert_eq!(entry.envelope_sent_percent, 0.0);
        assert_eq!(entry.bandwidth_sent_mbps, 0.0);
    }

    #[test]
    fn test_build_relay_stats_counts_routable_peers() {
        let (map, ids) = relay_map(1000);
        let db = StatsDatabase::default();
        // 0 <-> 1 routable, 0 <-> 2 too much jitter, 1 <-> 2 one direction only
        db.process_stats(ids[0], &[ping(ids[1], 10.0, 1.0), ping(ids[2], 10.0, 50.0)]);
        db.process_stats(ids[1], &[ping(ids[0], 10.0, 1.0), ping(ids[2], 10.0, 1.0)]);
        db.process_stats(ids[2], &[ping(ids[0], 10.0, 1.0)]);

        let relays = map.all_relay_data();
        let entries = build_relay_stats(&relays, &db.make_copy(), THRESHOLDS);
        assert_eq!(entries.len(), 3);

        let entry = |id| entries.iter().find(|entry| entry.id == id).unwrap();
        assert_eq!((entry(ids[0]).num_routable, entry(ids[0]).num_unroutable), (1, 1));
        assert_eq!((entry(ids[1]).num_routable, entry(ids[1]).num_unroutable), (1, 1));
        assert_eq!((entry(ids[2]).num_routable, entry(ids[2]).num_unroutable), (0, 2));
    }

    #[test]
    fn test_build_relay_stats_drains_traffic() {
        let (map, _) = relay_map(1000);
        let traffic = TrafficStats {
            session_count: 4,
            ..Default::default()
        };
        map.lock().update("10.0.0.1:40000", traffic, 10.0, 10.0).unwrap();

        let relays = map.all_relay_data();
        let db = StatsDatabase::default();
        let first = build_relay_stats(&relays, &db.make_copy(), THRESHOLDS);
        let second = build_relay_stats(&relays, &db.make_copy(), THRESHOLDS);
        assert_eq!(first.iter().map(|e| e.num_sessions).sum::<u64>(), 4);
        assert_eq!(second.iter().map(|e| e.num_sessions).sum::<u64>(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_stats_loop_publishes_batches() {
        let db = Arc::new(StatsDatabase::default());
        db.process_stats(1, &[ping(2, 10.0, 1.0)]);
        db.process_stats(2, &[ping(1, 10.0, 1.0)]);
        let (publisher, mut rx) = QueuePublisher::<PingStatsEntry>::new(1);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(run_ping_stats_loop(
            db,
            Arc::new(publisher),
            Duration::from_secs(60),
            THRESHOLDS,
            shutdown.clone(),
        ));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].routable);

        shutdown.trigger();
        // unblock a publish that may already be waiting on the full queue
        let _ = rx.recv().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_stats_loop_publishes_batches() {
        let (map, ids) = relay_map(1000);
        let traffic = TrafficStats {
            session_count: 4,
            ..Default::default()
        };
        map.lock().update("10.0.0.1:40000", traffic, 20.0, 30.0).unwrap();
        let db = Arc::new(StatsDatabase::default());
        db.process_stats(ids[0], &[ping(ids[1], 10.0, 1.0)]);
        db.process_stats(ids[1], &[ping(ids[0], 10.0, 1.0)]);

        let (publisher, mut rx) = QueuePublisher::<RelayStatsEntry>::new(1);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(run_relay_stats_loop(
            map,
            db,
            Arc::new(publisher),
            Duration::from_secs(10),
            THRESHOLDS,
            shutdown.clone(),
        ));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        let first = batch.iter().find(|entry| entry.id == ids[0]).unwrap();
        assert_eq!(first.num_sessions, 4);
        assert_eq!((first.cpu_usage, first.mem_usage), (20.0, 30.0));
        assert_eq!((first.num_routable, first.num_unroutable), (1, 1));

        // traffic was drained by the first batch
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|entry| entry.num_sessions == 0));

        shutdown.trigger();
        let _ = rx.recv().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_error_is_fatal() {
        let (map, _) = relay_map(1000);
        let (publisher, rx) = QueuePublisher::<RelayStatsEntry>::new(1);
        drop(rx);

        let result = run_relay_stats_loop(
            map,
            Arc::new(StatsDatabase::default()),
            Arc::new(publisher),
            Duration::from_secs(10),
            THRESHOLDS,
            Shutdown::new(),
        )
        .await;
        assert!(matches!(result, Err(PublishError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_publisher() {
        let (map, _) = relay_map(0);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(run_relay_stats_loop(
            map,
            Arc::new(StatsDatabase::default()),
            Arc::new(NoopPublisher),
            Duration::from_secs(10),
            THRESHOLDS,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.trigger();
        task.await.unwrap().unwrap();
    }
}
