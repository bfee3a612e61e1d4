//! Directed relay-to-relay cost samples.
//!
//! Every directed pair keeps a bounded history of measurements and reads as
//! the maximum over that history. Pairs that were never measured, that have
//! only lossy measurements, or that were not refreshed within the TTL read as
//! [`Sample::INVALID`].
use crate::types::{PingSample, RelayId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Number of measurements retained per directed pair.
pub const HISTORY_SIZE: usize = 300;

/// Value reported for pairs without a usable measurement.
pub const INVALID_ROUTE_VALUE: f32 = 10000.0;

/// Packet loss above which a measurement is discarded as invalid.
const MAX_MEASURED_PACKET_LOSS: f32 = 99.0;

/// Cost grid value for pairs without a usable edge.
pub const COST_SENTINEL: i32 = -1;

pub const DEFAULT_SAMPLE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

impl Sample {
    pub const INVALID: Sample = Sample {
        rtt: INVALID_ROUTE_VALUE,
        jitter: INVALID_ROUTE_VALUE,
        packet_loss: INVALID_ROUTE_VALUE,
    };

    pub fn is_valid(&self) -> bool {
        self.rtt < INVALID_ROUTE_VALUE
    }

    /// True when the sample is valid and within both thresholds.
    pub fn is_routable(&self, max_jitter: f32, max_packet_loss: f32) -> bool {
        self.is_valid() && self.jitter <= max_jitter && self.packet_loss <= max_packet_loss
    }

    pub fn cost(&self, max_jitter: f32, max_packet_loss: f32) -> i32 {
        if self.is_routable(max_jitter, max_packet_loss) {
            self.rtt.ceil() as i32
        } else {
            COST_SENTINEL
        }
    }

    /// Element-wise maximum of both directions of a pair.
    fn worst_of(self, other: Sample) -> Sample {
        if !self.is_valid() || !other.is_valid() {
            return Sample::INVALID;
        }
        Sample {
            rtt: self.rtt.max(other.rtt),
            jitter: self.jitter.max(other.jitter),
            packet_loss: self.packet_loss.max(other.packet_loss),
        }
    }
}

#[derive(Debug)]
struct SampleHistory {
    // None marks a measurement that was discarded as invalid
    measurements: VecDeque<Option<Sample>>,
    effective: Sample,
    updated_at: Instant,
}

impl SampleHistory {
    fn new(now: Instant) -> Self {
        SampleHistory {
            measurements: VecDeque::new(),
            effective: Sample::INVALID,
            updated_at: now,
        }
    }

    fn push(&mut self, sample: &PingSample, now: Instant) {
        if self.measurements.len() == HISTORY_SIZE {
            self.measurements.pop_front();
        }

        let measurement = (sample.rtt.is_finite()
            && sample.jitter.is_finite()
            && sample.packet_loss.is_finite()
            && sample.rtt >= 0.0
            && sample.packet_loss <= MAX_MEASURED_PACKET_LOSS)
            .then_some(Sample {
                rtt: sample.rtt,
                jitter: sample.jitter.max(0.0),
                packet_loss: sample.packet_loss.max(0.0),
            });
        self.measurements.push_back(measurement);
        self.updated_at = now;

        self.effective = self
            .measurements
            .iter()
            .flatten()
            .fold(None, |acc: Option<Sample>, m| {
                Some(match acc {
                    None => *m,
                    Some(acc) => Sample {
                        rtt: acc.rtt.max(m.rtt),
                        jitter: acc.jitter.max(m.jitter),
                        packet_loss: acc.packet_loss.max(m.packet_loss),
                    },
                })
            })
            .unwrap_or(Sample::INVALID);
    }

    fn read(&self, now: Instant, ttl: Duration) -> Sample {
        if now.saturating_duration_since(self.updated_at) > ttl {
            return Sample::INVALID;
        }
        self.effective
    }
}

type SampleTable = HashMap<RelayId, HashMap<RelayId, SampleHistory>>;

pub struct StatsDatabase {
    entries: RwLock<SampleTable>,
    ttl: Duration,
}

impl Default for StatsDatabase {
    fn default() -> Self {
        StatsDatabase::new(DEFAULT_SAMPLE_TTL)
    }
}

impl StatsDatabase {
    pub fn new(ttl: Duration) -> Self {
        StatsDatabase {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Merges one relay's batch of outgoing samples.
    pub fn process_stats(&self, relay_id: RelayId, samples: &[PingSample]) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let peers = entries.entry(relay_id).or_default();
        for sample in samples {
            if sample.relay_id == relay_id {
                continue;
            }
            peers
                .entry(sample.relay_id)
                .or_insert_with(|| SampleHistory::new(now))
                .push(sample, now);
        }
    }

    /// Directed sample from `a` to `b`.
    pub fn get_sample(&self, a: RelayId, b: RelayId) -> Sample {
        let entries = self.entries.read();
        Self::read_sample(&entries, a, b, Instant::now(), self.ttl)
    }

    /// Worst of both directions between `a` and `b`.
    pub fn get_pair_sample(&self, a: RelayId, b: RelayId) -> Sample {
        let entries = self.entries.read();
        let now = Instant::now();
        Self::read_sample(&entries, a, b, now, self.ttl)
            .worst_of(Self::read_sample(&entries, b, a, now, self.ttl))
    }

    /// Flattened row-major directed cost grid for exactly `relay_ids`.
    pub fn get_costs(&self, relay_ids: &[RelayId], max_jitter: f32, max_packet_loss: f32) -> Vec<i32> {
        let n = relay_ids.len();
        let mut costs = vec![COST_SENTINEL; n * n];
        let entries = self.entries.read();
        let now = Instant::now();

        for (i, &source) in relay_ids.iter().enumerate() {
            let Some(peers) = entries.get(&source) else {
                continue;
            };
            for (j, &dest) in relay_ids.iter().enumerate() {
                if i == j {
                    continue;
                }
                if let Some(history) = peers.get(&dest) {
                    costs[i * n + j] = history.read(now, self.ttl).cost(max_jitter, max_packet_loss);
                }
            }
        }

        costs
    }

    /// Drops a relay's outgoing row and every sample pointing at it.
    pub fn delete_entry(&self, relay_id: RelayId) {
        let mut entries = self.entries.write();
        entries.remove(&relay_id);
        for peers in entries.values_mut() {
            peers.remove(&relay_id);
        }
    }

    /// Drops every row and sample whose source or destination is not in
    /// `relay_ids`.
    pub fn retain_relays(&self, relay_ids: &HashSet<RelayId>) {
        let mut entries = self.entries.write();
        entries.retain(|source, _| relay_ids.contains(source));
        for peers in entries.values_mut() {
            peers.retain(|dest, _| relay_ids.contains(dest));
        }
    }

    /// Point-in-time copy of every effective sample. Writers are only blocked
    /// while the copy is taken.
    pub fn make_copy(&self) -> StatsSnapshot {
        let entries = self.entries.read();
        let now = Instant::now();
        let samples = entries
            .iter()
            .map(|(&source, peers)| {
                let row = peers
                    .iter()
                    .map(|(&dest, history)| (dest, history.read(now, self.ttl)))
                    .collect();
                (source, row)
            })
            .collect();
        StatsSnapshot { samples }
    }

    fn read_sample(entries: &SampleTable, a: RelayId, b: RelayId, now: Instant, ttl: Duration) -> Sample {
        entries
            .get(&a)
            .and_then(|peers| peers.get(&b))
            .map(|history| history.read(now, ttl))
            .unwrap_or(Sample::INVALID)
    }
}

/// Immutable copy of the stats database.
#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
    samples: HashMap<RelayId, HashMap<RelayId, Sample>>,
}

impl StatsSnapshot {
    /// Every relay that appears as a source or destination, sorted.
    pub fn relay_ids(&self) -> Vec<RelayId> {
        let mut ids: Vec<RelayId> = self
            .samples
            .iter()
            .flat_map(|(source, peers)| std::iter::once(*source).chain(peers.keys().copied()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn get_sample(&self, a: RelayId, b: RelayId) -> Sample {
        self.samples
            .get(&a)
            .and_then(|peers| peers.get(&b))
            .copied()
            .unwrap_or(Sample::INVALID)
    }

    pub fn get_pair_sample(&self, a: RelayId, b: RelayId) -> Sample {
        self.get_sample(a, b).worst_of(self.get_sample(b, a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(relay_id: RelayId, rtt: f32, jitter: f32, packet_loss: f32) -> PingSample {
        PingSample {
            relay_id,
            rtt,
            jitter,
            packet_loss,
        }
    }

    #[test]
    fn test_missing_pair_is_invalid() {
        let db = StatsDatabase::default();
        assert_eq!(db.get_sample(1, 2), Sample::INVALID);
        assert!(!db.get_sample(1, 2).is_valid());
    }

    #[test]
    fn test_sample_is_max_over_history() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 1.0, 0.0)]);
        db.process_stats(1, &[ping(2, 30.0, 0.5, 0.0)]);
        db.process_stats(1, &[ping(2, 20.0, 2.0, 0.0)]);

        let sample = db.get_sample(1, 2);
        assert_eq!(sample.rtt, 30.0);
        assert_eq!(sample.jitter, 2.0);
        // directed: the reverse direction was never measured
        assert!(!db.get_sample(2, 1).is_valid());
    }

    #[test]
    fn test_history_is_bounded() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 500.0, 0.0, 0.0)]);
        for _ in 0..HISTORY_SIZE {
            db.process_stats(1, &[ping(2, 10.0, 0.0, 0.0)]);
        }
        assert_eq!(db.get_sample(1, 2).rtt, 10.0);
    }

    #[test]
    fn test_lossy_measurements_are_invalid() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 0.0, 100.0)]);
        assert!(!db.get_sample(1, 2).is_valid());

        db.process_stats(1, &[ping(2, 12.0, 0.0, 0.0)]);
        assert_eq!(db.get_sample(1, 2).rtt, 12.0);
    }

    #[test]
    fn test_stale_samples_are_invalid() {
        let db = StatsDatabase::new(Duration::from_millis(10));
        db.process_stats(1, &[ping(2, 10.0, 0.0, 0.0)]);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!db.get_sample(1, 2).is_valid());
        assert_eq!(db.get_costs(&[1, 2], 10.0, 1.0), vec![-1, -1, -1, -1]);
    }

    #[test]
    fn test_pair_sample_is_worst_direction() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 3.0, 0.0)]);
        assert!(!db.get_pair_sample(1, 2).is_valid());

        db.process_stats(2, &[ping(1, 15.0, 1.0, 0.5)]);
        let sample = db.get_pair_sample(1, 2);
        assert_eq!(sample.rtt, 15.0);
        assert_eq!(sample.jitter, 3.0);
        assert_eq!(sample.packet_loss, 0.5);
        assert_eq!(db.get_pair_sample(2, 1), sample);
    }

    #[test]
    fn test_get_costs_thresholds() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.2, 1.0, 0.0), ping(3, 20.0, 50.0, 0.0)]);
        db.process_stats(2, &[ping(1, 11.0, 1.0, 0.0), ping(3, 30.0, 1.0, 5.0)]);
        db.process_stats(3, &[ping(1, 21.0, 1.0, 0.0)]);

        let costs = db.get_costs(&[1, 2, 3], 10.0, 1.0);
        assert_eq!(costs.len(), 9);
        #[rustfmt::skip]
        assert_eq!(costs, vec![
            -1, 11, -1,
            11, -1, -1,
            21, -1, -1,
        ]);

        // ordering follows the requested IDs
        let costs = db.get_costs(&[2, 1], 10.0, 1.0);
        assert_eq!(costs, vec![-1, 11, 11, -1]);
    }

    #[test]
    fn test_self_samples_are_ignored() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(1, 10.0, 0.0, 0.0)]);
        assert!(!db.get_sample(1, 1).is_valid());
    }

    #[test]
    fn test_delete_entry() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 0.0, 0.0)]);
        db.process_stats(2, &[ping(1, 10.0, 0.0, 0.0)]);
        db.delete_entry(2);

        assert!(!db.get_sample(1, 2).is_valid());
        assert!(!db.get_sample(2, 1).is_valid());
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 0.0, 0.0)]);
        let snapshot = db.make_copy();

        db.process_stats(1, &[ping(3, 10.0, 0.0, 0.0)]);
        db.process_stats(1, &[ping(2, 50.0, 0.0, 0.0)]);

        assert_eq!(snapshot.relay_ids(), vec![1, 2]);
        assert_eq!(snapshot.get_sample(1, 2).rtt, 10.0);
        assert!(!snapshot.get_pair_sample(1, 2).is_valid());
        assert_eq!(db.make_copy().relay_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_retain_relays() {
        let db = StatsDatabase::default();
        db.process_stats(1, &[ping(2, 10.0, 0.0, 0.0), ping(3, 10.0, 0.0, 0.0)]);
        db.process_stats(2, &[ping(1, 10.0, 0.0, 0.0)]);
        db.process_stats(3, &[ping(1, 10.0, 0.0, 0.0)]);

        db.retain_relays(&HashSet::from([1, 2]));

        assert_eq!(db.make_copy().relay_ids(), vec![1, 2]);
        assert!(db.get_sample(1, 2).is_valid());
        assert!(db.get_sample(2, 1).is_valid());
        assert!(!db.get_sample(1, 3).is_valid());
    }

    #[test]
    fn test_concurrent_writers_and_reader() {
        const WRITERS: u64 = 4;
        const ROUNDS: usize = 500;
        let db = StatsDatabase::default();
        let relay_ids: Vec<RelayId> = (1..=WRITERS).collect();
        let rtt = |relay_id: RelayId| 10.0 * relay_id as f32;

        std::thread::scope(|scope| {
            for &writer in &relay_ids {
                let db = &db;
                let relay_ids = &relay_ids;
                scope.spawn(move || {
                    let samples: Vec<PingSample> = relay_ids
                        .iter()
                        .map(|&peer| ping(peer, rtt(writer), 0.0, 0.0))
                        .collect();
                    for _ in 0..ROUNDS {
                        db.process_stats(writer, &samples);
                    }
                });
            }

            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let snapshot = db.make_copy();
                    for &source in &relay_ids {
                        for &dest in &relay_ids {
                            let sample = snapshot.get_sample(source, dest);
                            if sample.is_valid() {
                                assert_eq!(sample.rtt, rtt(source));
                            }
                        }
                    }
                    let n = relay_ids.len();
                    assert_eq!(db.get_costs(&relay_ids, 10.0, 1.0).len(), n * n);
                }
            });
        });

        let snapshot = db.make_copy();
        assert_eq!(snapshot.relay_ids(), relay_ids);
        for &source in &relay_ids {
            for &dest in &relay_ids {
                if source != dest {
                    assert_eq!(snapshot.get_sample(source, dest).rtt, rtt(source));
                }
            }
        }
    }
}
