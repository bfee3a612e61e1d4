//! Cost and route matrices produced by one optimization cycle.
//!
//! Both matrices are immutable once built and carry their serialized form.
//! Serialization is bincode (standard config) prefixed with a format version
//! and bounded by a caller supplied buffer size.
use crate::path_selection::RouteEntry;
use crate::types::{Relay, RelayId};
use bincode::error::EncodeError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub const COST_MATRIX_VERSION: u32 = 1;
pub const ROUTE_MATRIX_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum MatrixError {
    #[error("encode error: {0}")]
    Encode(EncodeError),

    #[error("serialized matrix does not fit in {limit} bytes")]
    BufferTooSmall { limit: usize },

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("unsupported matrix version {0}")]
    UnsupportedVersion(u32),

    #[error("analysis error: {0}")]
    Analysis(#[from] serde_json::Error),
}

/// Per-relay metadata stored as parallel arrays, one slot per matrix row.
#[derive(Clone, Debug, Default, PartialEq, bincode::Encode, bincode::Decode)]
pub struct RelayMetadata {
    pub ids: Vec<RelayId>,
    pub addresses: Vec<String>,
    pub names: Vec<String>,
    pub latitudes: Vec<f32>,
    pub longitudes: Vec<f32>,
    pub datacenter_ids: Vec<u64>,
}

impl RelayMetadata {
    pub fn with_capacity(capacity: usize) -> Self {
        RelayMetadata {
            ids: Vec::with_capacity(capacity),
            addresses: Vec::with_capacity(capacity),
            names: Vec::with_capacity(capacity),
            latitudes: Vec::with_capacity(capacity),
            longitudes: Vec::with_capacity(capacity),
            datacenter_ids: Vec::with_capacity(capacity),
        }
    }

    /// Appends a slot for `id`. Without a relay record the slot keeps the ID
    /// and default values for everything else.
    pub fn push(&mut self, id: RelayId, relay: Option<&Relay>) {
        self.ids.push(id);
        match relay {
            Some(relay) => {
                self.addresses.push(relay.address.to_string());
                self.names.push(relay.name.clone());
                self.latitudes.push(relay.datacenter.latitude);
                self.longitudes.push(relay.datacenter.longitude);
                self.datacenter_ids.push(relay.datacenter.id);
            }
            None => {
                self.addresses.push(String::new());
                self.names.push(String::new());
                self.latitudes.push(0.0);
                self.longitudes.push(0.0);
                self.datacenter_ids.push(0);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn datacenter_count(&self) -> usize {
        self.datacenter_ids
            .iter()
            .filter(|&&id| id != 0)
            .collect::<HashSet<_>>()
            .len()
    }
}

fn encode_bounded<E: bincode::Encode>(value: E, buffer_size: usize) -> Result<Bytes, MatrixError> {
    let mut buffer = vec![0u8; buffer_size];
    match bincode::encode_into_slice(value, &mut buffer, bincode::config::standard()) {
        Ok(size) => {
            buffer.truncate(size);
            Ok(Bytes::from(buffer))
        }
        Err(EncodeError::UnexpectedEnd) => Err(MatrixError::BufferTooSmall { limit: buffer_size }),
        Err(err) => Err(MatrixError::Encode(err)),
    }
}

/// Reads the version prefix and returns the remaining body.
fn decode_version(bytes: &[u8], expected: u32) -> Result<&[u8], MatrixError> {
    let (version, read): (u32, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())?;
    if version != expected {
        return Err(MatrixError::UnsupportedVersion(version));
    }
    Ok(&bytes[read..])
}

#[derive(Clone, Debug)]
pub struct CostMatrix {
    relays: Arc<RelayMetadata>,
    costs: Vec<i32>,
    data: Bytes,
}

impl CostMatrix {
    pub fn new(
        relays: Arc<RelayMetadata>,
        costs: Vec<i32>,
        buffer_size: usize,
    ) -> Result<Self, MatrixError> {
        let data = encode_bounded((COST_MATRIX_VERSION, &*relays, &costs), buffer_size)?;
        Ok(CostMatrix {
            relays,
            costs,
            data,
        })
    }

    pub fn decode(data: Bytes) -> Result<Self, MatrixError> {
        let body = decode_version(&data, COST_MATRIX_VERSION)?;
        let ((relays, costs), _): ((RelayMetadata, Vec<i32>), usize) =
            bincode::decode_from_slice(body, bincode::config::standard())?;
        Ok(CostMatrix {
            relays: Arc::new(relays),
            costs,
            data,
        })
    }

    pub fn relays(&self) -> &Arc<RelayMetadata> {
        &self.relays
    }

    pub fn costs(&self) -> &[i32] {
        &self.costs
    }

    pub fn cost(&self, from: usize, to: usize) -> i32 {
        self.costs[from * self.relays.len() + to]
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[derive(Clone, Debug)]
pub struct RouteMatrix {
    relays: Arc<RelayMetadata>,
    entries: Vec<RouteEntry>,
    data: Bytes,
    analysis: RouteMatrixAnalysis,
}

impl RouteMatrix {
    pub fn new(
        relays: Arc<RelayMetadata>,
        entries: Vec<RouteEntry>,
        buffer_size: usize,
    ) -> Result<Self, MatrixError> {
        let data = encode_bounded((ROUTE_MATRIX_VERSION, &*relays, &entries), buffer_size)?;
        let analysis = RouteMatrixAnalysis::new(&relays, &entries);
        Ok(RouteMatrix {
            relays,
            entries,
            data,
            analysis,
        })
    }

    pub fn decode(data: Bytes) -> Result<Self, MatrixError> {
        let body = decode_version(&data, ROUTE_MATRIX_VERSION)?;
        let ((relays, entries), _): ((RelayMetadata, Vec<RouteEntry>), usize) =
            bincode::decode_from_slice(body, bincode::config::standard())?;
        let analysis = RouteMatrixAnalysis::new(&relays, &entries);
        Ok(RouteMatrix {
            relays: Arc::new(relays),
            entries,
            data,
            analysis,
        })
    }

    pub fn relays(&self) -> &Arc<RelayMetadata> {
        &self.relays
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn entry(&self, from: usize, to: usize) -> &RouteEntry {
        &self.entries[from * self.relays.len() + to]
    }

    pub fn total_routes(&self) -> usize {
        self.entries.iter().map(RouteEntry::num_routes).sum()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn analysis(&self) -> &RouteMatrixAnalysis {
        &self.analysis
    }

    pub fn analysis_json(&self) -> Result<Vec<u8>, MatrixError> {
        Ok(serde_json::to_vec(&self.analysis)?)
    }
}

/// How many pairs improve on their direct RTT by how much, in 5ms buckets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RttImprovement {
    pub none: usize,
    #[serde(rename = "0-5")]
    pub ms_0_5: usize,
    #[serde(rename = "5-10")]
    pub ms_5_10: usize,
    #[serde(rename = "10-15")]
    pub ms_10_15: usize,
    #[serde(rename = "15-20")]
    pub ms_15_20: usize,
    #[serde(rename = "20-25")]
    pub ms_20_25: usize,
    #[serde(rename = "25-30")]
    pub ms_25_30: usize,
    #[serde(rename = "30-35")]
    pub ms_30_35: usize,
    #[serde(rename = "35-40")]
    pub ms_35_40: usize,
    #[serde(rename = "40-45")]
    pub ms_40_45: usize,
    #[serde(rename = "45-50")]
    pub ms_45_50: usize,
    #[serde(rename = "50+")]
    pub ms_50_plus: usize,
}

impl RttImprovement {
    fn record(&mut self, improvement: i32) {
        let bucket = match improvement {
            i32::MIN..=0 => &mut self.none,
            1..=5 => &mut self.ms_0_5,
            6..=10 => &mut self.ms_5_10,
            11..=15 => &mut self.ms_10_15,
            16..=20 => &mut self.ms_15_20,
            21..=25 => &mut self.ms_20_25,
            26..=30 => &mut self.ms_25_30,
            31..=35 => &mut self.ms_30_35,
            36..=40 => &mut self.ms_35_40,
            41..=45 => &mut self.ms_40_45,
            46..=50 => &mut self.ms_45_50,
            _ => &mut self.ms_50_plus,
        };
        *bucket += 1;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMatrixAnalysis {
    pub relay_count: usize,
    pub datacenter_count: usize,
    pub relay_pairs: usize,
    pub routed_pairs: usize,
    pub pairs_without_direct_route: usize,
    pub total_routes: usize,
    pub average_routes_per_pair: f64,
    pub max_routes_per_pair: usize,
    pub average_relays_per_route: f64,
    pub max_relays_per_route: usize,
    pub percent_pairs_with_one_route: f64,
    pub percent_pairs_with_no_routes: f64,
    pub rtt_improvement: RttImprovement,
}

impl RouteMatrixAnalysis {
    pub fn new(relays: &RelayMetadata, entries: &[RouteEntry]) -> Self {
        let n = relays.len();
        let mut analysis = RouteMatrixAnalysis {
            relay_count: n,
            datacenter_count: relays.datacenter_count(),
            relay_pairs: n * n.saturating_sub(1),
            ..Default::default()
        };

        let mut one_route = 0;
        let mut no_routes = 0;
        let mut total_relays = 0;

        for (index, entry) in entries.iter().enumerate() {
            if n == 0 || index / n == index % n {
                continue;
            }

            let num_routes = entry.num_routes();
            analysis.total_routes += num_routes;
            analysis.max_routes_per_pair = analysis.max_routes_per_pair.max(num_routes);
            match num_routes {
                0 => no_routes += 1,
                1 => one_route += 1,
                _ => {}
            }

            for route in &entry.routes {
                total_relays += route.relays.len();
                analysis.max_relays_per_route = analysis.max_relays_per_route.max(route.relays.len());
            }

            let Some(best) = entry.routes.first() else {
                continue;
            };
            analysis.routed_pairs += 1;
            if entry.direct_cost < 0 {
                analysis.pairs_without_direct_route += 1;
            } else {
                analysis.rtt_improvement.record(entry.direct_cost - best.cost);
            }
        }

        if analysis.routed_pairs > 0 {
            analysis.average_routes_per_pair =
                analysis.total_routes as f64 / analysis.routed_pairs as f64;
        }
        if analysis.total_routes > 0 {
            analysis.average_relays_per_route = total_relays as f64 / analysis.total_routes as f64;
        }
        if analysis.relay_pairs > 0 {
            let pairs = analysis.relay_pairs as f64;
            analysis.percent_pairs_with_one_route = one_route as f64 * 100.0 / pairs;
            analysis.percent_pairs_with_no_routes = no_routes as f64 * 100.0 / pairs;
        }

        analysis
    }
}
