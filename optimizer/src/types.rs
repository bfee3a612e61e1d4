use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use std::net::SocketAddr;

pub type RelayId = u64;

/// Derives the stable relay ID from its address. Relays restarted on the same
/// address keep the same ID.
pub fn relay_id(address: &str) -> RelayId {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(address.as_bytes());
    hasher.finish()
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Seller {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: u64,
    pub name: String,
    pub latitude: f32,
    pub longitude: f32,
}

/// A relay as recorded in the persistent inventory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub id: RelayId,
    pub name: String,
    pub address: SocketAddr,
    pub public_key: Vec<u8>,
    pub seller: Seller,
    pub datacenter: Datacenter,
    pub max_sessions: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub nic_speed_mbps: u32,
}

impl Relay {
    pub fn new<N>(name: N, address: SocketAddr, datacenter: Datacenter) -> Self
    where
        N: Into<String>,
    {
        Relay {
            id: relay_id(&address.to_string()),
            name: name.into(),
            address,
            public_key: Vec::new(),
            seller: Seller::default(),
            datacenter,
            max_sessions: 0,
            version: String::new(),
            nic_speed_mbps: 0,
        }
    }

    /// The ID this relay's address derives to. Inventory records must carry it.
    pub fn address_id(&self) -> RelayId {
        relay_id(&self.address.to_string())
    }
}

/// Outgoing measurement from the reporting relay to one peer.
#[derive(Clone, Debug, PartialEq, bincode::Encode, bincode::Decode)]
pub struct PingSample {
    pub relay_id: RelayId,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

/// Traffic counters reported by a relay for one update interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, bincode::Encode, bincode::Decode)]
pub struct TrafficStats {
    pub session_count: u64,
    pub envelope_up_kbps: u64,
    pub envelope_down_kbps: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TrafficStats {
    /// Field-wise sum, saturating at `u64::MAX`.
    pub fn add(&self, other: &TrafficStats) -> TrafficStats {
        TrafficStats {
            session_count: self.session_count.saturating_add(other.session_count),
            envelope_up_kbps: self.envelope_up_kbps.saturating_add(other.envelope_up_kbps),
            envelope_down_kbps: self.envelope_down_kbps.saturating_add(other.envelope_down_kbps),
            bytes_sent: self.bytes_sent.saturating_add(other.bytes_sent),
            bytes_received: self.bytes_received.saturating_add(other.bytes_received),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TrafficStats::default()
    }
}
