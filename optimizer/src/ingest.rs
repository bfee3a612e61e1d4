//! Relay update ingestion.
//!
//! Updates are best effort: anything that cannot be applied is counted and
//! dropped, the relay's next periodic update supersedes it.
use crate::Shutdown;
use crate::metrics_defs::{
    RELAY_UPDATE_DECODE_FAILED, RELAY_UPDATE_PROCESSED, RELAY_UPDATE_RELAY_NOT_FOUND,
};
use crate::relay_map::RelayMap;
use crate::stats_database::StatsDatabase;
use crate::types::{PingSample, RelayId, TrafficStats};
use async_trait::async_trait;
use bytes::Bytes;
use shared::counter;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub const RELAY_UPDATE_VERSION: u32 = 1;

/// Largest relay update accepted over UDP.
const MAX_PACKET_SIZE: usize = 65_507;

/// How long a receive may block before the loop re-checks shutdown.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("unsupported relay update version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid relay address {0:?}")]
    InvalidAddress(String),

    #[error("invalid {0} usage")]
    InvalidUsage(&'static str),

    #[error("relay {0} not found")]
    RelayNotFound(String),

    #[error("subscription error: {0}")]
    Subscription(#[from] io::Error),

    #[error("subscription closed")]
    SubscriptionClosed,
}

/// Periodic report sent by a relay.
#[derive(Clone, Debug, PartialEq, bincode::Encode, bincode::Decode)]
pub struct RelayUpdate {
    pub address: String,
    pub relay_version: String,
    pub ping_stats: Vec<PingSample>,
    pub traffic_stats: TrafficStats,
    /// Fraction in [0, 1]
    pub cpu_usage: f32,
    /// Fraction in [0, 1]
    pub mem_usage: f32,
}

impl RelayUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, IngestError> {
        Ok(bincode::encode_to_vec(
            (RELAY_UPDATE_VERSION, self),
            bincode::config::standard(),
        )?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, IngestError> {
        // Length prefixes larger than a datagram fail instead of allocating.
        let config = bincode::config::standard().with_limit::<MAX_PACKET_SIZE>();
        let (version, read): (u32, usize) = bincode::decode_from_slice(payload, config)?;
        if version != RELAY_UPDATE_VERSION {
            return Err(IngestError::UnsupportedVersion(version));
        }
        let (update, _): (RelayUpdate, usize) = bincode::decode_from_slice(&payload[read..], config)?;
        Ok(update)
    }

    /// Address in the form used as relay map key.
    pub fn normalized_address(&self) -> Result<String, IngestError> {
        self.address
            .trim()
            .parse::<SocketAddr>()
            .map(|address| address.to_string())
            .map_err(|_| IngestError::InvalidAddress(self.address.clone()))
    }
}

fn usage_percent(name: &'static str, fraction: f32) -> Result<f32, IngestError> {
    if !fraction.is_finite() {
        return Err(IngestError::InvalidUsage(name));
    }
    Ok((fraction * 100.0).clamp(0.0, 100.0))
}

/// Applies relay updates to the stats database and the relay map.
#[derive(Clone)]
pub struct RelayUpdateHandler {
    relay_map: Arc<RelayMap>,
    stats_db: Arc<StatsDatabase>,
}

impl RelayUpdateHandler {
    pub fn new(relay_map: Arc<RelayMap>, stats_db: Arc<StatsDatabase>) -> Self {
        RelayUpdateHandler {
            relay_map,
            stats_db,
        }
    }

    pub fn handle(&self, payload: &[u8]) -> Result<RelayId, IngestError> {
        let decoded = RelayUpdate::decode(payload).and_then(|update| {
            let address = update.normalized_address()?;
            let cpu = usage_percent("cpu", update.cpu_usage)?;
            let mem = usage_percent("memory", update.mem_usage)?;
            Ok((update, address, cpu, mem))
        });
        let (update, address, cpu, mem) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(error = %err, "dropping relay update");
                counter!(RELAY_UPDATE_DECODE_FAILED).increment(1);
                return Err(err);
            }
        };

        // Held until the update is applied so a concurrent removal cannot
        // interleave with the stats write.
        let mut relays = self.relay_map.lock();
        let Some(entry) = relays.get(&address) else {
            tracing::debug!(relay_address = %address, "dropping update from unknown relay");
            counter!(RELAY_UPDATE_RELAY_NOT_FOUND).increment(1);
            return Err(IngestError::RelayNotFound(address));
        };

        let id = entry.id;
        self.stats_db.process_stats(id, &update.ping_stats);
        if relays.update(&address, update.traffic_stats, cpu, mem).is_err() {
            return Err(IngestError::RelayNotFound(address));
        }
        drop(relays);

        counter!(RELAY_UPDATE_PROCESSED).increment(1);
        Ok(id)
    }
}

/// Source of relay update payloads.
#[async_trait]
pub trait RelayUpdateSubscriber: Send {
    /// Sets up the subscription. Failing here is fatal.
    async fn subscribe(&mut self) -> Result<(), IngestError>;

    /// Next payload, or `None` once the subscription is closed.
    async fn receive(&mut self) -> Option<Bytes>;
}

/// Receives payloads from an in-process channel.
pub struct ChannelSubscriber {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSubscriber {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        ChannelSubscriber { rx }
    }
}

#[async_trait]
impl RelayUpdateSubscriber for ChannelSubscriber {
    async fn subscribe(&mut self) -> Result<(), IngestError> {
        Ok(())
    }

    async fn receive(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Receives one relay update per UDP datagram.
pub struct UdpSubscriber {
    address: String,
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
}

impl UdpSubscriber {
    pub fn new(host: &str, port: u16) -> Self {
        UdpSubscriber {
            address: format!("{host}:{port}"),
            socket: None,
            buffer: vec![0; MAX_PACKET_SIZE],
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }
}

#[async_trait]
impl RelayUpdateSubscriber for UdpSubscriber {
    async fn subscribe(&mut self) -> Result<(), IngestError> {
        let socket = UdpSocket::bind(self.address.as_str()).await?;
        tracing::info!(address = %self.address, "listening for relay updates");
        self.socket = Some(socket);
        Ok(())
    }

    async fn receive(&mut self) -> Option<Bytes> {
        let socket = self.socket.as_ref()?;
        loop {
            match socket.recv_from(&mut self.buffer).await {
                Ok((len, _peer)) => return Some(Bytes::copy_from_slice(&self.buffer[..len])),
                Err(err) => tracing::warn!(error = %err, "failed to receive relay update"),
            }
        }
    }
}

/// Applies updates one at a time until shutdown. Subscription failures are
/// returned, bad updates are not.
pub async fn run_ingest<S>(
    handler: RelayUpdateHandler,
    mut subscriber: S,
    shutdown: Shutdown,
) -> Result<(), IngestError>
where
    S: RelayUpdateSubscriber,
{
    subscriber.subscribe().await?;

    loop {
        if shutdown.is_triggered() {
            tracing::info!("relay update ingestion shutting down");
            return Ok(());
        }

        match tokio::time::timeout(RECEIVE_POLL_INTERVAL, subscriber.receive()).await {
            Err(_) => continue,
            Ok(None) => return Err(IngestError::SubscriptionClosed),
            Ok(Some(payload)) => {
                let _ = handler.handle(&payload);
            }
        }
    }
}
