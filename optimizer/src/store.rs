//! Persistent collaborators: the relay inventory, matrix persistence and the
//! matrix archive.
use crate::types::{Relay, RelayId};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("relay {0:016x} not found")]
    RelayNotFound(RelayId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("invalid relay inventory: {0}")]
    Inventory(#[from] serde_json::Error),

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Authoritative relay inventory.
pub trait RelayStore: Send + Sync {
    fn get_all(&self) -> Result<Vec<Relay>, StoreError>;
    fn get(&self, id: RelayId) -> Result<Relay, StoreError>;
}

/// Inventory records are keyed by the ID their address derives to, whatever
/// ID the record itself carries.
fn keyed_by_address(mut relay: Relay) -> Relay {
    let id = relay.address_id();
    if relay.id != id {
        tracing::debug!(
            relay_name = %relay.name,
            inventory_id = relay.id,
            relay_id = id,
            "replacing inventory relay id with address id"
        );
        relay.id = id;
    }
    relay
}

#[derive(Default)]
pub struct InMemoryRelayStore {
    relays: RwLock<HashMap<RelayId, Relay>>,
}

impl InMemoryRelayStore {
    pub fn new(relays: Vec<Relay>) -> Self {
        InMemoryRelayStore {
            relays: RwLock::new(
                relays
                    .into_iter()
                    .map(keyed_by_address)
                    .map(|r| (r.id, r))
                    .collect(),
            ),
        }
    }

    pub fn insert(&self, relay: Relay) {
        let relay = keyed_by_address(relay);
        self.relays.write().insert(relay.id, relay);
    }

    pub fn remove(&self, id: RelayId) -> Option<Relay> {
        self.relays.write().remove(&id)
    }
}

impl RelayStore for InMemoryRelayStore {
    fn get_all(&self) -> Result<Vec<Relay>, StoreError> {
        let mut relays: Vec<Relay> = self.relays.read().values().cloned().collect();
        relays.sort_by_key(|relay| relay.id);
        Ok(relays)
    }

    fn get(&self, id: RelayId) -> Result<Relay, StoreError> {
        self.relays
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::RelayNotFound(id))
    }
}

/// Relay inventory read from a JSON array on disk. The file is re-read on
/// every call so edits are picked up by the next reconciliation.
pub struct JsonFileRelayStore {
    path: PathBuf,
}

impl JsonFileRelayStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        JsonFileRelayStore { path: path.into() }
    }
}

impl RelayStore for JsonFileRelayStore {
    fn get_all(&self) -> Result<Vec<Relay>, StoreError> {
        let file = File::open(&self.path)?;
        let relays: Vec<Relay> = serde_json::from_reader(io::BufReader::new(file))?;
        Ok(relays.into_iter().map(keyed_by_address).collect())
    }

    fn get(&self, id: RelayId) -> Result<Relay, StoreError> {
        self.get_all()?
            .into_iter()
            .find(|relay| relay.id == id)
            .ok_or(StoreError::RelayNotFound(id))
    }
}

/// Latest serialized matrix of one type.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    pub optimizer_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub matrix_type: String,
    pub data: Bytes,
}

pub trait MatrixStore: Send + Sync {
    fn update_matrix(&self, matrix: Matrix) -> Result<(), StoreError>;
    fn latest(&self, matrix_type: &str) -> Result<Option<Matrix>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryMatrixStore {
    matrices: RwLock<HashMap<String, Matrix>>,
}

impl InMemoryMatrixStore {
    pub fn new() -> Self {
        InMemoryMatrixStore::default()
    }
}

impl MatrixStore for InMemoryMatrixStore {
    fn update_matrix(&self, matrix: Matrix) -> Result<(), StoreError> {
        self.matrices
            .write()
            .insert(matrix.matrix_type.clone(), matrix);
        Ok(())
    }

    fn latest(&self, matrix_type: &str) -> Result<Option<Matrix>, StoreError> {
        Ok(self.matrices.read().get(matrix_type).cloned())
    }
}

#[derive(bincode::Encode, bincode::Decode)]
struct StoredMatrix {
    optimizer_id: u64,
    created_at_ms: i64,
    updated_at_ms: i64,
    matrix_type: String,
    data: Vec<u8>,
}

impl From<&Matrix> for StoredMatrix {
    fn from(matrix: &Matrix) -> Self {
        StoredMatrix {
            optimizer_id: matrix.optimizer_id,
            created_at_ms: matrix.created_at.timestamp_millis(),
            updated_at_ms: matrix.updated_at.timestamp_millis(),
            matrix_type: matrix.matrix_type.clone(),
            data: matrix.data.to_vec(),
        }
    }
}

impl TryFrom<StoredMatrix> for Matrix {
    type Error = StoreError;

    fn try_from(stored: StoredMatrix) -> Result<Self, Self::Error> {
        let timestamp = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms).ok_or(StoreError::InvalidTimestamp(ms))
        };
        Ok(Matrix {
            optimizer_id: stored.optimizer_id,
            created_at: timestamp(stored.created_at_ms)?,
            updated_at: timestamp(stored.updated_at_ms)?,
            matrix_type: stored.matrix_type,
            data: Bytes::from(stored.data),
        })
    }
}

#[derive(Clone)]
/// zstd-compressed bincode, the on-disk format of stored matrices.
struct Codec {
    level: i32,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(level: i32) -> Self {
        Codec {
            level,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    fn write<W: Write>(&self, writer: &mut W, matrix: &StoredMatrix) -> Result<usize, StoreError> {
        let mut encoder = zstd::stream::write::Encoder::new(writer, self.level)?;
        let size = bincode::encode_into_std_write(matrix, &mut encoder, self.config)?;
        encoder.finish()?.flush()?;
        Ok(size)
    }

    fn read<R: Read>(&self, reader: R) -> Result<StoredMatrix, StoreError> {
        let mut decoder = zstd::stream::read::Decoder::new(reader)?;
        Ok(bincode::decode_from_std_read(&mut decoder, self.config)?)
    }
}

/// Keeps the latest matrix of each type in `{base_dir}/{matrix_type}.bin`.
pub struct FilesystemMatrixStore {
    base_dir: PathBuf,
    codec: Codec,
}

impl FilesystemMatrixStore {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        FilesystemMatrixStore {
            base_dir: base_dir.into(),
            codec: Codec::new(1),
        }
    }

    fn path(&self, matrix_type: &str) -> PathBuf {
        self.base_dir.join(format!("{matrix_type}.bin"))
    }
}

impl MatrixStore for FilesystemMatrixStore {
    fn update_matrix(&self, matrix: Matrix) -> Result<(), StoreError> {
        fs::create_dir_all(&self.base_dir)?;
        let path = self.path(&matrix.matrix_type);
        // Write next to the target and rename so readers never see a partial file
        let tmp_path = path.with_extension("bin.tmp");

        let mut writer = io::BufWriter::new(File::create(&tmp_path)?);
        let size = self.codec.write(&mut writer, &StoredMatrix::from(&matrix))?;
        drop(writer);
        fs::rename(&tmp_path, &path)?;

        tracing::debug!(path = %path.display(), bytes = size, "stored matrix");
        Ok(())
    }

    fn latest(&self, matrix_type: &str) -> Result<Option<Matrix>, StoreError> {
        let file = match File::open(self.path(matrix_type)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let stored = self.codec.read(io::BufReader::new(file))?;
        Ok(Some(stored.try_into()?))
    }
}

/// Object storage path under which a matrix snapshot is archived. Components
/// are unpadded decimal values in UTC.
pub fn archive_path(optimizer_id: u64, timestamp: DateTime<Utc>, matrix_type: &str) -> String {
    format!(
        "matrix/optimizer/{}/{}/{}/{}/{}/{}/{}-{}",
        optimizer_id,
        timestamp.year(),
        timestamp.month(),
        timestamp.day(),
        timestamp.hour(),
        timestamp.minute(),
        matrix_type,
        timestamp.second()
    )
}

pub trait MatrixArchive: Send + Sync {
    fn archive(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;
}

pub struct FilesystemArchive {
    base_dir: PathBuf,
}

impl FilesystemArchive {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        FilesystemArchive {
            base_dir: base_dir.into(),
        }
    }
}

impl MatrixArchive for FilesystemArchive {
    fn archive(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let target = self.base_dir.join(Path::new(path));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        Ok(())
    }
}
