//! File-backed vegetation storage.
//!
//! Layout inside the storage directory:
//! ```text
//! storage.meta.json            - schema version, cell size, counts, payload hash
//! vegetation.storage.cbor.zst  - CBOR+zstd compressed storage payload
//! ```

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::PersistentVegetationStorage;

/// Current schema version of the storage payload.
const STORAGE_SCHEMA_VERSION: u32 = 2;

const META_FILE: &str = "storage.meta.json";
const PAYLOAD_FILE: &str = "vegetation.storage.cbor.zst";

/// Errors from file-backed storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("no storage found at {0}")]
    NotFound(PathBuf),
}

/// Metadata stored in storage.meta.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMeta {
    pub schema_version: u32,
    pub package_name: String,
    /// Cell size the stored cell indices refer to.
    #[serde(default)]
    pub cell_size: Option<f32>,
    pub instance_count: usize,
    pub removed_count: usize,
    pub sha256: String,
}

/// Saves and loads [`PersistentVegetationStorage`] with schema and hash checks.
///
/// Loading fails closed: a schema mismatch or a payload whose hash differs
/// from the meta file is an error, never a silently empty storage.
pub struct StorageFile {
    root: PathBuf,
}

impl StorageFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root: path.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.join(META_FILE).is_file()
    }

    /// Write the storage, replacing any previous contents.
    pub fn save(&self, storage: &PersistentVegetationStorage) -> Result<StorageMeta, StoreError> {
        let _span = tracing::info_span!("storage_save", path = %self.root.display()).entered();
        std::fs::create_dir_all(&self.root)?;

        let cbor_bytes = cbor_serialize(storage)?;
        let compressed = zstd_compress(&cbor_bytes)?;

        let meta = StorageMeta {
            schema_version: STORAGE_SCHEMA_VERSION,
            package_name: storage.package_name().to_string(),
            cell_size: storage.cell_size(),
            instance_count: storage.instance_count(),
            removed_count: storage.removed_count(),
            sha256: sha256_hex(&compressed),
        };

        // Payload first, then meta, each via rename so a crash never pairs
        // a new meta with an old payload.
        write_replace(&self.root.join(PAYLOAD_FILE), &compressed)?;
        write_replace(
            &self.root.join(META_FILE),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
        )?;

        tracing::debug!(
            instances = meta.instance_count,
            removed = meta.removed_count,
            bytes = compressed.len(),
            "storage saved"
        );
        Ok(meta)
    }

    /// Read the meta file and check its schema version.
    pub fn meta(&self) -> Result<StorageMeta, StoreError> {
        let meta_path = self.root.join(META_FILE);
        if !meta_path.is_file() {
            return Err(StoreError::NotFound(self.root.clone()));
        }
        let meta: StorageMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
        if meta.schema_version != STORAGE_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                file_version: meta.schema_version,
                expected_version: STORAGE_SCHEMA_VERSION,
            });
        }
        Ok(meta)
    }

    /// Load and verify the stored payload.
    pub fn load(&self) -> Result<PersistentVegetationStorage, StoreError> {
        let _span = tracing::info_span!("storage_load", path = %self.root.display()).entered();
        let meta = self.meta()?;
        let compressed = self.verified_payload(&meta)?;
        let cbor_bytes = zstd_decompress(&compressed)?;
        let storage: PersistentVegetationStorage = cbor_deserialize(&cbor_bytes)?;
        tracing::debug!(
            instances = storage.instance_count(),
            removed = storage.removed_count(),
            "storage loaded"
        );
        Ok(storage)
    }

    /// Check the payload hash against the meta file without decoding it.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let meta = self.meta()?;
        self.verified_payload(&meta).map(|_| ())
    }

    fn verified_payload(&self, meta: &StorageMeta) -> Result<Vec<u8>, StoreError> {
        let compressed = std::fs::read(self.root.join(PAYLOAD_FILE))?;
        let actual = sha256_hex(&compressed);
        if actual != meta.sha256 {
            return Err(StoreError::IntegrityMismatch {
                expected: meta.sha256.clone(),
                actual,
            });
        }
        Ok(compressed)
    }
}

fn write_replace(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
