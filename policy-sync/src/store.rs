//! Model distribution store.
//!
//! Artifacts are opaque bytes keyed by a logical model name plus version.
//! `publish` records a SHA-256 checksum next to the bytes; `fetch` verifies it
//! and fails closed, so a caller never sees partial or corrupt data. Neither
//! operation retries; see [`crate::retry`].
//!
//! On-disk layout of [`FsModelStore`]:
//! - `<root>/<name>/<version>.bin`
//! - `<root>/<name>/<version>.json` (manifest: byte length + sha256)

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use policy_sync_core::version::ModelVersion;

const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Logical key of one artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub name: String,
    pub version: ModelVersion,
}

impl ArtifactKey {
    pub fn new(name: impl Into<String>, version: ModelVersion) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version.get())
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("checksum mismatch for {key} (expected {expected}, got {actual})")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("size mismatch for {key} (expected {expected} bytes, got {actual})")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid manifest for {key}: {reason}")]
    Manifest { key: String, reason: String },
    #[error("invalid artifact name `{0}`")]
    InvalidName(String),
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

/// Manifest written next to each artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub name: String,
    pub version: i64,
    pub bytes: u64,
    pub hash_algo: String,
    pub sha256: String,
}

impl ArtifactManifest {
    fn describe(key: &ArtifactKey, bytes: &[u8]) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            name: key.name.clone(),
            version: key.version.get(),
            bytes: bytes.len() as u64,
            hash_algo: "sha256".to_string(),
            sha256: sha256_hex(bytes),
        }
    }

    /// Check `bytes` against this manifest
    pub fn verify(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), StoreError> {
        if self.schema_version != MANIFEST_SCHEMA_VERSION || self.hash_algo != "sha256" {
            return Err(StoreError::Manifest {
                key: key.to_string(),
                reason: "unsupported schema_version or hash algorithm".to_string(),
            });
        }
        if self.name != key.name || self.version != key.version.get() {
            return Err(StoreError::Manifest {
                key: key.to_string(),
                reason: format!("manifest describes {}@{}", self.name, self.version),
            });
        }
        if self.bytes != bytes.len() as u64 {
            return Err(StoreError::SizeMismatch {
                key: key.to_string(),
                expected: self.bytes,
                actual: bytes.len() as u64,
            });
        }
        let actual = sha256_hex(bytes);
        if actual != self.sha256 {
            return Err(StoreError::ChecksumMismatch {
                key: key.to_string(),
                expected: self.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Push/pull of model artifacts
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Store `bytes` under `key`, overwriting any previous artifact. Returns the checksum.
    async fn publish(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String, StoreError>;

    /// Load and verify the artifact under `key`
    async fn fetch(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError>;
}

/// Filesystem-backed store
#[derive(Debug, Clone)]
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    /// Use `root` as the store directory (created on first publish)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, key: &ArtifactKey) -> Result<(PathBuf, PathBuf), StoreError> {
        if key.name.is_empty()
            || key.name.contains(['/', '\\'])
            || key.name == "."
            || key.name == ".."
        {
            return Err(StoreError::InvalidName(key.name.clone()));
        }
        let dir = self.root.join(&key.name);
        let version = key.version.get();
        Ok((
            dir.join(format!("{version}.bin")),
            dir.join(format!("{version}.json")),
        ))
    }

    fn publish_blocking(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String, StoreError> {
        let (bin, manifest_path) = self.paths(key)?;
        let manifest = ArtifactManifest::describe(key, bytes);
        atomic_write(&bin, bytes)?;
        write_json_pretty_atomic(&manifest_path, &manifest)?;
        Ok(manifest.sha256)
    }

    fn fetch_blocking(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let (bin, manifest_path) = self.paths(key)?;
        if !manifest_path.exists() || !bin.exists() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let manifest: ArtifactManifest = read_json(&manifest_path)?;
        let bytes = fs::read(&bin)?;
        manifest.verify(key, &bytes)?;
        Ok(bytes)
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn publish(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String, StoreError> {
        let store = self.clone();
        let key = key.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || store.publish_blocking(&key, &bytes))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn fetch(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let store = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.fetch_blocking(&key))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// In-process store, verified the same way as the filesystem one
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    artifacts: Mutex<HashMap<ArtifactKey, (ArtifactManifest, Vec<u8>)>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts
    pub fn len(&self) -> usize {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the stored bytes without touching the manifest
    pub fn corrupt(&self, key: &ArtifactKey, bytes: Vec<u8>) {
        if let Some(entry) = self
            .artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(key)
        {
            entry.1 = bytes;
        }
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn publish(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String, StoreError> {
        let manifest = ArtifactManifest::describe(key, bytes);
        let checksum = manifest.sha256.clone();
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), (manifest, bytes.to_vec()));
        Ok(checksum)
    }

    async fn fetch(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let (manifest, bytes) = self
            .artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        manifest.verify(key, &bytes)?;
        Ok(bytes)
    }
}

fn write_json_pretty_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.flush()?;
        let _ = f.sync_all();
    }
    fs::rename(&tmp_path, path)
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
