//! Cache-slot blob store with sidecar validator metadata.
//!
//! Every URL owns one slot under `data/` (opaque bytes) plus a JSON sidecar
//! under `meta/` holding the HTTP validators and the payload hash. After a
//! successful fetch the payload is promoted into a content-addressed copy
//! under `<format>/<sha256>.<ext>`. The JSONL manifests live under `index/`.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde_derive::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::data_structures::Format;

/// Metadata persisted alongside each cached payload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StoredMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub sha256: Option<String>,
    pub content_type: Option<String>,
    pub fetched_at: Option<String>,
}

/// Errors raised while streaming a response body into the store. Network
/// failures must stay distinguishable from disk failures so the retry loop
/// can classify them.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Network(#[from] reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobStore { root: root.into() }
    }

    /// Create the fixed store layout up front so workers never race on it.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for sub in ["data", "meta", "index"] {
            std::fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(())
    }

    fn slot_key(url: &str) -> String {
        hex::encode(Sha1::digest(url.as_bytes()))
    }

    /// (data_path, meta_path) for a URL's cache slot.
    pub fn paths_for(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = Self::slot_key(url);
        (
            self.root.join("data").join(format!("{key}.bin")),
            self.root.join("meta").join(format!("{key}.json")),
        )
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.root.join("index").join(name)
    }

    /// Content-addressed location for a promoted payload.
    pub fn payload_path(&self, format: Format, sha256: &str) -> PathBuf {
        self.root
            .join(format.as_str())
            .join(format!("{sha256}.{}", format.extension()))
    }

    /// Load the sidecar for a URL. Missing or corrupt sidecars degrade to an
    /// empty meta so the next fetch runs unconditionally.
    pub async fn load_meta(&self, url: &str) -> StoredMeta {
        let (_, meta_path) = self.paths_for(url);
        match tokio::fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => StoredMeta::default(),
        }
    }

    pub async fn save_meta(&self, url: &str, meta: &StoredMeta) -> std::io::Result<()> {
        let (_, meta_path) = self.paths_for(url);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(meta).expect("sidecar serialization");
        tokio::fs::write(&meta_path, payload).await
    }

    /// Cached payload bytes for a URL, if a non-empty slot exists.
    pub async fn read_cached(&self, url: &str) -> Option<Vec<u8>> {
        let (data_path, _) = self.paths_for(url);
        match tokio::fs::read(&data_path).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }

    pub async fn cached_size(&self, url: &str) -> u64 {
        let (data_path, _) = self.paths_for(url);
        match tokio::fs::metadata(&data_path).await {
            Ok(md) => md.len(),
            Err(_) => 0,
        }
    }

    /// Persist payload bytes and sidecar in one call.
    pub async fn write_bytes(
        &self,
        url: &str,
        bytes: &[u8],
        meta: &StoredMeta,
    ) -> std::io::Result<()> {
        let (data_path, _) = self.paths_for(url);
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&data_path, bytes).await?;
        self.save_meta(url, meta).await
    }

    /// Stream a response body into the URL's cache slot while hashing it.
    /// Updates `meta.sha256` and persists the sidecar. Returns the hex
    /// digest and the byte count.
    pub async fn stream_into(
        &self,
        url: &str,
        response: reqwest::Response,
        meta: &mut StoredMeta,
    ) -> Result<(String, u64), StreamError> {
        let (data_path, _) = self.paths_for(url);
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&data_path).await?;
        let mut hasher = Sha256::new();
        let mut nbytes: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            hasher.update(&chunk);
            nbytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        let sha256 = hex::encode(hasher.finalize());
        meta.sha256 = Some(sha256.clone());
        self.save_meta(url, meta).await?;
        Ok((sha256, nbytes))
    }

    /// Copy a cache slot into its content-addressed home. Idempotent: an
    /// existing target is returned untouched. Returns None when the cache
    /// slot itself is gone.
    pub async fn promote(
        &self,
        format: Format,
        sha256: &str,
        data_path: &Path,
    ) -> std::io::Result<Option<PathBuf>> {
        let target = self.payload_path(format, sha256);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(Some(target));
        }
        if !tokio::fs::try_exists(data_path).await.unwrap_or(false) {
            return Ok(None);
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(data_path, &target).await?;
        Ok(Some(target))
    }
}

/// SHA-256 hex digest of a byte payload.
pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
