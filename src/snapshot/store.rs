//! Content-addressed snapshot store
//!
//! Blobs live under `<cache>/blobs/sha256/<hh>/<hash>` (two-level fanout by
//! the leading hex byte), layer manifests under
//! `<cache>/layers/<layer-id>.manifest`. Once published, a blob or manifest
//! is never mutated.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::snapshot::layer::{LayerId, LayerManifest};
use crate::{Error, Result};

pub struct SnapshotStore {
    cache_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn blobs_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs").join("sha256")
    }

    fn layers_dir(&self) -> PathBuf {
        self.cache_dir.join("layers")
    }

    /// `<cache>/blobs/sha256/<hh>/<hash>`
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let fanout = hash.get(0..2).unwrap_or("00");
        self.blobs_dir().join(fanout).join(hash)
    }

    pub fn has_blob(&self, hash: &str) -> bool {
        self.blob_path(hash).exists()
    }

    /// Store file contents, returning the hex sha256. Idempotent.
    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        let hash = hex_digest(data);
        let path = self.blob_path(&hash);
        if path.exists() {
            return Ok(hash);
        }
        let dir = path.parent().unwrap();
        fs::create_dir_all(dir).map_err(|e| Error::io("mkdir", dir.display().to_string(), e))?;
        // Write-then-rename keeps concurrent builders from seeing partial
        // blobs.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| Error::io("write", tmp.display().to_string(), e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::io("rename", path.display().to_string(), e))?;
        Ok(hash)
    }

    /// Copy a stored blob to `dest`.
    pub fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        fs::read(&path).map_err(|e| Error::io("read", path.display().to_string(), e))
    }

    pub fn manifest_path(&self, id: &LayerId) -> PathBuf {
        self.layers_dir().join(format!("{}.manifest", id))
    }

    pub fn has_layer(&self, id: &LayerId) -> bool {
        self.manifest_path(id).exists()
    }

    /// Publish a manifest under its id. Idempotent; never overwrites.
    pub fn put_manifest(&self, id: &LayerId, manifest: &LayerManifest) -> Result<()> {
        let path = self.manifest_path(id);
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().unwrap();
        fs::create_dir_all(dir).map_err(|e| Error::io("mkdir", dir.display().to_string(), e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, manifest.to_bytes()?)
            .map_err(|e| Error::io("write", tmp.display().to_string(), e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::io("rename", path.display().to_string(), e))?;
        debug!(layer = %id, "manifest published");
        Ok(())
    }

    pub fn load_manifest(&self, id: &LayerId) -> Result<LayerManifest> {
        let path = self.manifest_path(id);
        let raw =
            fs::read(&path).map_err(|e| Error::io("read", path.display().to_string(), e))?;
        LayerManifest::from_bytes(&raw)
    }

    /// Directory where a materialized chain rootfs is cached.
    pub fn materialized_path(&self, top: &LayerId) -> PathBuf {
        self.cache_dir.join("rootfs").join(top.to_string())
    }
}

pub(crate) fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
