//! Layer manifests and filesystem walks
//!
//! A manifest maps relative paths to (mode, owner, mtime, content hash,
//! symlink target, xattrs). Serialization is deterministic JSON (sorted
//! map), so identical trees always produce identical manifest bytes and
//! therefore identical layer ids.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::snapshot::glob_match;
use crate::snapshot::store::SnapshotStore;
use crate::{Error, Result};

/// Hex sha256 identifying a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_unix: i64,
    /// Content hash for regular files; None for directories and symlinks.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symlink: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub xattrs: BTreeMap<String, String>,
}

impl LayerEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }
}

/// Sorted path → entry map. Deterministic by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerManifest {
    entries: BTreeMap<String, LayerEntry>,
}

impl LayerManifest {
    pub fn insert(&mut self, path: String, entry: LayerEntry) {
        self.entries.insert(path, entry);
    }

    pub fn get(&self, path: &str) -> Option<&LayerEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LayerEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic manifest bytes (sorted-key JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            entries: serde_json::from_slice(raw)?,
        })
    }

    /// Layer identity: `sha256(parent_id ∥ manifest_bytes)`.
    pub fn layer_id(&self, parent: Option<&LayerId>) -> LayerId {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_str().as_bytes());
        }
        hasher.update(self.to_bytes().expect("manifest encoding cannot fail"));
        let digest = hasher.finalize();
        LayerId(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// Walk `root`, skipping paths matched by `exclude` globs, hashing every
/// regular file into `store`, and return the manifest.
pub fn capture_tree(
    root: &Path,
    store: &SnapshotStore,
    exclude: &[String],
) -> Result<LayerManifest> {
    let mut manifest = LayerManifest::default();
    walk(root, root, store, exclude, &mut manifest)?;
    Ok(manifest)
}

fn walk(
    root: &Path,
    dir: &Path,
    store: &SnapshotStore,
    exclude: &[String],
    manifest: &mut LayerManifest,
) -> Result<()> {
    let entries =
        fs::read_dir(dir).map_err(|e| Error::io("readdir", dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("readdir", dir.display().to_string(), e))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|_| Error::InvalidConfig("walk escaped root".into()))?
            .to_string_lossy()
            .replace('\\', "/");

        if exclude.iter().any(|pattern| glob_match(pattern, &rel)) {
            trace!(path = %rel, "excluded from snapshot");
            continue;
        }

        let meta = fs::symlink_metadata(&path)
            .map_err(|e| Error::io("stat", path.display().to_string(), e))?;
        let file_type = meta.file_type();

        let layer_entry = if file_type.is_symlink() {
            let target = fs::read_link(&path)
                .map_err(|e| Error::io("readlink", path.display().to_string(), e))?;
            LayerEntry {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_unix: meta.mtime(),
                hash: None,
                symlink: Some(target.to_string_lossy().into_owned()),
                xattrs: BTreeMap::new(),
            }
        } else if file_type.is_dir() {
            LayerEntry {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_unix: meta.mtime(),
                hash: None,
                symlink: None,
                xattrs: BTreeMap::new(),
            }
        } else if file_type.is_file() {
            let data = fs::read(&path)
                .map_err(|e| Error::io("read", path.display().to_string(), e))?;
            let hash = store.put_blob(&data)?;
            LayerEntry {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_unix: meta.mtime(),
                hash: Some(hash),
                symlink: None,
                xattrs: BTreeMap::new(),
            }
        } else {
            // Sockets, fifos, device nodes: carried as metadata only.
            LayerEntry {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_unix: meta.mtime(),
                hash: None,
                symlink: None,
                xattrs: BTreeMap::new(),
            }
        };

        manifest.insert(rel, layer_entry);
        if file_type.is_dir() {
            walk(root, &path, store, exclude, manifest)?;
        }
    }
    Ok(())
}

/// The delta between a parent manifest and a newly captured tree: entries
/// that are new or changed. (Deletions are not tracked; a chain replays
/// bottom-up and later layers win.)
pub fn diff_manifest(parent: &LayerManifest, current: &LayerManifest) -> LayerManifest {
    let mut delta = LayerManifest::default();
    for (path, entry) in current.iter() {
        if parent.get(path) != Some(entry) {
            delta.insert(path.clone(), entry.clone());
        }
    }
    delta
}

/// Materialize a manifest into `dest`, pulling blobs from the store.
pub fn materialize(manifest: &LayerManifest, store: &SnapshotStore, dest: &Path) -> Result<()> {
    for (rel, entry) in manifest.iter() {
        let path = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&path)
                .map_err(|e| Error::io("mkdir", path.display().to_string(), e))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode & 0o7777))
                .map_err(|e| Error::io("chmod", path.display().to_string(), e))?;
        } else if let Some(target) = &entry.symlink {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io("mkdir", parent.display().to_string(), e))?;
            }
            if path.symlink_metadata().is_ok() {
                fs::remove_file(&path)
                    .map_err(|e| Error::io("unlink", path.display().to_string(), e))?;
            }
            std::os::unix::fs::symlink(target, &path)
                .map_err(|e| Error::io("symlink", path.display().to_string(), e))?;
        } else if let Some(hash) = &entry.hash {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io("mkdir", parent.display().to_string(), e))?;
            }
            let data = store.read_blob(hash)?;
            fs::write(&path, data)
                .map_err(|e| Error::io("write", path.display().to_string(), e))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode & 0o7777))
                .map_err(|e| Error::io("chmod", path.display().to_string(), e))?;
        }
    }
    Ok(())
}
