//! Instance sources: where a VM's root filesystem comes from
//!
//! An [`InstanceSource`] yields a readable root filesystem tree plus the
//! runtime configuration distilled from the image metadata. Registry fetch
//! and tar extraction live outside this crate; an OCI image arrives here as
//! an already-unpacked directory and a config JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Runtime configuration an image carries, mirroring the OCI config fields
/// the VMM consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl RuntimeConfig {
    /// The argv a default run executes: entrypoint followed by cmd.
    pub fn full_command(&self) -> Vec<String> {
        let mut argv = self.entrypoint.clone();
        argv.extend(self.cmd.iter().cloned());
        argv
    }

    /// Env entries parsed into (key, value) pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}

/// Shape of the OCI image config JSON we consume (`.config` holds the
/// runtime fields).
#[derive(Debug, Clone, Default, Deserialize)]
struct OciImageConfig {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    config: OciRuntimeSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OciRuntimeSection {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "WorkingDir", default)]
    working_dir: String,
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default)]
    cmd: Vec<String>,
    #[serde(rename = "User", default)]
    user: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

/// Abstract producer of (rootfs tree, runtime config). A pulled OCI
/// extract, a plain directory, and a built snapshot chain all implement
/// this shape.
pub trait InstanceSource: Send + Sync {
    /// Directory holding the root filesystem tree.
    fn rootfs(&self) -> Result<PathBuf>;

    /// Image runtime configuration.
    fn runtime_config(&self) -> Result<RuntimeConfig>;

    /// Stable identity for cache keys (content digest or path fingerprint).
    fn identity(&self) -> String;
}

/// An externally-unpacked OCI image: rootfs dir + config JSON.
pub struct OciExtractSource {
    rootfs: PathBuf,
    config: RuntimeConfig,
    identity: String,
}

impl OciExtractSource {
    /// `extract_dir` is the unpacked image: `rootfs/` plus `config.json`.
    pub fn open(extract_dir: &Path) -> Result<Self> {
        let rootfs = extract_dir.join("rootfs");
        if !rootfs.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "no rootfs directory under {}",
                extract_dir.display()
            )));
        }
        let config_path = extract_dir.join("config.json");
        let config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .map_err(|e| Error::io("read", config_path.display().to_string(), e))?;
            let parsed: OciImageConfig = serde_json::from_str(&raw)?;
            RuntimeConfig {
                architecture: parsed.architecture,
                os: parsed.os,
                env: parsed.config.env,
                working_dir: parsed.config.working_dir,
                entrypoint: parsed.config.entrypoint,
                cmd: parsed.config.cmd,
                user: parsed.config.user,
                labels: parsed.config.labels,
            }
        } else {
            debug!("no config.json; using empty runtime config");
            RuntimeConfig::default()
        };

        Ok(Self {
            identity: format!("oci:{}", extract_dir.display()),
            rootfs,
            config,
        })
    }
}

impl InstanceSource for OciExtractSource {
    fn rootfs(&self) -> Result<PathBuf> {
        Ok(self.rootfs.clone())
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(self.config.clone())
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

/// A prebaked directory used as the root filesystem directly.
pub struct DirSource {
    root: PathBuf,
    config: RuntimeConfig,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }
}

impl InstanceSource for DirSource {
    fn rootfs(&self) -> Result<PathBuf> {
        if !self.root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "rootfs directory missing: {}",
                self.root.display()
            )));
        }
        Ok(self.root.clone())
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(self.config.clone())
    }

    fn identity(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}
