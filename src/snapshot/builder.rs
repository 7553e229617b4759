//! Snapshot factory: chained build operations with content-addressed caching
//!
//! A [`SnapshotFactory`] replays FROM / RUN / COPY / ENV / WORKDIR / USER
//! operations, producing one layer per op keyed by
//! `sha256(parent_id ∥ op_encoding)`. When a key already exists in the
//! store the operation is short-circuited — the RUN never executes. Built
//! snapshots are [`InstanceSource`]s.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::snapshot::layer::{self, LayerId, LayerManifest};
use crate::snapshot::store::SnapshotStore;
use crate::source::{InstanceSource, RuntimeConfig};
use crate::{Error, Result};

/// One primitive build operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildOp {
    /// Base image, identified by its source identity string.
    From(String),
    /// Execute argv inside the working rootfs.
    Run(Vec<String>),
    /// Copy `src` (context-relative) to `dest` (rootfs-absolute).
    Copy { src: String, dest: String },
    Env { key: String, value: String },
    Workdir(String),
    User(String),
}

impl BuildOp {
    /// Deterministic encoding hashed into the layer key.
    fn encode(&self) -> Vec<u8> {
        postcard::to_stdvec(self).expect("op encoding cannot fail")
    }

    /// `sha256(parent_id ∥ op_encoding)`.
    pub fn layer_key(&self, parent: Option<&LayerId>) -> LayerId {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_str().as_bytes());
        }
        hasher.update(self.encode());
        let digest = hasher.finalize();
        LayerId::from_hex(
            digest
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>(),
        )
    }
}

/// Build context: the tree COPY sources resolve against.
pub enum BuildContext {
    Dir(PathBuf),
    /// In-memory files keyed by relative path.
    Memory(BTreeMap<String, Vec<u8>>),
}

impl BuildContext {
    fn read(&self, src: &str) -> Result<Vec<u8>> {
        match self {
            BuildContext::Dir(root) => {
                let path = root.join(src);
                fs::read(&path).map_err(|e| Error::io("read", path.display().to_string(), e))
            }
            BuildContext::Memory(files) => files.get(src).cloned().ok_or_else(|| {
                Error::InvalidConfig(format!("context has no file {:?}", src))
            }),
        }
    }
}

/// Runs a command inside a working rootfs. The production executor boots an
/// instance and execs over the control plane; tests substitute a host-side
/// implementation. Executions are counted so cache hits are observable.
pub trait RunExecutor {
    fn run(
        &mut self,
        rootfs: &Path,
        argv: &[String],
        env: &[(String, String)],
        workdir: &str,
        user: &str,
    ) -> Result<()>;
}

/// A finished build: layer chain plus accumulated runtime config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChain {
    /// Layer ids, base first.
    pub layers: Vec<LayerId>,
    pub config: RuntimeConfig,
    cache_dir: PathBuf,
}

impl SnapshotChain {
    pub fn top_layer(&self) -> Option<&LayerId> {
        self.layers.last()
    }

    fn store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.cache_dir)
    }
}

impl InstanceSource for SnapshotChain {
    fn rootfs(&self) -> Result<PathBuf> {
        let store = self.store();
        let top = self
            .top_layer()
            .ok_or_else(|| Error::InvalidConfig("empty snapshot chain".into()))?;
        let dest = store.materialized_path(top);
        if dest.join(".complete").exists() {
            return Ok(dest);
        }
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .map_err(|e| Error::io("rmdir", dest.display().to_string(), e))?;
        }
        fs::create_dir_all(&dest)
            .map_err(|e| Error::io("mkdir", dest.display().to_string(), e))?;
        // Replay base to top; later layers overwrite earlier paths.
        for id in &self.layers {
            let manifest = store.load_manifest(id)?;
            layer::materialize(&manifest, &store, &dest)?;
        }
        fs::write(dest.join(".complete"), b"ok")
            .map_err(|e| Error::io("write", dest.display().to_string(), e))?;
        Ok(dest)
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(self.config.clone())
    }

    fn identity(&self) -> String {
        self.top_layer()
            .map(|id| format!("snapshot:{}", id))
            .unwrap_or_else(|| "snapshot:empty".into())
    }
}

/// Chains build operations into cached layers.
pub struct SnapshotFactory<'a> {
    store: SnapshotStore,
    executor: &'a mut dyn RunExecutor,
    context: BuildContext,
    /// Paths never captured into layers.
    exclude: Vec<String>,
}

impl<'a> SnapshotFactory<'a> {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        executor: &'a mut dyn RunExecutor,
        context: BuildContext,
    ) -> Self {
        Self {
            store: SnapshotStore::new(cache_dir.into()),
            executor,
            context,
            exclude: vec![
                "proc/**".into(),
                "sys/**".into(),
                "dev/**".into(),
                "tmp/**".into(),
            ],
        }
    }

    pub fn exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    /// Execute the operation list. `base` provides the FROM rootfs and the
    /// starting runtime config.
    pub fn build(&mut self, base: &dyn InstanceSource, ops: &[BuildOp]) -> Result<SnapshotChain> {
        let mut config = base.runtime_config()?;
        let mut layers: Vec<LayerId> = Vec::new();
        let mut parent: Option<LayerId> = None;

        // Working rootfs, seeded lazily on the first cache miss.
        let work = tempfile::Builder::new()
            .prefix("cradle-build-")
            .tempdir()
            .map_err(|e| Error::io("mkdtemp", "build".to_string(), e))?;
        let mut work_seeded = false;
        let mut parent_manifest = LayerManifest::default();

        for op_entry in ops {
            let key = op_entry.layer_key(parent.as_ref());

            // Config-only ops always fold into the runtime config.
            apply_config_op(op_entry, &mut config);

            if self.store.has_layer(&key) {
                info!(op = ?op_entry, layer = %key, "cache hit; skipping");
                layers.push(key.clone());
                parent = Some(key);
                work_seeded = false; // the on-disk tree is now stale
                continue;
            }

            // Cache miss: make sure the working tree reflects the chain so
            // far, then apply the operation for real. With no layers built
            // yet the tree is the bare base and the parent manifest is
            // empty, so the FROM layer captures the entire base tree.
            if !work_seeded {
                reset_dir(work.path())?;
                seed_work_tree(work.path(), base, &layers, &self.store)?;
                parent_manifest = if layers.is_empty() {
                    LayerManifest::default()
                } else {
                    layer::capture_tree(work.path(), &self.store, &self.exclude)?
                };
                work_seeded = true;
            }

            match op_entry {
                BuildOp::From(_) | BuildOp::Env { .. } | BuildOp::Workdir(_)
                | BuildOp::User(_) => {}
                BuildOp::Run(argv) => {
                    debug!(argv = ?argv, "executing RUN");
                    self.executor.run(
                        work.path(),
                        argv,
                        &config.env_pairs(),
                        &config.working_dir,
                        &config.user,
                    )?;
                }
                BuildOp::Copy { src, dest } => {
                    let data = self.context.read(src)?;
                    let rel = dest.trim_start_matches('/');
                    let target = work.path().join(rel);
                    if let Some(dir) = target.parent() {
                        fs::create_dir_all(dir)
                            .map_err(|e| Error::io("mkdir", dir.display().to_string(), e))?;
                    }
                    fs::write(&target, data)
                        .map_err(|e| Error::io("write", target.display().to_string(), e))?;
                }
            }

            // Capture the delta as this op's layer under its key.
            let current = layer::capture_tree(work.path(), &self.store, &self.exclude)?;
            let delta = layer::diff_manifest(&parent_manifest, &current);
            self.store.put_manifest(&key, &delta)?;
            parent_manifest = current;
            layers.push(key.clone());
            parent = Some(key);
        }

        Ok(SnapshotChain {
            layers,
            config,
            cache_dir: self.store.cache_dir().to_path_buf(),
        })
    }
}

fn apply_config_op(op_entry: &BuildOp, config: &mut RuntimeConfig) {
    match op_entry {
        BuildOp::Env { key, value } => {
            config.env.retain(|e| !e.starts_with(&format!("{}=", key)));
            config.env.push(format!("{}={}", key, value));
        }
        BuildOp::Workdir(dir) => config.working_dir = dir.clone(),
        BuildOp::User(user) => config.user = user.clone(),
        _ => {}
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    for entry in
        fs::read_dir(dir).map_err(|e| Error::io("readdir", dir.display().to_string(), e))?
    {
        let entry = entry.map_err(|e| Error::io("readdir", dir.display().to_string(), e))?;
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path)
                .map_err(|e| Error::io("rmdir", path.display().to_string(), e))?;
        } else {
            fs::remove_file(&path)
                .map_err(|e| Error::io("unlink", path.display().to_string(), e))?;
        }
    }
    Ok(())
}

/// Rebuild the working tree for the chain so far. Before any layer exists
/// the tree is the bare base; afterwards the layers alone reproduce it (the
/// FROM layer carries the full base tree).
fn seed_work_tree(
    work: &Path,
    base: &dyn InstanceSource,
    layers: &[LayerId],
    store: &SnapshotStore,
) -> Result<()> {
    if layers.is_empty() {
        let base_root = base.rootfs()?;
        copy_tree(&base_root, work)?;
        return Ok(());
    }
    for id in layers {
        let manifest = store.load_manifest(id)?;
        layer::materialize(&manifest, store, work)?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in
        fs::read_dir(src).map_err(|e| Error::io("readdir", src.display().to_string(), e))?
    {
        let entry = entry.map_err(|e| Error::io("readdir", src.display().to_string(), e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::io("stat", from.display().to_string(), e))?;
        if file_type.is_dir() {
            fs::create_dir_all(&to)
                .map_err(|e| Error::io("mkdir", to.display().to_string(), e))?;
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)
                .map_err(|e| Error::io("readlink", from.display().to_string(), e))?;
            std::os::unix::fs::symlink(&target, &to)
                .map_err(|e| Error::io("symlink", to.display().to_string(), e))?;
        } else {
            fs::copy(&from, &to)
                .map_err(|e| Error::io("copy", to.display().to_string(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DirSource;

    /// Host-side executor that appends a marker file and counts runs.
    struct CountingExecutor {
        runs: usize,
    }

    impl RunExecutor for CountingExecutor {
        fn run(
            &mut self,
            rootfs: &Path,
            argv: &[String],
            _env: &[(String, String)],
            _workdir: &str,
            _user: &str,
        ) -> Result<()> {
            self.runs += 1;
            fs::write(rootfs.join("ran.txt"), argv.join(" ")).unwrap();
            Ok(())
        }
    }

    fn base_source() -> (tempfile::TempDir, DirSource) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/sh"), "#!busybox").unwrap();
        let source = DirSource::new(dir.path());
        (dir, source)
    }

    fn ops() -> Vec<BuildOp> {
        vec![
            BuildOp::From("alpine".into()),
            BuildOp::Env {
                key: "LANG".into(),
                value: "C.UTF-8".into(),
            },
            BuildOp::Run(vec!["apk".into(), "add".into(), "gcc".into()]),
        ]
    }

    #[test]
    fn layer_keys_are_deterministic_and_diverge_per_op() {
        let run = BuildOp::Run(vec!["apk".into(), "add".into(), "gcc".into()]);
        let parent = LayerId::from_hex("11".repeat(32));
        assert_eq!(run.layer_key(Some(&parent)), run.layer_key(Some(&parent)));

        let other = BuildOp::Run(vec!["apk".into(), "add".into(), "make".into()]);
        assert_ne!(run.layer_key(Some(&parent)), other.layer_key(Some(&parent)));
        assert_ne!(run.layer_key(None), run.layer_key(Some(&parent)));
    }

    #[test]
    fn build_produces_chain_and_config() {
        let (_base_dir, base) = base_source();
        let cache = tempfile::tempdir().unwrap();
        let mut executor = CountingExecutor { runs: 0 };
        let mut factory = SnapshotFactory::new(
            cache.path(),
            &mut executor,
            BuildContext::Memory(BTreeMap::new()),
        );

        let chain = factory.build(&base, &ops()).unwrap();
        assert_eq!(chain.layers.len(), 3);
        assert!(chain.config.env.contains(&"LANG=C.UTF-8".to_string()));
        assert_eq!(executor.runs, 1);
    }

    #[test]
    fn identical_build_hits_cache_and_skips_run() {
        let (_base_dir, base) = base_source();
        let cache = tempfile::tempdir().unwrap();

        let mut first = CountingExecutor { runs: 0 };
        let chain_a = SnapshotFactory::new(
            cache.path(),
            &mut first,
            BuildContext::Memory(BTreeMap::new()),
        )
        .build(&base, &ops())
        .unwrap();
        assert_eq!(first.runs, 1);

        let mut second = CountingExecutor { runs: 0 };
        let chain_b = SnapshotFactory::new(
            cache.path(),
            &mut second,
            BuildContext::Memory(BTreeMap::new()),
        )
        .build(&base, &ops())
        .unwrap();

        // Same top layer id, zero executions the second time.
        assert_eq!(chain_a.top_layer(), chain_b.top_layer());
        assert_eq!(second.runs, 0);
    }

    #[test]
    fn changed_op_diverges_from_cache() {
        let (_base_dir, base) = base_source();
        let cache = tempfile::tempdir().unwrap();

        let mut executor = CountingExecutor { runs: 0 };
        let chain_a = SnapshotFactory::new(
            cache.path(),
            &mut executor,
            BuildContext::Memory(BTreeMap::new()),
        )
        .build(&base, &ops())
        .unwrap();

        let mut changed = ops();
        changed[2] = BuildOp::Run(vec!["apk".into(), "add".into(), "clang".into()]);
        let mut executor2 = CountingExecutor { runs: 0 };
        let chain_b = SnapshotFactory::new(
            cache.path(),
            &mut executor2,
            BuildContext::Memory(BTreeMap::new()),
        )
        .build(&base, &changed)
        .unwrap();

        assert_ne!(chain_a.top_layer(), chain_b.top_layer());
        assert_eq!(executor2.runs, 1);
    }

    #[test]
    fn copy_op_reads_context() {
        let (_base_dir, base) = base_source();
        let cache = tempfile::tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("app.conf".to_string(), b"port=8080".to_vec());

        let mut executor = CountingExecutor { runs: 0 };
        let mut factory =
            SnapshotFactory::new(cache.path(), &mut executor, BuildContext::Memory(files));
        let chain = factory
            .build(
                &base,
                &[
                    BuildOp::From("alpine".into()),
                    BuildOp::Copy {
                        src: "app.conf".into(),
                        dest: "/etc/app.conf".into(),
                    },
                ],
            )
            .unwrap();

        // Materialized chain contains the copied file.
        let rootfs = chain.rootfs().unwrap();
        assert_eq!(fs::read(rootfs.join("etc/app.conf")).unwrap(), b"port=8080");
    }

    #[test]
    fn chain_is_an_instance_source() {
        let (_base_dir, base) = base_source();
        let cache = tempfile::tempdir().unwrap();
        let mut executor = CountingExecutor { runs: 0 };
        let chain = SnapshotFactory::new(
            cache.path(),
            &mut executor,
            BuildContext::Memory(BTreeMap::new()),
        )
        .build(&base, &ops())
        .unwrap();

        let rootfs = chain.rootfs().unwrap();
        assert!(rootfs.join("ran.txt").exists());
        assert!(chain.identity().starts_with("snapshot:"));
        // Second materialization reuses the completed tree.
        assert_eq!(chain.rootfs().unwrap(), rootfs);
    }
}
