//! Snapshot engine end-to-end: layer identity, Dockerfile cache behavior,
//! and re-materialized chains as instance sources.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use cradle::snapshot::{
    parse_dockerfile, BuildContext, BuildOp, RunExecutor, SnapshotFactory, SnapshotStore,
};
use cradle::source::{DirSource, InstanceSource};

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
    ) -> cradle::Result<()> {
        self.runs += 1;
        // Deterministic effect so repeated builds hash identically.
        fs::write(rootfs.join("build-log"), argv.join(" ")).unwrap();
        Ok(())
    }
}

fn alpine_like_base(dir: &Path) -> DirSource {
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("bin/sh"), "#!busybox\n").unwrap();
    fs::create_dir_all(dir.join("etc")).unwrap();
    fs::write(dir.join("etc/os-release"), "ID=alpine\n").unwrap();
    DirSource::new(dir)
}

const DOCKERFILE: &str = "\
FROM alpine
ENV LANG=C.UTF-8
WORKDIR /src
RUN apk add gcc
";

#[test]
fn dockerfile_build_twice_hits_cache_with_equal_top_layer() {
    let base_dir = tempfile::tempdir().unwrap();
    let base = alpine_like_base(base_dir.path());
    let cache = tempfile::tempdir().unwrap();
    let ops = parse_dockerfile(DOCKERFILE, &HashMap::new()).unwrap();

    let mut first = CountingExecutor { runs: 0 };
    let chain_a = SnapshotFactory::new(
        cache.path(),
        &mut first,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &ops)
    .unwrap();
    assert_eq!(first.runs, 1, "cold build executes the RUN");

    let mut second = CountingExecutor { runs: 0 };
    let chain_b = SnapshotFactory::new(
        cache.path(),
        &mut second,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &ops)
    .unwrap();

    assert_eq!(
        chain_a.top_layer(),
        chain_b.top_layer(),
        "identical inputs produce identical layer ids"
    );
    assert_eq!(second.runs, 0, "warm build executes zero RUN ops");
}

#[test]
fn changed_run_line_diverges_only_from_that_op() {
    let base_dir = tempfile::tempdir().unwrap();
    let base = alpine_like_base(base_dir.path());
    let cache = tempfile::tempdir().unwrap();

    let ops_a = parse_dockerfile(DOCKERFILE, &HashMap::new()).unwrap();
    let ops_b = parse_dockerfile(
        &DOCKERFILE.replace("apk add gcc", "apk add clang"),
        &HashMap::new(),
    )
    .unwrap();

    let mut executor = CountingExecutor { runs: 0 };
    let chain_a = SnapshotFactory::new(
        cache.path(),
        &mut executor,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &ops_a)
    .unwrap();
    let chain_b = SnapshotFactory::new(
        cache.path(),
        &mut executor,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &ops_b)
    .unwrap();

    // Shared prefix (FROM, ENV, WORKDIR), divergent top.
    assert_eq!(chain_a.layers[0], chain_b.layers[0]);
    assert_eq!(chain_a.layers[1], chain_b.layers[1]);
    assert_eq!(chain_a.layers[2], chain_b.layers[2]);
    assert_ne!(chain_a.top_layer(), chain_b.top_layer());
    // One RUN executed per distinct build.
    assert_eq!(executor.runs, 2);
}

#[test]
fn build_args_feed_layer_identity() {
    let base_dir = tempfile::tempdir().unwrap();
    let base = alpine_like_base(base_dir.path());
    let cache = tempfile::tempdir().unwrap();
    let dockerfile = "FROM alpine\nARG PKG=gcc\nRUN apk add $PKG\n";

    let mut executor = CountingExecutor { runs: 0 };
    let default_ops = parse_dockerfile(dockerfile, &HashMap::new()).unwrap();
    let mut overridden_args = HashMap::new();
    overridden_args.insert("PKG".to_string(), "clang".to_string());
    let overridden_ops = parse_dockerfile(dockerfile, &overridden_args).unwrap();

    let chain_default = SnapshotFactory::new(
        cache.path(),
        &mut executor,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &default_ops)
    .unwrap();
    let chain_overridden = SnapshotFactory::new(
        cache.path(),
        &mut executor,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &overridden_ops)
    .unwrap();

    assert_ne!(chain_default.top_layer(), chain_overridden.top_layer());
}

#[test]
fn built_chain_materializes_base_and_build_outputs() {
    let base_dir = tempfile::tempdir().unwrap();
    let base = alpine_like_base(base_dir.path());
    let cache = tempfile::tempdir().unwrap();

    let mut context_files = std::collections::BTreeMap::new();
    context_files.insert("app.conf".to_string(), b"port=8080".to_vec());

    let mut executor = CountingExecutor { runs: 0 };
    let ops = vec![
        BuildOp::From("alpine".into()),
        BuildOp::Copy {
            src: "app.conf".into(),
            dest: "/etc/app.conf".into(),
        },
        BuildOp::Run(vec!["true".into()]),
    ];
    let chain = SnapshotFactory::new(
        cache.path(),
        &mut executor,
        BuildContext::Memory(context_files),
    )
    .build(&base, &ops)
    .unwrap();

    let rootfs = chain.rootfs().unwrap();
    // Base content survives the chain.
    assert_eq!(
        fs::read_to_string(rootfs.join("etc/os-release")).unwrap(),
        "ID=alpine\n"
    );
    // COPY and RUN outputs present.
    assert_eq!(fs::read(rootfs.join("etc/app.conf")).unwrap(), b"port=8080");
    assert!(rootfs.join("build-log").exists());

    // The chain is a full instance source.
    let runtime = chain.runtime_config().unwrap();
    assert!(runtime.entrypoint.is_empty());
    assert!(chain.identity().starts_with("snapshot:"));
}

#[test]
fn blobs_are_shared_across_layers() {
    let base_dir = tempfile::tempdir().unwrap();
    let base = alpine_like_base(base_dir.path());
    let cache = tempfile::tempdir().unwrap();

    let mut executor = CountingExecutor { runs: 0 };
    let ops = vec![
        BuildOp::From("alpine".into()),
        BuildOp::Run(vec!["true".into()]),
    ];
    SnapshotFactory::new(
        cache.path(),
        &mut executor,
        BuildContext::Memory(Default::default()),
    )
    .build(&base, &ops)
    .unwrap();

    // The os-release blob exists exactly once in the store.
    let store = SnapshotStore::new(cache.path());
    let mut hasher_input = fs::read(base_dir.path().join("etc/os-release")).unwrap();
    let hash = {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(&hasher_input);
        digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    };
    assert!(store.has_blob(&hash));
    hasher_input.clear();
}
