//! End-to-end localization against a local filesystem and an in-memory
//! object store: expand inputs, localize, inspect the staged tree, then
//! collect outputs back through the manifest.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use musher::adapters::{InputAdapter, ManualAdapter};
use musher::backends::LocalTransport;
use musher::localization::{
    parse_overrides, LocalizeMode, Localizer, LocalizerOptions, StagedLocalizer,
    COLLECTOR_FILENAME, PIPELINE_MANIFEST,
};
use musher::test_support::MemoryObjectStore;

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
}

fn engine(staging: &Path, store: Arc<MemoryObjectStore>) -> StagedLocalizer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let transport = Arc::new(LocalTransport::new());
    StagedLocalizer::new(
        transport.clone(),
        transport,
        store,
        LocalizerOptions {
            mode: LocalizeMode::Batched,
            staging_dir: Some(staging.to_path_buf()),
            transfer_bucket: None,
            disk_type: Some("standard".to_string()),
            local_download_dir: None,
            prep_concurrency: 4,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn localize_stages_inputs_and_renders_scripts() {
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");

    // A real local file referenced by both jobs becomes a common input.
    let shared = scratch.path().join("reference.fa");
    std::fs::write(&shared, b"ACGT").unwrap();

    let store = Arc::new(MemoryObjectStore::new());
    store.put_object("gs://bucket/annotations.db", b"annotations");
    store.put_object("gs://bucket/reads.bam", b"reads");

    let mut adapter = ManualAdapter::new();
    let jobs = adapter
        .parse_inputs(
            [
                ("sample".to_string(), json!(["s1", "s2"])),
                (
                    "reference".to_string(),
                    json!(shared.to_string_lossy().into_owned()),
                ),
                ("annotations".to_string(), json!("gs://bucket/annotations.db")),
                ("reads".to_string(), json!("gs://bucket/reads.bam")),
                ("threads".to_string(), json!(8)),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();
    assert_eq!(jobs.len(), 2);

    let overrides = parse_overrides([("annotations", "delayed"), ("reads", "stream")]);
    let mut patterns = BTreeMap::new();
    patterns.insert("result".to_string(), "*.txt".to_string());

    let engine = engine(&staging, store);
    let staging_root = engine.localize(&jobs, &patterns, &overrides).await.unwrap();
    assert_eq!(staging_root, staging);

    // The common input was localized exactly once, under common/.
    assert_eq!(read(&staging.join("common/reference.fa")), "ACGT");

    // Each job carries rendered three-phase scripts plus the collector.
    for job in ["0", "1"] {
        let setup = read(&staging.join("jobs").join(job).join("setup.sh"));
        assert!(setup.starts_with("#!/bin/bash\n"));
        assert!(setup.contains(&format!(
            "export reference={}",
            staging.join("common/reference.fa").display()
        )));
        assert!(setup.contains("export threads=8"));
        assert!(setup.contains("export reads=$MUSHER_STREAM_DIR/reads.bam"));
        assert!(setup.contains(&format!(
            "export annotations={}",
            staging
                .join("jobs")
                .join(job)
                .join("inputs/annotations.db")
                .display()
        )));

        let localization = read(&staging.join("jobs").join(job).join("localization.sh"));
        assert!(localization.contains("set -e"));
        assert!(localization.contains("gsutil ls gs://bucket/reads.bam > /dev/null"));
        assert!(localization.contains("mkfifo $MUSHER_STREAM_DIR/reads.bam"));
        assert!(localization.contains("cp gs://bucket/annotations.db"));

        let teardown = read(&staging.join("jobs").join(job).join("teardown.sh"));
        assert!(teardown.contains(&format!("{COLLECTOR_FILENAME} ")));
        assert!(teardown.contains("-p result '*.txt'"));
    }
    assert!(staging.join(COLLECTOR_FILENAME).exists());

    // The per-job sample values differ.
    let setup0 = read(&staging.join("jobs/0/setup.sh"));
    let setup1 = read(&staging.join("jobs/1/setup.sh"));
    assert!(setup0.contains("export sample=s1"));
    assert!(setup1.contains("export sample=s2"));

    // Delayed objects were not transferred up front.
    assert!(!staging.join("jobs/0/inputs/annotations.db").exists());

    // The canonical tree exists on the compute side.
    for dir in ["common", "jobs", "outputs"] {
        assert!(staging.join(dir).is_dir(), "missing {dir}/");
    }
}

#[tokio::test]
async fn outputs_flow_back_through_the_manifest() {
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");
    let store = Arc::new(MemoryObjectStore::new());

    let mut adapter = ManualAdapter::new();
    let jobs = adapter
        .parse_inputs([("x".to_string(), json!([1, 2]))].into_iter().collect())
        .unwrap();

    let patterns: BTreeMap<String, String> =
        [("result".to_string(), "*.txt".to_string())].into_iter().collect();
    let engine = engine(&staging, store);
    engine
        .localize(&jobs, &patterns, &BTreeMap::new())
        .await
        .unwrap();

    // Simulate what the node-side collector leaves behind.
    for job in ["0", "1"] {
        let job_dir = staging.join("outputs").join(job);
        std::fs::create_dir_all(job_dir.join("result")).unwrap();
        std::fs::write(job_dir.join("result").join(format!("{job}.txt")), job).unwrap();
        std::fs::write(job_dir.join("stdout"), "done\n").unwrap();
        std::fs::write(
            job_dir.join(".musher_job_manifest"),
            format!("{job}\tresult\t{job}/result/{job}.txt\n"),
        )
        .unwrap();
    }

    let dest = scratch.path().join("collected");
    let first = engine.delocalize(&patterns, &dest).await.unwrap();
    let second = engine.delocalize(&patterns, &dest).await.unwrap();
    assert_eq!(first, second);

    assert!(staging.join("outputs").join(PIPELINE_MANIFEST).exists());
    let mut collector = engine.collector();
    let manifest = collector.build_manifest().await.unwrap();
    assert_eq!(manifest.get("0", "result"), Some("0/result/0.txt"));
    assert_eq!(manifest.get("1", "result"), Some("1/result/1.txt"));

    for job in ["0", "1"] {
        let outputs = &first[job];
        assert_eq!(outputs["result"].len(), 1);
        assert_eq!(outputs["stdout"].len(), 1);
    }
}

#[tokio::test]
async fn node_local_downloads_provision_a_disk() {
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");
    let store = Arc::new(MemoryObjectStore::new());
    for i in 0..30 {
        store.put_object(
            &format!("gs://bucket/huge/{i:02}.part"),
            &vec![0u8; 1 << 20],
        );
    }

    let mut adapter = ManualAdapter::new();
    let jobs = adapter
        .parse_inputs(
            [("payload".to_string(), json!("gs://bucket/huge"))]
                .into_iter()
                .collect(),
        )
        .unwrap();
    let overrides = parse_overrides([("payload", "local")]);

    let engine = engine(&staging, store);
    engine
        .localize(&jobs, &BTreeMap::new(), &overrides)
        .await
        .unwrap();

    let setup = read(&staging.join("jobs/0/setup.sh"));
    assert!(setup.contains("export MUSHER_LOCAL_DISK_SIZE=10GB"));
    assert!(setup.contains("export MUSHER_LOCAL_DISK_TYPE=standard"));
    assert!(setup.contains("export payload=$MUSHER_LOCAL_DISK_DIR/huge"));

    let localization = read(&staging.join("jobs/0/localization.sh"));
    assert!(localization.contains("gcloud compute disks create"));
    let teardown = read(&staging.join("jobs/0/teardown.sh"));
    assert!(teardown.contains("gcloud compute disks delete"));
}
