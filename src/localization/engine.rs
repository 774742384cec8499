//! The localization engine: decides, per input and per job, how a value
//! reaches the compute node, performs the eager transfers, and emits each
//! job's three-phase execution plan.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{JobInputTable, JobValue, ALIAS_VAR};
use crate::backends::{CommandTransport, FileTransport, TransportError};
use crate::storage::{self, ObjectStore, StorageError, TransferContext};

use super::common::{select_common_sources, CommonInputTable};
use super::delocalize::{DelocalizeError, OutputCollector};
use super::paths::{Environment, PathReservation, PathSide, COMMON_DIR, JOBS_DIR};
use super::plan::{JobPlanBuilder, PlanError};
use super::render::{collector_script, render_job_scripts, COLLECTOR_FILENAME};
use super::requests::{LocalizationRequest, OverrideMode, Overrides};

/// Marker file touched inside directories before a tree rides through the
/// transfer bucket, so empty directories survive the object store.
const DIR_MARKER: &str = ".musher_dir_marker";

#[derive(Debug, thiserror::Error)]
pub enum LocalizeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Delocalize(#[from] DelocalizeError),
}

pub type LocalizeResult<T> = Result<T, LocalizeError>;

/// How staged files reach the compute side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalizeMode {
    /// Stage everything under a local scratch root, then ship the whole
    /// tree to the compute staging root in one batch.
    Batched,
    /// Local and compute roots are the same shared filesystem; files are
    /// placed (or linked) directly.
    Shared,
}

#[derive(Clone, Debug)]
pub struct LocalizerOptions {
    pub mode: LocalizeMode,
    /// Compute-side staging root; a random name is chosen when unset.
    pub staging_dir: Option<PathBuf>,
    /// Relay tree transfers through this bucket instead of the filesystem
    /// transport.
    pub transfer_bucket: Option<String>,
    /// Ephemeral disk type for node-local downloads; `None` disables
    /// provisioning entirely.
    pub disk_type: Option<String>,
    /// Where node-local downloads mount on the compute node.
    pub local_download_dir: Option<PathBuf>,
    /// Concurrent jobs during input preparation.
    pub prep_concurrency: usize,
}

impl Default for LocalizerOptions {
    fn default() -> Self {
        Self {
            mode: LocalizeMode::Batched,
            staging_dir: None,
            transfer_bucket: None,
            disk_type: Some("standard".to_string()),
            local_download_dir: None,
            prep_concurrency: num_cpus::get().max(1) * 2,
        }
    }
}

/// The localization seam: one implementation is selected by configuration
/// and drives a whole pipeline's staging.
pub trait Localizer: Send + Sync {
    /// Resolve and perform all up-front transfers, write per-job scripts,
    /// and return the compute staging root, ready for job startup.
    fn localize<'a>(
        &'a self,
        jobs: &'a JobInputTable,
        patterns: &'a BTreeMap<String, String>,
        overrides: &'a Overrides,
    ) -> BoxFuture<'a, LocalizeResult<PathBuf>>;

    /// Transfer a single file or object into a reserved path.
    fn localize_file<'a>(
        &'a self,
        src: &'a str,
        dest: &'a PathReservation,
    ) -> BoxFuture<'a, LocalizeResult<()>>;
}

#[derive(Default)]
struct EngineState {
    requests: HashMap<String, BTreeMap<String, LocalizationRequest>>,
    download_bytes: HashMap<String, u64>,
}

/// Staging engine over a command transport, a file transport, and an object
/// store. All caches and per-job state live on one instance and last one
/// `localize()` call; nothing survives across engines.
pub struct StagedLocalizer {
    mode: LocalizeMode,
    env: Environment,
    // Keeps the local scratch root alive for the engine's lifetime.
    _scratch: Option<TempDir>,
    commands: Arc<dyn CommandTransport>,
    files: Arc<dyn FileTransport>,
    store: Arc<dyn ObjectStore>,
    transfer_bucket: Option<String>,
    disk_type: Option<String>,
    local_download_dir: PathBuf,
    disk_key: String,
    prep_concurrency: usize,
    state: Mutex<EngineState>,
}

impl StagedLocalizer {
    pub fn new(
        commands: Arc<dyn CommandTransport>,
        files: Arc<dyn FileTransport>,
        store: Arc<dyn ObjectStore>,
        options: LocalizerOptions,
    ) -> LocalizeResult<Self> {
        let staging_dir = files.normpath(
            &options
                .staging_dir
                .unwrap_or_else(|| PathBuf::from(Uuid::new_v4().to_string())),
        );
        let (scratch, env) = match options.mode {
            LocalizeMode::Batched => {
                let scratch = TempDir::new().map_err(TransportError::from)?;
                let env = Environment::new(scratch.path(), &staging_dir);
                (Some(scratch), env)
            }
            LocalizeMode::Shared => (None, Environment::new(&staging_dir, &staging_dir)),
        };
        let disk_key = format!("{:08x}", rand::random::<u32>());
        let local_download_dir = options
            .local_download_dir
            .unwrap_or_else(|| PathBuf::from(format!("/mnt/musher-local-downloads/{disk_key}")));
        Ok(Self {
            mode: options.mode,
            env,
            _scratch: scratch,
            commands,
            files,
            store,
            transfer_bucket: options.transfer_bucket,
            disk_type: options.disk_type,
            local_download_dir,
            disk_key,
            prep_concurrency: options.prep_concurrency.max(1),
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Collector over this engine's staging tree, for the post-execution
    /// manifest and output pass.
    pub fn collector(&self) -> OutputCollector {
        OutputCollector::new(Arc::clone(&self.files), self.env.clone())
    }

    /// Convenience delegation: collect outputs into `output_dir`,
    /// tolerating prior collections at the same destination.
    pub async fn delocalize(
        &self,
        patterns: &BTreeMap<String, String>,
        output_dir: &Path,
    ) -> LocalizeResult<crate::adapters::JobOutputs> {
        let mut collector = self.collector();
        Ok(collector.delocalize(patterns, output_dir, true).await?)
    }

    async fn localize_impl(
        &self,
        jobs: &JobInputTable,
        patterns: &BTreeMap<String, String>,
        overrides: &Overrides,
    ) -> LocalizeResult<PathBuf> {
        info!(jobs = jobs.len(), "starting localization");

        // Alias values pass through untouched unless the user says otherwise.
        let mut overrides = overrides.clone();
        let has_alias = jobs.values().any(|record| record.contains_key(ALIAS_VAR));
        if has_alias && !overrides.contains_key(ALIAS_VAR) {
            overrides.insert(ALIAS_VAR.to_string(), OverrideMode::Null);
        }

        // Phase 1: the common table is complete and immutable before any
        // job-level resolution begins.
        let common = self.pick_common_inputs(jobs, &overrides).await?;
        info!(common = common.len(), "localized common inputs");

        // Phase 2: per-job preparation, bounded fan-out. Each job writes
        // only under its own private paths.
        let mut prep_futures = Vec::with_capacity(jobs.len());
        for (job_id, values) in jobs.iter() {
            prep_futures.push(self.prepare_job_inputs(job_id, values, &common, &overrides));
        }
        stream::iter(prep_futures)
            .buffer_unordered(self.prep_concurrency)
            .try_collect::<Vec<_>>()
            .await?;

        // Phase 3: plans, scripts, and the batch hand-off.
        self.write_job_scripts(jobs, patterns).await?;
        self.finalize(jobs).await
    }

    /// Scan all jobs for repeated or forced-common sources and localize each
    /// exactly once under `common/`.
    async fn pick_common_inputs(
        &self,
        jobs: &JobInputTable,
        overrides: &Overrides,
    ) -> LocalizeResult<CommonInputTable> {
        let mut table = CommonInputTable::new();
        for source in select_common_sources(jobs, overrides) {
            if storage::is_object_url(&source) || local_path_exists(&source).await {
                let dest = self.env.reserve([COMMON_DIR, storage::basename(&source)]);
                self.localize_file_impl(&source, &dest).await?;
                table.insert(source, dest);
            }
        }
        Ok(table)
    }

    async fn prepare_job_inputs(
        &self,
        job_id: &str,
        values: &BTreeMap<String, JobValue>,
        common: &CommonInputTable,
        overrides: &Overrides,
    ) -> LocalizeResult<()> {
        debug!(job = job_id, inputs = values.len(), "preparing job inputs");
        let mut requests = BTreeMap::new();
        for (variable, value) in values {
            let request = self
                .handle_input(job_id, variable, value, common, overrides)
                .await?;
            requests.insert(variable.clone(), request);
        }
        self.state
            .lock()
            .await
            .requests
            .insert(job_id.to_string(), requests);
        Ok(())
    }

    /// Decide one input's fate. Arrays recurse element-wise; everything else
    /// resolves to exactly one request variant.
    fn handle_input<'a>(
        &'a self,
        job_id: &'a str,
        variable: &'a str,
        value: &'a JobValue,
        common: &'a CommonInputTable,
        overrides: &'a Overrides,
    ) -> BoxFuture<'a, LocalizeResult<LocalizationRequest>> {
        Box::pin(async move {
            let value = match value {
                JobValue::Array(items) => {
                    let mut requests = Vec::with_capacity(items.len());
                    for item in items {
                        requests
                            .push(self.handle_input(job_id, variable, item, common, overrides).await?);
                    }
                    return Ok(LocalizationRequest::Array(requests));
                }
                JobValue::Scalar(value) => value,
            };

            if let Some(reservation) = common.get(value) {
                return Ok(LocalizationRequest::Common {
                    reservation: reservation.clone(),
                });
            }
            let mode = overrides.get(variable).copied();
            match mode {
                // Forced common, but the value never became an actual common
                // input (not a path): pass it through.
                Some(OverrideMode::Common) => {
                    return Ok(LocalizationRequest::Literal {
                        value: value.clone(),
                    })
                }
                Some(deferred @ (OverrideMode::Stream | OverrideMode::Delayed | OverrideMode::Local)) => {
                    if storage::is_object_url(value) {
                        let user_project = self.store.user_project(value).await?;
                        return Ok(match deferred {
                            OverrideMode::Stream => LocalizationRequest::Stream {
                                url: value.clone(),
                                user_project,
                            },
                            OverrideMode::Delayed => LocalizationRequest::Delayed {
                                url: value.clone(),
                                user_project,
                            },
                            _ => {
                                let bytes = self.store.size(value).await?;
                                let mut state = self.state.lock().await;
                                *state.download_bytes.entry(job_id.to_string()).or_insert(0) +=
                                    bytes;
                                LocalizationRequest::LocalDisk {
                                    url: value.clone(),
                                    user_project,
                                }
                            }
                        });
                    }
                    warn!(
                        variable,
                        value = %value,
                        mode = %deferred,
                        "override only applies to remote objects; localizing now"
                    );
                }
                Some(OverrideMode::Null) => {
                    return Ok(LocalizationRequest::Literal {
                        value: value.clone(),
                    })
                }
                Some(OverrideMode::Localize | OverrideMode::Symlink) | None => {}
            }

            // Default: eagerly localize anything that denotes a file.
            if storage::is_object_url(value) || local_path_exists(value).await {
                let dest = self.env.reserve([
                    JOBS_DIR,
                    job_id,
                    "inputs",
                    storage::basename(value),
                ]);
                self.localize_file_impl(value, &dest).await?;
                return Ok(LocalizationRequest::Reserved { reservation: dest });
            }
            Ok(LocalizationRequest::Literal {
                value: value.clone(),
            })
        })
    }

    async fn localize_file_impl(&self, src: &str, dest: &PathReservation) -> LocalizeResult<()> {
        // Staging writes happen on the local side; in shared mode that path
        // is the compute path.
        let target = dest.side(PathSide::Local).to_path_buf();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(TransportError::from)?;
        }
        if storage::is_object_url(src) {
            debug!(src, dest = %target.display(), "downloading object");
            if self.store.is_directory(src).await? {
                let parent = target
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| target.clone());
                self.store
                    .copy_tree(src, &parent.to_string_lossy(), TransferContext::Local)
                    .await?;
            } else {
                self.store
                    .copy(src, &target.to_string_lossy(), TransferContext::Local)
                    .await?;
            }
            return Ok(());
        }

        let source = PathBuf::from(src);
        match self.mode {
            LocalizeMode::Shared => {
                // Same filesystem on both sides: link instead of copying,
                // falling back to a copy across devices.
                let absolute = tokio::fs::canonicalize(&source)
                    .await
                    .map_err(TransportError::from)?;
                debug!(src, dest = %target.display(), "linking local file");
                if symlink(&absolute, &target).await.is_err() {
                    copy_local_path(&absolute, &target).await?;
                }
            }
            LocalizeMode::Batched => {
                debug!(src, dest = %target.display(), "staging local file");
                copy_local_path(&source, &target).await?;
            }
        }
        Ok(())
    }

    async fn write_job_scripts(
        &self,
        jobs: &JobInputTable,
        patterns: &BTreeMap<String, String>,
    ) -> LocalizeResult<()> {
        let state = self.state.lock().await;
        let download_dir = self.local_download_dir.to_string_lossy();
        let builder = JobPlanBuilder::new(
            &self.env,
            patterns,
            self.disk_type.as_deref(),
            &download_dir,
            &self.disk_key,
        );
        let empty = BTreeMap::new();
        for job_id in jobs.keys() {
            let requests = state.requests.get(job_id).unwrap_or(&empty);
            let bytes = state.download_bytes.get(job_id).copied().unwrap_or(0);
            let plan = builder.build(job_id, requests, bytes)?;
            let scripts = render_job_scripts(&plan, &self.env);
            for (filename, contents) in [
                ("setup.sh", &scripts.setup),
                ("localization.sh", &scripts.localization),
                ("teardown.sh", &scripts.teardown),
            ] {
                let path = self.env.reserve([JOBS_DIR, job_id.as_str(), filename]).local;
                write_executable(&path, contents).await?;
            }
        }
        let collector_path = self.env.root(PathSide::Local).join(COLLECTOR_FILENAME);
        write_executable(&collector_path, collector_script()).await?;
        Ok(())
    }

    /// Ship the staged tree (batched mode) and build out any directories the
    /// transfer dropped, returning the compute staging root.
    async fn finalize(&self, jobs: &JobInputTable) -> LocalizeResult<PathBuf> {
        let compute_root = self.env.root(PathSide::Compute).to_path_buf();
        if self.mode == LocalizeMode::Batched {
            self.send_tree(
                &self.env.root(PathSide::Local).to_path_buf(),
                &compute_root,
                false,
            )
            .await?;
        }

        let common = self.env.common().compute;
        let jobs_dir = self.env.jobs().compute;
        let outputs = self.env.outputs().compute;
        for dir in [&common, &jobs_dir] {
            if !self.files.is_dir(dir).await? {
                self.files.makedirs(dir).await?;
            }
        }
        if !jobs.is_empty() && !self.files.is_dir(&outputs).await? {
            self.files.makedirs(&outputs).await?;
        }

        // Transports may drop permission bits in transit.
        self.files
            .chmod_executable(&compute_root.join(COLLECTOR_FILENAME))
            .await?;
        for job_id in jobs.keys() {
            for script in ["setup.sh", "localization.sh", "teardown.sh"] {
                let path = self.env.reserve([JOBS_DIR, job_id.as_str(), script]).compute;
                self.files.chmod_executable(&path).await?;
            }
        }
        info!(staging = %compute_root.display(), "staging directory finalized");
        Ok(compute_root)
    }

    /// Transfer a local tree to the compute side, optionally relayed through
    /// the transfer bucket.
    async fn send_tree(&self, src: &Path, dest: &Path, exist_okay: bool) -> LocalizeResult<()> {
        let Some(bucket) = &self.transfer_bucket else {
            self.files.send_tree(src, dest, exist_okay).await?;
            return Ok(());
        };
        if self.files.exists(dest).await? && !exist_okay {
            return Err(TransportError::AlreadyExists(dest.to_path_buf()).into());
        }
        info!(bucket = %bucket, "relaying tree through transfer bucket");
        // Object stores drop empty directories; leave a marker in each.
        touch_dir_markers(src).await?;
        let scratch = format!(
            "{}/{}",
            Uuid::new_v4(),
            dest.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "staging".to_string())
        );
        let bucket_url = storage::join_url(
            &format!("{}{}", storage::OBJECT_SCHEME, bucket.trim_end_matches('/')),
            Path::new(&scratch),
        );
        self.store
            .copy_tree(
                &src.to_string_lossy(),
                &bucket_url,
                TransferContext::Local,
            )
            .await?;
        let dest_parent = dest.parent().unwrap_or(dest);
        if !self.files.is_dir(dest_parent).await? {
            self.files.makedirs(dest_parent).await?;
        }
        self.store
            .copy_tree(
                &bucket_url,
                &dest_parent.to_string_lossy(),
                TransferContext::Remote,
            )
            .await?;
        let bucket_scratch_root = bucket_url
            .rsplit_once('/')
            .map(|(prefix, _)| prefix.to_string())
            .unwrap_or_else(|| bucket_url.clone());
        self.store
            .remove_tree(&bucket_scratch_root, TransferContext::Local)
            .await?;
        // Marker cleanup is best effort.
        let cleanup = format!("rm -f {}/*/{}", dest.to_string_lossy(), DIR_MARKER);
        if let Err(err) = self.commands.invoke(&cleanup, false).await {
            warn!(error = %err, "failed to clean up directory markers");
        }
        Ok(())
    }
}

impl Localizer for StagedLocalizer {
    fn localize<'a>(
        &'a self,
        jobs: &'a JobInputTable,
        patterns: &'a BTreeMap<String, String>,
        overrides: &'a Overrides,
    ) -> BoxFuture<'a, LocalizeResult<PathBuf>> {
        Box::pin(self.localize_impl(jobs, patterns, overrides))
    }

    fn localize_file<'a>(
        &'a self,
        src: &'a str,
        dest: &'a PathReservation,
    ) -> BoxFuture<'a, LocalizeResult<()>> {
        Box::pin(self.localize_file_impl(src, dest))
    }
}

async fn local_path_exists(value: &str) -> bool {
    tokio::fs::try_exists(value).await.unwrap_or(false)
}

async fn symlink(src: &Path, dest: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::symlink(src, dest).await
    }
    #[cfg(not(unix))]
    {
        tokio::fs::copy(src, dest).await.map(|_| ())
    }
}

async fn write_executable(path: &Path, contents: &str) -> Result<(), TransportError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

/// Copy a local file or directory tree.
async fn copy_local_path(src: &Path, dest: &Path) -> Result<(), TransportError> {
    let metadata = tokio::fs::metadata(src).await?;
    if !metadata.is_dir() {
        tokio::fs::copy(src, dest).await?;
        return Ok(());
    }
    let mut stack = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

/// Touch a marker file in every directory under `root`.
async fn touch_dir_markers(root: &Path) -> Result<(), TransportError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        tokio::fs::write(dir.join(DIR_MARKER), b"").await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_markers_reach_nested_directories() {
        let scratch = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(scratch.path().join("a/b"))
            .await
            .unwrap();
        touch_dir_markers(scratch.path()).await.unwrap();
        assert!(scratch.path().join(DIR_MARKER).exists());
        assert!(scratch.path().join("a/b").join(DIR_MARKER).exists());
    }

    #[tokio::test]
    async fn copy_local_path_handles_files_and_trees() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("f.txt");
        tokio::fs::write(&file, b"data").await.unwrap();
        let dest = scratch.path().join("copy.txt");
        copy_local_path(&file, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"data");

        let tree = scratch.path().join("tree/inner");
        tokio::fs::create_dir_all(&tree).await.unwrap();
        tokio::fs::write(tree.join("x"), b"x").await.unwrap();
        let tree_dest = scratch.path().join("tree_copy");
        copy_local_path(&scratch.path().join("tree"), &tree_dest)
            .await
            .unwrap();
        assert!(tree_dest.join("inner/x").exists());
    }
}
