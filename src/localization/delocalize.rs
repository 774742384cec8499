//! Post-execution pass: assemble the pipeline manifest from per-job
//! fragments and resolve declared output patterns into concrete file lists.

use std::collections::BTreeMap;
use std::path::Path;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapters::JobOutputs;
use crate::backends::{FileTransport, TransportError};

use super::paths::Environment;

/// Pipeline-wide manifest, fixed filename under the output root.
pub const PIPELINE_MANIFEST: &str = ".musher_pipeline_manifest.tsv";
/// Per-job fragment written by the node-side collector.
pub const JOB_MANIFEST: &str = ".musher_job_manifest";
pub const MANIFEST_HEADER: &str = "jobId\tfield\tpath";

#[derive(Debug, thiserror::Error)]
pub enum DelocalizeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed manifest row: `{row}`")]
    MalformedRow { row: String },
    #[error("invalid output pattern for '{name}': {source}")]
    Pattern {
        name: String,
        source: glob::PatternError,
    },
}

/// The authoritative `(jobId, field) -> path` table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    rows: BTreeMap<(String, String), String>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, DelocalizeError> {
        let mut rows = BTreeMap::new();
        for line in text.lines().skip(1) {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, '\t');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(job_id), Some(field), Some(path)) => {
                    rows.insert((job_id.to_string(), field.to_string()), path.to_string());
                }
                _ => {
                    return Err(DelocalizeError::MalformedRow {
                        row: line.to_string(),
                    })
                }
            }
        }
        Ok(Self { rows })
    }

    pub fn get(&self, job_id: &str, field: &str) -> Option<&str> {
        self.rows
            .get(&(job_id.to_string(), field.to_string()))
            .map(String::as_str)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&(String, String), &String)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Builds the manifest once per pipeline and resolves job outputs against
/// their declared patterns.
pub struct OutputCollector {
    transport: Arc<dyn FileTransport>,
    env: Environment,
    manifest: Option<Manifest>,
}

impl OutputCollector {
    pub fn new(transport: Arc<dyn FileTransport>, env: Environment) -> Self {
        Self {
            transport,
            env,
            manifest: None,
        }
    }

    /// The pipeline manifest, synthesized from per-job fragments on first
    /// use and cached for every later call.
    pub async fn build_manifest(&mut self) -> Result<Manifest, DelocalizeError> {
        if let Some(manifest) = &self.manifest {
            return Ok(manifest.clone());
        }
        let manifest = self.load_or_build().await?;
        self.manifest = Some(manifest.clone());
        Ok(manifest)
    }

    async fn load_or_build(&self) -> Result<Manifest, DelocalizeError> {
        let output_dir = self.transport.normpath(&self.env.outputs().compute);
        let manifest_path = output_dir.join(PIPELINE_MANIFEST);
        if !self.transport.is_file(&manifest_path).await? {
            let mut combined = String::from(MANIFEST_HEADER);
            combined.push('\n');
            let mut fragments = Vec::new();
            if self.transport.is_dir(&output_dir).await? {
                for entry in self.transport.list_dir(&output_dir).await? {
                    let fragment = output_dir.join(&entry).join(JOB_MANIFEST);
                    if self.transport.is_file(&fragment).await? {
                        let bytes = self.transport.read(&fragment).await?;
                        let text = String::from_utf8_lossy(&bytes);
                        let trimmed = text.trim_end();
                        if !trimmed.is_empty() {
                            combined.push_str(trimmed);
                            combined.push('\n');
                        }
                        fragments.push(fragment);
                    }
                }
            }
            info!(fragments = fragments.len(), "synthesizing pipeline manifest");
            self.transport
                .write(&manifest_path, combined.as_bytes())
                .await?;
            for fragment in fragments {
                if let Err(err) = self.transport.remove(&fragment).await {
                    warn!(fragment = %fragment.display(), error = %err, "failed to remove manifest fragment");
                }
            }
        }
        let bytes = self.transport.read(&manifest_path).await?;
        Manifest::parse(&String::from_utf8_lossy(&bytes))
    }

    /// Transfer the whole remote output tree to `output_dir` and resolve
    /// each job's declared outputs. Running twice against the same
    /// destination is safe when `exist_okay`; outputs with nothing present
    /// are simply absent from the result.
    pub async fn delocalize(
        &mut self,
        patterns: &BTreeMap<String, String>,
        output_dir: &Path,
        exist_okay: bool,
    ) -> Result<JobOutputs, DelocalizeError> {
        self.build_manifest().await?;
        let remote_output = self.transport.normpath(&self.env.outputs().compute);
        self.transport
            .receive_tree(&remote_output, output_dir, exist_okay)
            .await?;

        let mut outputs = JobOutputs::new();
        let mut entries = tokio::fs::read_dir(output_dir)
            .await
            .map_err(TransportError::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(TransportError::from)? {
            let job_dir = entry.path();
            if !job_dir.is_dir() {
                continue;
            }
            let job_id = entry.file_name().to_string_lossy().into_owned();
            debug!(job = %job_id, "resolving job outputs");
            let mut job_outputs = BTreeMap::new();
            for (name, pattern) in patterns {
                let field_dir = job_dir.join(name);
                if !field_dir.is_dir() {
                    continue;
                }
                let full_pattern = field_dir.join(pattern).to_string_lossy().into_owned();
                let matches = glob::glob(&full_pattern)
                    .map_err(|source| DelocalizeError::Pattern {
                        name: name.clone(),
                        source,
                    })?
                    .filter_map(Result::ok)
                    .collect::<Vec<_>>();
                if !matches.is_empty() {
                    job_outputs.insert(name.clone(), matches);
                }
            }
            for special in ["stdout", "stderr"] {
                let file = job_dir.join(special);
                if file.is_file() {
                    job_outputs.insert(special.to_string(), vec![file]);
                }
            }
            outputs.insert(job_id, job_outputs);
        }
        Ok(outputs)
    }
}
