//! Per-job execution plans: ordered, typed setup/localize/teardown actions
//! assembled from resolved localization requests. Rendering to the target
//! execution format lives in `render`; nothing here touches I/O.

use std::collections::BTreeMap;

use crate::storage;

use super::paths::{Environment, JOBS_DIR};
use super::requests::LocalizationRequest;

pub const JOB_VARS_VAR: &str = "MUSHER_JOB_VARS";
pub const JOB_INPUTS_VAR: &str = "MUSHER_JOB_INPUTS";
pub const JOB_ROOT_VAR: &str = "MUSHER_JOB_ROOT";
pub const JOB_SETUP_VAR: &str = "MUSHER_JOB_SETUP";
pub const JOB_TEARDOWN_VAR: &str = "MUSHER_JOB_TEARDOWN";
pub const CONTAINER_ARGS_VAR: &str = "MUSHER_CONTAINER_ARGS";
pub const STREAM_DIR_VAR: &str = "MUSHER_STREAM_DIR";
pub const LOCAL_DISK_DIR_VAR: &str = "MUSHER_LOCAL_DISK_DIR";
pub const LOCAL_DISK_SIZE_VAR: &str = "MUSHER_LOCAL_DISK_SIZE";
pub const LOCAL_DISK_TYPE_VAR: &str = "MUSHER_LOCAL_DISK_TYPE";
pub const NODE_NAME_VAR: &str = "MUSHER_NODE_NAME";
pub const NODE_ZONE_VAR: &str = "MUSHER_NODE_ZONE";

/// Separator joining array input elements into a single exported value.
pub const ARRAY_SEPARATOR: &str = "\t";

/// Bytes counted per provisioned GiB; slightly under a true GiB so the disk
/// keeps headroom over the estimate.
pub const PROVISION_BYTES_PER_GIB: u64 = 1_022_611_260;
pub const MIN_DISK_GIB: u64 = 10;
pub const MAX_DISK_GIB: u64 = 65535;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("cannot provision {size_gib} GiB disk for job {job_id}")]
    DiskTooLarge { job_id: String, size_gib: u64 },
    #[error("unsupported localization request for '{variable}': arrays cannot nest")]
    NestedArray { variable: String },
}

/// Requested size for a local download estimate.
pub fn disk_size_gib(bytes: u64) -> u64 {
    (1 + bytes / PROVISION_BYTES_PER_GIB).max(MIN_DISK_GIB)
}

/// An ephemeral block device provisioned for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
    pub device: String,
    pub size_gib: u64,
    pub disk_type: String,
    pub mount_dir: String,
}

/// An exported value: literal values are shell-quoted at render time, raw
/// values carry variable references or command substitutions verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportValue {
    Literal(String),
    Raw(String),
}

/// One step of a job's setup, localization, or teardown phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Export { name: String, value: ExportValue },
    MakeDirs { path: String },
    ChangeDirIfExists { path: String },
    /// Fail the localization phase early if the source object is missing.
    ObjectCheck { url: String },
    /// Replace any stale file with a fresh named pipe.
    MakeFifo { path: String },
    /// Background stream of an object into a pipe.
    BackgroundRead {
        url: String,
        dest: String,
        user_project: Option<String>,
    },
    /// Marker-guarded download, safe to re-run.
    GuardedDownload {
        url: String,
        dest: String,
        user_project: Option<String>,
    },
    /// Setup-phase exports describing the job's ephemeral disk.
    DiskEnvironment { spec: DiskSpec },
    /// Create, attach, format, and mount the ephemeral disk.
    ProvisionDisk { spec: DiskSpec },
    /// Unmount, detach, and delete the ephemeral disk.
    TeardownDisk { spec: DiskSpec },
    RemoveDirIfSet { var: &'static str },
    /// Run output collection for this job's declared patterns.
    CollectOutputs { patterns: Vec<(String, String)> },
}

/// The three-phase plan one job executes, plus its container mounts.
#[derive(Clone, Debug)]
pub struct JobExecutionPlan {
    pub job_id: String,
    pub container_args: Vec<String>,
    pub job_vars: Vec<String>,
    pub setup: Vec<Action>,
    pub localization: Vec<Action>,
    pub teardown: Vec<Action>,
    pub disk: Option<DiskSpec>,
}

/// Assembles [`JobExecutionPlan`]s from resolved requests.
pub struct JobPlanBuilder<'a> {
    env: &'a Environment,
    patterns: &'a BTreeMap<String, String>,
    disk_type: Option<&'a str>,
    local_download_dir: &'a str,
    disk_key: &'a str,
}

impl<'a> JobPlanBuilder<'a> {
    pub fn new(
        env: &'a Environment,
        patterns: &'a BTreeMap<String, String>,
        disk_type: Option<&'a str>,
        local_download_dir: &'a str,
        disk_key: &'a str,
    ) -> Self {
        Self {
            env,
            patterns,
            disk_type,
            local_download_dir,
            disk_key,
        }
    }

    pub fn build(
        &self,
        job_id: &str,
        inputs: &BTreeMap<String, LocalizationRequest>,
        download_bytes: u64,
    ) -> Result<JobExecutionPlan, PlanError> {
        let mut plan = JobExecutionPlan {
            job_id: job_id.to_string(),
            container_args: vec![format!("-v ${0}:${0}", super::paths::ROOT_VAR)],
            job_vars: Vec::new(),
            setup: Vec::new(),
            localization: vec![Action::ChangeDirIfExists {
                path: format!("${JOB_INPUTS_VAR}"),
            }],
            teardown: Vec::new(),
            disk: None,
        };

        self.push_job_roots(job_id, &mut plan);

        let mut disk_teardown = Vec::new();
        if download_bytes > 0 {
            self.provision_disk(job_id, download_bytes, &mut plan, &mut disk_teardown)?;
        }

        let mut stream_ready = false;
        let mut stream_teardown = Vec::new();
        for (variable, request) in inputs {
            plan.job_vars.push(variable.clone());
            let value = self.resolve(
                job_id,
                variable,
                request,
                true,
                &mut plan,
                &mut stream_ready,
                &mut stream_teardown,
            )?;
            plan.setup.push(Action::Export {
                name: variable.clone(),
                value,
            });
        }

        // Outputs are collected before any cleanup so they survive a failed
        // disk teardown.
        plan.teardown = vec![
            Action::ChangeDirIfExists {
                path: self.env.job_workspace(job_id).compute_str(),
            },
            Action::CollectOutputs {
                patterns: self
                    .patterns
                    .iter()
                    .map(|(name, pattern)| (name.clone(), pattern.clone()))
                    .collect(),
            },
        ];
        plan.teardown.extend(stream_teardown);
        plan.teardown.extend(disk_teardown);

        Ok(plan)
    }

    fn push_job_roots(&self, job_id: &str, plan: &mut JobExecutionPlan) {
        let inputs = self.env.job_inputs(job_id).compute_str();
        let workspace = self.env.job_workspace(job_id).compute_str();
        let setup = self
            .env
            .reserve([JOBS_DIR, job_id, "setup.sh"])
            .compute_str();
        let teardown = self
            .env
            .reserve([JOBS_DIR, job_id, "teardown.sh"])
            .compute_str();
        for (name, value) in [
            (JOB_INPUTS_VAR, inputs),
            (JOB_ROOT_VAR, workspace),
            (JOB_SETUP_VAR, setup),
            (JOB_TEARDOWN_VAR, teardown),
        ] {
            plan.setup.push(Action::Export {
                name: name.to_string(),
                value: ExportValue::Literal(value),
            });
        }
        plan.setup.push(Action::MakeDirs {
            path: format!("${JOB_INPUTS_VAR}"),
        });
        plan.setup.push(Action::MakeDirs {
            path: format!("${JOB_ROOT_VAR}"),
        });
    }

    fn provision_disk(
        &self,
        job_id: &str,
        download_bytes: u64,
        plan: &mut JobExecutionPlan,
        disk_teardown: &mut Vec<Action>,
    ) -> Result<(), PlanError> {
        let Some(disk_type) = self.disk_type else {
            // Provisioning disabled: downloads land in a plain directory.
            plan.setup.push(Action::Export {
                name: LOCAL_DISK_DIR_VAR.to_string(),
                value: ExportValue::Literal(format!("{}/{}", self.local_download_dir, job_id)),
            });
            plan.localization.push(Action::MakeDirs {
                path: format!("${LOCAL_DISK_DIR_VAR}"),
            });
            return Ok(());
        };

        let size_gib = disk_size_gib(download_bytes);
        if size_gib > MAX_DISK_GIB {
            return Err(PlanError::DiskTooLarge {
                job_id: job_id.to_string(),
                size_gib,
            });
        }
        let name = format!(
            "musher-{}-{:08x}-{}",
            self.disk_key,
            rand::random::<u32>(),
            job_id
        );
        let spec = DiskSpec {
            device: format!("mu{:04x}{}", rand::random::<u16>(), job_id),
            mount_dir: format!("{}/{}", self.local_download_dir, name),
            name,
            size_gib,
            disk_type: disk_type.to_string(),
        };
        plan.setup.push(Action::DiskEnvironment { spec: spec.clone() });
        plan.localization.push(Action::ProvisionDisk { spec: spec.clone() });
        disk_teardown.push(Action::TeardownDisk { spec: spec.clone() });
        plan.container_args
            .push(format!("-v ${0}:${0}", LOCAL_DISK_DIR_VAR));
        plan.disk = Some(spec);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &self,
        job_id: &str,
        variable: &str,
        request: &LocalizationRequest,
        top_level: bool,
        plan: &mut JobExecutionPlan,
        stream_ready: &mut bool,
        stream_teardown: &mut Vec<Action>,
    ) -> Result<ExportValue, PlanError> {
        match request {
            LocalizationRequest::Literal { value } => Ok(ExportValue::Literal(value.clone())),
            LocalizationRequest::Reserved { reservation }
            | LocalizationRequest::Common { reservation } => {
                Ok(ExportValue::Literal(reservation.compute_str()))
            }
            LocalizationRequest::Stream { url, user_project } => {
                if !*stream_ready {
                    plan.setup.push(Action::Export {
                        name: STREAM_DIR_VAR.to_string(),
                        value: ExportValue::Raw(
                            "$(mktemp -d /tmp/musher_streams.XXXXXX)".to_string(),
                        ),
                    });
                    plan.container_args
                        .push(format!("-v ${0}:${0}", STREAM_DIR_VAR));
                    stream_teardown.push(Action::RemoveDirIfSet {
                        var: STREAM_DIR_VAR,
                    });
                    *stream_ready = true;
                }
                let dest = format!("${}/{}", STREAM_DIR_VAR, storage::basename(url));
                plan.localization.push(Action::ObjectCheck { url: url.clone() });
                plan.localization.push(Action::MakeFifo { path: dest.clone() });
                plan.localization.push(Action::BackgroundRead {
                    url: url.clone(),
                    dest: dest.clone(),
                    user_project: user_project.clone(),
                });
                Ok(ExportValue::Raw(dest))
            }
            LocalizationRequest::Delayed { url, user_project } => {
                let dest = self
                    .env
                    .reserve([JOBS_DIR, job_id, "inputs", storage::basename(url)])
                    .compute_str();
                plan.localization.push(Action::GuardedDownload {
                    url: url.clone(),
                    dest: dest.clone(),
                    user_project: user_project.clone(),
                });
                Ok(ExportValue::Literal(dest))
            }
            LocalizationRequest::LocalDisk { url, user_project } => {
                let dest = format!("${}/{}", LOCAL_DISK_DIR_VAR, storage::basename(url));
                plan.localization.push(Action::GuardedDownload {
                    url: url.clone(),
                    dest: dest.clone(),
                    user_project: user_project.clone(),
                });
                Ok(ExportValue::Raw(dest))
            }
            LocalizationRequest::Array(items) => {
                if !top_level {
                    return Err(PlanError::NestedArray {
                        variable: variable.to_string(),
                    });
                }
                let mut parts = Vec::with_capacity(items.len());
                let mut any_raw = false;
                for item in items {
                    let value = self.resolve(
                        job_id,
                        variable,
                        item,
                        false,
                        plan,
                        stream_ready,
                        stream_teardown,
                    )?;
                    match value {
                        ExportValue::Literal(text) => parts.push(text),
                        ExportValue::Raw(text) => {
                            any_raw = true;
                            parts.push(text);
                        }
                    }
                }
                let joined = parts.join(ARRAY_SEPARATOR);
                Ok(if any_raw {
                    ExportValue::Raw(joined)
                } else {
                    ExportValue::Literal(joined)
                })
            }
        }
    }
}
