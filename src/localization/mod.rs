//! Localization: everything between a parsed job table and a staging tree
//! the cluster can run. Covers common-input resolution, per-input transfer
//! decisions, plan building, script rendering, and output collection.

pub mod common;
pub mod delocalize;
pub mod engine;
pub mod paths;
pub mod plan;
pub mod render;
pub mod requests;

pub use common::{select_common_sources, CommonInputTable};
pub use delocalize::{
    DelocalizeError, Manifest, OutputCollector, JOB_MANIFEST, MANIFEST_HEADER, PIPELINE_MANIFEST,
};
pub use engine::{
    LocalizeError, LocalizeMode, LocalizeResult, Localizer, LocalizerOptions, StagedLocalizer,
};
pub use paths::{Environment, PathReservation, PathSide};
pub use plan::{
    disk_size_gib, Action, DiskSpec, ExportValue, JobExecutionPlan, JobPlanBuilder, PlanError,
    ARRAY_SEPARATOR, MAX_DISK_GIB, MIN_DISK_GIB,
};
pub use render::{collector_script, render_job_scripts, sh_quote, JobScripts, COLLECTOR_FILENAME};
pub use requests::{parse_overrides, LocalizationRequest, OverrideMode, Overrides};
