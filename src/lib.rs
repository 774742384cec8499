//! Musher - staging and localization engine for array-style compute
//! pipelines on remote job clusters.
//!
//! Raw inputs expand into a per-job table ([`adapters`]), the localization
//! engine plans and performs input transfers and renders per-job
//! setup/localize/teardown scripts ([`localization`]), and declared outputs
//! are collected back through a manifest after execution.

pub mod adapters;
pub mod backends;
pub mod config;
pub mod localization;
pub mod storage;
pub mod test_support;

pub use adapters::{
    AliasSpec, FixedArray, InputAdapter, JobInputTable, JobOutputs, JobValue, ManualAdapter,
    ALIAS_VAR,
};
pub use backends::{CommandTransport, FileTransport, LocalTransport};
pub use localization::{
    Environment, LocalizeError, LocalizeMode, Localizer, LocalizerOptions, Manifest,
    OutputCollector, OverrideMode, Overrides, StagedLocalizer,
};
pub use storage::{ObjectStore, ShellObjectStore};
