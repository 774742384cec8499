//! Pipeline input adapters: turn raw user inputs into a dense per-job table.

mod manual;
mod values;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

pub use manual::{AliasSpec, ManualAdapter};
pub use values::{scalar_to_string, FixedArray, JobValue, RawValue};

/// Reserved variable carrying the optional per-job alias.
pub const ALIAS_VAR: &str = "MUSHER_JOB_ALIAS";

/// Per-job expanded inputs: `jobId -> {variable -> value}`. Job ids are
/// stringified dense integers starting at 0.
pub type JobInputTable = BTreeMap<String, BTreeMap<String, JobValue>>;

/// Post-execution outputs handed back to an adapter:
/// `jobId -> {outputName -> resolved paths}`.
pub type JobOutputs = BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("cannot co-iterate uneven input '{variable}'")]
    UnevenInput { variable: String },
    #[error("{actual} job aliases provided for {expected} jobs")]
    AliasCountMismatch { expected: usize, actual: usize },
    #[error("job alias '{alias}' is not unique")]
    DuplicateAlias { alias: String },
    #[error("alias variable '{variable}' not present in inputs")]
    AliasVariableMissing { variable: String },
    #[error("alias variable '{variable}' expands to an array, not a scalar")]
    AliasNotScalar { variable: String },
}

/// An input adapter expands raw inputs into the job table consumed by
/// localization and, after execution, post-processes collected outputs.
pub trait InputAdapter: Send + Sync {
    /// Expand raw inputs into a per-job input table. The same table is
    /// retained and available through [`InputAdapter::spec`].
    fn parse_inputs(
        &mut self,
        inputs: BTreeMap<String, Value>,
    ) -> Result<JobInputTable, AdapterError>;

    /// Post-process collected job outputs.
    fn parse_outputs(&mut self, outputs: &JobOutputs);

    /// Defensive copy of the most recent job specification.
    fn spec(&self) -> Option<JobInputTable>;
}
