//! Manual adapter: expands explicitly supplied inputs, either as a cartesian
//! product or as a positional co-iteration over array values.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use tracing::warn;

use super::values::{JobValue, RawValue};
use super::{AdapterError, InputAdapter, JobInputTable, JobOutputs, ALIAS_VAR};

/// How per-job aliases are assigned.
#[derive(Clone, Debug)]
pub enum AliasSpec {
    /// One alias per job, positionally.
    PerJob(Vec<String>),
    /// Copy each job's expanded value for this input variable.
    Variable(String),
}

/// Expands user-supplied inputs with no external lookups. Array values
/// either co-iterate positionally (default) or combine as a cartesian
/// product; declared common inputs and two-level arrays are pinned so they
/// ride along unexpanded.
#[derive(Debug, Default)]
pub struct ManualAdapter {
    product: bool,
    alias: Option<AliasSpec>,
    common_inputs: Vec<String>,
    spec: Option<JobInputTable>,
    job_length: usize,
}

impl ManualAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine array inputs as a cartesian product instead of co-iterating.
    pub fn product(mut self, product: bool) -> Self {
        self.product = product;
        self
    }

    pub fn alias(mut self, alias: AliasSpec) -> Self {
        self.alias = Some(alias);
        self
    }

    /// Variables whose array values must never be expanded across jobs.
    pub fn common_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.common_inputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn job_length(&self) -> usize {
        self.job_length
    }

    /// Resolve the co-iterated job length. The first length above 1 pins the
    /// job count; any later length that is neither 1 nor the pinned count is
    /// an uneven input. Variables are visited in sorted name order so error
    /// outcomes are deterministic.
    fn coiterated_length(
        lengths: &BTreeMap<String, usize>,
    ) -> Result<usize, AdapterError> {
        let mut job_length = 0usize;
        for (name, &len) in lengths {
            if len == 0 {
                return Err(AdapterError::UnevenInput {
                    variable: name.clone(),
                });
            }
            if len > job_length {
                if job_length <= 1 {
                    job_length = len;
                } else {
                    return Err(AdapterError::UnevenInput {
                        variable: name.clone(),
                    });
                }
            } else if len != 1 && len != job_length {
                return Err(AdapterError::UnevenInput {
                    variable: name.clone(),
                });
            }
        }
        Ok(job_length.max(1))
    }

    fn assign_aliases(
        &self,
        table: &mut JobInputTable,
        inputs: &BTreeMap<String, RawValue>,
    ) -> Result<(), AdapterError> {
        let Some(alias) = &self.alias else {
            return Ok(());
        };
        match alias {
            AliasSpec::PerJob(list) => {
                if list.len() != self.job_length {
                    return Err(AdapterError::AliasCountMismatch {
                        expected: self.job_length,
                        actual: list.len(),
                    });
                }
                for (i, alias) in list.iter().enumerate() {
                    if let Some(record) = table.get_mut(&i.to_string()) {
                        record.insert(ALIAS_VAR.to_string(), JobValue::Scalar(alias.clone()));
                    }
                }
            }
            AliasSpec::Variable(variable) => {
                if !inputs.contains_key(variable) {
                    return Err(AdapterError::AliasVariableMissing {
                        variable: variable.clone(),
                    });
                }
                for record in table.values_mut() {
                    let value = record
                        .get(variable)
                        .and_then(JobValue::as_scalar)
                        .map(str::to_string)
                        .ok_or_else(|| AdapterError::AliasNotScalar {
                            variable: variable.clone(),
                        })?;
                    record.insert(ALIAS_VAR.to_string(), JobValue::Scalar(value));
                }
            }
        }
        let mut seen = HashSet::new();
        for record in table.values() {
            if let Some(JobValue::Scalar(alias)) = record.get(ALIAS_VAR) {
                if !seen.insert(alias.as_str()) {
                    return Err(AdapterError::DuplicateAlias {
                        alias: alias.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl InputAdapter for ManualAdapter {
    fn parse_inputs(
        &mut self,
        inputs: BTreeMap<String, Value>,
    ) -> Result<JobInputTable, AdapterError> {
        // Shape every value exactly once; explicit nulls are dropped.
        let mut shaped: BTreeMap<String, RawValue> = BTreeMap::new();
        for (name, value) in inputs {
            if value.is_null() {
                warn!(input = %name, "ignoring input explicitly set to null");
                continue;
            }
            let raw = RawValue::shape(&name, value, &self.common_inputs);
            shaped.insert(name, raw);
        }

        if shaped.is_empty() {
            self.job_length = 0;
            self.spec = Some(JobInputTable::new());
            return Ok(JobInputTable::new());
        }

        let lengths: BTreeMap<String, usize> = shaped
            .iter()
            .map(|(name, value)| (name.clone(), value.expansion_len()))
            .collect();

        // Length-1 ordinary lists broadcast like scalars.
        let shaped: BTreeMap<String, RawValue> = shaped
            .into_iter()
            .map(|(name, value)| (name, value.unwrap_singleton()))
            .collect();

        self.job_length = if self.product {
            lengths.values().product()
        } else {
            Self::coiterated_length(&lengths)?
        };

        let columns: Vec<(&String, Vec<JobValue>)> = shaped
            .iter()
            .map(|(name, value)| (name, value.expanded()))
            .collect();

        let mut table = JobInputTable::new();
        for i in 0..self.job_length {
            let mut record = BTreeMap::new();
            if self.product {
                // Cartesian product over sorted variables, rightmost fastest.
                let mut index = i;
                for (name, column) in columns.iter().rev() {
                    record.insert((*name).clone(), column[index % column.len()].clone());
                    index /= column.len();
                }
            } else {
                for (name, column) in &columns {
                    let value = if column.len() == 1 {
                        column[0].clone()
                    } else {
                        column[i].clone()
                    };
                    record.insert((*name).clone(), value);
                }
            }
            table.insert(i.to_string(), record);
        }
        debug_assert_eq!(table.len(), self.job_length);

        self.assign_aliases(&mut table, &shaped)?;

        self.spec = Some(table.clone());
        Ok(table)
    }

    fn parse_outputs(&mut self, _outputs: &JobOutputs) {
        // Manual inputs need no output post-processing.
    }

    fn spec(&self) -> Option<JobInputTable> {
        self.spec.clone()
    }
}
