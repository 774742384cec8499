//! Cross-job scan for inputs worth localizing once and sharing.

use std::collections::{BTreeSet, HashMap};

use crate::adapters::JobInputTable;

use super::paths::PathReservation;
use super::requests::{OverrideMode, Overrides};

/// Source values chosen for common localization: any leaf repeated across
/// two or more distinct jobs under the same variable, plus every leaf of a
/// variable forced common by override. Variables with any other override are
/// never commonized by repetition.
pub fn select_common_sources(table: &JobInputTable, overrides: &Overrides) -> BTreeSet<String> {
    let mut common = BTreeSet::new();
    // (variable, leaf) -> first job that used it
    let mut seen: HashMap<(&str, &str), &str> = HashMap::new();
    for (job_id, record) in table {
        for (variable, value) in record {
            let mut leaves = Vec::new();
            value.leaves(&mut leaves);
            match overrides.get(variable.as_str()) {
                None => {
                    for leaf in leaves {
                        match seen.get(&(variable.as_str(), leaf)) {
                            Some(first) if *first != job_id.as_str() => {
                                common.insert(leaf.to_string());
                            }
                            Some(_) => {}
                            None => {
                                seen.insert((variable.as_str(), leaf), job_id.as_str());
                            }
                        }
                    }
                }
                Some(OverrideMode::Common) => {
                    for leaf in leaves {
                        common.insert(leaf.to_string());
                    }
                }
                Some(_) => {}
            }
        }
    }
    common
}

/// Source path -> common reservation. Built once per `localize()` call and
/// read-only afterward; jobs never race to localize a shared input.
#[derive(Clone, Debug, Default)]
pub struct CommonInputTable {
    entries: HashMap<String, PathReservation>,
}

impl CommonInputTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: String, reservation: PathReservation) {
        self.entries.insert(source, reservation);
    }

    pub fn get(&self, source: &str) -> Option<&PathReservation> {
        self.entries.get(source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::adapters::JobValue;

    use super::*;

    fn table(rows: &[(&str, &[(&str, JobValue)])]) -> JobInputTable {
        rows.iter()
            .map(|(job, vars)| {
                (
                    job.to_string(),
                    vars.iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect::<BTreeMap<_, _>>(),
                )
            })
            .collect()
    }

    fn scalar(s: &str) -> JobValue {
        JobValue::Scalar(s.to_string())
    }

    #[test]
    fn repeated_leaves_across_jobs_become_common() {
        let jobs = table(&[
            ("0", &[("ref", scalar("/data/ref.fa")), ("x", scalar("a"))]),
            ("1", &[("ref", scalar("/data/ref.fa")), ("x", scalar("b"))]),
        ]);
        let common = select_common_sources(&jobs, &Overrides::new());
        assert_eq!(
            common.into_iter().collect::<Vec<_>>(),
            vec!["/data/ref.fa".to_string()]
        );
    }

    #[test]
    fn repetition_within_one_job_is_not_common() {
        let jobs = table(&[(
            "0",
            &[(
                "pair",
                JobValue::Array(vec![scalar("/data/x"), scalar("/data/x")]),
            )],
        )]);
        let common = select_common_sources(&jobs, &Overrides::new());
        assert!(common.is_empty());
    }

    #[test]
    fn forced_common_marks_every_leaf() {
        let jobs = table(&[("0", &[("ref", scalar("gs://b/ref.fa"))])]);
        let mut overrides = Overrides::new();
        overrides.insert("ref".into(), OverrideMode::Common);
        let common = select_common_sources(&jobs, &overrides);
        assert!(common.contains("gs://b/ref.fa"));
    }

    #[test]
    fn overridden_variables_are_skipped_for_repetition() {
        let jobs = table(&[
            ("0", &[("v", scalar("gs://b/big"))]),
            ("1", &[("v", scalar("gs://b/big"))]),
        ]);
        let mut overrides = Overrides::new();
        overrides.insert("v".into(), OverrideMode::Stream);
        let common = select_common_sources(&jobs, &overrides);
        assert!(common.is_empty());
    }

    #[test]
    fn same_leaf_under_different_variables_stays_private() {
        let jobs = table(&[
            ("0", &[("a", scalar("/data/f"))]),
            ("1", &[("b", scalar("/data/f"))]),
        ]);
        let common = select_common_sources(&jobs, &Overrides::new());
        assert!(common.is_empty());
    }
}
