//! Input value shaping: raw JSON inputs become a closed set of shapes once,
//! at ingestion, instead of being re-inspected throughout expansion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Render a scalar JSON value the way job arguments expect it: strings pass
/// through unquoted, everything else uses its JSON text.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// An array the user has marked (or shaped) as fixed: it is carried into job
/// records as a single structured value and never expanded across jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedArray {
    items: Vec<Value>,
}

impl FixedArray {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    /// A fixed array is two-dimensional iff it is non-empty and every
    /// top-level element is itself an array.
    pub fn is_2d(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(Value::is_array)
    }

    /// Length for expansion purposes: row count when 2-D, otherwise the
    /// whole array counts as a single opaque value.
    pub fn expansion_len(&self) -> usize {
        if self.is_2d() {
            self.items.len()
        } else {
            1
        }
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    /// Rows of a 2-D fixed array, each wrapped as a nested fixed array.
    /// Meaningless (empty) unless `is_2d()`.
    pub fn rows(&self) -> impl Iterator<Item = FixedArray> + '_ {
        let two_d = self.is_2d();
        self.items.iter().filter(move |_| two_d).map(|row| {
            FixedArray::new(row.as_array().cloned().unwrap_or_default())
        })
    }

    /// Stringify: a 2-D array becomes a list of lists of strings (each row's
    /// members stringified individually); anything else becomes a flat list
    /// with each top-level element stringified as a whole unit.
    pub fn stringify(&self) -> JobValue {
        if self.is_2d() {
            JobValue::Array(self.rows().map(|row| row.stringify()).collect())
        } else {
            JobValue::Array(
                self.items
                    .iter()
                    .map(|item| JobValue::Scalar(scalar_to_string(item)))
                    .collect(),
            )
        }
    }
}

/// A fully expanded per-job input value. A nested array here is an
/// intentional literal array; downstream localization treats it element-wise
/// and never as a single path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobValue {
    Scalar(String),
    Array(Vec<JobValue>),
}

impl JobValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            JobValue::Scalar(s) => Some(s),
            JobValue::Array(_) => None,
        }
    }

    /// Depth-first leaf traversal, preserving order.
    pub fn leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            JobValue::Scalar(s) => out.push(s),
            JobValue::Array(items) => {
                for item in items {
                    item.leaves(out);
                }
            }
        }
    }
}

/// The shape of one raw input variable, decided exactly once.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Scalar(String),
    Sequence(Vec<Value>),
    Fixed(FixedArray),
}

impl RawValue {
    /// Shape a raw JSON value. Arrays whose every element is itself an array
    /// are pinned as fixed, as is any array belonging to a declared common
    /// input; other arrays expand normally. Scalars stay scalars even when
    /// declared common (there is nothing to pin).
    pub fn shape(name: &str, value: Value, common_inputs: &[String]) -> RawValue {
        match value {
            Value::Array(items) => {
                let fixed = FixedArray::new(items);
                if fixed.is_2d() || common_inputs.iter().any(|c| c == name) {
                    RawValue::Fixed(fixed)
                } else {
                    RawValue::Sequence(fixed.into_items())
                }
            }
            other => RawValue::Scalar(scalar_to_string(&other)),
        }
    }

    pub fn expansion_len(&self) -> usize {
        match self {
            RawValue::Scalar(_) => 1,
            RawValue::Sequence(items) => items.len(),
            RawValue::Fixed(fixed) => fixed.expansion_len(),
        }
    }

    /// A length-1 ordinary sequence behaves like the scalar it contains.
    /// Fixed arrays are exempt: an explicit two-level array of outer length
    /// one must stay intact.
    pub fn unwrap_singleton(self) -> RawValue {
        match self {
            RawValue::Sequence(items) if items.len() == 1 => {
                RawValue::Scalar(scalar_to_string(&items[0]))
            }
            other => other,
        }
    }

    /// The per-position values this variable contributes to expansion.
    /// Iterated shapes (ordinary sequences, 2-D fixed arrays) yield one
    /// entry per element/row; held shapes yield a single entry.
    pub fn expanded(&self) -> Vec<JobValue> {
        match self {
            RawValue::Scalar(s) => vec![JobValue::Scalar(s.clone())],
            RawValue::Sequence(items) => items
                .iter()
                .map(|item| JobValue::Scalar(scalar_to_string(item)))
                .collect(),
            RawValue::Fixed(fixed) => {
                if fixed.is_2d() {
                    fixed.rows().map(|row| row.stringify()).collect()
                } else {
                    vec![fixed.stringify()]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed(value: Value) -> FixedArray {
        FixedArray::new(value.as_array().cloned().expect("array literal"))
    }

    #[test]
    fn two_d_detection() {
        assert!(fixed(json!([[1, 2], [3]])).is_2d());
        assert!(!fixed(json!([1, [2]])).is_2d());
        assert!(!fixed(json!([])).is_2d());
        assert!(!fixed(json!(["a", "b"])).is_2d());
    }

    #[test]
    fn expansion_len_counts_rows_only_when_2d() {
        assert_eq!(fixed(json!([[1], [2], [3]])).expansion_len(), 3);
        assert_eq!(fixed(json!(["a", "b", "c"])).expansion_len(), 1);
    }

    #[test]
    fn stringify_2d_nests_rows() {
        let value = fixed(json!([[1, 2], ["x"]])).stringify();
        assert_eq!(
            value,
            JobValue::Array(vec![
                JobValue::Array(vec![
                    JobValue::Scalar("1".into()),
                    JobValue::Scalar("2".into()),
                ]),
                JobValue::Array(vec![JobValue::Scalar("x".into())]),
            ])
        );
    }

    #[test]
    fn stringify_flat_keeps_whole_units() {
        let value = fixed(json!(["a", ["b", "c"]])).stringify();
        assert_eq!(
            value,
            JobValue::Array(vec![
                JobValue::Scalar("a".into()),
                JobValue::Scalar(r#"["b","c"]"#.into()),
            ])
        );
    }

    #[test]
    fn singleton_sequences_unwrap_but_fixed_do_not() {
        let seq = RawValue::shape("v", json!(["only"]), &[]);
        assert_eq!(seq.unwrap_singleton(), RawValue::Scalar("only".into()));

        let pinned = RawValue::shape("v", json!([[1, 2]]), &[]);
        let kept = pinned.clone().unwrap_singleton();
        assert_eq!(kept, pinned);
    }

    #[test]
    fn common_inputs_pin_plain_arrays() {
        let shaped = RawValue::shape("ref", json!(["a", "b"]), &["ref".to_string()]);
        assert!(matches!(shaped, RawValue::Fixed(_)));
        assert_eq!(shaped.expansion_len(), 1);
    }

    #[test]
    fn leaves_flatten_in_order() {
        let value = JobValue::Array(vec![
            JobValue::Scalar("a".into()),
            JobValue::Array(vec![JobValue::Scalar("b".into())]),
        ]);
        let mut out = Vec::new();
        value.leaves(&mut out);
        assert_eq!(out, vec!["a", "b"]);
    }
}
