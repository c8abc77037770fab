//! Splitter/combiner semantics
//!
//! A split expands one logical task into an indexed collection of
//! sub-instances over its split-slot values; a combine re-assembles their
//! outputs into ordered (possibly nested) sequences. Non-split slots are
//! shared by every sub-instance; values are immutable once bound, so no
//! isolation copy is needed.

use std::sync::Arc;

use serde_json::Value;

use crate::error::SpindleError;
use crate::task::{TaskInputs, TaskOutputs};

/// Index of one sub-instance: one entry per split dimension, in the order
/// the split slots were declared
pub type MultiIndex = Vec<usize>;

/// How a task's split slots expand into sub-instances
#[derive(Debug, Clone)]
pub enum SplitSpec {
    /// Cartesian product: one sub-instance per tuple of the cross product
    Outer(Vec<Arc<str>>),
    /// Co-indexed zip: all listed slots must have equal length
    Inner(Vec<Arc<str>>),
}

impl SplitSpec {
    pub fn outer(slots: &[&str]) -> Self {
        SplitSpec::Outer(slots.iter().map(|s| Arc::from(*s)).collect())
    }

    pub fn inner(slots: &[&str]) -> Self {
        SplitSpec::Inner(slots.iter().map(|s| Arc::from(*s)).collect())
    }

    pub fn slots(&self) -> &[Arc<str>] {
        match self {
            SplitSpec::Outer(slots) | SplitSpec::Inner(slots) => slots,
        }
    }
}

/// Which split dimensions to collapse when reading outputs downstream,
/// outer-to-inner in the listed order. `all()` collapses every dimension
/// in split declaration order.
#[derive(Debug, Clone, Default)]
pub struct CombineSpec {
    pub dims: Vec<Arc<str>>,
}

impl CombineSpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn over(dims: &[&str]) -> Self {
        Self {
            dims: dims.iter().map(|s| Arc::from(*s)).collect(),
        }
    }
}

/// One expanded execution of a split task
#[derive(Debug, Clone)]
pub struct SubInstance {
    pub index: MultiIndex,
    pub inputs: TaskInputs,
}

/// Result of expanding a split: the sub-instances plus the per-dimension
/// lengths (in split declaration order)
#[derive(Debug)]
pub struct Expansion {
    pub units: Vec<SubInstance>,
    pub dims: Vec<usize>,
}

fn split_sequence<'a>(
    task: &Arc<str>,
    slot: &Arc<str>,
    inputs: &'a TaskInputs,
) -> Result<&'a Vec<Value>, SpindleError> {
    let value = inputs
        .get(slot.as_ref())
        .ok_or_else(|| SpindleError::UnresolvedInput {
            task: Arc::clone(task),
            slot: Arc::clone(slot),
        })?;
    value
        .as_array()
        .ok_or_else(|| SpindleError::InvalidSplitInput {
            task: Arc::clone(task),
            slot: Arc::clone(slot),
            details: format!("bound to a scalar ({}), expected a sequence", kind_of(value)),
        })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Expand a task's resolved inputs into sub-instances.
///
/// Outer splits produce the full cross product tagged with a multi-index;
/// inner splits zip equal-length slots into a single dimension. A
/// zero-length split sequence yields zero sub-instances, which is not an
/// error.
pub fn expand(
    task: &Arc<str>,
    split: &SplitSpec,
    inputs: &TaskInputs,
) -> Result<Expansion, SpindleError> {
    match split {
        SplitSpec::Outer(slots) => {
            let mut sequences: Vec<&Vec<Value>> = Vec::with_capacity(slots.len());
            for slot in slots {
                sequences.push(split_sequence(task, slot, inputs)?);
            }
            let dims: Vec<usize> = sequences.iter().map(|s| s.len()).collect();
            let total: usize = dims.iter().product();

            // Row-major enumeration: last declared dimension varies fastest
            let mut units = Vec::with_capacity(total);
            for flat in 0..total {
                let mut remainder = flat;
                let mut index = vec![0usize; dims.len()];
                for d in (0..dims.len()).rev() {
                    index[d] = remainder % dims[d];
                    remainder /= dims[d];
                }
                let mut sub_inputs = inputs.clone();
                for (d, slot) in slots.iter().enumerate() {
                    sub_inputs.insert(slot.to_string(), sequences[d][index[d]].clone());
                }
                units.push(SubInstance {
                    index,
                    inputs: sub_inputs,
                });
            }
            Ok(Expansion { units, dims })
        }
        SplitSpec::Inner(slots) => {
            let mut sequences: Vec<&Vec<Value>> = Vec::with_capacity(slots.len());
            for slot in slots {
                sequences.push(split_sequence(task, slot, inputs)?);
            }
            let len = sequences.first().map(|s| s.len()).unwrap_or(0);
            for (slot, seq) in slots.iter().zip(&sequences) {
                if seq.len() != len {
                    return Err(SpindleError::InvalidSplitInput {
                        task: Arc::clone(task),
                        slot: Arc::clone(slot),
                        details: format!(
                            "inner split requires equal lengths, got {} and {}",
                            len,
                            seq.len()
                        ),
                    });
                }
            }

            let mut units = Vec::with_capacity(len);
            for i in 0..len {
                let mut sub_inputs = inputs.clone();
                for (d, slot) in slots.iter().enumerate() {
                    sub_inputs.insert(slot.to_string(), sequences[d][i].clone());
                }
                units.push(SubInstance {
                    index: vec![i],
                    inputs: sub_inputs,
                });
            }
            Ok(Expansion {
                units,
                dims: vec![len],
            })
        }
    }
}

/// Resolve a combine spec against a split into an axis permutation:
/// position `i` of the result names which split dimension sits at nesting
/// depth `i` (outer-to-inner).
pub fn combine_permutation(
    task: &Arc<str>,
    split: &SplitSpec,
    combine: Option<&CombineSpec>,
) -> Result<Vec<usize>, SpindleError> {
    let declared = split.slots();
    // Inner splits collapse to a single logical dimension
    if matches!(split, SplitSpec::Inner(_)) {
        return Ok(vec![0]);
    }
    let Some(combine) = combine else {
        return Ok((0..declared.len()).collect());
    };
    if combine.dims.is_empty() {
        return Ok((0..declared.len()).collect());
    }
    if combine.dims.len() != declared.len() {
        return Err(SpindleError::InvalidSplitInput {
            task: Arc::clone(task),
            slot: combine.dims[0].clone(),
            details: format!(
                "combine names {} dimensions but the split declares {}",
                combine.dims.len(),
                declared.len()
            ),
        });
    }
    let mut perm = Vec::with_capacity(combine.dims.len());
    for dim in &combine.dims {
        let pos = declared
            .iter()
            .position(|s| s == dim)
            .ok_or_else(|| SpindleError::InvalidSplitInput {
                task: Arc::clone(task),
                slot: Arc::clone(dim),
                details: "combine names a dimension that was never split".to_string(),
            })?;
        perm.push(pos);
    }
    Ok(perm)
}

/// Re-assemble per-unit outputs into one combined output map: each output
/// slot becomes a sequence (nested outer-to-inner for multi-dimensional
/// splits) ordered by split index, regardless of completion order.
pub fn combine_outputs(
    dims: &[usize],
    perm: &[usize],
    output_slots: &[Arc<str>],
    results: &[(MultiIndex, TaskOutputs)],
) -> TaskOutputs {
    let permuted_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();

    let mut ordered: Vec<(MultiIndex, &TaskOutputs)> = results
        .iter()
        .map(|(index, outputs)| {
            let key: MultiIndex = perm.iter().map(|&p| index[p]).collect();
            (key, outputs)
        })
        .collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut combined = TaskOutputs::new();
    for slot in output_slots {
        let values: Vec<Value> = ordered
            .iter()
            .map(|(_, outputs)| outputs.get(slot.as_ref()).cloned().unwrap_or(Value::Null))
            .collect();
        combined.insert(slot.to_string(), nest(&permuted_dims, &values));
    }
    combined
}

/// Nest a flat row-major sequence into arrays shaped by `dims`
fn nest(dims: &[usize], values: &[Value]) -> Value {
    if dims.len() <= 1 {
        return Value::Array(values.to_vec());
    }
    let inner: usize = dims[1..].iter().product();
    let chunks: Vec<Value> = values
        .chunks(inner.max(1))
        .map(|chunk| nest(&dims[1..], chunk))
        .collect();
    Value::Array(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> TaskInputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn outer_split_is_cartesian_product() {
        let task: Arc<str> = "t".into();
        let split = SplitSpec::outer(&["a", "b"]);
        let inputs = inputs(&[
            ("a", json!([1, 2])),
            ("b", json!(["x", "y", "z"])),
            ("shared", json!(10)),
        ]);

        let expansion = expand(&task, &split, &inputs).unwrap();
        assert_eq!(expansion.units.len(), 6);
        assert_eq!(expansion.dims, vec![2, 3]);

        // Row-major: [0,0], [0,1], [0,2], [1,0], ...
        assert_eq!(expansion.units[0].index, vec![0, 0]);
        assert_eq!(expansion.units[0].inputs["a"], json!(1));
        assert_eq!(expansion.units[0].inputs["b"], json!("x"));
        assert_eq!(expansion.units[5].index, vec![1, 2]);
        assert_eq!(expansion.units[5].inputs["a"], json!(2));
        assert_eq!(expansion.units[5].inputs["b"], json!("z"));

        // Non-split slots are copied into every sub-instance
        assert!(expansion.units.iter().all(|u| u.inputs["shared"] == json!(10)));
    }

    #[test]
    fn inner_split_zips_equal_lengths() {
        let task: Arc<str> = "t".into();
        let split = SplitSpec::inner(&["a", "b"]);
        let inputs = inputs(&[("a", json!([1, 2, 3])), ("b", json!([10, 20, 30]))]);

        let expansion = expand(&task, &split, &inputs).unwrap();
        assert_eq!(expansion.units.len(), 3);
        assert_eq!(expansion.dims, vec![3]);
        assert_eq!(expansion.units[1].inputs["a"], json!(2));
        assert_eq!(expansion.units[1].inputs["b"], json!(20));
    }

    #[test]
    fn inner_split_rejects_mismatched_lengths() {
        let task: Arc<str> = "t".into();
        let split = SplitSpec::inner(&["a", "b"]);
        let inputs = inputs(&[("a", json!([1, 2, 3])), ("b", json!([10]))]);

        let err = expand(&task, &split, &inputs).unwrap_err();
        assert!(matches!(err, SpindleError::InvalidSplitInput { .. }));
    }

    #[test]
    fn split_over_scalar_is_an_error() {
        let task: Arc<str> = "t".into();
        let split = SplitSpec::outer(&["a"]);
        let inputs = inputs(&[("a", json!(5))]);

        let err = expand(&task, &split, &inputs).unwrap_err();
        match err {
            SpindleError::InvalidSplitInput { details, .. } => {
                assert!(details.contains("scalar"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn zero_length_split_yields_zero_units() {
        let task: Arc<str> = "t".into();
        let split = SplitSpec::outer(&["a", "b"]);
        let inputs = inputs(&[("a", json!([])), ("b", json!([1, 2]))]);

        let expansion = expand(&task, &split, &inputs).unwrap();
        assert!(expansion.units.is_empty());
        assert_eq!(expansion.dims, vec![0, 2]);
    }

    #[test]
    fn combine_preserves_split_order() {
        let slot: Arc<str> = "out".into();
        // Results arrive in scrambled completion order
        let results: Vec<(MultiIndex, TaskOutputs)> = vec![
            (vec![2], [("out".to_string(), json!(30))].into()),
            (vec![0], [("out".to_string(), json!(10))].into()),
            (vec![1], [("out".to_string(), json!(20))].into()),
        ];

        let combined = combine_outputs(&[3], &[0], &[slot], &results);
        assert_eq!(combined["out"], json!([10, 20, 30]));
    }

    #[test]
    fn multi_dimensional_combine_nests_outer_to_inner() {
        let slot: Arc<str> = "out".into();
        let mut results: Vec<(MultiIndex, TaskOutputs)> = Vec::new();
        for i in 0..2 {
            for j in 0..3 {
                results.push((
                    vec![i, j],
                    [("out".to_string(), json!(i * 10 + j))].into(),
                ));
            }
        }

        let combined = combine_outputs(&[2, 3], &[0, 1], &[slot.clone()], &results);
        assert_eq!(combined["out"], json!([[0, 1, 2], [10, 11, 12]]));

        // Permuted combine nests the second dimension outermost
        let transposed = combine_outputs(&[2, 3], &[1, 0], &[slot], &results);
        assert_eq!(transposed["out"], json!([[0, 10], [1, 11], [2, 12]]));
    }

    #[test]
    fn combine_permutation_validates_dimension_names() {
        let task: Arc<str> = "t".into();
        let split = SplitSpec::outer(&["a", "b"]);

        let perm = combine_permutation(&task, &split, None).unwrap();
        assert_eq!(perm, vec![0, 1]);

        let perm =
            combine_permutation(&task, &split, Some(&CombineSpec::over(&["b", "a"]))).unwrap();
        assert_eq!(perm, vec![1, 0]);

        let err = combine_permutation(&task, &split, Some(&CombineSpec::over(&["z", "a"])))
            .unwrap_err();
        assert!(matches!(err, SpindleError::InvalidSplitInput { .. }));
    }

    #[test]
    fn empty_combine_result_for_zero_units() {
        let slot: Arc<str> = "out".into();
        let combined = combine_outputs(&[0], &[0], &[slot], &[]);
        assert_eq!(combined["out"], json!([]));
    }
}
