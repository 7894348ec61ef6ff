//! Per-row transforms applied before a row is assembled.
//!
//! Transforms run in stage order: parameters are substituted first, then
//! subtype candidates are resolved, then consumed slots are filled from the
//! slots they were folded into. A tuple enters the pipeline fresh, so a
//! consumed slot always takes the folded value whatever earlier stages wrote.

use super::types::{OptionalParameters, ResultTuple, Value};
use smallvec::SmallVec;
use smol_str::SmolStr;

/// One candidate mapping of a subtype-dependent attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Variant indices the candidate's mapping belongs to.
    pub variants: SmallVec<[usize; 4]>,
    pub slot: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TupleTransform {
    Parameters {
        slots: Vec<(usize, SmolStr)>,
    },
    /// Copies the value of the candidate matching the row's variant into
    /// `target`. Candidates are ordered most specific first.
    SubtypeConstraint {
        discriminator: usize,
        target: usize,
        candidates: SmallVec<[Candidate; 4]>,
        default: Option<usize>,
    },
    Consuming {
        /// (consumed slot, slot it was folded into)
        slots: Vec<(usize, usize)>,
    },
}

impl TupleTransform {
    fn stage(&self) -> u8 {
        match self {
            TupleTransform::Parameters { .. } => 0,
            TupleTransform::SubtypeConstraint { .. } => 1,
            TupleTransform::Consuming { .. } => 2,
        }
    }

    pub fn apply(&self, tuple: &mut ResultTuple, parameters: &OptionalParameters) {
        match self {
            TupleTransform::Parameters { slots } => {
                for (slot, name) in slots {
                    let value = parameters.get(name).cloned().unwrap_or(Value::Null);
                    tuple.set(*slot, value);
                }
            }
            TupleTransform::SubtypeConstraint {
                discriminator,
                target,
                candidates,
                default,
            } => {
                let variant = variant_of(tuple.get(*discriminator));
                let source = candidates
                    .iter()
                    .find(|c| c.variants.contains(&variant))
                    .map(|c| c.slot)
                    .or(*default);
                let value = source
                    .map(|slot| tuple.get(slot).clone())
                    .unwrap_or(Value::Null);
                tuple.set(*target, value);
            }
            TupleTransform::Consuming { slots } => {
                for (slot, into) in slots {
                    let value = tuple.get(*into).clone();
                    tuple.set(*slot, value);
                    tuple.mark_consumed(*slot);
                }
            }
        }
    }
}

/// Variant index from a discriminator slot; anything unexpected selects
/// the declared type.
pub fn variant_of(value: &Value) -> usize {
    match value {
        Value::Int(i) if *i > 0 => *i as usize,
        _ => 0,
    }
}

/// Ordered transforms of one tuple shape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TuplePipeline {
    transforms: Vec<TupleTransform>,
}

impl TuplePipeline {
    /// Inserts the transform behind every transform of the same or an
    /// earlier stage.
    pub fn push(&mut self, transform: TupleTransform) {
        let stage = transform.stage();
        let at = self
            .transforms
            .iter()
            .position(|t| t.stage() > stage)
            .unwrap_or(self.transforms.len());
        self.transforms.insert(at, transform);
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn transforms(&self) -> &[TupleTransform] {
        &self.transforms
    }

    pub fn apply(&self, tuple: &mut ResultTuple, parameters: &OptionalParameters) {
        for transform in &self.transforms {
            transform.apply(tuple, parameters);
        }
    }
}

#[cfg(test)]
mod transform_tests {
    use super::*;
    use smallvec::smallvec;

    fn row(values: Vec<Value>) -> ResultTuple {
        ResultTuple::new(values)
    }

    #[test]
    fn test_stages_are_ordered() {
        let mut pipeline = TuplePipeline::default();
        pipeline.push(TupleTransform::Consuming { slots: vec![] });
        pipeline.push(TupleTransform::Parameters { slots: vec![] });
        pipeline.push(TupleTransform::SubtypeConstraint {
            discriminator: 0,
            target: 1,
            candidates: SmallVec::new(),
            default: None,
        });
        let stages: Vec<u8> = pipeline.transforms().iter().map(TupleTransform::stage).collect();
        assert_eq!(stages, vec![0, 1, 2]);
    }

    #[test]
    fn test_parameters_substituted() {
        let mut params = OptionalParameters::default();
        params.insert("tenant".into(), Value::from("acme"));
        let mut tuple = row(vec![Value::from(1), Value::Null, Value::Null]);
        TupleTransform::Parameters {
            slots: vec![(1, "tenant".into()), (2, "missing".into())],
        }
        .apply(&mut tuple, &params);
        assert_eq!(tuple.get(1), &Value::from("acme"));
        assert_eq!(tuple.get(2), &Value::Null);
    }

    #[test]
    fn test_subtype_candidate_selection() {
        // slots: discriminator, target, dog candidate, cat candidate, base candidate
        let transform = TupleTransform::SubtypeConstraint {
            discriminator: 0,
            target: 1,
            candidates: smallvec![
                Candidate { variants: smallvec![2], slot: 2 },
                Candidate { variants: smallvec![1], slot: 3 },
            ],
            default: Some(4),
        };
        let params = OptionalParameters::default();

        let mut dog = row(vec![Value::from(2), Value::Null, "bark".into(), "meow".into(), "base".into()]);
        transform.apply(&mut dog, &params);
        assert_eq!(dog.get(1), &Value::from("bark"));

        let mut plain = row(vec![Value::Null, Value::Null, "bark".into(), "meow".into(), "base".into()]);
        transform.apply(&mut plain, &params);
        assert_eq!(plain.get(1), &Value::from("base"));
    }

    #[test]
    fn test_consuming_copies_and_marks() {
        let mut tuple = row(vec![Value::from(5), Value::Null]);
        let mut pipeline = TuplePipeline::default();
        pipeline.push(TupleTransform::Consuming { slots: vec![(1, 0)] });
        pipeline.push(TupleTransform::Parameters {
            slots: vec![(1, "ignored".into())],
        });
        pipeline.apply(&mut tuple, &OptionalParameters::default());
        assert_eq!(tuple.get(1), &Value::from(5));
        assert!(tuple.is_consumed(1));
    }

    #[test]
    fn test_consumed_subtype_target_takes_folded_value() {
        // slots: discriminator, target, candidate, folded
        let mut pipeline = TuplePipeline::default();
        pipeline.push(TupleTransform::Consuming { slots: vec![(1, 3)] });
        pipeline.push(TupleTransform::SubtypeConstraint {
            discriminator: 0,
            target: 1,
            candidates: smallvec![Candidate { variants: smallvec![1], slot: 2 }],
            default: None,
        });
        let mut tuple = row(vec![Value::from(1), Value::Null, "candidate".into(), "folded".into()]);
        assert!(!tuple.is_consumed(1));
        pipeline.apply(&mut tuple, &OptionalParameters::default());
        assert_eq!(tuple.get(1), &Value::from("folded"));
        assert!(tuple.is_consumed(1));
    }
}
