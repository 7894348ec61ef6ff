use super::path::AttributePath;
use super::value::Value;
use crate::error::MaterializeError;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::fmt;

/// What a slot holds once the query engine has filled it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotRole {
    Value,
    /// Identity of a view; groups rows per instance.
    Identity,
    /// List index or map key of a collection element.
    Index,
    /// Inheritance variant of a view node.
    Discriminator,
    /// Subtype-specific mapping of an attribute; resolved by the pipeline.
    Candidate,
    /// Value a select-fetched correlation is resolved for.
    CorrelationBasis,
    /// Echo of the basis value in batched correlation results.
    CorrelationKey,
    Multiset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotBinding {
    Attribute { path: AttributePath, role: SlotRole },
    Parameter { name: SmolStr },
    /// Duplicate projection; readers use `into` instead.
    Consumed { into: usize },
}

/// Fixed, ordered list of slots a plan expects in every row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TupleShape {
    slots: Vec<SlotBinding>,
}

impl TupleShape {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&SlotBinding> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[SlotBinding] {
        &self.slots
    }

    pub(crate) fn push(&mut self, binding: SlotBinding) -> usize {
        self.slots.push(binding);
        self.slots.len() - 1
    }

    /// Rejects rows whose width differs from the plan.
    pub fn check(&self, tuple: &ResultTuple) -> Result<(), MaterializeError> {
        if tuple.len() != self.slots.len() {
            return Err(MaterializeError::TupleWidth {
                expected: self.slots.len(),
                found: tuple.len(),
                tuple: tuple.snapshot(),
            });
        }
        Ok(())
    }
}

/// One row as produced by the query engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResultTuple {
    values: Vec<Value>,
    consumed: SmallVec<[u64; 1]>,
}

impl ResultTuple {
    pub fn new(values: Vec<Value>) -> Self {
        ResultTuple {
            values,
            consumed: SmallVec::new(),
        }
    }

    /// Builds a row from a JSON array.
    pub fn from_json(row: serde_json::Value) -> anyhow::Result<Self> {
        match row {
            serde_json::Value::Array(items) => {
                Ok(ResultTuple::new(items.into_iter().map(Value::from).collect()))
            }
            other => anyhow::bail!("expected a JSON array for a result row, got {}", other),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slot access. Callers check the width against the shape first.
    pub fn get(&self, slot: usize) -> &Value {
        &self.values[slot]
    }

    pub fn set(&mut self, slot: usize, value: Value) {
        self.values[slot] = value;
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn mark_consumed(&mut self, slot: usize) {
        let word = slot / 64;
        if self.consumed.len() <= word {
            self.consumed.resize(word + 1, 0);
        }
        self.consumed[word] |= 1u64 << (slot % 64);
    }

    pub fn is_consumed(&self, slot: usize) -> bool {
        self.consumed
            .get(slot / 64)
            .map(|w| w & (1u64 << (slot % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> TupleSnapshot {
        TupleSnapshot::of(&self.values)
    }
}

impl From<Vec<Value>> for ResultTuple {
    fn from(values: Vec<Value>) -> Self {
        ResultTuple::new(values)
    }
}

/// Rows of a nested correlation carried inside one slot. `sizes` splits a
/// flattened group into consecutive sub-collections.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MultisetGroup {
    rows: Vec<ResultTuple>,
    sizes: Option<SmallVec<[usize; 4]>>,
}

impl MultisetGroup {
    pub fn new(rows: Vec<ResultTuple>) -> Self {
        MultisetGroup { rows, sizes: None }
    }

    pub fn with_sizes(rows: Vec<ResultTuple>, sizes: impl IntoIterator<Item = usize>) -> Self {
        MultisetGroup {
            rows,
            sizes: Some(sizes.into_iter().collect()),
        }
    }

    pub fn rows(&self) -> &[ResultTuple] {
        &self.rows
    }

    pub fn sizes(&self) -> Option<&[usize]> {
        self.sizes.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rendered values and their type names, attached to errors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TupleSnapshot {
    entries: Vec<(String, SmolStr)>,
}

impl TupleSnapshot {
    pub fn of(values: &[Value]) -> Self {
        TupleSnapshot {
            entries: values
                .iter()
                .map(|v| (v.to_string(), v.type_name()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, SmolStr)] {
        &self.entries
    }
}

impl fmt::Display for TupleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (value, ty)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "#{} {}: {}", i, value, ty)?;
        }
        f.write_str(")")
    }
}
