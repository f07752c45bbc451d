use core::ops::Index;

use smallvec::SmallVec;

use crate::schema::{Combinator, Schema};

/// Per-column aggregate of everything reachable below a node.
///
/// Column 0 is the entry count.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Summary(SmallVec<[u64; 8]>);

impl Summary {
    pub fn zero(columns: usize) -> Self {
        Self(SmallVec::from_elem(0, columns))
    }

    pub fn from_values(values: impl IntoIterator<Item = u64>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn count(&self) -> u64 {
        self.0.first().copied().unwrap_or(0)
    }

    pub fn get(&self, column: usize) -> u64 {
        self.0.get(column).copied().unwrap_or(0)
    }

    pub fn columns(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Folds `other` into `self` with each column's combinator.
    pub fn accumulate(&mut self, other: &Self, schema: &Schema) {
        for (idx, column) in schema.columns.iter().enumerate() {
            let value = other.get(idx);
            let slot = &mut self.0[idx];
            *slot = match column.kind.combinator() {
                Combinator::Sum => slot.saturating_add(value),
                Combinator::Max => (*slot).max(value),
            };
        }
    }
}

impl Index<usize> for Summary {
    type Output = u64;

    fn index(&self, column: usize) -> &u64 {
        &self.0[column]
    }
}
