//! Interning of column combinations for the n-ary shuffle.
//!
//! Every dependent and referenced side of the arity-`k` candidate set is a
//! sorted column sequence; each distinct sequence gets a dense combination
//! id for the duration of one arity level. Combination ids live in their own
//! namespace, disjoint from column ids: a pass shuffles either columns or
//! combinations, never both.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};

use crate::cells::TupleProjection;
use crate::common::{Ind, SortedColumns};
use crate::input::TableIndex;

/// The per-arity bijection between sorted column combinations and dense
/// integer ids. Rebuilt fresh for every arity level.
#[derive(Debug, Default)]
pub struct CombinationIndex {
    by_columns: IndexMap<SortedColumns, u32>,
}

impl CombinationIndex {
    /// Interns the dependent and referenced sides of every candidate.
    pub fn from_candidates<'a>(candidates: impl IntoIterator<Item = &'a Ind>) -> Self {
        let mut index = CombinationIndex::default();
        for candidate in candidates {
            index.intern(candidate.dependent());
            index.intern(candidate.referenced());
        }
        index
    }

    fn intern(&mut self, columns: &[u32]) {
        let sorted = crate::common::sorted_columns(columns);
        let next_id = self.by_columns.len() as u32;
        self.by_columns.entry(sorted).or_insert(next_id);
    }

    pub fn len(&self) -> usize {
        self.by_columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_columns.is_empty()
    }

    /// The id of a sorted column combination.
    pub fn id_of(&self, columns: &[u32]) -> Option<u32> {
        self.by_columns.get(columns).copied()
    }

    /// The sorted column combination behind an id.
    pub fn columns_of(&self, id: u32) -> Option<&[u32]> {
        self.by_columns
            .get_index(id as usize)
            .map(|(columns, _)| &**columns)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u32], u32)> {
        self.by_columns.iter().map(|(columns, &id)| (&**columns, id))
    }

    /// Groups the combinations of the given candidate subset by owning
    /// table, resolving each column to its row position. Combinations not
    /// present in `chunk` are left out, so a chunked pass only emits its
    /// share.
    pub fn projections_by_table(
        &self,
        chunk: &IndexSet<Ind>,
        index: &TableIndex,
    ) -> HashMap<u32, Vec<TupleProjection>> {
        let codec = index.codec();
        let mut chunk_combinations: IndexSet<SortedColumns> = IndexSet::new();
        for candidate in chunk {
            chunk_combinations.insert(crate::common::sorted_columns(candidate.dependent()));
            chunk_combinations.insert(crate::common::sorted_columns(candidate.referenced()));
        }

        let mut by_table: HashMap<u32, Vec<TupleProjection>> = HashMap::new();
        for columns in &chunk_combinations {
            let Some(combination_id) = self.id_of(columns) else {
                continue;
            };
            let table_id = codec.table_id_of(columns[0]);
            let positions = columns
                .iter()
                .map(|&c| codec.column_index_of(c) as usize)
                .collect();
            by_table
                .entry(table_id)
                .or_default()
                .push(TupleProjection {
                    combination_id,
                    positions,
                });
        }
        by_table
    }
}

// ============================================================================
// Tests
// ============================================================================
