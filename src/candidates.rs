//! Apriori-style synthesis of arity-`k+1` IND candidates from the validated
//! INDs of arity `k`, and consolidation of the cumulative IND set.
//!
//! Candidates are built by merging sibling INDs that agree on their first
//! `k-1` dependent/referenced positions, then pruned: every arity-`k`
//! generalization must itself be a validated IND (the Apriori closure
//! check), both sides must stay within one table, the configured restriction
//! must permit the column multiset, and optionally void sides are excluded.

use std::collections::HashSet;

use indexmap::IndexSet;

use crate::common::Ind;

/// Restrictions on the column multiset of an n-ary IND candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaryIndRestriction {
    /// No restriction.
    None,
    /// A column may appear at most once across both sides.
    NoRepetitions,
    /// The dependent columns are disjoint from the referenced columns.
    DepRefDisjoint,
}

impl NaryIndRestriction {
    pub fn permits(&self, candidate: &Ind) -> bool {
        match self {
            NaryIndRestriction::None => true,
            NaryIndRestriction::NoRepetitions => {
                let mut all: Vec<u32> = candidate
                    .dependent()
                    .iter()
                    .chain(candidate.referenced())
                    .copied()
                    .collect();
                let len = all.len();
                all.sort_unstable();
                all.dedup();
                all.len() == len
            }
            NaryIndRestriction::DepRefDisjoint => candidate
                .dependent()
                .iter()
                .all(|d| !candidate.referenced().contains(d)),
        }
    }
}

/// The candidate-generation strategy. The strategies share the merge rule
/// below and differ in whether void sides are excluded from candidate
/// generation by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStrategy {
    Mind,
    Apriori,
    Binder,
}

impl CandidateStrategy {
    /// The strategy's default for excluding void sides from candidate
    /// generation, used when the configuration leaves it unset.
    pub fn excludes_void_by_default(&self) -> bool {
        matches!(self, CandidateStrategy::Binder)
    }

    /// Generates the arity-`arity` candidates from the validated INDs of
    /// arity `arity - 1`.
    ///
    /// `is_non_void` reports whether a column combination of the previous
    /// arity has at least one distinct tuple; with `exclude_void` set, a
    /// candidate is rejected when any of its generalizations has a void
    /// side. `column_bit_mask` selects the column-index field of a column
    /// id and scopes both candidate sides to a single table.
    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        &self,
        new_inds: &[Ind],
        arity: usize,
        restriction: NaryIndRestriction,
        exclude_void: bool,
        is_non_void: impl Fn(&[u32]) -> bool,
        column_bit_mask: u32,
        out: &mut IndexSet<Ind>,
    ) {
        debug_assert!(arity >= 2);
        debug_assert!(new_inds.iter().all(|ind| ind.arity() == arity - 1));
        let prefix_len = arity - 2;

        let mut sorted: Vec<&Ind> = new_inds.iter().collect();
        sorted.sort_by(|a, b| a.lexicographic_cmp(b));
        let known: HashSet<&Ind> = new_inds.iter().collect();

        // Walk the blocks of INDs sharing their dependent prefix; the sort
        // makes them contiguous and orders them by the extension column.
        let mut block_start = 0;
        while block_start < sorted.len() {
            let mut block_end = block_start + 1;
            while block_end < sorted.len()
                && sorted[block_end].dependent()[..prefix_len]
                    == sorted[block_start].dependent()[..prefix_len]
            {
                block_end += 1;
            }

            for i in block_start..block_end {
                for j in i + 1..block_end {
                    let (a, b) = (sorted[i], sorted[j]);
                    if let Some(candidate) =
                        merge_siblings(a, b, prefix_len, column_bit_mask)
                    {
                        if !restriction.permits(&candidate) {
                            continue;
                        }
                        let admissible = (0..arity).all(|position| {
                            let general = candidate.coproject(position);
                            known.contains(&general)
                                && (!exclude_void
                                    || (is_non_void(general.dependent())
                                        && is_non_void(general.referenced())))
                        });
                        if admissible {
                            out.insert(candidate);
                        }
                    }
                }
            }
            block_start = block_end;
        }
    }

    /// Removes from `all_inds` every IND implied by a member of `new_inds`.
    /// The INDs in `all_inds` are of strictly smaller arity, so implication
    /// only ever runs in that direction.
    pub fn consolidate(&self, all_inds: &mut Vec<Ind>, new_inds: &[Ind]) {
        all_inds.retain(|existing| !new_inds.iter().any(|new| existing.is_implied_by(new)));
    }
}

/// Merges two siblings sharing their first `prefix_len` dependent and
/// referenced positions into the candidate one arity up, or `None` when
/// they extend by the same dependent column or leave a table.
fn merge_siblings(a: &Ind, b: &Ind, prefix_len: usize, column_bit_mask: u32) -> Option<Ind> {
    let last = prefix_len;
    if a.dependent()[last] == b.dependent()[last] {
        return None;
    }
    if a.referenced()[..prefix_len] != b.referenced()[..prefix_len] {
        return None;
    }

    // Both sides must stay within one table; the prefix already agrees, so
    // only the extension columns need checking.
    let same_table = |existing: u32, extension: u32| {
        existing & !column_bit_mask == extension & !column_bit_mask
    };
    if !same_table(a.dependent()[0], b.dependent()[last]) {
        return None;
    }
    if !same_table(a.referenced()[0], b.referenced()[last]) {
        return None;
    }

    // The sort order guarantees the extension columns arrive ascending, so
    // appending keeps the dependent side canonical.
    debug_assert!(a.dependent()[last] < b.dependent()[last]);
    let mut dependent = a.dependent().to_vec();
    dependent.push(b.dependent()[last]);
    let mut referenced = a.referenced().to_vec();
    referenced.push(b.referenced()[last]);
    Some(Ind::new(dependent, referenced))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: u32 = 0xffff;

    // Table r: a=0x0000, b=0x0001, c=0x0002; table s: x=0x1_0000, ...
    const A: u32 = 0x0000;
    const B: u32 = 0x0001;
    const C: u32 = 0x0002;
    const X: u32 = 0x1_0000;
    const Y: u32 = 0x1_0001;
    const Z: u32 = 0x1_0002;

    fn generate(
        new_inds: &[Ind],
        arity: usize,
        restriction: NaryIndRestriction,
    ) -> IndexSet<Ind> {
        let mut out = IndexSet::new();
        CandidateStrategy::Apriori.generate(
            new_inds,
            arity,
            restriction,
            false,
            |_| true,
            MASK,
            &mut out,
        );
        out
    }

    #[test]
    fn merges_unary_siblings() {
        let inds = vec![Ind::unary(A, X), Ind::unary(B, Y)];
        let out = generate(&inds, 2, NaryIndRestriction::NoRepetitions);
        assert_eq!(out.len(), 1);
        assert!(out.contains(&Ind::new(vec![A, B], vec![X, Y])));
    }

    #[test]
    fn same_dependent_extension_never_merges() {
        // a ⊆ x and a ⊆ y cannot grow a two-column dependent side.
        let inds = vec![Ind::unary(A, X), Ind::unary(A, Y)];
        let out = generate(&inds, 2, NaryIndRestriction::None);
        assert!(out.is_empty());
    }

    #[test]
    fn closure_check_rejects_unsupported_candidates() {
        // (a,b) ⊆ (x,y) and (a,c) ⊆ (x,z) merge to (a,b,c) ⊆ (x,y,z), but
        // the generalization (b,c) ⊆ (y,z) was never validated.
        let inds = vec![
            Ind::new(vec![A, B], vec![X, Y]),
            Ind::new(vec![A, C], vec![X, Z]),
        ];
        let out = generate(&inds, 3, NaryIndRestriction::NoRepetitions);
        assert!(out.is_empty());

        // With the generalization present, the candidate is admitted.
        let inds = vec![
            Ind::new(vec![A, B], vec![X, Y]),
            Ind::new(vec![A, C], vec![X, Z]),
            Ind::new(vec![B, C], vec![Y, Z]),
        ];
        let out = generate(&inds, 3, NaryIndRestriction::NoRepetitions);
        assert_eq!(out.len(), 1);
        assert!(out.contains(&Ind::new(vec![A, B, C], vec![X, Y, Z])));
    }

    #[test]
    fn no_repetitions_rejects_shared_columns() {
        // a ⊆ b and b ⊆ c merge to (a,b) ⊆ (b,c), in which b repeats.
        let inds = vec![Ind::unary(A, B), Ind::unary(B, C)];

        let strict = generate(&inds, 2, NaryIndRestriction::NoRepetitions);
        assert!(strict.is_empty());

        let disjoint = generate(&inds, 2, NaryIndRestriction::DepRefDisjoint);
        assert!(disjoint.is_empty());

        let lax = generate(&inds, 2, NaryIndRestriction::None);
        assert_eq!(lax.len(), 1);
        assert!(lax.contains(&Ind::new(vec![A, B], vec![B, C])));
    }

    #[test]
    fn sides_stay_within_one_table() {
        // The second IND's dependent column lives in a different table, so
        // the merged dependent side would span two tables.
        let other_table_c = 0x2_0000;
        let inds = vec![Ind::unary(A, X), Ind::unary(other_table_c, Y)];
        let out = generate(&inds, 2, NaryIndRestriction::NoRepetitions);
        assert!(out.is_empty());
    }

    #[test]
    fn void_sides_can_be_excluded() {
        let inds = vec![Ind::unary(A, X), Ind::unary(B, Y)];
        let mut out = IndexSet::new();
        CandidateStrategy::Binder.generate(
            &inds,
            2,
            NaryIndRestriction::NoRepetitions,
            true,
            |columns| columns != [B],
            MASK,
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn binder_excludes_void_by_default() {
        assert!(CandidateStrategy::Binder.excludes_void_by_default());
        assert!(!CandidateStrategy::Apriori.excludes_void_by_default());
        assert!(!CandidateStrategy::Mind.excludes_void_by_default());
    }

    #[test]
    fn consolidation_drops_implied_inds() {
        let mut all = vec![Ind::unary(A, X), Ind::unary(C, Z)];
        let new = vec![Ind::new(vec![A, B], vec![X, Y])];
        CandidateStrategy::Apriori.consolidate(&mut all, &new);
        assert_eq!(all, vec![Ind::unary(C, Z)]);
    }
}
