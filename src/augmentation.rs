//! Extraction of IND augmentation rules after each validation pass.
//!
//! Two families of rules are detected. *Void rules* cover INDs whose
//! dependent side has no distinct tuples and therefore holds vacuously;
//! representing them as rules staves off the search-space inflation they
//! would otherwise cause. *Equivalence rules* cover positions whose removal
//! leaves the referenced side with identical distinct and null counts: the
//! wider IND adds no information over its generalization, so the position is
//! recorded as a rule and the IND itself is suppressed. Every suppressed IND
//! is recoverable by composing a rule with a surviving lower-arity IND.

use tracing::debug;

use crate::common::{sorted_columns, Ind, IndAugmentationRule, LevelStatistics};

/// Applies the unary void rule to the INDs of the arity-1 pass: an IND whose
/// dependent column has no distinct values, or whose referenced column has
/// exactly one, is rewritten to a 0-ary rule and removed from `new_inds`.
pub fn extract_unary_rules(
    new_inds: &mut Vec<Ind>,
    statistics: &LevelStatistics,
    rules: &mut Vec<IndAugmentationRule>,
) {
    new_inds.retain(|ind| {
        debug_assert_eq!(ind.arity(), 1);
        let dependent_distinct = statistics.distinct_count(ind.dependent());
        let referenced_distinct = statistics.distinct_count(ind.referenced());
        if dependent_distinct == 0 || referenced_distinct == 1 {
            let rule = IndAugmentationRule::new(Ind::empty(), ind.clone());
            debug!("Discovered {rule}.");
            rules.push(rule);
            false
        } else {
            true
        }
    });
}

/// Applies the n-ary void and equivalence rules to the INDs of an arity-`k`
/// pass (`k >= 2`). `current` holds the combination statistics of arity `k`,
/// `previous` those of arity `k - 1`. INDs that produced at least one rule
/// are removed from `new_inds`.
pub fn extract_nary_rules(
    new_inds: &mut Vec<Ind>,
    current: &LevelStatistics,
    previous: &LevelStatistics,
    rules: &mut Vec<IndAugmentationRule>,
) {
    new_inds.retain(|ind| {
        debug_assert!(ind.arity() >= 2);
        let mut embedded = false;

        let sorted_dependent = sorted_columns(ind.dependent());
        if current.distinct_count(&sorted_dependent) == 0 {
            // A void dependent side holds against anything; one rule per
            // position covers every way of reaching this IND.
            for position in 0..ind.arity() {
                let rule =
                    IndAugmentationRule::new(ind.coproject(position), ind.project(position));
                debug!("Discovered {rule} (void IND).");
                rules.push(rule);
            }
            embedded = true;
        } else {
            let sorted_referenced = sorted_columns(ind.referenced());
            let referenced_distinct = current.distinct_count(&sorted_referenced);
            let referenced_nulls = current.null_count(&sorted_referenced);
            for position in 0..ind.arity() {
                let general = ind.coproject(position);
                let general_referenced = sorted_columns(general.referenced());
                if previous.distinct_count(&general_referenced) == referenced_distinct
                    && previous.null_count(&general_referenced) == referenced_nulls
                {
                    let rule = IndAugmentationRule::new(general, ind.project(position));
                    debug!("Discovered {rule}.");
                    rules.push(rule);
                    embedded = true;
                }
            }
        }

        !embedded
    });
}

// ============================================================================
// Tests
// ============================================================================
