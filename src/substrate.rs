//! The execution substrate: a bulk-synchronous operator graph that runs one
//! validation pass, and the in-process implementation of it.
//!
//! A pass flat-maps input rows into `(value, id)` records, groups them by
//! value, derives the attribute set of every group, re-keys each set by its
//! members, and reduces per member by set intersection. Side statistics
//! (null counts, distinct counts, table widths) accumulate into named
//! broadcast channels readable from the [`JobResult`] after completion.
//!
//! The substrate contract: every record of a group is delivered to exactly
//! one reducer invocation, atomically; reducers are deterministic given the
//! same multiset of inputs; reduced inclusion sets reach the registered
//! collector exactly once per pass, from whatever worker surfaced them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::cells::{EmitBuffer, TableEmitter};
use crate::common::AttributeSet;
use crate::input::{InputError, TableInput};

/// Accumulator key for per-id null counts.
pub const NULL_VALUES_KEY: &str = "null-values";
/// Accumulator key for per-id distinct value counts.
pub const DISTINCT_VALUES_KEY: &str = "distinct-values";
/// Accumulator key for per-table column counts.
pub const TABLE_WIDTHS_KEY: &str = "table-widths";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("input failure during pass execution")]
    Input(#[from] InputError),

    #[error("no result collector registered under id {0}")]
    CollectorUnbound(u64),

    #[error("result collector panicked")]
    CollectorPanicked,
}

// ============================================================================
// Collector Registry
// ============================================================================

/// Receives reduced inclusion sets while a pass is executing.
///
/// `collect` is invoked from worker context; implementations must be
/// thread-safe. The delivered set is the full intersection result and still
/// contains the dependent id itself; consumers decide whether to keep the
/// reflexive pair.
pub trait InclusionSink: Send + Sync {
    fn collect(&self, dependent: u32, referenced: &AttributeSet);
}

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Arc<dyn InclusionSink>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<dyn InclusionSink>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A scoped registration of an [`InclusionSink`] in the process-wide
/// registry that workers resolve collectors through.
///
/// The registration is released when the handle drops, on every exit path
/// including panics, so a failed run never leaves a collector bound.
#[derive(Debug)]
pub struct CollectorHandle {
    id: u64,
}

impl CollectorHandle {
    pub fn register(sink: Arc<dyn InclusionSink>) -> Self {
        let id = NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed);
        registry().lock().insert(id, sink);
        CollectorHandle { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Looks up a registered collector; used by substrate workers.
    pub fn resolve(id: u64) -> Option<Arc<dyn InclusionSink>> {
        registry().lock().get(&id).cloned()
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        registry().lock().remove(&self.id);
    }
}

// ============================================================================
// Pass Description
// ============================================================================

/// One table of a pass: the input source and the emitter that flat-maps its
/// rows.
pub struct PassTable<'a> {
    pub table_id: u32,
    pub input: &'a dyn TableInput,
    pub emitter: TableEmitter,
}

/// A full description of one validation pass.
pub struct InclusionPass<'a> {
    pub job_name: String,
    pub tables: Vec<PassTable<'a>>,
    /// Emit only the first N rows of each table.
    pub sample_rows: Option<u64>,
    /// Group by sorting instead of hashing.
    pub use_sort_grouping: bool,
    /// The collector that receives reduced inclusion sets, resolved through
    /// the registry.
    pub collector_id: u64,
}

/// Accumulator side channels of a completed pass.
#[derive(Debug, Default)]
pub struct JobResult {
    accumulators: HashMap<&'static str, HashMap<u32, u64>>,
}

impl JobResult {
    pub fn accumulator(&self, key: &str) -> Option<&HashMap<u32, u64>> {
        self.accumulators.get(key)
    }
}

/// Executes validation passes. Implementations schedule the emit, group,
/// and reduce stages however they like, as long as the contract in the
/// module documentation holds.
pub trait Substrate {
    fn execute(&self, pass: InclusionPass<'_>) -> Result<JobResult, SubstrateError>;
}

// ============================================================================
// Local Substrate
// ============================================================================

/// The in-process substrate: data-parallel over the rayon thread pool, with
/// reduced inclusion sets streamed to the collector over a channel while
/// the delivering workers run.
#[derive(Debug, Default)]
pub struct LocalSubstrate;

impl LocalSubstrate {
    pub fn new() -> Self {
        LocalSubstrate
    }

    /// Emit stage for one table: iterate rows (honouring the sampling cap)
    /// and flat-map them through the table's emitter.
    fn emit_table(
        table: &PassTable<'_>,
        sample_rows: Option<u64>,
    ) -> Result<EmitBuffer, SubstrateError> {
        let mut out = EmitBuffer::default();
        let rows = table.input.rows()?;
        let mut remaining = sample_rows;
        for row in rows {
            if let Some(0) = remaining {
                break;
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
            let row = row?;
            table.emitter.emit_row(&row, &mut out);
        }
        Ok(out)
    }

    /// Group-by-value via per-worker hash maps merged pairwise.
    fn group_by_hashing(cells: Vec<(String, u32)>) -> Vec<AttributeSet> {
        let grouped: HashMap<String, Vec<u32>> = cells
            .into_par_iter()
            .fold(HashMap::new, |mut map, (value, id)| {
                map.entry(value).or_insert_with(Vec::new).push(id);
                map
            })
            .reduce(HashMap::new, |mut a, b| {
                for (value, mut ids) in b {
                    a.entry(value).or_insert_with(Vec::new).append(&mut ids);
                }
                a
            });
        grouped
            .into_par_iter()
            .map(|(_, ids)| AttributeSet::new(&ids))
            .collect()
    }

    /// Group-by-value via a parallel sort and a run-length scan; the hint
    /// for substrates without hash-based group operators.
    fn group_by_sorting(mut cells: Vec<(String, u32)>) -> Vec<AttributeSet> {
        cells.par_sort_unstable();
        let mut groups = Vec::new();
        let mut start = 0;
        while start < cells.len() {
            let value = &cells[start].0;
            let mut end = start + 1;
            while end < cells.len() && cells[end].0 == *value {
                end += 1;
            }
            let ids: Vec<u32> = cells[start..end].iter().map(|(_, id)| *id).collect();
            groups.push(AttributeSet::new(&ids));
            start = end;
        }
        groups
    }
}

impl Substrate for LocalSubstrate {
    fn execute(&self, pass: InclusionPass<'_>) -> Result<JobResult, SubstrateError> {
        let sink = CollectorHandle::resolve(pass.collector_id)
            .ok_or(SubstrateError::CollectorUnbound(pass.collector_id))?;
        info!("Executing job: {}", pass.job_name);

        // Flat-map all tables into shuffle records, in parallel.
        let buffers: Vec<EmitBuffer> = pass
            .tables
            .par_iter()
            .map(|table| Self::emit_table(table, pass.sample_rows))
            .collect::<Result<_, _>>()?;

        let mut null_counts: HashMap<u32, u64> = HashMap::new();
        let mut table_widths: HashMap<u32, u64> = HashMap::new();
        let mut cells = Vec::new();
        for buffer in buffers {
            for (id, count) in buffer.null_counts {
                *null_counts.entry(id).or_insert(0) += count;
            }
            cells.extend(buffer.cells);
        }
        for table in &pass.tables {
            if let TableEmitter::Unary(emitter) = &table.emitter {
                table_widths.insert(table.table_id, emitter.width() as u64);
            }
        }
        debug!("Emitted {} cells.", cells.len());

        // Group by value and derive the attribute set of every group.
        let groups = if pass.use_sort_grouping {
            Self::group_by_sorting(cells)
        } else {
            Self::group_by_hashing(cells)
        };
        debug!("Formed {} value groups.", groups.len());

        // Every group an id occurs in contributes one distinct value.
        let distinct_counts: HashMap<u32, u64> = groups
            .par_iter()
            .fold(HashMap::new, |mut map, set| {
                for id in set.iter() {
                    *map.entry(id).or_insert(0) += 1;
                }
                map
            })
            .reduce(HashMap::new, |mut a, b| {
                for (id, count) in b {
                    *a.entry(id).or_insert(0) += count;
                }
                a
            });

        // The universe of ids observed in this pass. Groups whose attribute
        // set is the whole universe cannot narrow any intersection, so the
        // reduce stage skips them; ids that only ever co-occurred with
        // everything resolve to the universe below.
        let universe: AttributeSet = {
            let mut ids: Vec<u32> = distinct_counts.keys().copied().collect();
            ids.sort_unstable();
            AttributeSet::from_sorted(&ids)
        };

        // Re-key each attribute set by its members and reduce per member by
        // intersection.
        let mut inclusions: HashMap<u32, AttributeSet> = groups
            .par_iter()
            .filter(|set| set.len() != universe.len())
            .fold(HashMap::new, |mut map: HashMap<u32, AttributeSet>, set| {
                for id in set.iter() {
                    match map.entry(id) {
                        Entry::Occupied(mut entry) => entry.get_mut().intersect_with(set),
                        Entry::Vacant(entry) => {
                            entry.insert(set.clone());
                        }
                    }
                }
                map
            })
            .reduce(HashMap::new, |mut a, b| {
                for (id, set) in b {
                    match a.entry(id) {
                        Entry::Occupied(mut entry) => entry.get_mut().intersect_with(&set),
                        Entry::Vacant(entry) => {
                            entry.insert(set);
                        }
                    }
                }
                a
            });

        let results: Vec<(u32, AttributeSet)> = universe
            .iter()
            .map(|id| {
                let referenced = inclusions
                    .remove(&id)
                    .unwrap_or_else(|| universe.clone());
                (id, referenced)
            })
            .collect();

        // Stream results to the collector while workers are still running;
        // each inclusion set is delivered exactly once.
        let (tx, rx) = crossbeam::channel::unbounded::<(u32, AttributeSet)>();
        let drained = std::thread::scope(|scope| {
            let sink = &*sink;
            let drain = scope.spawn(move || {
                for (dependent, referenced) in rx {
                    sink.collect(dependent, &referenced);
                }
            });
            results.into_par_iter().for_each_with(tx, |tx, result| {
                let _ = tx.send(result);
            });
            drain.join()
        });
        if drained.is_err() {
            return Err(SubstrateError::CollectorPanicked);
        }

        let mut accumulators = HashMap::new();
        accumulators.insert(NULL_VALUES_KEY, null_counts);
        accumulators.insert(DISTINCT_VALUES_KEY, distinct_counts);
        accumulators.insert(TABLE_WIDTHS_KEY, table_widths);
        Ok(JobResult { accumulators })
    }
}

// ============================================================================
// Tests
// ============================================================================
