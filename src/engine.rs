//! The run controller: drives the per-arity validation passes, owns the
//! discovered IND and augmentation-rule sets, and consolidates the final
//! result.
//!
//! Arity 1 runs the unary pipeline and seeds the statistics tables; every
//! further arity generates candidates from the previous level, validates
//! them through the substrate, extracts augmentation rules, and consolidates
//! the cumulative IND set. Arities are strictly sequential; inside a pass
//! the substrate parallelises freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::augmentation;
use crate::candidates::{CandidateStrategy, NaryIndRestriction};
use crate::cells::{EmitterSettings, NaryEmitter, TableEmitter, UnaryEmitter};
use crate::combinations::CombinationIndex;
use crate::common::{
    sorted_columns, AttributeSet, ColumnCodec, Ind, IndAugmentationRule, LevelStatistics,
    Statistics,
};
use crate::input::{CsvSettings, InputError, TableIndex, TableInput};
use crate::substrate::{
    CollectorHandle, InclusionPass, InclusionSink, JobResult, PassTable, Substrate,
    SubstrateError, DISTINCT_VALUES_KEY, NULL_VALUES_KEY, TABLE_WIDTHS_KEY,
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("input failure")]
    Input(#[from] InputError),

    #[error("execution substrate failure")]
    Substrate(#[from] SubstrateError),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("run cancelled")]
    Cancelled,
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration. Sentinel value `-1` means "unbounded" for the
/// integer caps, mirroring the command-line surface.
///
/// There is deliberately no `Default` implementation: null handling changes
/// discovered results, so `drop_nulls` must be chosen explicitly via
/// [`DiscoveryConfig::new`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Number of bits of a column id reserved for the column index.
    pub num_column_bits: u32,
    /// Upper bound on discovered arity; `-1` exhausts the search space.
    pub max_arity: i32,
    /// Stop after the unary pass and report the IND count only.
    pub only_count_inds: bool,
    /// Cap on columns per table; `-1` for all.
    pub max_columns: i32,
    /// Emit only the first N rows of each table; `-1` for all.
    pub sample_rows: i64,
    /// Discard null cells rather than emitting them under a sentinel.
    pub drop_nulls: bool,
    /// Keep trivial INDs (`c ⊆ c`) instead of filtering them.
    pub keep_trivial_inds: bool,
    /// Hint the substrate to group by sorting instead of hashing.
    pub not_use_group_operators: bool,
    /// Exclude void sides from candidate generation; `None` defers to the
    /// candidate strategy's default.
    pub exclude_void_inds: Option<bool>,
    /// Restriction on n-ary candidates; required whenever `max_arity != 1`.
    pub nary_restriction: Option<NaryIndRestriction>,
    /// Candidate-generation strategy; required whenever `max_arity != 1`.
    pub candidate_strategy: Option<CandidateStrategy>,
    /// Candidates per n-ary validation pass; `-1` validates each arity in
    /// one pass.
    pub candidate_chunk_size: i64,
    /// CSV parsing controls, propagated to the input iterators.
    pub csv: CsvSettings,
}

impl DiscoveryConfig {
    pub fn new(drop_nulls: bool) -> Self {
        DiscoveryConfig {
            num_column_bits: 16,
            max_arity: -1,
            only_count_inds: false,
            max_columns: -1,
            sample_rows: -1,
            drop_nulls,
            keep_trivial_inds: false,
            not_use_group_operators: false,
            exclude_void_inds: None,
            nary_restriction: None,
            candidate_strategy: None,
            candidate_chunk_size: -1,
            csv: CsvSettings::default(),
        }
    }
}

/// The configuration after validation, with sentinels resolved.
struct EffectiveConfig {
    max_arity: Option<usize>,
    only_count_inds: bool,
    max_columns: Option<usize>,
    sample_rows: Option<u64>,
    restriction: NaryIndRestriction,
    strategy: CandidateStrategy,
    exclude_void: bool,
    chunk_size: Option<usize>,
}

impl EffectiveConfig {
    fn allows(&self, arity: usize) -> bool {
        self.max_arity.map_or(true, |max| arity <= max)
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Receives every discovered IND exactly once, as soon as it is known.
/// Invoked from worker context; implementations must be thread-safe.
pub trait IndSink: Send + Sync {
    fn collect(&self, ind: &Ind);
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// INDs streamed to the sink across all passes, including non-maximal
    /// ones.
    pub num_discovered_inds: u64,
    /// Maximal INDs after consolidation.
    pub num_consolidated_inds: usize,
    /// Augmentation rules extracted across all arities.
    pub num_augmentation_rules: usize,
    /// Highest arity that was validated.
    pub max_arity_processed: usize,
}

// ============================================================================
// Run Collector
// ============================================================================

/// How the collector resolves reduced ids back into INDs.
enum CollectMode {
    /// Ids are plain column ids.
    Unary,
    /// Ids are combination ids of the current arity; resolved INDs must be
    /// members of the current candidate chunk.
    Nary {
        combinations: Arc<CombinationIndex>,
        candidates: Arc<IndexSet<Ind>>,
    },
}

/// The engine-side collector registered with the substrate for the duration
/// of a run. Thread-safe; receives inclusion sets from worker context.
struct RunCollector {
    sink: Option<Arc<dyn IndSink>>,
    keep_trivial: bool,
    mode: Mutex<CollectMode>,
    inds: Mutex<Vec<Ind>>,
    discovered: AtomicU64,
}

impl RunCollector {
    fn new(sink: Option<Arc<dyn IndSink>>, keep_trivial: bool) -> Self {
        RunCollector {
            sink,
            keep_trivial,
            mode: Mutex::new(CollectMode::Unary),
            inds: Mutex::new(Vec::new()),
            discovered: AtomicU64::new(0),
        }
    }

    fn set_unary_mode(&self) {
        *self.mode.lock() = CollectMode::Unary;
    }

    fn set_nary_mode(&self, combinations: Arc<CombinationIndex>, candidates: Arc<IndexSet<Ind>>) {
        *self.mode.lock() = CollectMode::Nary {
            combinations,
            candidates,
        };
    }

    /// Drains the INDs collected since the last call.
    fn take_inds(&self) -> Vec<Ind> {
        std::mem::take(&mut *self.inds.lock())
    }

    fn discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }

    fn collect_ind(&self, ind: Ind) {
        if let Some(sink) = &self.sink {
            sink.collect(&ind);
        }
        debug!("Discovered {ind} (might be non-maximal).");
        self.inds.lock().push(ind);

        let total = self.discovered.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 1_000_000 == 0 {
            info!("{total} INDs added so far.");
        }
    }
}

impl InclusionSink for RunCollector {
    fn collect(&self, dependent: u32, referenced: &AttributeSet) {
        let mode = self.mode.lock();
        for referenced_id in referenced.iter() {
            let ind = match &*mode {
                CollectMode::Unary => Ind::unary(dependent, referenced_id),
                CollectMode::Nary {
                    combinations,
                    candidates,
                } => {
                    let (Some(dependent_columns), Some(referenced_columns)) = (
                        combinations.columns_of(dependent),
                        combinations.columns_of(referenced_id),
                    ) else {
                        warn!(
                            "Dropping inclusion of unknown combination ({dependent}, {referenced_id})."
                        );
                        continue;
                    };
                    let ind = Ind::new(dependent_columns.to_vec(), referenced_columns.to_vec());
                    if !candidates.contains(&ind) {
                        info!("Rejected n-ary pseudo IND {ind}.");
                        continue;
                    }
                    ind
                }
            };
            if ind.is_trivial() && !self.keep_trivial {
                continue;
            }
            self.collect_ind(ind);
        }
    }
}

// ============================================================================
// Discovery Engine
// ============================================================================

/// The IND discovery engine. Construct with the configuration, the input
/// tables, and a substrate, then call [`Discovery::run`]; the consolidated
/// IND set and the augmentation rules are available afterwards.
pub struct Discovery<S: Substrate> {
    config: DiscoveryConfig,
    inputs: Vec<Box<dyn TableInput>>,
    substrate: S,
    ind_sink: Option<Arc<dyn IndSink>>,
    cancel: Arc<AtomicBool>,
    table_index: Option<TableIndex>,
    all_inds: Vec<Ind>,
    augmentation_rules: Vec<IndAugmentationRule>,
    num_discovered: u64,
}

impl<S: Substrate> Discovery<S> {
    pub fn new(config: DiscoveryConfig, inputs: Vec<Box<dyn TableInput>>, substrate: S) -> Self {
        Discovery {
            config,
            inputs,
            substrate,
            ind_sink: None,
            cancel: Arc::new(AtomicBool::new(false)),
            table_index: None,
            all_inds: Vec::new(),
            augmentation_rules: Vec::new(),
            num_discovered: 0,
        }
    }

    /// Streams every discovered IND to `sink` as soon as it is known.
    pub fn with_ind_sink(mut self, sink: Arc<dyn IndSink>) -> Self {
        self.ind_sink = Some(sink);
        self
    }

    /// A flag that aborts the run at the next pass boundary when set.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// The maximal INDs of the last run, with non-maximal results removed.
    pub fn consolidated_inds(&self) -> &[Ind] {
        &self.all_inds
    }

    /// The augmentation rules of the last run.
    pub fn augmentation_rules(&self) -> &[IndAugmentationRule] {
        &self.augmentation_rules
    }

    /// The number of INDs discovered in the last run, including non-maximal
    /// ones.
    pub fn num_discovered_inds(&self) -> u64 {
        self.num_discovered
    }

    /// The table index of the last run, for rendering results.
    pub fn table_index(&self) -> Option<&TableIndex> {
        self.table_index.as_ref()
    }

    /// Runs discovery to completion. Returns a summary, or exactly one
    /// error; the streaming collector is released on every exit path.
    pub fn run(&mut self) -> Result<RunSummary, DiscoveryError> {
        let effective = self.validate_config()?;
        let codec = ColumnCodec::new(self.config.num_column_bits);
        let table_index = TableIndex::build(codec, &self.inputs)?;
        info!("Indexed {} tables.", table_index.len());

        self.all_inds = Vec::new();
        self.augmentation_rules = Vec::new();
        self.num_discovered = 0;

        let collector = Arc::new(RunCollector::new(
            self.ind_sink.clone(),
            self.config.keep_trivial_inds,
        ));
        // Scoped registration: released when `handle` drops, on success and
        // on every error path out of this function.
        let handle = CollectorHandle::register(collector.clone());

        let result = self.execute_run(&effective, &codec, &table_index, &collector, &handle);
        self.num_discovered = collector.discovered();
        self.table_index = Some(table_index);
        result
    }

    fn execute_run(
        &mut self,
        effective: &EffectiveConfig,
        codec: &ColumnCodec,
        table_index: &TableIndex,
        collector: &Arc<RunCollector>,
        handle: &CollectorHandle,
    ) -> Result<RunSummary, DiscoveryError> {
        let mut statistics = Statistics::new();
        let mut rules = Vec::new();

        // ── Arity 1 ─────────────────────────────────────────────────────
        self.check_cancelled()?;
        collector.set_unary_mode();
        let pass = self.build_unary_pass(effective, table_index, handle.id());
        let job = self.substrate.execute(pass)?;

        for (&table_id, &width) in accumulator_entries(&job, TABLE_WIDTHS_KEY) {
            statistics.set_table_width(table_id, width as u32);
        }
        let mut level = LevelStatistics::default();
        for (&id, &count) in accumulator_entries(&job, DISTINCT_VALUES_KEY) {
            level.record_distinct(Box::new([id]), count);
        }
        for (&id, &count) in accumulator_entries(&job, NULL_VALUES_KEY) {
            level.record_nulls(Box::new([id]), count);
        }

        let mut new_inds = collector.take_inds();

        if effective.only_count_inds {
            let count = new_inds.len();
            info!("Discovered {count} unary INDs.");
            return Ok(RunSummary {
                num_discovered_inds: count as u64,
                num_consolidated_inds: 0,
                num_augmentation_rules: 0,
                max_arity_processed: 1,
            });
        }

        // Void columns never reach the reduce stage; their INDs against
        // every other column are synthesized here and rewritten to 0-ary
        // rules just below.
        let all_columns = statistics.all_column_ids(codec);
        for &dependent in &all_columns {
            if level.distinct_count(&[dependent]) == 0 {
                for &referenced in &all_columns {
                    if dependent != referenced {
                        collector.collect_ind(Ind::unary(dependent, referenced));
                    }
                }
            }
        }
        new_inds.extend(collector.take_inds());

        augmentation::extract_unary_rules(&mut new_inds, &level, &mut rules);
        statistics.push_level(level);
        info!(
            "Arity 1: {} candidates, {} INDs, {} augmentation rules.",
            all_columns.len() * all_columns.len().saturating_sub(1),
            new_inds.len(),
            rules.len(),
        );

        let mut all_inds = new_inds.clone();
        let mut max_arity_processed = 1;

        // ── Arity k >= 2 ────────────────────────────────────────────────
        let mut arity = 2;
        while !new_inds.is_empty() && effective.allows(arity) {
            self.check_cancelled()?;

            let previous = statistics_level(&statistics, arity - 1)?;
            let mut candidates = IndexSet::new();
            effective.strategy.generate(
                &new_inds,
                arity,
                effective.restriction,
                effective.exclude_void,
                |columns| previous.distinct_count(&sorted_columns(columns)) > 0,
                codec.mask(),
                &mut candidates,
            );
            info!("Generated {} IND candidates.", candidates.len());
            if candidates.is_empty() {
                break;
            }
            let num_candidates = candidates.len();

            let combinations = Arc::new(CombinationIndex::from_candidates(&candidates));
            let candidates = Arc::new(candidates);
            let chunks = chunk_candidates(&candidates, effective.chunk_size);
            let num_chunks = chunks.len();

            let mut level = LevelStatistics::default();
            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                collector.set_nary_mode(combinations.clone(), chunk.clone());
                let pass = self.build_nary_pass(
                    effective,
                    table_index,
                    &combinations,
                    &chunk,
                    arity,
                    chunk_index + 1,
                    num_chunks,
                    handle.id(),
                );
                let job = self.substrate.execute(pass)?;

                for (&id, &count) in accumulator_entries(&job, DISTINCT_VALUES_KEY) {
                    let columns = combination_columns(&combinations, id)?;
                    level.record_distinct(sorted_columns(columns), count);
                }
                for (&id, &count) in accumulator_entries(&job, NULL_VALUES_KEY) {
                    let columns = combination_columns(&combinations, id)?;
                    level.record_nulls(sorted_columns(columns), count);
                }
            }

            new_inds = collector.take_inds();
            let num_validated = new_inds.len();

            let num_prev_rules = rules.len();
            {
                let previous = statistics_level(&statistics, arity - 1)?;
                augmentation::extract_nary_rules(&mut new_inds, &level, previous, &mut rules);
            }
            statistics.push_level(level);
            info!(
                "Arity {arity}: {num_candidates} candidates, {num_validated} INDs validated, \
                 {} kept, {} augmentation rules.",
                new_inds.len(),
                rules.len() - num_prev_rules,
            );

            effective.strategy.consolidate(&mut all_inds, &new_inds);
            all_inds.extend(new_inds.iter().cloned());
            max_arity_processed = arity;
            arity += 1;
        }

        self.all_inds = all_inds;
        self.augmentation_rules = rules;
        Ok(RunSummary {
            num_discovered_inds: collector.discovered(),
            num_consolidated_inds: self.all_inds.len(),
            num_augmentation_rules: self.augmentation_rules.len(),
            max_arity_processed,
        })
    }

    fn check_cancelled(&self) -> Result<(), DiscoveryError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(DiscoveryError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn validate_config(&self) -> Result<EffectiveConfig, DiscoveryError> {
        let config = &self.config;
        if !(1..=31).contains(&config.num_column_bits) {
            return Err(DiscoveryError::Configuration(format!(
                "num_column_bits must be in [1, 31], got {}",
                config.num_column_bits
            )));
        }

        let mut max_arity = match config.max_arity {
            -1 => None,
            n if n >= 1 => Some(n as usize),
            n => {
                return Err(DiscoveryError::Configuration(format!(
                    "max_arity must be -1 or >= 1, got {n}"
                )))
            }
        };
        if config.only_count_inds && max_arity != Some(1) {
            warn!("Counting only, will process only unary INDs.");
            max_arity = Some(1);
        }

        let (restriction, strategy) = if max_arity == Some(1) {
            // Unused beyond arity 1; any values serve.
            (
                config.nary_restriction.unwrap_or(NaryIndRestriction::NoRepetitions),
                config.candidate_strategy.unwrap_or(CandidateStrategy::Apriori),
            )
        } else {
            match (config.nary_restriction, config.candidate_strategy) {
                (Some(restriction), Some(strategy)) => (restriction, strategy),
                _ => {
                    return Err(DiscoveryError::Configuration(
                        "no n-ary IND restrictions and/or candidate generator set up".to_owned(),
                    ))
                }
            }
        };

        let max_columns = match config.max_columns {
            -1 => None,
            n if n >= 1 => Some(n as usize),
            n => {
                return Err(DiscoveryError::Configuration(format!(
                    "max_columns must be -1 or >= 1, got {n}"
                )))
            }
        };
        let sample_rows = match config.sample_rows {
            -1 => None,
            n if n >= 0 => Some(n as u64),
            n => {
                return Err(DiscoveryError::Configuration(format!(
                    "sample_rows must be -1 or >= 0, got {n}"
                )))
            }
        };
        let chunk_size = match config.candidate_chunk_size {
            -1 => None,
            n if n >= 1 => Some(n as usize),
            n => {
                return Err(DiscoveryError::Configuration(format!(
                    "candidate_chunk_size must be -1 or >= 1, got {n}"
                )))
            }
        };

        Ok(EffectiveConfig {
            max_arity,
            only_count_inds: config.only_count_inds,
            max_columns,
            sample_rows,
            restriction,
            strategy,
            exclude_void: config
                .exclude_void_inds
                .unwrap_or_else(|| strategy.excludes_void_by_default()),
            chunk_size,
        })
    }

    fn emitter_settings(&self) -> EmitterSettings {
        EmitterSettings {
            null_string: self.config.csv.null_string.clone(),
            drop_nulls: self.config.drop_nulls,
            drop_differing_lines: self.config.csv.drop_differing_lines,
        }
    }

    fn build_unary_pass<'a>(
        &'a self,
        effective: &EffectiveConfig,
        table_index: &TableIndex,
        collector_id: u64,
    ) -> InclusionPass<'a> {
        let codec = table_index.codec();
        let tables = self
            .inputs
            .iter()
            .zip(table_index.iter())
            .map(|(input, table)| {
                let declared_width = table.column_names.len();
                let width = effective
                    .max_columns
                    .map_or(declared_width, |cap| declared_width.min(cap));
                PassTable {
                    table_id: table.table_id,
                    input: &**input,
                    emitter: TableEmitter::Unary(UnaryEmitter::new(
                        codec.base_of(table.table_id),
                        width,
                        declared_width,
                        self.emitter_settings(),
                    )),
                }
            })
            .collect();
        InclusionPass {
            job_name: format!("confluence on {} tables (unary)", self.inputs.len()),
            tables,
            sample_rows: effective.sample_rows,
            use_sort_grouping: self.config.not_use_group_operators,
            collector_id,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_nary_pass<'a>(
        &'a self,
        effective: &EffectiveConfig,
        table_index: &TableIndex,
        combinations: &CombinationIndex,
        chunk: &IndexSet<Ind>,
        arity: usize,
        chunk_number: usize,
        num_chunks: usize,
        collector_id: u64,
    ) -> InclusionPass<'a> {
        let mut by_table = combinations.projections_by_table(chunk, table_index);
        let tables = self
            .inputs
            .iter()
            .zip(table_index.iter())
            .filter_map(|(input, table)| {
                let projections = by_table.remove(&table.table_id)?;
                Some(PassTable {
                    table_id: table.table_id,
                    input: &**input,
                    emitter: TableEmitter::Nary(NaryEmitter::new(
                        projections,
                        table.column_names.len(),
                        self.emitter_settings(),
                    )),
                })
            })
            .collect();
        InclusionPass {
            job_name: format!(
                "confluence on {} tables ({arity}-ary, {chunk_number}/{num_chunks})",
                self.inputs.len()
            ),
            tables,
            sample_rows: effective.sample_rows,
            use_sort_grouping: self.config.not_use_group_operators,
            collector_id,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn accumulator_entries<'a>(
    job: &'a JobResult,
    key: &str,
) -> impl Iterator<Item = (&'a u32, &'a u64)> {
    job.accumulator(key)
        .map(HashMap::iter)
        .into_iter()
        .flatten()
}

fn statistics_level(statistics: &Statistics, arity: usize) -> Result<&LevelStatistics, DiscoveryError> {
    statistics.level(arity).ok_or_else(|| {
        DiscoveryError::InternalInvariant(format!("missing arity-{arity} statistics"))
    })
}

fn combination_columns(combinations: &CombinationIndex, id: u32) -> Result<&[u32], DiscoveryError> {
    combinations.columns_of(id).ok_or_else(|| {
        DiscoveryError::InternalInvariant(format!("unknown combination id {id} in accumulator"))
    })
}

/// Partitions the candidate set into validation chunks. A single chunk
/// shares the existing allocation.
fn chunk_candidates(
    candidates: &Arc<IndexSet<Ind>>,
    chunk_size: Option<usize>,
) -> Vec<Arc<IndexSet<Ind>>> {
    match chunk_size {
        Some(size) if candidates.len() > size => {
            let mut chunks = Vec::new();
            let mut current = IndexSet::with_capacity(size);
            for candidate in candidates.iter() {
                current.insert(candidate.clone());
                if current.len() == size {
                    chunks.push(Arc::new(std::mem::replace(
                        &mut current,
                        IndexSet::with_capacity(size),
                    )));
                }
            }
            if !current.is_empty() {
                chunks.push(Arc::new(current));
            }
            chunks
        }
        _ => vec![candidates.clone()],
    }
}

// ============================================================================
// Tests
// ============================================================================
