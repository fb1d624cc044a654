//! Cell emission: flat-mapping input rows into `(value, id)` shuffle
//! records for the validation passes.
//!
//! The unary emitter produces one record per non-dropped cell, keyed by the
//! cell value with the column id as payload. The n-ary emitter produces one
//! record per candidate column combination of the row's table, keyed by the
//! projected tuple with the combination id as payload. Null handling, row
//! sampling, and column caps are applied here so the substrate stays
//! agnostic of them.

use std::collections::HashMap;

/// Sentinel value emitted for null cells when nulls are kept. Cannot occur
/// in parsed field data.
pub const NULL_SENTINEL: &str = "\u{0}";

/// Separator joining tuple components into an n-ary shuffle key. Cannot
/// occur in parsed field data.
pub const TUPLE_SEPARATOR: char = '\u{1}';

// ============================================================================
// Settings
// ============================================================================

/// Row-level emission policy, shared by both emitters.
#[derive(Debug, Clone)]
pub struct EmitterSettings {
    /// The string that denotes a null cell.
    pub null_string: String,
    /// Discard null cells (or tuples with a null component) instead of
    /// emitting them under [`NULL_SENTINEL`].
    pub drop_nulls: bool,
    /// Silently skip rows whose field count differs from the header width.
    pub drop_differing_lines: bool,
}

impl EmitterSettings {
    fn is_null(&self, value: &str) -> bool {
        value == self.null_string
    }
}

// ============================================================================
// Emission Output
// ============================================================================

/// Worker-local emission buffers: shuffle records plus the null-count side
/// channel. Merged across workers by the substrate.
#[derive(Debug, Default)]
pub struct EmitBuffer {
    pub cells: Vec<(String, u32)>,
    pub null_counts: HashMap<u32, u64>,
}

impl EmitBuffer {
    fn count_null(&mut self, id: u32) {
        *self.null_counts.entry(id).or_insert(0) += 1;
    }
}

// ============================================================================
// Unary Emitter
// ============================================================================

/// Emits one `(value, columnId)` record per cell of each row.
#[derive(Debug, Clone)]
pub struct UnaryEmitter {
    /// Column-0 id of the table.
    base_column_id: u32,
    /// Number of columns to emit, after the per-table column cap.
    num_columns: usize,
    /// Header width of the table, for differing-line detection.
    declared_width: usize,
    settings: EmitterSettings,
}

impl UnaryEmitter {
    pub fn new(
        base_column_id: u32,
        num_columns: usize,
        declared_width: usize,
        settings: EmitterSettings,
    ) -> Self {
        UnaryEmitter {
            base_column_id,
            num_columns,
            declared_width,
            settings,
        }
    }

    /// The number of columns this emitter covers.
    pub fn width(&self) -> usize {
        self.num_columns
    }

    pub fn emit_row(&self, row: &[String], out: &mut EmitBuffer) {
        if self.settings.drop_differing_lines && row.len() != self.declared_width {
            return;
        }
        for (i, value) in row.iter().take(self.num_columns).enumerate() {
            let column_id = self.base_column_id + i as u32;
            if self.settings.is_null(value) {
                out.count_null(column_id);
                if !self.settings.drop_nulls {
                    out.cells.push((NULL_SENTINEL.to_owned(), column_id));
                }
            } else {
                out.cells.push((value.clone(), column_id));
            }
        }
    }
}

// ============================================================================
// N-ary Emitter
// ============================================================================

/// One candidate column combination of a table, with the row positions to
/// project.
#[derive(Debug, Clone)]
pub struct TupleProjection {
    pub combination_id: u32,
    /// Column indices within the table, ascending.
    pub positions: Vec<usize>,
}

/// Emits one `(tuple, combinationId)` record per candidate combination of
/// each row. Null policy applies tuple-wise: a tuple with any null component
/// counts as null for its combination.
#[derive(Debug, Clone)]
pub struct NaryEmitter {
    projections: Vec<TupleProjection>,
    declared_width: usize,
    settings: EmitterSettings,
}

impl NaryEmitter {
    pub fn new(
        projections: Vec<TupleProjection>,
        declared_width: usize,
        settings: EmitterSettings,
    ) -> Self {
        NaryEmitter {
            projections,
            declared_width,
            settings,
        }
    }

    pub fn emit_row(&self, row: &[String], out: &mut EmitBuffer) {
        if self.settings.drop_differing_lines && row.len() != self.declared_width {
            return;
        }
        for projection in &self.projections {
            // A short row cannot fill this combination; emit what can be
            // emitted for the others.
            if projection.positions.iter().any(|&p| p >= row.len()) {
                continue;
            }

            let mut any_null = false;
            for &position in &projection.positions {
                if self.settings.is_null(&row[position]) {
                    any_null = true;
                    break;
                }
            }
            if any_null {
                out.count_null(projection.combination_id);
                if self.settings.drop_nulls {
                    continue;
                }
            }

            let mut key = String::new();
            for (i, &position) in projection.positions.iter().enumerate() {
                if i > 0 {
                    key.push(TUPLE_SEPARATOR);
                }
                let value = &row[position];
                if self.settings.is_null(value) {
                    key.push_str(NULL_SENTINEL);
                } else {
                    key.push_str(value);
                }
            }
            out.cells.push((key, projection.combination_id));
        }
    }
}

// ============================================================================
// Table Emitter
// ============================================================================

/// The emitter variant a pass runs against one table.
#[derive(Debug, Clone)]
pub enum TableEmitter {
    Unary(UnaryEmitter),
    Nary(NaryEmitter),
}

impl TableEmitter {
    pub fn emit_row(&self, row: &[String], out: &mut EmitBuffer) {
        match self {
            TableEmitter::Unary(emitter) => emitter.emit_row(row, out),
            TableEmitter::Nary(emitter) => emitter.emit_row(row, out),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
