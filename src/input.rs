//! Tabular input sources and the table index.
//!
//! The engine is written against the [`TableInput`] trait; a CSV-backed
//! implementation and an in-memory implementation are provided. Indexing
//! assigns each input a table id from the column-id codec and records its
//! relation name and column names for rendering results.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::common::{ColumnCodec, Ind};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum InputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),

    #[error("input file has no header row: {path:?}")]
    MissingHeader { path: PathBuf },

    #[error("too many input tables: the column-id codec addresses at most {limit}")]
    TooManyTables { limit: u64 },
}

// ============================================================================
// Input Sources
// ============================================================================

/// A restartable iterator over the rows of one input table.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Vec<String>, InputError>> + Send + 'a>;

/// One tabular input: a relation name, an ordered column-name list, and a
/// restartable row iterator. Each call to [`TableInput::rows`] starts a
/// fresh pass over the data.
pub trait TableInput: Send + Sync {
    fn relation_name(&self) -> &str;

    fn column_names(&self) -> Result<Vec<String>, InputError>;

    fn rows(&self) -> Result<RowIter<'_>, InputError>;
}

// ============================================================================
// CSV Input
// ============================================================================

/// CSV parsing controls, propagated to [`CsvTableInput`].
#[derive(Debug, Clone)]
pub struct CsvSettings {
    /// Field separator byte.
    pub field_separator: u8,
    /// Quote character byte.
    pub quote_char: u8,
    /// Escape character; `None` means quotes are escaped by doubling.
    pub escape_char: Option<u8>,
    /// The string that denotes a null cell. The empty string means empty
    /// cells are null.
    pub null_string: String,
    /// Silently skip rows whose field count differs from the header.
    pub drop_differing_lines: bool,
    /// Trim whitespace around unquoted fields.
    pub ignore_leading_whitespace: bool,
    /// Accepted for compatibility with strict-quoting CSV dialects; the
    /// parser currently treats it as standard quoting.
    pub use_strict_quotes: bool,
}

impl Default for CsvSettings {
    fn default() -> Self {
        CsvSettings {
            field_separator: b',',
            quote_char: b'"',
            escape_char: None,
            null_string: String::new(),
            drop_differing_lines: false,
            ignore_leading_whitespace: true,
            use_strict_quotes: false,
        }
    }
}

impl CsvSettings {
    fn reader_builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(self.field_separator)
            .quote(self.quote_char)
            .escape(self.escape_char)
            .double_quote(self.escape_char.is_none())
            .trim(if self.ignore_leading_whitespace {
                csv::Trim::Fields
            } else {
                csv::Trim::None
            })
            // Differing field counts are handled row-wise by the cell
            // emitters, which either drop or partially emit such rows.
            .flexible(true)
            .has_headers(true);
        builder
    }
}

/// A CSV file offered as a [`TableInput`]. The first record is the header;
/// the relation name is the file stem.
pub struct CsvTableInput {
    path: PathBuf,
    name: String,
    settings: CsvSettings,
}

impl CsvTableInput {
    pub fn new(path: impl Into<PathBuf>, settings: CsvSettings) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        CsvTableInput {
            path,
            name,
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<csv::Reader<std::fs::File>, InputError> {
        Ok(self.settings.reader_builder().from_path(&self.path)?)
    }
}

impl TableInput for CsvTableInput {
    fn relation_name(&self) -> &str {
        &self.name
    }

    fn column_names(&self) -> Result<Vec<String>, InputError> {
        let mut reader = self.open()?;
        let headers = reader.headers()?;
        if headers.is_empty() {
            return Err(InputError::MissingHeader {
                path: self.path.clone(),
            });
        }
        Ok(headers.iter().map(str::to_owned).collect())
    }

    fn rows(&self) -> Result<RowIter<'_>, InputError> {
        let reader = self.open()?;
        Ok(Box::new(reader.into_records().map(|record| {
            let record = record?;
            Ok(record.iter().map(str::to_owned).collect())
        })))
    }
}

// ============================================================================
// In-Memory Input
// ============================================================================

/// An in-memory [`TableInput`], used by tests and embedders that already
/// hold their rows.
pub struct MemoryTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MemoryTable {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<&str>,
        rows: Vec<Vec<&str>>,
    ) -> Self {
        MemoryTable {
            name: name.into(),
            columns: columns.into_iter().map(str::to_owned).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(str::to_owned).collect())
                .collect(),
        }
    }
}

impl TableInput for MemoryTable {
    fn relation_name(&self) -> &str {
        &self.name
    }

    fn column_names(&self) -> Result<Vec<String>, InputError> {
        Ok(self.columns.clone())
    }

    fn rows(&self) -> Result<RowIter<'_>, InputError> {
        Ok(Box::new(self.rows.iter().cloned().map(Ok)))
    }
}

// ============================================================================
// Table Index
// ============================================================================

/// One indexed input table.
#[derive(Debug, Clone)]
pub struct IndexedTable {
    pub table_id: u32,
    pub name: String,
    pub column_names: Vec<String>,
}

/// The assignment of table ids to inputs, with the names needed to render
/// discovered INDs. Built once before the first pass; column ids never
/// change afterwards.
#[derive(Debug, Clone)]
pub struct TableIndex {
    codec: ColumnCodec,
    tables: Vec<IndexedTable>,
    by_table_id: HashMap<u32, usize>,
}

impl TableIndex {
    /// Indexes `inputs` in order, reading each input's relation name and
    /// column names.
    pub fn build(
        codec: ColumnCodec,
        inputs: &[Box<dyn TableInput>],
    ) -> Result<Self, InputError> {
        if inputs.len() as u64 > codec.max_tables() {
            return Err(InputError::TooManyTables {
                limit: codec.max_tables(),
            });
        }

        let mut tables = Vec::with_capacity(inputs.len());
        let mut by_table_id = HashMap::with_capacity(inputs.len());
        for (input, table_id) in inputs.iter().zip(codec.table_ids()) {
            by_table_id.insert(table_id, tables.len());
            tables.push(IndexedTable {
                table_id,
                name: input.relation_name().to_owned(),
                column_names: input.column_names()?,
            });
        }
        Ok(TableIndex {
            codec,
            tables,
            by_table_id,
        })
    }

    pub fn codec(&self) -> &ColumnCodec {
        &self.codec
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedTable> {
        self.tables.iter()
    }

    pub fn table(&self, table_id: u32) -> Option<&IndexedTable> {
        self.by_table_id.get(&table_id).map(|&i| &self.tables[i])
    }

    /// Renders an IND with table and column names, e.g.
    /// `orders[customer_id] ⊆ customers[id]`.
    pub fn render(&self, ind: &Ind) -> String {
        if ind.arity() == 0 {
            return "[] \u{2286} []".to_owned();
        }
        let mut out = String::new();
        self.render_side(&mut out, ind.dependent());
        out.push_str(" \u{2286} ");
        self.render_side(&mut out, ind.referenced());
        out
    }

    fn render_side(&self, out: &mut String, columns: &[u32]) {
        let table_id = self.codec.table_id_of(columns[0]);
        match self.table(table_id) {
            Some(table) => {
                out.push_str(&table.name);
                out.push('[');
                for (i, &column) in columns.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let index = self.codec.column_index_of(column) as usize;
                    match table.column_names.get(index) {
                        Some(name) => out.push_str(name),
                        None => {
                            let _ = write!(out, "{index}");
                        }
                    }
                }
                out.push(']');
            }
            None => {
                let _ = write!(out, "{columns:?}");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn two_table_index() -> TableIndex {
        let inputs: Vec<Box<dyn TableInput>> = vec![
            Box::new(MemoryTable::new(
                "orders",
                vec!["id", "customer_id"],
                vec![],
            )),
            Box::new(MemoryTable::new("customers", vec!["id"], vec![])),
        ];
        TableIndex::build(ColumnCodec::new(16), &inputs).unwrap()
    }

    #[test]
    fn index_assigns_table_ids_in_order() {
        let index = two_table_index();
        assert_eq!(index.len(), 2);
        let ids: Vec<u32> = index.iter().map(|t| t.table_id).collect();
        assert_eq!(ids, vec![0xffff, 0x1_ffff]);
        assert_eq!(index.table(0x1_ffff).unwrap().name, "customers");
        assert!(index.table(0x2_ffff).is_none());
    }

    #[test]
    fn render_resolves_names() {
        let index = two_table_index();
        let ind = Ind::unary(0x0001, 0x1_0000);
        assert_eq!(index.render(&ind), "orders[customer_id] \u{2286} customers[id]");
        assert_eq!(index.render(&Ind::empty()), "[] \u{2286} []");
    }

    #[test]
    fn csv_input_reads_headers_and_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a,b").unwrap();
        writeln!(file, "1, 10").unwrap();
        writeln!(file, "2,\"2,0\"").unwrap();
        file.flush().unwrap();

        let input = CsvTableInput::new(file.path(), CsvSettings::default());
        assert_eq!(input.column_names().unwrap(), vec!["a", "b"]);

        let rows: Vec<Vec<String>> = input.rows().unwrap().map(Result::unwrap).collect();
        assert_eq!(rows, vec![vec!["1", "10"], vec!["2", "2,0"]]);

        // A fresh iterator restarts from the top.
        let again: Vec<Vec<String>> = input.rows().unwrap().map(Result::unwrap).collect();
        assert_eq!(again, rows);
    }

    #[test]
    fn csv_input_honours_separator() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "x;y").unwrap();
        writeln!(file, "7;8").unwrap();
        file.flush().unwrap();

        let settings = CsvSettings {
            field_separator: b';',
            ..CsvSettings::default()
        };
        let input = CsvTableInput::new(file.path(), settings);
        assert_eq!(input.column_names().unwrap(), vec!["x", "y"]);
        let rows: Vec<Vec<String>> = input.rows().unwrap().map(Result::unwrap).collect();
        assert_eq!(rows, vec![vec!["7", "8"]]);
    }
}
