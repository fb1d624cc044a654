//! Discover inclusion dependencies across a set of CSV tables.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin discover -- data/*.csv --drop-nulls true
//! cargo run --release --bin discover -- data/*.csv --drop-nulls true --max-arity 3 --json
//! ```

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;

use confluence::candidates::{CandidateStrategy, NaryIndRestriction};
use confluence::engine::{Discovery, DiscoveryConfig, RunSummary};
use confluence::input::{CsvSettings, CsvTableInput, TableInput};
use confluence::substrate::LocalSubstrate;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Discover inclusion dependencies across CSV tables")]
struct Args {
    /// Input CSV files, one table per file. The first record of each file
    /// is its header.
    #[arg(required = true)]
    tables: Vec<PathBuf>,

    /// Number of bits of a column id reserved for the column index.
    #[arg(long, default_value_t = 16)]
    num_column_bits: u32,

    /// Maximum IND arity to search; -1 exhausts the search space.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    max_arity: i32,

    /// Stop after the unary pass and report the IND count only.
    #[arg(long, action = ArgAction::SetTrue)]
    only_count_inds: bool,

    /// Cap on columns per table; -1 for all.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    max_columns: i32,

    /// Process only the first N rows of each table; -1 for all.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    sample_rows: i64,

    /// Discard null cells rather than emitting them as a shared sentinel.
    /// Required: the choice changes discovered results.
    #[arg(long, required = true, action = ArgAction::Set)]
    drop_nulls: bool,

    /// Keep trivial INDs (a column included in itself).
    #[arg(long, action = ArgAction::SetTrue)]
    keep_trivial_inds: bool,

    /// Hint the substrate to group by sorting instead of hashing.
    #[arg(long, action = ArgAction::SetTrue)]
    not_use_group_operators: bool,

    /// Exclude void sides from candidate generation; defaults to the
    /// candidate generator's preference.
    #[arg(long, action = ArgAction::Set)]
    exclude_void_inds: Option<bool>,

    /// Restriction on the column multiset of n-ary IND candidates.
    #[arg(long, value_enum, default_value_t = RestrictionArg::NoRepetitions)]
    nary_ind_restrictions: RestrictionArg,

    /// Candidate-generation strategy.
    #[arg(long, value_enum, default_value_t = GeneratorArg::Apriori)]
    candidate_generator: GeneratorArg,

    /// Candidates per n-ary validation pass; -1 validates each arity in one
    /// pass.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    candidate_chunk_size: i64,

    /// CSV field separator.
    #[arg(long, default_value_t = ',')]
    field_separator: char,

    /// CSV quote character.
    #[arg(long, default_value_t = '"')]
    quote_char: char,

    /// CSV escape character; quotes are escaped by doubling when unset.
    #[arg(long)]
    escape_char: Option<char>,

    /// The string that denotes a null cell.
    #[arg(long, default_value = "")]
    null_string: String,

    /// Silently skip rows whose field count differs from the header.
    #[arg(long, action = ArgAction::SetTrue)]
    drop_differing_lines: bool,

    /// Trim whitespace around unquoted fields.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    ignore_leading_whitespace: bool,

    /// Treat the input as a strict-quoting CSV dialect.
    #[arg(long, action = ArgAction::SetTrue)]
    use_strict_quotes: bool,

    /// Emit the run report as JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RestrictionArg {
    None,
    NoRepetitions,
    DepRefDisjoint,
}

impl From<RestrictionArg> for NaryIndRestriction {
    fn from(arg: RestrictionArg) -> Self {
        match arg {
            RestrictionArg::None => NaryIndRestriction::None,
            RestrictionArg::NoRepetitions => NaryIndRestriction::NoRepetitions,
            RestrictionArg::DepRefDisjoint => NaryIndRestriction::DepRefDisjoint,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GeneratorArg {
    Mind,
    Apriori,
    Binder,
}

impl From<GeneratorArg> for CandidateStrategy {
    fn from(arg: GeneratorArg) -> Self {
        match arg {
            GeneratorArg::Mind => CandidateStrategy::Mind,
            GeneratorArg::Apriori => CandidateStrategy::Apriori,
            GeneratorArg::Binder => CandidateStrategy::Binder,
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Serialize)]
struct Report {
    summary: RunSummary,
    inds: Vec<String>,
    augmentation_rules: Vec<String>,
}

fn ascii_byte(name: &str, value: char) -> Result<u8, Box<dyn std::error::Error>> {
    if value.is_ascii() {
        Ok(value as u8)
    } else {
        Err(format!("{name} must be an ASCII character, got '{value}'").into())
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let csv = CsvSettings {
        field_separator: ascii_byte("field separator", args.field_separator)?,
        quote_char: ascii_byte("quote char", args.quote_char)?,
        escape_char: args
            .escape_char
            .map(|c| ascii_byte("escape char", c))
            .transpose()?,
        null_string: args.null_string.clone(),
        drop_differing_lines: args.drop_differing_lines,
        ignore_leading_whitespace: args.ignore_leading_whitespace,
        use_strict_quotes: args.use_strict_quotes,
    };

    let mut config = DiscoveryConfig::new(args.drop_nulls);
    config.num_column_bits = args.num_column_bits;
    config.max_arity = args.max_arity;
    config.only_count_inds = args.only_count_inds;
    config.max_columns = args.max_columns;
    config.sample_rows = args.sample_rows;
    config.keep_trivial_inds = args.keep_trivial_inds;
    config.not_use_group_operators = args.not_use_group_operators;
    config.exclude_void_inds = args.exclude_void_inds;
    config.nary_restriction = Some(args.nary_ind_restrictions.into());
    config.candidate_strategy = Some(args.candidate_generator.into());
    config.candidate_chunk_size = args.candidate_chunk_size;
    config.csv = csv.clone();

    let inputs: Vec<Box<dyn TableInput>> = args
        .tables
        .iter()
        .map(|path| Box::new(CsvTableInput::new(path, csv.clone())) as Box<dyn TableInput>)
        .collect();

    let mut discovery = Discovery::new(config, inputs, LocalSubstrate::new());
    let summary = discovery.run()?;

    let (mut inds, mut rules) = match discovery.table_index() {
        Some(index) => (
            discovery
                .consolidated_inds()
                .iter()
                .map(|ind| index.render(ind))
                .collect::<Vec<_>>(),
            discovery
                .augmentation_rules()
                .iter()
                .map(|rule| format!("{} \u{21d2} {}", index.render(rule.lhs()), index.render(rule.rhs())))
                .collect::<Vec<_>>(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    inds.sort();
    rules.sort();

    if args.json {
        let report = Report {
            summary,
            inds,
            augmentation_rules: rules,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if !inds.is_empty() {
            println!("Inclusion dependencies:");
            for ind in &inds {
                println!("  {ind}");
            }
        }
        if !rules.is_empty() {
            println!("Augmentation rules:");
            for rule in &rules {
                println!("  {rule}");
            }
        }
        println!(
            "{} INDs discovered, {} maximal, {} augmentation rules, max arity {}.",
            summary.num_discovered_inds,
            summary.num_consolidated_inds,
            summary.num_augmentation_rules,
            summary.max_arity_processed,
        );
    }

    Ok(())
}
