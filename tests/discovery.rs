//! End-to-end discovery scenarios over small tables.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use confluence::candidates::{CandidateStrategy, NaryIndRestriction};
use confluence::common::Ind;
use confluence::engine::{Discovery, DiscoveryConfig, IndSink, RunSummary};
use confluence::input::{CsvSettings, CsvTableInput, MemoryTable, TableInput};
use confluence::substrate::LocalSubstrate;

/// The id of column `index` of the `table`-th input, under the default
/// 16-bit column split.
fn col(table: u32, index: u32) -> u32 {
    (table << 16) + index
}

fn run(
    tables: Vec<Box<dyn TableInput>>,
    configure: impl FnOnce(&mut DiscoveryConfig),
) -> (Discovery<LocalSubstrate>, RunSummary) {
    let mut config = DiscoveryConfig::new(true);
    config.nary_restriction = Some(NaryIndRestriction::NoRepetitions);
    config.candidate_strategy = Some(CandidateStrategy::Apriori);
    configure(&mut config);
    let mut discovery = Discovery::new(config, tables, LocalSubstrate::new());
    let summary = discovery.run().expect("discovery run failed");
    (discovery, summary)
}

#[test]
fn unary_inclusion_across_two_tables() {
    let tables: Vec<Box<dyn TableInput>> = vec![
        Box::new(MemoryTable::new(
            "r",
            vec!["a", "b"],
            vec![vec!["1", "10"], vec!["2", "20"], vec!["3", "30"]],
        )),
        Box::new(MemoryTable::new(
            "s",
            vec!["x", "y"],
            vec![vec!["1", "99"], vec!["2", "99"], vec!["3", "99"], vec!["4", "99"]],
        )),
    ];
    let (discovery, summary) = run(tables, |config| config.max_arity = 1);

    // b ⊆ x fails because 10 is not among x's values.
    assert_eq!(discovery.consolidated_inds(), &[Ind::unary(col(0, 0), col(1, 0))]);
    assert_eq!(summary.max_arity_processed, 1);

    let index = discovery.table_index().unwrap();
    assert_eq!(
        index.render(&discovery.consolidated_inds()[0]),
        "r[a] \u{2286} s[x]"
    );
}

#[test]
fn void_column_becomes_zero_ary_rule() {
    let tables: Vec<Box<dyn TableInput>> = vec![
        Box::new(MemoryTable::new(
            "r",
            vec!["a", "b"],
            vec![vec!["", "1"], vec!["", "2"]],
        )),
        Box::new(MemoryTable::new("s", vec!["x"], vec![vec!["7"]])),
    ];
    let (discovery, _) = run(tables, |_| {});

    // The void column's INDs surface only as 0-ary augmentation rules.
    assert!(discovery.consolidated_inds().is_empty());

    let rules: Vec<(Ind, Ind)> = discovery
        .augmentation_rules()
        .iter()
        .map(|rule| (rule.lhs().clone(), rule.rhs().clone()))
        .collect();
    assert!(rules.contains(&(Ind::empty(), Ind::unary(col(0, 0), col(1, 0)))));
    assert!(rules.contains(&(Ind::empty(), Ind::unary(col(0, 0), col(0, 1)))));
    assert_eq!(rules.len(), 2);
}

#[test]
fn trivial_self_inclusion_is_kept_on_request() {
    let table = || -> Vec<Box<dyn TableInput>> {
        vec![Box::new(MemoryTable::new(
            "r",
            vec!["a"],
            vec![vec!["1"], vec!["2"], vec!["3"]],
        ))]
    };

    let (filtered, _) = run(table(), |config| config.max_arity = 1);
    assert!(filtered.consolidated_inds().is_empty());

    let (kept, _) = run(table(), |config| {
        config.max_arity = 1;
        config.keep_trivial_inds = true;
    });
    let self_ind = Ind::unary(col(0, 0), col(0, 0));
    assert_eq!(kept.consolidated_inds(), &[self_ind.clone()]);
    assert!(self_ind.is_trivial());
}

#[test]
fn equivalent_binary_ind_is_embedded_as_rule() {
    let tables: Vec<Box<dyn TableInput>> = vec![
        Box::new(MemoryTable::new(
            "r",
            vec!["a", "b"],
            vec![vec!["1", "10"], vec!["2", "20"], vec!["3", "30"]],
        )),
        Box::new(MemoryTable::new(
            "s",
            vec!["x", "y"],
            vec![
                vec!["1", "10"],
                vec!["2", "20"],
                vec!["3", "30"],
                vec!["4", "40"],
            ],
        )),
    ];
    let (discovery, summary) = run(tables, |_| {});

    // The binary IND validates but adds nothing over its generalizations,
    // so it is suppressed in favour of the augmentation rules.
    let mut consolidated = discovery.consolidated_inds().to_vec();
    consolidated.sort();
    assert_eq!(
        consolidated,
        vec![
            Ind::unary(col(0, 0), col(1, 0)),
            Ind::unary(col(0, 1), col(1, 1)),
        ]
    );

    let rules: Vec<(Ind, Ind)> = discovery
        .augmentation_rules()
        .iter()
        .map(|rule| (rule.lhs().clone(), rule.rhs().clone()))
        .collect();
    assert!(rules.contains(&(
        Ind::unary(col(0, 1), col(1, 1)),
        Ind::unary(col(0, 0), col(1, 0)),
    )));
    assert!(rules.contains(&(
        Ind::unary(col(0, 0), col(1, 0)),
        Ind::unary(col(0, 1), col(1, 1)),
    )));
    assert_eq!(summary.max_arity_processed, 2);
}

#[test]
fn consolidation_keeps_only_maximal_inds() {
    // Neither x nor y alone determines the (x, y) pairs, so the binary IND
    // is informative and survives; its unary generalizations are subsumed.
    let tables: Vec<Box<dyn TableInput>> = vec![
        Box::new(MemoryTable::new(
            "r",
            vec!["a", "b"],
            vec![vec!["1", "10"], vec!["2", "20"]],
        )),
        Box::new(MemoryTable::new(
            "s",
            vec!["x", "y"],
            vec![
                vec!["1", "10"],
                vec!["2", "20"],
                vec!["3", "30"],
                vec!["1", "20"],
                vec!["2", "10"],
            ],
        )),
    ];
    let (discovery, _) = run(tables, |_| {});

    let binary = Ind::new(vec![col(0, 0), col(0, 1)], vec![col(1, 0), col(1, 1)]);
    assert_eq!(discovery.consolidated_inds(), &[binary.clone()]);

    // No two members may imply one another, and every dependent side is
    // strictly ascending.
    let inds = discovery.consolidated_inds();
    for x in inds {
        assert!(x.dependent().windows(2).all(|w| w[0] < w[1]));
        for y in inds {
            assert!(x == y || !x.is_implied_by(y));
        }
    }
}

#[test]
fn chunked_validation_matches_unchunked() {
    let tables = || -> Vec<Box<dyn TableInput>> {
        vec![
            Box::new(MemoryTable::new(
                "r",
                vec!["a", "b", "c"],
                vec![
                    vec!["1", "10", "100"],
                    vec!["2", "20", "200"],
                ],
            )),
            Box::new(MemoryTable::new(
                "s",
                vec!["x", "y", "z"],
                vec![
                    vec!["1", "10", "100"],
                    vec!["2", "20", "200"],
                    vec!["3", "30", "300"],
                ],
            )),
        ]
    };

    let (whole, whole_summary) = run(tables(), |_| {});
    let (chunked, chunked_summary) = run(tables(), |config| {
        config.candidate_chunk_size = 1;
    });

    let sort = |discovery: &Discovery<LocalSubstrate>| {
        let mut inds = discovery.consolidated_inds().to_vec();
        inds.sort();
        let mut rules: Vec<String> = discovery
            .augmentation_rules()
            .iter()
            .map(|rule| rule.to_string())
            .collect();
        rules.sort();
        (inds, rules)
    };
    assert_eq!(sort(&whole), sort(&chunked));
    assert_eq!(
        whole_summary.num_discovered_inds,
        chunked_summary.num_discovered_inds
    );
}

#[test]
fn csv_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let r_path = dir.path().join("orders.csv");
    let s_path = dir.path().join("customers.csv");
    let mut r = std::fs::File::create(&r_path).unwrap();
    writeln!(r, "id,customer_id").unwrap();
    writeln!(r, "500,1").unwrap();
    writeln!(r, "501,2").unwrap();
    r.flush().unwrap();
    let mut s = std::fs::File::create(&s_path).unwrap();
    writeln!(s, "id").unwrap();
    writeln!(s, "1").unwrap();
    writeln!(s, "2").unwrap();
    writeln!(s, "3").unwrap();
    s.flush().unwrap();

    let settings = CsvSettings::default();
    let tables: Vec<Box<dyn TableInput>> = vec![
        Box::new(CsvTableInput::new(&r_path, settings.clone())),
        Box::new(CsvTableInput::new(&s_path, settings)),
    ];
    let (discovery, _) = run(tables, |config| config.max_arity = 1);

    let index = discovery.table_index().unwrap();
    let rendered: Vec<String> = discovery
        .consolidated_inds()
        .iter()
        .map(|ind| index.render(ind))
        .collect();
    assert_eq!(rendered, vec!["orders[customer_id] \u{2286} customers[id]"]);
}

#[derive(Default)]
struct CountingSink {
    count: AtomicU64,
    inds: Mutex<Vec<Ind>>,
}

impl IndSink for CountingSink {
    fn collect(&self, ind: &Ind) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.inds.lock().unwrap().push(ind.clone());
    }
}

#[test]
fn streaming_sink_receives_each_ind_once() {
    let tables: Vec<Box<dyn TableInput>> = vec![
        Box::new(MemoryTable::new(
            "r",
            vec!["a", "b"],
            vec![vec!["1", "10"], vec!["2", "20"], vec!["3", "30"]],
        )),
        Box::new(MemoryTable::new(
            "s",
            vec!["x", "y"],
            vec![
                vec!["1", "10"],
                vec!["2", "20"],
                vec!["3", "30"],
                vec!["4", "40"],
            ],
        )),
    ];

    let sink = Arc::new(CountingSink::default());
    let mut config = DiscoveryConfig::new(true);
    config.nary_restriction = Some(NaryIndRestriction::NoRepetitions);
    config.candidate_strategy = Some(CandidateStrategy::Apriori);
    let mut discovery =
        Discovery::new(config, tables, LocalSubstrate::new()).with_ind_sink(sink.clone());
    let summary = discovery.run().unwrap();

    // Two unary INDs plus the binary IND that is later rewritten to rules:
    // each streamed exactly once, before consolidation.
    assert_eq!(sink.count.load(Ordering::Relaxed), 3);
    assert_eq!(summary.num_discovered_inds, 3);

    let streamed = sink.inds.lock().unwrap();
    let binary = Ind::new(vec![col(0, 0), col(0, 1)], vec![col(1, 0), col(1, 1)]);
    assert!(streamed.contains(&binary));
}
