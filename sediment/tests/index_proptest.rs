//! Property tests for segment visibility and analyzer validation.

use proptest::prelude::*;

use sediment::analysis::{Analyzer, AnalyzerDef};
use sediment::storage::{CancellationToken, StorageType};
use sediment::{Config, Engine, IndexMeta};
use tempfile::TempDir;

const KNOWN_FILTERS: [&str; 5] = ["lowercase", "uppercase", "trim", "identifier_split", "unique"];

fn segment_ranges() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((1i64..1000, 0i64..200), 1..6)
        .prop_map(|v| v.into_iter().map(|(start, len)| (start, start + len)).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn historical_reader_sees_exactly_overlapping_segments(
        ranges in segment_ranges(),
        query_min in 0i64..1200,
        query_len in 0i64..400,
        kv in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let storage_type = if kv { StorageType::Kv } else { StorageType::Disk };
        let engine = Engine::open(Config {
            data_path: dir.path().to_path_buf(),
            default_storage_type: storage_type,
            ..Config::default()
        })
        .unwrap();
        engine.indexes().create_index(IndexMeta::new("logs")).unwrap();

        let cancel = CancellationToken::new();
        let writer = engine.indexes().get_writer("logs").unwrap();
        let mut ids = Vec::new();
        for (i, (min, max)) in ranges.iter().enumerate() {
            let payload = format!("segment-{}", i).into_bytes();
            ids.push(writer.add_segment(&payload, *min, *max, &cancel).unwrap());
        }
        drop(writer);
        engine.indexes().close_writer("logs").unwrap();

        let query_max = if query_len == 0 { 0 } else { query_min + query_len };
        let expected: Vec<u64> = ranges
            .iter()
            .zip(&ids)
            .filter(|((min, max), _)| {
                (query_min == 0 || *max >= query_min) && (query_max == 0 || *min <= query_max)
            })
            .map(|(_, id)| *id)
            .collect();

        let reader = engine.indexes().get_reader("logs", query_min, query_max).unwrap();
        let mut visible: Vec<u64> = reader.segments().iter().map(|s| s.id).collect();
        visible.sort_unstable();
        prop_assert_eq!(visible, expected);
        drop(reader);
        engine.shutdown().unwrap();
    }

    #[test]
    fn unknown_filter_names_are_rejected(name in "[a-z_]{1,16}") {
        prop_assume!(!KNOWN_FILTERS.contains(&name.as_str()));
        let result = Analyzer::from_def(
            "custom",
            &AnalyzerDef {
                tokenizer: "standard".to_string(),
                filters: vec!["lowercase".to_string(), name.clone()],
            },
        );
        let err = result.unwrap_err();
        let expected = format!("unknown token filter [{}]", name);
        prop_assert!(err.to_string().contains(&expected));
    }
}
