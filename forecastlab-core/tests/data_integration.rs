//! Collect, prepare and persist, end to end on offline sources.

use chrono::NaiveDate;
use forecastlab_core::data::{dataset_hash, CsvSource, MarketDataSource, SyntheticSource};
use forecastlab_core::domain::{is_strictly_ordered, Granularity, PipelineRunId};
use forecastlab_core::features::{ArtifactStore, FeatureStore};
use std::fs;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

#[test]
fn five_days_of_bars_give_a_five_by_seven_matrix() {
    // GIVEN: five complete daily bars
    let src = SyntheticSource::new(42);
    let fetched = src.fetch("AAPL", Granularity::Day, d(2024, 2, 5), d(2024, 2, 9)).unwrap();
    assert_eq!(fetched.records.len(), 5);
    assert!(fetched.records.iter().all(|r| r.missing_fields() == 0));

    // WHEN: the feature store prepares them
    let prepared = FeatureStore::new().prepare(&fetched.records);

    // THEN: 5x7 standardized predictors and 5 labels (the closes)
    assert_eq!(prepared.features.n_rows(), 5);
    assert_eq!(prepared.features.n_cols(), 7);
    assert_eq!(prepared.labels.len(), 5);
    for (label, rec) in prepared.labels.iter().zip(&fetched.records) {
        assert_eq!(*label, rec.close);
    }
}

#[test]
fn synthetic_collection_round_trips_through_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let src = SyntheticSource::new(1);
    let fetched = src.fetch("MSFT", Granularity::Day, d(2023, 1, 1), d(2023, 3, 31)).unwrap();
    assert!(is_strictly_ordered(&fetched.records));

    let run = PipelineRunId::derive(&["MSFT", &dataset_hash(&fetched.records)]);
    let prepared = FeatureStore::new().prepare(&fetched.records);
    let store = ArtifactStore::new(dir.path());
    store.write(&run, &prepared).unwrap();

    assert!(store.exists(&run));
    assert_eq!(store.read_labels(&run).unwrap(), prepared.labels);
    assert_eq!(store.read_features(&run).unwrap().n_rows(), fetched.records.len());
}

#[test]
fn exported_records_can_be_imported_again() {
    let dir = tempfile::tempdir().unwrap();
    let src = SyntheticSource::new(5);
    let fetched = src.fetch("SPY", Granularity::Day, d(2024, 1, 1), d(2024, 1, 15)).unwrap();
    let prepared = FeatureStore::new().prepare(&fetched.records);
    let run = PipelineRunId::derive(&["SPY"]);
    let store = ArtifactStore::new(dir.path().join("artifacts"));
    let paths = store.write(&run, &prepared).unwrap();

    let import_dir = dir.path().join("import");
    fs::create_dir_all(&import_dir).unwrap();
    fs::copy(&paths.records, import_dir.join("SPY.csv")).unwrap();

    let csv = CsvSource::new(&import_dir);
    let again = csv.fetch("SPY", Granularity::Day, d(2024, 1, 1), d(2024, 1, 15)).unwrap();
    assert_eq!(again.records.len(), fetched.records.len());
    assert_eq!(again.records[3].timestamp, fetched.records[3].timestamp);
    assert_eq!(again.records[3].close, fetched.records[3].close);
}

#[test]
fn empty_fetch_is_valid_and_prepares_to_nothing() {
    let src = SyntheticSource::new(1);
    // a single day still yields one bar; an empty csv yields none
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("NONE.csv"), "Timestamp,Open,High,Low,Close\n").unwrap();
    let csv = CsvSource::new(dir.path());
    let empty = csv.fetch("NONE", Granularity::Day, d(2024, 1, 1), d(2024, 1, 2)).unwrap();
    assert!(empty.is_empty());
    let prepared = FeatureStore::new().prepare(&empty.records);
    assert!(prepared.is_empty());
    assert_eq!(src.fetch("X", Granularity::Day, d(2024, 1, 1), d(2024, 1, 1)).unwrap().records.len(), 1);
}
