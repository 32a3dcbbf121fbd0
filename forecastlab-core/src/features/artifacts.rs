//! Per-run feature/label artifacts.
//!
//! Layout: `{root}/{run_id}/features.parquet`, `labels.parquet`, `records.csv`, `scaler.json`.
//! Every file is written to `.tmp` and renamed into place.

use super::matrix::FeatureMatrix;
use super::store::{PreparedData, ProcessedRow, LABEL_COLUMN};
use super::scaler::Scaler;
use crate::domain::PipelineRunId;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no artifacts for run {0}")]
    NotFound(String),

    #[error("artifact is malformed: {0}")]
    Malformed(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Paths written for one run.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub features: PathBuf,
    pub labels: PathBuf,
    pub records: PathBuf,
    pub scaler: PathBuf,
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &PipelineRunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    pub fn paths(&self, run_id: &PipelineRunId) -> ArtifactPaths {
        let dir = self.run_dir(run_id);
        ArtifactPaths {
            features: dir.join("features.parquet"),
            labels: dir.join("labels.parquet"),
            records: dir.join("records.csv"),
            scaler: dir.join("scaler.json"),
        }
    }

    pub fn exists(&self, run_id: &PipelineRunId) -> bool {
        let p = self.paths(run_id);
        p.features.exists() && p.labels.exists()
    }

    pub fn write(&self, run_id: &PipelineRunId, data: &PreparedData) -> Result<ArtifactPaths, ArtifactError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let paths = self.paths(run_id);

        let features_df = matrix_to_dataframe(&data.features)?;
        atomic_write(&paths.features, |tmp| write_parquet(&features_df, tmp))?;

        let labels_df = DataFrame::new(vec![Column::new(LABEL_COLUMN.into(), data.labels.clone())])
            .map_err(|e| ArtifactError::Parquet(format!("labels frame: {e}")))?;
        atomic_write(&paths.labels, |tmp| write_parquet(&labels_df, tmp))?;

        atomic_write(&paths.records, |tmp| write_records_csv(&data.rows, tmp))?;

        let scaler_json = serde_json::to_vec_pretty(&data.scaler)?;
        atomic_write(&paths.scaler, |tmp| fs::write(tmp, &scaler_json).map_err(io_err(tmp)))?;

        info!(run_id = %run_id, rows = data.len(), dir = %dir.display(), "wrote feature artifacts");
        Ok(paths)
    }

    pub fn read_features(&self, run_id: &PipelineRunId) -> Result<FeatureMatrix, ArtifactError> {
        let path = self.paths(run_id).features;
        let df = read_parquet(&path, run_id)?;
        dataframe_to_matrix(&df)
    }

    pub fn read_labels(&self, run_id: &PipelineRunId) -> Result<Vec<f64>, ArtifactError> {
        let path = self.paths(run_id).labels;
        let df = read_parquet(&path, run_id)?;
        let col = df
            .column(LABEL_COLUMN)
            .map_err(|e| ArtifactError::Malformed(format!("labels: {e}")))?;
        let ca = col
            .f64()
            .map_err(|e| ArtifactError::Malformed(format!("labels type: {e}")))?;
        Ok(ca.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }

    pub fn read_records(&self, run_id: &PipelineRunId) -> Result<Vec<ProcessedRow>, ArtifactError> {
        let path = self.paths(run_id).records;
        if !path.exists() {
            return Err(ArtifactError::NotFound(run_id.to_string()));
        }
        let mut rdr = csv::Reader::from_path(&path).map_err(|e| ArtifactError::Csv(e.to_string()))?;
        rdr.deserialize()
            .map(|row| row.map_err(|e| ArtifactError::Csv(e.to_string())))
            .collect()
    }

    pub fn read_scaler(&self, run_id: &PipelineRunId) -> Result<Scaler, ArtifactError> {
        let path = self.paths(run_id).scaler;
        let raw = fs::read(&path).map_err(io_err(&path))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

fn atomic_write<F>(path: &Path, write: F) -> Result<(), ArtifactError>
where
    F: FnOnce(&Path) -> Result<(), ArtifactError>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ArtifactError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

fn matrix_to_dataframe(m: &FeatureMatrix) -> Result<DataFrame, ArtifactError> {
    let columns: Vec<Column> = m
        .columns()
        .iter()
        .enumerate()
        .map(|(i, name)| Column::new(name.as_str().into(), m.column(i)))
        .collect();
    DataFrame::new(columns).map_err(|e| ArtifactError::Parquet(format!("features frame: {e}")))
}

fn dataframe_to_matrix(df: &DataFrame) -> Result<FeatureMatrix, ArtifactError> {
    let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
    let n = df.height();
    let mut cols = Vec::with_capacity(names.len());
    for name in &names {
        let ca = df
            .column(name)
            .and_then(|c| c.f64().cloned())
            .map_err(|e| ArtifactError::Malformed(format!("column {name}: {e}")))?;
        cols.push(ca);
    }
    let mut data = Vec::with_capacity(n * names.len());
    for r in 0..n {
        for ca in &cols {
            data.push(ca.get(r).unwrap_or(f64::NAN));
        }
    }
    FeatureMatrix::new(names, n, data).map_err(|e| ArtifactError::Malformed(e.to_string()))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), ArtifactError> {
    let file = fs::File::create(path).map_err(io_err(path))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| ArtifactError::Parquet(format!("write {}: {e}", path.display())))?;
    Ok(())
}

fn read_parquet(path: &Path, run_id: &PipelineRunId) -> Result<DataFrame, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::NotFound(run_id.to_string()));
    }
    let file = fs::File::open(path).map_err(io_err(path))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| ArtifactError::Parquet(format!("read {}: {e}", path.display())))
}

fn write_records_csv(rows: &[ProcessedRow], path: &Path) -> Result<(), ArtifactError> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| ArtifactError::Csv(e.to_string()))?;
    for row in rows {
        wtr.serialize(row).map_err(|e| ArtifactError::Csv(e.to_string()))?;
    }
    wtr.flush().map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MarketDataSource, SyntheticSource};
    use crate::domain::Granularity;
    use crate::features::FeatureStore;
    use chrono::NaiveDate;

    fn prepared() -> PreparedData {
        let src = SyntheticSource::new(3);
        let res = src
            .fetch(
                "AAPL",
                Granularity::Day,
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
            )
            .unwrap();
        FeatureStore::new().prepare(&res.records)
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run = PipelineRunId::derive(&["test"]);
        let data = prepared();
        let paths = store.write(&run, &data).unwrap();
        assert!(paths.features.exists());
        assert!(!paths.features.with_extension("parquet.tmp").exists());

        let features = store.read_features(&run).unwrap();
        assert_eq!(features.columns(), data.features.columns());
        assert_eq!(features.n_rows(), 20);
        assert!((features.get(3, 2) - data.features.get(3, 2)).abs() < 1e-12);
        assert_eq!(store.read_labels(&run).unwrap(), data.labels);
        assert_eq!(store.read_records(&run).unwrap(), data.rows);
        let scaler = store.read_scaler(&run).unwrap();
        assert_eq!(scaler.columns, data.scaler.columns);
        for (a, b) in scaler.means.iter().zip(&data.scaler.means) {
            assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0));
        }
    }

    #[test]
    fn records_csv_uses_export_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run = PipelineRunId::derive(&["header"]);
        let paths = store.write(&run, &prepared()).unwrap();
        let text = fs::read_to_string(paths.records).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "Volume,VWAP,Open,Close,High,Low,Timestamp,Number_of_Trades,Date"
        );
    }

    #[test]
    fn missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let run = PipelineRunId::derive(&["nope"]);
        assert!(!store.exists(&run));
        assert!(matches!(store.read_features(&run), Err(ArtifactError::NotFound(_))));
    }
}
