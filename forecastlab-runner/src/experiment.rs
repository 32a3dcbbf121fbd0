//! Experiment store: append-only JSONL logs of trials and registration candidates.
//!
//! One file per experiment (`{root}/{experiment}.jsonl`). Each record is serialized
//! in full before the file is touched and written with a single `write_all`
//! under a lock, so concurrent trials never interleave partial lines.

use chrono::NaiveDateTime;
use forecastlab_core::domain::{PipelineRunId, TrialId};
use forecastlab_core::model::Hyperparameters;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("experiment store io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid experiment name '{0}'")]
    InvalidName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Complete,
    Failed,
}

/// One hyperparameter trial. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub run_id: PipelineRunId,
    pub trial: TrialId,
    pub params: Hyperparameters,
    pub status: TrialStatus,
    /// Minimum validation loss over all epochs.
    pub score: Option<f64>,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
}

impl TrialRecord {
    pub fn is_scored(&self) -> bool {
        self.status == TrialStatus::Complete && self.score.is_some_and(f64::is_finite)
    }
}

/// One finalist retrained on the full training set and scored on the test set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub run_id: PipelineRunId,
    pub source_trial: TrialId,
    pub params: Hyperparameters,
    pub test_loss: Option<f64>,
    pub train_loss: Option<f64>,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunRecord {
    Trial(TrialRecord),
    Candidate(CandidateRecord),
}

impl RunRecord {
    pub fn run_id(&self) -> &PipelineRunId {
        match self {
            RunRecord::Trial(t) => &t.run_id,
            RunRecord::Candidate(c) => &c.run_id,
        }
    }
}

pub struct ExperimentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ExperimentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, experiment: &str) -> Result<PathBuf, ExperimentError> {
        let valid = !experiment.is_empty()
            && experiment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !experiment.starts_with('.');
        if !valid {
            return Err(ExperimentError::InvalidName(experiment.to_string()));
        }
        Ok(self.root.join(format!("{experiment}.jsonl")))
    }

    /// Append one record as a single line.
    pub fn append(&self, experiment: &str, record: &RunRecord) -> Result<(), ExperimentError> {
        let path = self.path_for(experiment)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let io_err = |source| ExperimentError::Io {
            path: path.clone(),
            source,
        };
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(&self.root).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(())
    }

    /// Read every record of an experiment. Malformed lines are skipped with a warning.
    pub fn read_all(&self, experiment: &str) -> Result<Vec<RunRecord>, ExperimentError> {
        let path = self.path_for(experiment)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let io_err = |source| ExperimentError::Io {
            path: path.clone(),
            source,
        };
        let file = fs::File::open(&path).map_err(io_err)?;
        let mut records = Vec::new();
        for (n, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(experiment, line = n + 1, error = %e, "skipping malformed record"),
            }
        }
        Ok(records)
    }

    pub fn trials(&self, experiment: &str, run_id: &PipelineRunId) -> Result<Vec<TrialRecord>, ExperimentError> {
        Ok(self
            .read_all(experiment)?
            .into_iter()
            .filter_map(|r| match r {
                RunRecord::Trial(t) if &t.run_id == run_id => Some(t),
                _ => None,
            })
            .collect())
    }

    pub fn candidates(
        &self,
        experiment: &str,
        run_id: &PipelineRunId,
    ) -> Result<Vec<CandidateRecord>, ExperimentError> {
        Ok(self
            .read_all(experiment)?
            .into_iter()
            .filter_map(|r| match r {
                RunRecord::Candidate(c) if &c.run_id == run_id => Some(c),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn trial(run: &PipelineRunId, n: u64, score: Option<f64>) -> RunRecord {
        RunRecord::Trial(TrialRecord {
            run_id: run.clone(),
            trial: TrialId(n),
            params: Hyperparameters::default(),
            status: if score.is_some() {
                TrialStatus::Complete
            } else {
                TrialStatus::Failed
            },
            score,
            train_loss: score,
            val_loss: score,
            error: score.is_none().then(|| "boom".to_string()),
            created_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        })
    }

    #[test]
    fn append_and_filter_by_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(dir.path());
        let a = PipelineRunId::derive(&["a"]);
        let b = PipelineRunId::derive(&["b"]);
        store.append("hpo", &trial(&a, 0, Some(1.0))).unwrap();
        store.append("hpo", &trial(&b, 0, Some(2.0))).unwrap();
        store.append("hpo", &trial(&a, 1, None)).unwrap();

        let trials = store.trials("hpo", &a).unwrap();
        assert_eq!(trials.len(), 2);
        assert!(trials[0].is_scored());
        assert!(!trials[1].is_scored());
        assert!(store.candidates("hpo", &a).unwrap().is_empty());
    }

    #[test]
    fn missing_experiment_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(dir.path());
        assert!(store.read_all("nothing").unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(dir.path());
        let run = PipelineRunId::derive(&["x"]);
        store.append("hpo", &trial(&run, 0, Some(1.0))).unwrap();
        let path = store.path_for("hpo").unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        store.append("hpo", &trial(&run, 1, Some(2.0))).unwrap();
        assert_eq!(store.read_all("hpo").unwrap().len(), 2);
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(dir.path());
        assert!(store.path_for("../escape").is_err());
        assert!(store.path_for("").is_err());
    }

    #[test]
    fn concurrent_appends_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ExperimentStore::new(dir.path()));
        let run = PipelineRunId::derive(&["par"]);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let run = run.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.append("hpo", &trial(&run, t * 100 + i, Some(i as f64))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.trials("hpo", &run).unwrap().len(), 200);
    }
}
