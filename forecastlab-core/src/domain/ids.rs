use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one pipeline invocation (BLAKE3 over symbol, range, dataset and start time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineRunId(pub String);

impl PipelineRunId {
    pub fn from_hash(hash: &str) -> Self {
        Self(hash.to_string())
    }

    /// Derive a run id from arbitrary identifying parts.
    ///
    /// Parts are length-prefixed before hashing so `["ab", "c"]` and `["a", "bc"]`
    /// produce different ids.
    pub fn derive(parts: &[&str]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        // 16 hex chars is plenty for directory names and log lines
        let hex = hasher.finalize().to_hex();
        Self(hex.as_str()[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trial number within one hyperparameter search, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId(pub u64);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_run_id_is_deterministic() {
        let a = PipelineRunId::derive(&["AAPL", "day", "2024-01-01"]);
        let b = PipelineRunId::derive(&["AAPL", "day", "2024-01-01"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn derived_run_id_is_boundary_sensitive() {
        let a = PipelineRunId::derive(&["ab", "c"]);
        let b = PipelineRunId::derive(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn trial_ids_order_by_creation() {
        assert!(TrialId(0) < TrialId(1));
        assert_eq!(TrialId(7).to_string(), "trial-7");
    }
}
