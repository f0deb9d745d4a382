//! The stored reference run that comparison rules measure against.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, report::MetricsSummary, store::write_json_atomic};

pub const BASELINE_FILE: &str = "baseline.json";

/// A promoted run's summary plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub metrics: MetricsSummary,
}

impl Baseline {
    pub fn new(run_id: impl Into<String>, metrics: MetricsSummary) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            metrics,
        }
    }
}

/// `baseline.json` under the artifact root.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(BASELINE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current baseline. A missing or unreadable file is "no baseline", never an
    /// error.
    pub fn load(&self) -> Option<Baseline> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no baseline stored yet");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "baseline unreadable, ignoring it"
                );
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(baseline) => Some(baseline),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "baseline corrupt, ignoring it"
                );
                None
            }
        }
    }

    /// Replace the baseline. Readers see either the old or the new file, never a
    /// partial one.
    pub fn save(&self, metrics: &MetricsSummary, run_id: &str) -> Result<Baseline, StoreError> {
        let baseline = Baseline::new(run_id, metrics.clone());
        write_json_atomic(&self.path, &baseline)?;
        tracing::info!(run_id, path = %self.path.display(), "baseline promoted");
        Ok(baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(BaselineStore::in_root(dir.path()).load(), None);
    }

    #[test]
    fn corrupt_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::in_root(dir.path());
        std::fs::write(store.path(), b"{\"run_id\": 3, trunc").unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("nested/baseline.json"));
        let metrics = MetricsSummary {
            requests: 10,
            p95_ms: 120.5,
            ..Default::default()
        };
        let saved = store.save(&metrics, "run-1").unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.metrics, metrics);

        // a second promotion replaces the first
        store.save(&MetricsSummary::default(), "run-2").unwrap();
        assert_eq!(store.load().unwrap().run_id, "run-2");
        let leftovers = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
