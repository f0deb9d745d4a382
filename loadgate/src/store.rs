//! Run artifacts on disk.
//!
//! ```text
//! <root>/
//!   baseline.json
//!   history.json
//!   runs/<run_id>/
//!     run.json
//!     metrics.json
//!     analysis.json
//!     generated/program.json
//!     raw/samples.jsonl
//! ```

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;

use crate::{
    baseline::Baseline,
    compiler::Program,
    config::LoadParams,
    error::StoreError,
    gate::{Analysis, Verdict},
    metric::Sample,
    report::MetricsSummary,
};

pub const HISTORY_FILE: &str = "history.json";

/// CI variables copied into `run.json`.
const CI_VARIABLES: [&str; 7] = [
    "GITHUB_SHA",
    "GITHUB_REF",
    "GITHUB_RUN_ID",
    "GITHUB_RUN_NUMBER",
    "GITHUB_REPOSITORY",
    "GITHUB_WORKFLOW",
    "GITHUB_ACTIONS",
];

/// Variables tried, in order, for a run id when none is configured.
const RUN_ID_VARIABLES: [&str; 3] = ["GITHUB_SHA", "GITHUB_RUN_ID", "CI_PIPELINE_ID"];

/// Pick the run id: explicit value first, then CI variables, then `run-<epoch seconds>`.
pub fn resolve_run_id(explicit: Option<&str>) -> String {
    explicit
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| {
            RUN_ID_VARIABLES
                .iter()
                .filter_map(|key| std::env::var(key).ok())
                .find(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| format!("run-{}", Utc::now().timestamp()))
}

/// CI metadata present in the environment, keys lowercased.
pub fn ci_metadata() -> BTreeMap<String, String> {
    CI_VARIABLES
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_ascii_lowercase(), v))
        })
        .collect()
}

/// Serialize to a temp file next to `path`, then rename over it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let body = serde_json::to_vec_pretty(value).map_err(|e| StoreError::serialization(path, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&body).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
        _ => StoreError::io(path, e),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::serialization(path, e))
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,
    pub load: LoadParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ci: BTreeMap<String, String>,
}

impl RunMetadata {
    pub fn new(run_id: impl Into<String>, load: LoadParams) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            config: None,
            load,
            verdict: None,
            promoted: None,
            ci: ci_metadata(),
        }
    }
}

/// One row of `history.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Verdict>,
    pub requests: u64,
    pub failures: u64,
    pub rps: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub error_rate: f64,
    pub error_rate_4xx: f64,
    pub error_rate_5xx: f64,
    pub error_rate_503: f64,
}

impl HistoryEntry {
    pub fn new(
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        metrics: &MetricsSummary,
        status: Option<Verdict>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            status,
            requests: metrics.requests,
            failures: metrics.failures,
            rps: metrics.rps,
            avg_ms: metrics.avg_ms,
            median_ms: metrics.median_ms,
            p95_ms: metrics.p95_ms,
            p99_ms: metrics.p99_ms,
            max_ms: metrics.max_ms,
            error_rate: metrics.error_rate,
            error_rate_4xx: metrics.error_rate_4xx,
            error_rate_5xx: metrics.error_rate_5xx,
            error_rate_503: metrics.error_rate_503,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub runs: Vec<HistoryEntry>,
}

impl History {
    /// Append `entry`, replacing any earlier row for the same run, and keep the
    /// newest `limit` rows (`0` keeps everything).
    pub fn record(&mut self, entry: HistoryEntry, limit: usize) {
        self.runs.retain(|r| r.run_id != entry.run_id);
        self.runs.push(entry);
        if limit > 0 && self.runs.len() > limit {
            let excess = self.runs.len() - limit;
            self.runs.drain(..excess);
        }
    }
}

/// Paths and I/O for everything under the artifact root.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    pub fn metrics_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("metrics.json")
    }

    pub fn analysis_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("analysis.json")
    }

    pub fn program_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("generated").join("program.json")
    }

    pub fn samples_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("raw").join("samples.jsonl")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    pub fn save_run(&self, meta: &RunMetadata) -> Result<(), StoreError> {
        write_json_atomic(&self.run_path(&meta.run_id), meta)
    }

    pub fn load_run(&self, run_id: &str) -> Result<RunMetadata, StoreError> {
        read_json(&self.run_path(run_id))
    }

    pub fn save_metrics(&self, run_id: &str, metrics: &MetricsSummary) -> Result<(), StoreError> {
        write_json_atomic(&self.metrics_path(run_id), metrics)
    }

    pub fn load_metrics(&self, run_id: &str) -> Result<MetricsSummary, StoreError> {
        read_json(&self.metrics_path(run_id))
    }

    pub fn save_analysis(&self, run_id: &str, analysis: &Analysis) -> Result<(), StoreError> {
        write_json_atomic(&self.analysis_path(run_id), analysis)
    }

    pub fn save_program(&self, run_id: &str, program: &Program) -> Result<(), StoreError> {
        write_json_atomic(&self.program_path(run_id), program)
    }

    /// Read a compiled program written by [`RunStore::save_program`] (or by hand).
    pub fn load_program(path: &Path) -> Result<Program, StoreError> {
        read_json(path)
    }

    /// One JSON object per line, in stream order.
    pub fn save_samples(&self, run_id: &str, samples: &[Sample]) -> Result<(), StoreError> {
        let path = self.samples_path(run_id);
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        {
            let mut out = std::io::BufWriter::new(tmp.as_file_mut());
            for sample in samples {
                serde_json::to_writer(&mut out, sample)
                    .map_err(|e| StoreError::serialization(&path, e))?;
                out.write_all(b"\n").map_err(|e| StoreError::io(&path, e))?;
            }
            out.flush().map_err(|e| StoreError::io(&path, e))?;
        }
        tmp.persist(&path).map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    }

    /// A baseline built from a stored run's `metrics.json`.
    pub fn baseline_from_run(&self, run_id: &str) -> Result<Baseline, StoreError> {
        let metrics = self.load_metrics(run_id)?;
        let created_at = self
            .load_run(run_id)
            .map(|meta| meta.started_at)
            .unwrap_or_else(|_| Utc::now());
        Ok(Baseline {
            run_id: run_id.to_string(),
            created_at,
            metrics,
        })
    }

    /// The history file; missing or corrupt reads as empty.
    pub fn load_history(&self) -> History {
        match read_json(&self.history_path()) {
            Ok(history) => history,
            Err(StoreError::NotFound(_)) => History::default(),
            Err(e) => {
                tracing::warn!(error = %e, "history unreadable, starting a new one");
                History::default()
            }
        }
    }

    pub fn append_history(&self, entry: HistoryEntry, limit: usize) -> Result<(), StoreError> {
        let mut history = self.load_history();
        history.record(entry, limit);
        write_json_atomic(&self.history_path(), &history)
    }
}
