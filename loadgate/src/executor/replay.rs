use std::{
    collections::BTreeSet,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
};

use super::{RunExecutor, sort_by_completion};
use crate::{
    compiler::Program,
    config::LoadParams,
    error::{ExecutorError, StoreError},
    metric::Sample,
};

/// Plays back a recorded sample stream instead of generating load.
#[derive(Debug, Clone, Default)]
pub struct ReplayExecutor {
    samples: Vec<Sample>,
    program: Option<Arc<Program>>,
}

impl ReplayExecutor {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            program: None,
        }
    }

    /// Read a `samples.jsonl` file as written by [`crate::store::RunStore`].
    pub fn from_jsonl(path: &Path) -> Result<Self, StoreError> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
            _ => StoreError::io(path, e),
        })?;
        let mut samples = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            samples.push(
                serde_json::from_str(&line).map_err(|e| StoreError::serialization(path, e))?,
            );
        }
        Ok(Self::new(samples))
    }
}

impl RunExecutor for ReplayExecutor {
    fn load(&mut self, program: Arc<Program>) -> Result<(), ExecutorError> {
        self.program = Some(program);
        Ok(())
    }

    async fn run(&self, params: &LoadParams) -> Result<Vec<Sample>, ExecutorError> {
        let program = self.program.as_ref().ok_or(ExecutorError::NotLoaded)?;
        let known: BTreeSet<&str> = program
            .on_start
            .iter()
            .chain(&program.pool)
            .map(|r| r.name.as_str())
            .collect();

        let mut samples: Vec<Sample> = self
            .samples
            .iter()
            .filter(|s| s.started < params.run_time)
            .cloned()
            .collect();
        let unknown = samples
            .iter()
            .filter(|s| !known.contains(s.name.as_str()))
            .count();
        if unknown > 0 {
            tracing::warn!(unknown, "replayed samples reference requests outside the program");
        }
        sort_by_completion(&mut samples);
        tracing::info!(samples = samples.len(), "replay finished");
        Ok(samples)
    }
}
