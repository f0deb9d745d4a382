//! Orchestration: compile, run, summarize, judge, record.
//!
//! [`Plan::prepare`] does every check that can fail on configuration before a single
//! user starts. [`execute`] then drives a [`RunExecutor`] and writes the run's
//! artifacts; [`analyze`] re-judges a stored run.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    aggregate::{Warmup, summarize},
    baseline::{Baseline, BaselineStore},
    compiler::{Program, compile, is_eligible},
    config::{Document, LoadParams},
    error::{ConfigError, Error, StoreError},
    executor::{ReplayExecutor, RunExecutor},
    gate::{Analysis, Gate, Rule, Verdict, evaluate},
    metric::Sample,
    report::MetricsSummary,
    store::{HistoryEntry, RunMetadata, RunStore, resolve_run_id},
};

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Verdict below `fail_on`, or nothing to judge.
    Success,
    /// Verdict reached `fail_on`.
    GateFailed,
    /// Configuration or compilation error; no run happened.
    Config,
    /// Executor or artifact storage failure.
    Runtime,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::GateFailed => 1,
            Self::Config => 2,
            Self::Runtime => 3,
        }
    }

    pub fn for_verdict(verdict: Verdict, fail_on: Verdict) -> Self {
        if crate::gate::fails(verdict, fail_on) {
            Self::GateFailed
        } else {
            Self::Success
        }
    }

    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::Config(_) => Self::Config,
            Error::Store(_) | Error::Executor(_) => Self::Runtime,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(value: ExitStatus) -> Self {
        ExitCode::from(value.code())
    }
}

/// The `analysis` and `artifacts` sections, resolved.
#[derive(Debug, Clone)]
pub struct AnalysisPlan {
    pub rules: Vec<Rule>,
    pub gate: Option<Gate>,
    pub fail_on: Verdict,
    pub store: RunStore,
    pub history_limit: usize,
}

impl AnalysisPlan {
    pub fn prepare(doc: &Document) -> Result<Self, ConfigError> {
        Ok(Self {
            rules: doc.rules()?,
            gate: Gate::resolve(doc.analysis.mode, doc.analysis.gate.as_ref())?,
            fail_on: doc.fail_on(),
            store: RunStore::new(doc.storage_root()),
            history_limit: doc.history_limit(),
        })
    }

    pub fn warmup(&self) -> Warmup {
        self.gate.as_ref().map(Gate::warmup).unwrap_or_default()
    }

    pub fn baseline_store(&self) -> BaselineStore {
        BaselineStore::in_root(self.store.root())
    }
}

/// Everything needed to start a run.
#[derive(Debug, Clone)]
pub struct Plan {
    pub program: Arc<Program>,
    pub params: LoadParams,
    pub analysis: AnalysisPlan,
}

impl Plan {
    /// Validate the whole document. A `locust` section's precompiled program takes
    /// the place of `scenario`; the tag filter applies to its pool all the same.
    pub fn prepare(doc: &Document) -> Result<Self, ConfigError> {
        let load = doc.load_config();
        let params = LoadParams::try_from(&load)?;

        let program = match (&doc.locust, &doc.scenario) {
            (Some(locust), _) => {
                let mut program = RunStore::load_program(&locust.program)
                    .map_err(|e| ConfigError::invalid("locust.program", e.to_string()))?;
                if program.pool.is_empty() {
                    return Err(ConfigError::invalid("locust.program", "program has no requests"));
                }
                program.think_time.validate()?;
                program
                    .pool
                    .retain(|r| is_eligible(&r.tags, &load.tags, &load.exclude_tags));
                if program.pool.is_empty() {
                    return Err(ConfigError::EmptyPool {
                        tags: load.tags.clone(),
                        exclude_tags: load.exclude_tags.clone(),
                    });
                }
                program
            }
            (None, Some(scenario)) => compile(scenario, &load)?,
            (None, None) => return Err(ConfigError::missing("scenario")),
        };

        Ok(Self {
            program: Arc::new(program),
            params,
            analysis: AnalysisPlan::prepare(doc)?,
        })
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RunOptions {
    #[builder(default, setter(strip_option, into))]
    pub run_id: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub config_path: Option<PathBuf>,
    /// Judge the run; without it only metrics are recorded.
    #[builder(default = true)]
    pub analyze: bool,
    /// Make this run the baseline when it passes.
    #[builder(default)]
    pub promote: bool,
    /// Compare against this stored run instead of `baseline.json`.
    #[builder(default, setter(strip_option, into))]
    pub baseline_run: Option<String>,
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub metrics: MetricsSummary,
    pub analysis: Option<Analysis>,
    pub promoted: bool,
    pub exit: ExitStatus,
}

/// Run `plan` on `executor` and record everything under the artifact root.
pub async fn execute<E: RunExecutor>(
    plan: &Plan,
    executor: &mut E,
    opts: &RunOptions,
) -> Result<RunOutcome, Error> {
    let run_id = resolve_run_id(opts.run_id.as_deref());
    let store = &plan.analysis.store;

    let mut meta = RunMetadata::new(&run_id, plan.params.clone());
    meta.config = opts.config_path.clone();
    store.save_run(&meta)?;
    store.save_program(&run_id, &plan.program)?;

    tracing::info!(%run_id, host = %plan.params.host, "starting run");
    executor.load(Arc::clone(&plan.program))?;
    let samples = executor.run(&plan.params).await?;
    store.save_samples(&run_id, &samples)?;

    let metrics = summarize(&samples, plan.analysis.warmup());
    store.save_metrics(&run_id, &metrics)?;
    tracing::info!(
        %run_id,
        requests = metrics.requests,
        failures = metrics.failures,
        "run summarized"
    );

    let (analysis, exit) = if opts.analyze {
        let analysis = judge(&plan.analysis, &run_id, &metrics, opts.baseline_run.as_deref())?;
        let exit = ExitStatus::for_verdict(analysis.status, plan.analysis.fail_on);
        (Some(analysis), exit)
    } else {
        (None, ExitStatus::Success)
    };

    let promoted = opts.promote && promote(&plan.analysis, &run_id, &metrics, analysis.as_ref())?;

    store.append_history(
        HistoryEntry::new(&run_id, meta.started_at, &metrics, analysis.as_ref().map(|a| a.status)),
        plan.analysis.history_limit,
    )?;

    meta.finished_at = Some(chrono::Utc::now());
    meta.verdict = analysis.as_ref().map(|a| a.status);
    meta.promoted = opts.promote.then_some(promoted);
    store.save_run(&meta)?;

    Ok(RunOutcome {
        run_id,
        metrics,
        analysis,
        promoted,
        exit,
    })
}

/// Re-judge a stored run. Raw samples are preferred so the gate's warmup applies;
/// without them the stored `metrics.json` is used as is.
pub async fn analyze(
    plan: &AnalysisPlan,
    run_id: &str,
    opts: &RunOptions,
) -> Result<RunOutcome, Error> {
    let store = &plan.store;
    let metrics = match ReplayExecutor::from_jsonl(&store.samples_path(run_id)) {
        Ok(replay) => {
            let samples = replay_all(replay, store, run_id).await?;
            let metrics = summarize(&samples, plan.warmup());
            store.save_metrics(run_id, &metrics)?;
            metrics
        }
        Err(StoreError::NotFound(_)) => store.load_metrics(run_id)?,
        Err(e) => return Err(e.into()),
    };

    let analysis = judge(plan, run_id, &metrics, opts.baseline_run.as_deref())?;
    let exit = ExitStatus::for_verdict(analysis.status, plan.fail_on);
    let promoted = opts.promote && promote(plan, run_id, &metrics, Some(&analysis))?;

    Ok(RunOutcome {
        run_id: run_id.to_string(),
        metrics,
        analysis: Some(analysis),
        promoted,
        exit,
    })
}

async fn replay_all(
    mut replay: ReplayExecutor,
    store: &RunStore,
    run_id: &str,
) -> Result<Vec<Sample>, Error> {
    let program = RunStore::load_program(&store.program_path(run_id))?;
    let meta = store.load_run(run_id)?;
    replay.load(Arc::new(program))?;
    // a stored stream is replayed whole, including what finished while draining
    let params = LoadParams {
        run_time: Duration::MAX,
        ..meta.load
    };
    Ok(replay.run(&params).await?)
}

fn judge(
    plan: &AnalysisPlan,
    run_id: &str,
    metrics: &MetricsSummary,
    baseline_run: Option<&str>,
) -> Result<Analysis, Error> {
    let baseline: Option<Baseline> = match baseline_run {
        Some(id) => match plan.store.baseline_from_run(id) {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::warn!(baseline = id, error = %e, "baseline run unavailable");
                None
            }
        },
        None => plan.baseline_store().load(),
    };

    let mut analysis = evaluate(metrics, baseline.as_ref(), &plan.rules, plan.gate.as_ref());
    analysis.run_id = Some(run_id.to_string());
    plan.store.save_analysis(run_id, &analysis)?;
    tracing::info!(
        run_id,
        verdict = %analysis.status,
        fired = analysis.fired().count(),
        inconclusive = analysis.inconclusive,
        "analysis complete"
    );
    Ok(analysis)
}

/// Promote only runs that produced samples and whose verdict stayed below `fail_on`.
fn promote(
    plan: &AnalysisPlan,
    run_id: &str,
    metrics: &MetricsSummary,
    analysis: Option<&Analysis>,
) -> Result<bool, Error> {
    if metrics.requests == 0 {
        tracing::warn!(run_id, "run produced no requests, baseline not promoted");
        return Ok(false);
    }
    if let Some(analysis) = analysis.filter(|a| a.fails(plan.fail_on)) {
        tracing::warn!(
            run_id,
            verdict = %analysis.status,
            "run failed its gate, baseline not promoted"
        );
        return Ok(false);
    }
    plan.baseline_store().save(metrics, run_id)?;
    Ok(true)
}
