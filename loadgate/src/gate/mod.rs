//! Gate engine: turns a [`MetricsSummary`] into a [`Verdict`].
//!
//! Two kinds of checks feed one verdict:
//!
//! - comparison [`Rule`]s measure the change against the stored baseline;
//! - a [`Gate`] holds absolute thresholds on the current run (`acceptance` or
//!   `resilience` mode).
//!
//! Every check yields an [`Evaluation`]. The verdict is a fold of
//! `max(verdict, evaluation)` under `PASS < WARNING < DEGRADATION`, so it only ever
//! escalates and does not depend on rule order. Skipped evaluations never contribute.

mod compare;
mod threshold;

pub use compare::{Direction, Rule, RuleMode};
pub use threshold::{Gate, GateMode, GateSpec, Threshold, ThresholdSpec};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{baseline::Baseline, report::MetricsSummary};

/// Overall outcome of a run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    #[default]
    #[serde(alias = "pass")]
    Pass,
    #[serde(alias = "warning")]
    Warning,
    #[serde(alias = "degradation")]
    Degradation,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Warning => "WARNING",
            Self::Degradation => "DEGRADATION",
        })
    }
}

/// Outcome of one rule or threshold. `Skip` sorts below everything and never
/// reaches the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Skip,
    Pass,
    Warning,
    Degradation,
}

impl RuleStatus {
    pub fn verdict(self) -> Option<Verdict> {
        match self {
            Self::Skip => None,
            Self::Pass => Some(Verdict::Pass),
            Self::Warning => Some(Verdict::Warning),
            Self::Degradation => Some(Verdict::Degradation),
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verdict() {
            Some(v) => v.fmt(f),
            None => f.write_str("SKIP"),
        }
    }
}

/// Which check produced an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationKind {
    Relative,
    Absolute,
    Gate,
}

/// The record of one rule or threshold check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Metric name; gate thresholds are prefixed with `gate.`.
    pub metric: String,
    pub kind: EvaluationKind,
    pub direction: Direction,
    pub warn: Option<f64>,
    pub fail: Option<f64>,
    pub current: Option<f64>,
    pub baseline: Option<f64>,
    /// Percent for relative rules, metric units for absolute rules, unset for gates.
    pub delta: Option<f64>,
    pub status: RuleStatus,
    /// The threshold that was crossed, for WARNING and DEGRADATION.
    pub crossed: Option<f64>,
    pub reason: Option<String>,
}

impl Evaluation {
    fn new(metric: impl Into<String>, kind: EvaluationKind, direction: Direction) -> Self {
        Self {
            metric: metric.into(),
            kind,
            direction,
            warn: None,
            fail: None,
            current: None,
            baseline: None,
            delta: None,
            status: RuleStatus::Pass,
            crossed: None,
            reason: None,
        }
    }

    fn skip(mut self, reason: impl Into<String>) -> Self {
        self.status = RuleStatus::Skip;
        self.reason = Some(reason.into());
        self
    }

    fn with_status(mut self, status: RuleStatus) -> Self {
        self.crossed = match status {
            RuleStatus::Degradation => self.fail,
            RuleStatus::Warning => self.warn,
            RuleStatus::Pass | RuleStatus::Skip => None,
        };
        self.status = status;
        self
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status, self.metric)?;
        if let Some(current) = self.current {
            write!(f, " current={current:.3}")?;
        }
        if let Some(baseline) = self.baseline {
            write!(f, " baseline={baseline:.3}")?;
        }
        if let Some(delta) = self.delta {
            match self.kind {
                EvaluationKind::Relative => write!(f, " delta={delta:+.2}%")?,
                _ => write!(f, " delta={delta:+.3}")?,
            }
        }
        if let Some(crossed) = self.crossed {
            write!(f, " crossed {:?} threshold {crossed}", self.direction)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

/// Fold evaluations into a verdict. Escalate-only, order independent.
pub fn fold<'a, I>(evaluations: I) -> Verdict
where
    I: IntoIterator<Item = &'a Evaluation>,
{
    evaluations
        .into_iter()
        .filter_map(|e| e.status.verdict())
        .fold(Verdict::Pass, Verdict::max)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    #[serde(rename = "PASS")]
    pub pass: usize,
    #[serde(rename = "WARNING")]
    pub warning: usize,
    #[serde(rename = "DEGRADATION")]
    pub degradation: usize,
    #[serde(rename = "SKIP")]
    pub skip: usize,
}

impl StatusCounts {
    fn tally(evaluations: &[Evaluation]) -> Self {
        evaluations
            .iter()
            .fold(Self::default(), |mut counts, e| {
                match e.status {
                    RuleStatus::Pass => counts.pass += 1,
                    RuleStatus::Warning => counts.warning += 1,
                    RuleStatus::Degradation => counts.degradation += 1,
                    RuleStatus::Skip => counts.skip += 1,
                }
                counts
            })
    }
}

/// What the gate looked at, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub mode: GateMode,
    pub min_requests: u64,
    pub warmup_seconds: Option<u64>,
    pub requests_used: u64,
    pub failures_used: u64,
    /// False when the gate was skipped for lack of samples.
    pub applied: bool,
}

/// Verdict plus every evaluation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub status: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub summary: StatusCounts,
    pub results: Vec<Evaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateReport>,
    /// True when the gate was skipped for too few samples: the PASS is not a
    /// judgement.
    pub inconclusive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

impl Analysis {
    /// Evaluations at WARNING or worse.
    pub fn fired(&self) -> impl Iterator<Item = &Evaluation> {
        self.results
            .iter()
            .filter(|e| e.status >= RuleStatus::Warning)
    }

    /// Whether this verdict should fail the run.
    pub fn fails(&self, fail_on: Verdict) -> bool {
        fails(self.status, fail_on)
    }
}

/// `fail_on` of PASS would fail every run, so it is treated as WARNING.
pub fn fails(verdict: Verdict, fail_on: Verdict) -> bool {
    verdict >= fail_on.max(Verdict::Warning)
}

/// Run every comparison rule and the gate (when configured) against `metrics`.
///
/// `baseline` of `None` skips the comparison rules; a gate whose request floor is not
/// met is skipped and the analysis marked inconclusive.
pub fn evaluate(
    metrics: &MetricsSummary,
    baseline: Option<&Baseline>,
    rules: &[Rule],
    gate: Option<&Gate>,
) -> Analysis {
    let mut results = Vec::with_capacity(rules.len());
    let mut annotations = Vec::new();

    if !rules.is_empty() {
        let baseline_metrics = baseline.map(|b| &b.metrics);
        if baseline_metrics.is_none() {
            tracing::info!(
                rules = rules.len(),
                "baseline unavailable, comparison rules skipped"
            );
            annotations.push(format!(
                "baseline unavailable: {} comparison rule(s) skipped",
                rules.len()
            ));
        }
        results.extend(
            rules
                .iter()
                .map(|rule| rule.evaluate(metrics, baseline_metrics)),
        );
    }

    let mut inconclusive = false;
    let gate_report = gate.map(|gate| {
        let (evaluations, report) = gate.evaluate(metrics);
        if !report.applied {
            inconclusive = true;
            let note = format!(
                "inconclusive: {} gate skipped, {} post-warmup request(s) below min_requests {}",
                report.mode, report.requests_used, report.min_requests
            );
            tracing::warn!("{note}");
            annotations.push(note);
        }
        results.extend(evaluations);
        report
    });

    Analysis {
        status: fold(&results),
        run_id: None,
        baseline_id: baseline.map(|b| b.run_id.clone()),
        evaluated_at: Utc::now(),
        summary: StatusCounts::tally(&results),
        results,
        gate: gate_report,
        inconclusive,
        annotations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Baseline;

    fn eval(status: RuleStatus) -> Evaluation {
        Evaluation::new("m", EvaluationKind::Gate, Direction::Increase).with_status(status)
    }

    #[test]
    fn verdict_order() {
        assert!(Verdict::Pass < Verdict::Warning);
        assert!(Verdict::Warning < Verdict::Degradation);
        assert_eq!(fold(&[]), Verdict::Pass);
    }

    #[test]
    fn fold_is_escalate_only_and_order_independent() {
        let statuses = [
            RuleStatus::Skip,
            RuleStatus::Pass,
            RuleStatus::Warning,
            RuleStatus::Degradation,
        ];
        // every sequence of up to three statuses
        for a in statuses {
            for b in statuses {
                for c in statuses {
                    let forward = [eval(a), eval(b), eval(c)];
                    let backward = [eval(c), eval(b), eval(a)];
                    let expected = [a, b, c]
                        .into_iter()
                        .filter_map(RuleStatus::verdict)
                        .max()
                        .unwrap_or(Verdict::Pass);
                    assert_eq!(fold(&forward), expected);
                    assert_eq!(fold(&backward), expected);
                }
            }
        }
    }

    #[test]
    fn adding_a_failing_evaluation_never_lowers_the_verdict() {
        let statuses = [
            RuleStatus::Skip,
            RuleStatus::Pass,
            RuleStatus::Warning,
            RuleStatus::Degradation,
        ];
        for a in statuses {
            for b in statuses {
                let base = vec![eval(a), eval(b)];
                let before = fold(&base);
                for failing in [RuleStatus::Warning, RuleStatus::Degradation] {
                    let mut more = base.clone();
                    more.push(eval(failing));
                    let after = fold(&more);
                    assert!(after >= before);
                    assert!(after >= failing.verdict().unwrap());
                }
            }
        }
    }

    #[test]
    fn skips_never_escalate() {
        assert_eq!(fold(&[eval(RuleStatus::Skip), eval(RuleStatus::Skip)]), Verdict::Pass);
    }

    #[test]
    fn fail_on_threshold() {
        assert!(!fails(Verdict::Warning, Verdict::Degradation));
        assert!(fails(Verdict::Degradation, Verdict::Degradation));
        assert!(fails(Verdict::Warning, Verdict::Warning));
        assert!(!fails(Verdict::Pass, Verdict::Warning));
        assert!(!fails(Verdict::Pass, Verdict::Pass));
    }

    #[test]
    fn verdict_serializes_uppercase_and_accepts_lowercase() {
        assert_eq!(
            serde_json::to_string(&Verdict::Degradation).unwrap(),
            "\"DEGRADATION\""
        );
        let v: Verdict = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(v, Verdict::Warning);
    }

    #[test]
    fn regression_against_baseline_is_degradation() {
        let baseline = Baseline::new(
            "base",
            MetricsSummary {
                requests: 1000,
                p95_ms: 100.0,
                ..Default::default()
            },
        );
        let current = MetricsSummary {
            requests: 1000,
            p95_ms: 130.0,
            ..Default::default()
        };
        let rule = Rule {
            metric: "p95_ms".into(),
            mode: RuleMode::Relative,
            direction: Direction::Increase,
            warn: 10.0,
            fail: 25.0,
        };
        let analysis = evaluate(&current, Some(&baseline), &[rule], None);
        assert_eq!(analysis.status, Verdict::Degradation);
        assert_eq!(analysis.baseline_id.as_deref(), Some("base"));
        let fired: Vec<_> = analysis.fired().collect();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].crossed, Some(25.0));
        assert!((fired[0].delta.unwrap() - 30.0).abs() < 1e-9);
        assert!(fired[0].to_string().contains("p95_ms"));
        assert!(analysis.fails(Verdict::Degradation));
    }

    #[test]
    fn missing_baseline_skips_rules_with_a_note() {
        let rule = Rule {
            metric: "rps".into(),
            mode: RuleMode::Relative,
            direction: Direction::Decrease,
            warn: 10.0,
            fail: 20.0,
        };
        let analysis = evaluate(&MetricsSummary::default(), None, &[rule], None);
        assert_eq!(analysis.status, Verdict::Pass);
        assert_eq!(analysis.summary.skip, 1);
        assert!(analysis.annotations[0].contains("baseline unavailable"));
        assert!(!analysis.inconclusive);
    }

    #[test]
    fn resilience_gate_warns_on_small_error_rate() {
        let spec: GateSpec = serde_json::from_value(serde_json::json!({
            "thresholds": {"error_rate_non_503": {"fail": 2}}
        }))
        .unwrap();
        let gate = Gate::resolve(Some(GateMode::Resilience), Some(&spec))
            .unwrap()
            .unwrap();
        let current = MetricsSummary {
            requests: 500,
            error_rate_non_503: 0.5,
            ..Default::default()
        };
        let analysis = evaluate(&current, None, &[], Some(&gate));
        assert_eq!(analysis.status, Verdict::Warning);
        assert_eq!(analysis.results[0].metric, "gate.error_rate_non_503");
        assert_eq!(analysis.results[0].crossed, Some(0.0));
    }

    #[test]
    fn too_few_requests_is_inconclusive_pass() {
        let spec: GateSpec = serde_json::from_value(serde_json::json!({
            "min_requests": 100,
            "thresholds": {"error_rate": {"fail": 0}}
        }))
        .unwrap();
        let gate = Gate::resolve(Some(GateMode::Acceptance), Some(&spec))
            .unwrap()
            .unwrap();
        let current = MetricsSummary {
            requests: 40,
            failures: 40,
            error_rate: 100.0,
            ..Default::default()
        };
        let analysis = evaluate(&current, None, &[], Some(&gate));
        assert_eq!(analysis.status, Verdict::Pass);
        assert!(analysis.inconclusive);
        assert!(analysis.annotations[0].contains("inconclusive"));
        assert_eq!(analysis.gate.as_ref().map(|g| g.applied), Some(false));
        assert!(analysis.results.iter().all(|e| e.status == RuleStatus::Skip));
    }

    #[test]
    fn comparison_and_gate_merge_into_one_verdict() {
        let baseline = Baseline::new(
            "b",
            MetricsSummary {
                requests: 100,
                rps: 50.0,
                ..Default::default()
            },
        );
        let current = MetricsSummary {
            requests: 100,
            rps: 47.0,
            error_rate: 3.0,
            ..Default::default()
        };
        let rule = Rule {
            metric: "rps".into(),
            mode: RuleMode::Relative,
            direction: Direction::Decrease,
            warn: 5.0,
            fail: 20.0,
        };
        let spec: GateSpec = serde_json::from_value(serde_json::json!({
            "thresholds": {"error_rate": {"warn": 1, "fail": 5}}
        }))
        .unwrap();
        let gate = Gate::resolve(Some(GateMode::Acceptance), Some(&spec))
            .unwrap()
            .unwrap();
        let analysis = evaluate(&current, Some(&baseline), &[rule], Some(&gate));
        assert_eq!(analysis.status, Verdict::Warning);
        assert_eq!(analysis.summary.warning, 2);
        assert_eq!(analysis.results.len(), 2);
    }
}
