use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use super::{Direction, Evaluation, EvaluationKind, GateReport, RuleStatus};
use crate::{
    aggregate::Warmup,
    error::ConfigError,
    report::{MetricsSummary, is_error_metric},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Hard limits for a healthy system; with no thresholds, any error fails.
    Acceptance,
    /// Limits under induced stress; error-class metrics warn on any error.
    Resilience,
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acceptance => "acceptance",
            Self::Resilience => "resilience",
        })
    }
}

/// A threshold as written: a bare number is the `fail` limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Fail(f64),
    Limits {
        #[serde(default)]
        warn: Option<f64>,
        #[serde(default)]
        fail: Option<f64>,
        #[serde(default)]
        direction: Direction,
    },
}

/// The `analysis.gate` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GateMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdSpec>,
}

/// A resolved threshold, mode defaults applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub warn: Option<f64>,
    pub fail: Option<f64>,
    pub direction: Direction,
}

impl Threshold {
    /// A ceiling is breached strictly above it, a floor at or below it.
    fn breached(&self, current: f64, limit: f64) -> bool {
        match self.direction {
            Direction::Increase => current > limit,
            Direction::Decrease => current <= limit,
        }
    }

    fn status(&self, current: f64) -> RuleStatus {
        if self.fail.is_some_and(|fail| self.breached(current, fail)) {
            RuleStatus::Degradation
        } else if self.warn.is_some_and(|warn| self.breached(current, warn)) {
            RuleStatus::Warning
        } else {
            RuleStatus::Pass
        }
    }
}

/// An absolute-threshold gate ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct Gate {
    pub mode: GateMode,
    pub min_requests: u64,
    pub warmup_seconds: Option<u64>,
    pub thresholds: BTreeMap<String, Threshold>,
}

impl Gate {
    /// Build the gate from `analysis.mode` and `analysis.gate`.
    ///
    /// Returns `None` when no gate applies: no mode and no thresholds, or
    /// `resilience` without thresholds. `acceptance` without thresholds fails on any
    /// error. Thresholds without a mode imply `resilience`.
    pub fn resolve(
        mode: Option<GateMode>,
        spec: Option<&GateSpec>,
    ) -> Result<Option<Self>, ConfigError> {
        let empty = GateSpec::default();
        let spec = spec.unwrap_or(&empty);

        let mode = match mode.or(spec.mode) {
            Some(mode) => mode,
            None if spec.thresholds.is_empty() => return Ok(None),
            None => GateMode::Resilience,
        };

        let mut thresholds = BTreeMap::new();
        for (metric, raw) in &spec.thresholds {
            let field = format!("analysis.gate.thresholds.{metric}");
            if !MetricsSummary::is_known_metric(metric) {
                return Err(ConfigError::invalid(field, format!("unknown metric `{metric}`")));
            }
            let mut threshold = match *raw {
                ThresholdSpec::Fail(fail) => Threshold {
                    warn: None,
                    fail: Some(fail),
                    direction: Direction::Increase,
                },
                ThresholdSpec::Limits {
                    warn,
                    fail,
                    direction,
                } => Threshold {
                    warn,
                    fail,
                    direction,
                },
            };
            if let Some(bad) = [threshold.warn, threshold.fail]
                .into_iter()
                .flatten()
                .find(|v| !v.is_finite())
            {
                return Err(ConfigError::invalid(field, format!("{bad} is not a finite limit")));
            }
            if mode == GateMode::Resilience
                && threshold.warn.is_none()
                && threshold.fail.is_some()
                && is_error_metric(metric)
            {
                threshold.warn = Some(0.0);
            }
            thresholds.insert(metric.clone(), threshold);
        }

        if thresholds.is_empty() {
            match mode {
                GateMode::Resilience => return Ok(None),
                GateMode::Acceptance => {
                    thresholds.insert(
                        "error_rate".to_string(),
                        Threshold {
                            warn: None,
                            fail: Some(0.0),
                            direction: Direction::Increase,
                        },
                    );
                }
            }
        }

        Ok(Some(Self {
            mode,
            min_requests: spec.min_requests.unwrap_or(0),
            warmup_seconds: spec.warmup_seconds,
            thresholds,
        }))
    }

    /// Span at the start of the run whose samples the gate ignores.
    pub fn warmup(&self) -> Warmup {
        Warmup::from_seconds(self.warmup_seconds)
    }

    /// `metrics` must already exclude the warmup span.
    pub(super) fn evaluate(&self, metrics: &MetricsSummary) -> (Vec<Evaluation>, GateReport) {
        let applied = metrics.requests > 0 && metrics.requests >= self.min_requests;
        let skip_reason = if metrics.requests == 0 {
            "no requests after warmup"
        } else {
            "min_requests not met"
        };

        let evaluations = self
            .thresholds
            .iter()
            .map(|(metric, threshold)| {
                let mut eval = Evaluation::new(
                    format!("gate.{metric}"),
                    EvaluationKind::Gate,
                    threshold.direction,
                );
                eval.warn = threshold.warn;
                eval.fail = threshold.fail;
                eval.current = metrics.metric(metric);

                if !applied {
                    return eval.skip(skip_reason);
                }
                let Some(current) = eval.current else {
                    return eval.skip("missing current value");
                };
                if threshold.warn.is_none() && threshold.fail.is_none() {
                    return eval.skip("missing thresholds");
                }
                eval.with_status(threshold.status(current))
            })
            .collect();

        let report = GateReport {
            mode: self.mode,
            min_requests: self.min_requests,
            warmup_seconds: self.warmup_seconds,
            requests_used: metrics.requests,
            failures_used: metrics.failures,
            applied,
        };
        (evaluations, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: serde_json::Value) -> GateSpec {
        serde_json::from_value(json).unwrap()
    }

    fn metrics(requests: u64, error_rate: f64) -> MetricsSummary {
        MetricsSummary {
            requests,
            error_rate,
            ..Default::default()
        }
    }

    #[test]
    fn no_mode_and_no_thresholds_means_no_gate() {
        assert_eq!(Gate::resolve(None, None).unwrap(), None);
        assert_eq!(
            Gate::resolve(Some(GateMode::Resilience), Some(&GateSpec::default())).unwrap(),
            None
        );
    }

    #[test]
    fn acceptance_defaults_to_zero_errors() {
        let gate = Gate::resolve(Some(GateMode::Acceptance), None)
            .unwrap()
            .unwrap();
        let t = gate.thresholds["error_rate"];
        assert_eq!(t.fail, Some(0.0));
        assert_eq!(t.warn, None);

        let (evals, report) = gate.evaluate(&metrics(10, 0.0));
        assert!(report.applied);
        assert_eq!(evals[0].status, RuleStatus::Pass);
        let (evals, _) = gate.evaluate(&metrics(10, 10.0));
        assert_eq!(evals[0].status, RuleStatus::Degradation);
    }

    #[test]
    fn thresholds_without_mode_imply_resilience() {
        let s = spec(serde_json::json!({"thresholds": {"error_rate_5xx": 3, "p95_ms": 500}}));
        let gate = Gate::resolve(None, Some(&s)).unwrap().unwrap();
        assert_eq!(gate.mode, GateMode::Resilience);
        // error-class metrics pick up warn = 0, latency does not
        assert_eq!(gate.thresholds["error_rate_5xx"].warn, Some(0.0));
        assert_eq!(gate.thresholds["p95_ms"].warn, None);
    }

    #[test]
    fn gate_section_mode_is_used_when_analysis_mode_is_absent() {
        let s = spec(serde_json::json!({"mode": "acceptance", "thresholds": {"error_rate": 1}}));
        let gate = Gate::resolve(None, Some(&s)).unwrap().unwrap();
        assert_eq!(gate.mode, GateMode::Acceptance);
        assert_eq!(gate.thresholds["error_rate"].warn, None);
    }

    #[test]
    fn increase_is_strict() {
        let s = spec(serde_json::json!({"thresholds": {"error_rate": {"warn": 1, "fail": 5}}}));
        let gate = Gate::resolve(Some(GateMode::Acceptance), Some(&s))
            .unwrap()
            .unwrap();
        let status = |rate| gate.evaluate(&metrics(100, rate)).0[0].status;
        assert_eq!(status(1.0), RuleStatus::Pass);
        assert_eq!(status(1.5), RuleStatus::Warning);
        assert_eq!(status(5.0), RuleStatus::Warning);
        assert_eq!(status(5.1), RuleStatus::Degradation);
    }

    #[test]
    fn decrease_breaches_below_the_limit() {
        let s = spec(serde_json::json!({
            "thresholds": {"rps": {"warn": 50, "fail": 20, "direction": "decrease"}}
        }));
        let gate = Gate::resolve(Some(GateMode::Acceptance), Some(&s))
            .unwrap()
            .unwrap();
        let status = |rps| {
            let m = MetricsSummary {
                requests: 100,
                rps,
                ..Default::default()
            };
            gate.evaluate(&m).0[0].status
        };
        assert_eq!(status(80.0), RuleStatus::Pass);
        assert_eq!(status(40.0), RuleStatus::Warning);
        assert_eq!(status(10.0), RuleStatus::Degradation);
        // the floor itself already breaches
        assert_eq!(status(50.0), RuleStatus::Warning);
        assert_eq!(status(20.0), RuleStatus::Degradation);
    }

    #[test]
    fn increase_limit_itself_passes() {
        let s = spec(serde_json::json!({"thresholds": {"p95_ms": {"warn": 500, "fail": 1000}}}));
        let gate = Gate::resolve(Some(GateMode::Acceptance), Some(&s))
            .unwrap()
            .unwrap();
        let status = |p95_ms| {
            let m = MetricsSummary {
                requests: 100,
                p95_ms,
                ..Default::default()
            };
            gate.evaluate(&m).0[0].status
        };
        assert_eq!(status(500.0), RuleStatus::Pass);
        assert_eq!(status(1000.0), RuleStatus::Warning);
        assert_eq!(status(1000.5), RuleStatus::Degradation);
    }

    #[test]
    fn zero_requests_skip_even_without_floor() {
        let gate = Gate::resolve(Some(GateMode::Acceptance), None)
            .unwrap()
            .unwrap();
        let (evals, report) = gate.evaluate(&metrics(0, 0.0));
        assert!(!report.applied);
        assert_eq!(evals[0].status, RuleStatus::Skip);
        assert_eq!(evals[0].reason.as_deref(), Some("no requests after warmup"));
    }

    #[test]
    fn unknown_threshold_metric_is_a_config_error() {
        let s = spec(serde_json::json!({"thresholds": {"latency": 5}}));
        let err = Gate::resolve(None, Some(&s)).unwrap_err();
        assert!(
            err.to_string().contains("analysis.gate.thresholds.latency"),
            "{err}"
        );
    }

    #[test]
    fn warmup_comes_from_gate_section() {
        let s = spec(serde_json::json!({"warmup_seconds": 10, "thresholds": {"p95_ms": 500}}));
        let gate = Gate::resolve(None, Some(&s)).unwrap().unwrap();
        assert_eq!(gate.warmup(), Warmup(std::time::Duration::from_secs(10)));
    }
}
