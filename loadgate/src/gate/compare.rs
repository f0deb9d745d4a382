use serde::{Deserialize, Serialize};

use super::{Evaluation, EvaluationKind, RuleStatus};
use crate::{error::ConfigError, report::MetricsSummary};

/// How the change against the baseline is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    /// Percent change: `(current - baseline) / baseline * 100`.
    Relative,
    /// Raw change: `current - baseline`.
    Absolute,
}

/// Which way is worse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Higher is worse (latency, error rates).
    #[default]
    Increase,
    /// Lower is worse (throughput).
    Decrease,
}

impl Direction {
    /// Magnitude of `delta` in the worse direction; zero when it moved the good way.
    fn worse_by(self, delta: f64) -> f64 {
        match self {
            Self::Increase => delta.max(0.0),
            Self::Decrease => (-delta).max(0.0),
        }
    }
}

/// A regression check against the stored baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub metric: String,
    pub mode: RuleMode,
    #[serde(default)]
    pub direction: Direction,
    pub warn: f64,
    pub fail: f64,
}

impl Rule {
    /// `field` locates the rule in the document for error messages.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !MetricsSummary::is_known_metric(&self.metric) {
            return Err(ConfigError::invalid(
                format!("{field}.metric"),
                format!("unknown metric `{}`", self.metric),
            ));
        }
        for (name, value) in [("warn", self.warn), ("fail", self.fail)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(
                    format!("{field}.{name}"),
                    format!("{value} is not a non-negative number"),
                ));
            }
        }
        if self.warn > self.fail {
            return Err(ConfigError::invalid(
                field,
                format!("warn ({}) is greater than fail ({})", self.warn, self.fail),
            ));
        }
        Ok(())
    }

    pub(super) fn evaluate(
        &self,
        current: &MetricsSummary,
        baseline: Option<&MetricsSummary>,
    ) -> Evaluation {
        let kind = match self.mode {
            RuleMode::Relative => EvaluationKind::Relative,
            RuleMode::Absolute => EvaluationKind::Absolute,
        };
        let mut eval = Evaluation::new(self.metric.as_str(), kind, self.direction);
        eval.warn = Some(self.warn);
        eval.fail = Some(self.fail);
        eval.current = current.metric(&self.metric);

        let Some(baseline) = baseline else {
            return eval.skip("baseline unavailable");
        };
        eval.baseline = baseline.metric(&self.metric);

        let (Some(cur), Some(base)) = (eval.current, eval.baseline) else {
            return eval.skip(format!("metric `{}` not available", self.metric));
        };

        let delta = match self.mode {
            RuleMode::Absolute => cur - base,
            RuleMode::Relative if base == 0.0 => {
                return eval.skip("baseline value is zero");
            }
            RuleMode::Relative => (cur - base) / base * 100.0,
        };
        eval.delta = Some(delta);

        // thresholds are inclusive: a zero threshold fires on an unchanged value
        let worse = self.direction.worse_by(delta);
        let status = if worse >= self.fail {
            RuleStatus::Degradation
        } else if worse >= self.warn {
            RuleStatus::Warning
        } else {
            RuleStatus::Pass
        };
        eval.with_status(status)
    }
}
