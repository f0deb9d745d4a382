use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    macros::aggregate,
    metric::{Metric, Sample, StatusClass},
    report::MetricsSummary,
};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected into an
/// intermediate representation.
///
/// Aggregates keep the raw material (latency lists, counters); final statistics such
/// as percentiles and rates are derived when the aggregate is converted into a
/// [`MetricsSummary`]. A run's samples are persisted raw, so they are always folded
/// in a single pass.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);
}

/// Latencies and failure counters for one group of samples (the whole run, or one
/// request name).
#[aggregate]
#[derive(Default)]
pub struct GroupAggregate {
    /// Microseconds, in arrival order. Sorted only when a report is derived.
    pub latencies_us: Vec<u64>,
    pub failures: u64,
    pub failures_4xx: u64,
    pub failures_5xx: u64,
    pub failures_503: u64,
}

impl GroupAggregate {
    pub fn count(&self) -> u64 {
        self.latencies_us.len() as u64
    }

    fn consume(&mut self, sample: &Sample) {
        self.latencies_us
            .push(u64::try_from(sample.elapsed.as_micros()).unwrap_or(u64::MAX));
        match sample.outcome.class() {
            StatusClass::Success => {}
            StatusClass::Unavailable => {
                self.failures += 1;
                self.failures_5xx += 1;
                self.failures_503 += 1;
            }
            StatusClass::ClientError => {
                self.failures += 1;
                self.failures_4xx += 1;
            }
            StatusClass::ServerError => {
                self.failures += 1;
                self.failures_5xx += 1;
            }
            StatusClass::Other => self.failures += 1,
        }
    }
}

/// Everything a [`MetricsSummary`] is derived from.
#[aggregate]
#[derive(Default)]
pub struct RunAggregate {
    pub overall: GroupAggregate,
    pub endpoints: BTreeMap<String, GroupAggregate>,
    /// Start of the measured window (end of warmup), microseconds since run start.
    pub window_start_us: u64,
    /// Latest completion among consumed samples, microseconds since run start.
    pub window_end_us: u64,
}

impl RunAggregate {
    /// An empty aggregate whose measured window begins at `start`.
    pub fn starting_at(start: Duration) -> Self {
        let start = u64::try_from(start.as_micros()).unwrap_or(u64::MAX);
        Self {
            window_start_us: start,
            window_end_us: start,
            ..Self::default()
        }
    }

    /// Length of the measured window.
    pub fn window(&self) -> Duration {
        Duration::from_micros(self.window_end_us.saturating_sub(self.window_start_us))
    }
}

impl Aggregate for RunAggregate {
    type Metric = Sample;

    fn new() -> Self {
        RunAggregate::default()
    }

    fn consume(&mut self, sample: &Self::Metric) {
        self.overall.consume(sample);
        self.endpoints
            .entry(sample.label().to_string())
            .or_default()
            .consume(sample);
        let finished = u64::try_from(sample.finished().as_micros()).unwrap_or(u64::MAX);
        self.window_end_us = self.window_end_us.max(finished);
    }
}

/// Samples that started inside the warmup span are excluded from the summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Warmup(pub Duration);

impl Warmup {
    pub fn from_seconds(seconds: Option<u64>) -> Self {
        Self(Duration::from_secs(seconds.unwrap_or(0)))
    }

    pub fn admits(&self, sample: &Sample) -> bool {
        sample.started >= self.0
    }
}

/// Reduce a finished run's sample stream to its summary.
///
/// Pure and deterministic: the same samples and warmup always give the same summary,
/// independent of sample order.
pub fn summarize(samples: &[Sample], warmup: Warmup) -> MetricsSummary {
    let mut agg = RunAggregate::starting_at(warmup.0);
    samples
        .iter()
        .filter(|s| warmup.admits(s))
        .for_each(|s| agg.consume(s));
    MetricsSummary::from(agg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Outcome;

    fn sample(name: &str, started_ms: u64, elapsed_ms: u64, outcome: Outcome) -> Sample {
        Sample::new(
            name,
            Duration::from_millis(started_ms),
            Duration::from_millis(elapsed_ms),
            outcome,
        )
    }

    #[test]
    fn partitions_failures_by_status_class() {
        let mut agg = RunAggregate::new();
        agg.aggregate(&[
            sample("a", 0, 10, Outcome::Status(200)),
            sample("a", 1, 10, Outcome::Status(404)),
            sample("b", 2, 10, Outcome::Status(500)),
            sample("b", 3, 10, Outcome::Status(503)),
            sample("b", 4, 10, Outcome::Failure("reset".into())),
        ]);
        assert_eq!(agg.overall.count(), 5);
        assert_eq!(agg.overall.failures, 4);
        assert_eq!(agg.overall.failures_4xx, 1);
        assert_eq!(agg.overall.failures_5xx, 2);
        assert_eq!(agg.overall.failures_503, 1);
        assert_eq!(agg.endpoints["a"].count(), 2);
        assert_eq!(agg.endpoints["b"].failures, 3);
        assert_eq!(agg.window(), Duration::from_millis(14));
    }

    #[test]
    fn warmup_drops_early_samples() {
        let samples = vec![
            sample("a", 500, 10, Outcome::Status(500)),
            sample("a", 1_500, 10, Outcome::Status(200)),
            sample("a", 2_000, 10, Outcome::Status(200)),
        ];
        let summary = summarize(&samples, Warmup(Duration::from_secs(1)));
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.failures, 0);
    }

    #[test]
    fn stream_inside_warmup_yields_nothing() {
        let samples = vec![
            sample("a", 0, 10, Outcome::Status(200)),
            sample("a", 900, 10, Outcome::Status(200)),
        ];
        let summary = summarize(&samples, Warmup::from_seconds(Some(5)));
        assert_eq!(summary.requests, 0);
        assert_eq!(summary.rps, 0.0);
        assert_eq!(summary.error_rate, 0.0);
    }

    #[test]
    fn summarizing_twice_is_byte_identical() {
        let samples: Vec<_> = (0..50)
            .map(|i| {
                let status = if i % 9 == 0 { 502 } else { 200 };
                sample("a", i * 13, (i * 37) % 101, Outcome::Status(status))
            })
            .collect();
        let first = serde_json::to_vec(&summarize(&samples, Warmup::default())).unwrap();
        let second = serde_json::to_vec(&summarize(&samples, Warmup::default())).unwrap();
        assert_eq!(first, second);

        let mut reversed = samples.clone();
        reversed.reverse();
        let third = serde_json::to_vec(&summarize(&reversed, Warmup::default())).unwrap();
        assert_eq!(first, third);
    }
}
