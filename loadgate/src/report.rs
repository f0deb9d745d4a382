use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{GroupAggregate, RunAggregate},
    error::StoreError,
    gate::{Analysis, RuleStatus},
};

/// Metric names a rule or threshold may reference.
pub const METRIC_NAMES: &[&str] = &[
    "requests",
    "failures",
    "rps",
    "avg_ms",
    "median_ms",
    "min_ms",
    "max_ms",
    "p95_ms",
    "p99_ms",
    "error_rate",
    "error_rate_4xx",
    "error_rate_5xx",
    "error_rate_503",
    "error_rate_non_503",
    "failures_4xx",
    "failures_5xx",
    "failures_503",
    "failures_non_503",
];

/// Metrics counted as errors; resilience gates default their `warn` to 0.
pub fn is_error_metric(name: &str) -> bool {
    name.starts_with("error_rate") || name.starts_with("failures")
}

/// Summary of one run. Error rates are percentages of `requests`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub requests: u64,
    pub failures: u64,
    pub rps: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate: f64,
    pub error_rate_4xx: f64,
    pub error_rate_5xx: f64,
    pub error_rate_503: f64,
    pub error_rate_non_503: f64,
    pub failures_4xx: u64,
    pub failures_5xx: u64,
    pub failures_503: u64,
    pub failures_non_503: u64,
    /// Length of the measured (post-warmup) window.
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, EndpointSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSummary {
    pub requests: u64,
    pub failures: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub error_rate: f64,
}

impl MetricsSummary {
    /// Look a metric up by the name used in rules and thresholds.
    pub fn metric(&self, name: &str) -> Option<f64> {
        Some(match name {
            "requests" | "total_requests" => self.requests as f64,
            "failures" | "total_failures" => self.failures as f64,
            "rps" => self.rps,
            "avg_ms" => self.avg_ms,
            "median_ms" => self.median_ms,
            "min_ms" => self.min_ms,
            "max_ms" => self.max_ms,
            "p95_ms" => self.p95_ms,
            "p99_ms" => self.p99_ms,
            "error_rate" => self.error_rate,
            "error_rate_4xx" => self.error_rate_4xx,
            "error_rate_5xx" => self.error_rate_5xx,
            "error_rate_503" => self.error_rate_503,
            "error_rate_non_503" => self.error_rate_non_503,
            "failures_4xx" => self.failures_4xx as f64,
            "failures_5xx" => self.failures_5xx as f64,
            "failures_503" => self.failures_503 as f64,
            "failures_non_503" => self.failures_non_503 as f64,
            _ => return None,
        })
    }

    pub fn is_known_metric(name: &str) -> bool {
        Self::default().metric(name).is_some()
    }
}

/// Nearest-rank percentile over an ascending slice: the value at rank
/// `ceil(p / 100 * n)` (1-based). Empty input gives 0.
pub fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let rank = (percentile * n as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

fn ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

struct Latencies {
    sorted: Vec<u64>,
}

impl Latencies {
    fn new(mut raw: Vec<u64>) -> Self {
        raw.sort_unstable();
        Self { sorted: raw }
    }

    fn avg_ms(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        let total: u128 = self.sorted.iter().map(|&v| u128::from(v)).sum();
        total as f64 / self.sorted.len() as f64 / 1000.0
    }

    fn pct_ms(&self, p: f64) -> f64 {
        ms(nearest_rank(&self.sorted, p))
    }
}

impl From<GroupAggregate> for EndpointSummary {
    fn from(value: GroupAggregate) -> Self {
        let requests = value.count();
        let latencies = Latencies::new(value.latencies_us);
        Self {
            requests,
            failures: value.failures,
            avg_ms: latencies.avg_ms(),
            p95_ms: latencies.pct_ms(95.0),
            error_rate: rate(value.failures, requests),
        }
    }
}

impl From<RunAggregate> for MetricsSummary {
    fn from(value: RunAggregate) -> Self {
        let window = value.window();
        let overall = value.overall;
        let requests = overall.count();
        let failures_non_503 = overall.failures - overall.failures_503;
        let latencies = Latencies::new(overall.latencies_us);
        let secs = window.as_secs_f64();

        Self {
            requests,
            failures: overall.failures,
            rps: if secs > 0.0 { requests as f64 / secs } else { 0.0 },
            avg_ms: latencies.avg_ms(),
            median_ms: latencies.pct_ms(50.0),
            min_ms: latencies.sorted.first().copied().map(ms).unwrap_or(0.0),
            max_ms: latencies.sorted.last().copied().map(ms).unwrap_or(0.0),
            p95_ms: latencies.pct_ms(95.0),
            p99_ms: latencies.pct_ms(99.0),
            error_rate: rate(overall.failures, requests),
            error_rate_4xx: rate(overall.failures_4xx, requests),
            error_rate_5xx: rate(overall.failures_5xx, requests),
            error_rate_503: rate(overall.failures_503, requests),
            error_rate_non_503: rate(failures_non_503, requests),
            failures_4xx: overall.failures_4xx,
            failures_5xx: overall.failures_5xx,
            failures_503: overall.failures_503,
            failures_non_503,
            duration_s: secs,
            endpoints: value
                .endpoints
                .into_iter()
                .map(|(name, group)| (name, EndpointSummary::from(group)))
                .collect(),
        }
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "requests {} | failures {} ({:.2}%) | {:.2} req/s over {:.1}s",
            self.requests, self.failures, self.error_rate, self.rps, self.duration_s
        )?;
        writeln!(
            f,
            "latency ms: avg {:.1} | p50 {:.1} | p95 {:.1} | p99 {:.1} | max {:.1}",
            self.avg_ms, self.median_ms, self.p95_ms, self.p99_ms, self.max_ms
        )?;
        write!(
            f,
            "errors %: 4xx {:.2} | 5xx {:.2} | 503 {:.2} | non-503 {:.2}",
            self.error_rate_4xx, self.error_rate_5xx, self.error_rate_503, self.error_rate_non_503
        )?;
        for (name, e) in &self.endpoints {
            write!(
                f,
                "\n  {name}: {} req, {:.2}% errors, avg {:.1} ms, p95 {:.1} ms",
                e.requests, e.error_rate, e.avg_ms, e.p95_ms
            )?;
        }
        Ok(())
    }
}

/// Sends a report somewhere: stdout, a file, a database.
#[async_trait]
pub trait Reporter<R>
where
    R: Serialize + Send + Sync,
{
    async fn report(&self, report: &R) -> Result<(), StoreError>;
}

/// Prints human-readable summaries.
pub struct StdoutReporter;

#[async_trait]
impl Reporter<MetricsSummary> for StdoutReporter {
    async fn report(&self, report: &MetricsSummary) -> Result<(), StoreError> {
        println!("{report}");
        Ok(())
    }
}

#[async_trait]
impl Reporter<Analysis> for StdoutReporter {
    async fn report(&self, report: &Analysis) -> Result<(), StoreError> {
        println!("verdict: {}", report.status);
        for note in &report.annotations {
            println!("  note: {note}");
        }
        for e in report.results.iter().filter(|e| e.status >= RuleStatus::Warning) {
            println!("  {e}");
        }
        Ok(())
    }
}

/// Writes the report as pretty-printed JSON.
pub struct JsonReporter {
    pub path: PathBuf,
}

#[async_trait]
impl<R> Reporter<R> for JsonReporter
where
    R: Serialize + Send + Sync,
{
    async fn report(&self, report: &R) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(report)
            .map_err(|e| StoreError::serialization(&self.path, e))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }
}
