use std::{fmt::Debug, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::macros::metric;

/// A single measurement produced by the load engine.
///
/// Metrics are grouped by [`Metric::label`]; for request samples the label is the
/// request name from the scenario.
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    fn label(&self) -> &str;
}

/// How one request attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The server answered with this HTTP status.
    Status(u16),
    /// No status: transport error, timeout, or an unresolvable template.
    Failure(String),
}

/// Failure partition used by the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 503, usually deliberate backpressure.
    Unavailable,
    ClientError,
    ServerError,
    /// Failures without a 4xx/5xx status.
    Other,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        self.class() != StatusClass::Success
    }

    pub fn class(&self) -> StatusClass {
        match self {
            Self::Status(503) => StatusClass::Unavailable,
            Self::Status(200..=399) => StatusClass::Success,
            Self::Status(400..=499) => StatusClass::ClientError,
            Self::Status(500..=599) => StatusClass::ServerError,
            Self::Status(_) | Self::Failure(_) => StatusClass::Other,
        }
    }
}

/// One completed request attempt.
#[metric(label = name)]
pub struct Sample {
    pub name: String,
    /// When the request started, measured from the start of the run.
    #[serde(rename = "started_ms", with = "millis")]
    pub started: Duration,
    /// Request latency.
    #[serde(rename = "elapsed_ms", with = "millis")]
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl Sample {
    pub fn new(
        name: impl Into<String>,
        started: Duration,
        elapsed: Duration,
        outcome: Outcome,
    ) -> Self {
        Self {
            name: name.into(),
            started,
            elapsed,
            outcome,
        }
    }

    /// When the request finished, relative to run start.
    pub fn finished(&self) -> Duration {
        self.started + self.elapsed
    }
}

/// Durations as fractional milliseconds on the wire.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1e6)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom(format!("{ms} is not a valid millisecond value")));
        }
        Ok(Duration::from_nanos((ms * 1e6).round() as u64))
    }
}
