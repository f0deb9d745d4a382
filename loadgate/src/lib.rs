//! Loadgate: declarative HTTP load scenarios, compiled and gated.
//!
//! A configuration document describes a scenario (requests, weights, tags, auth,
//! per-user setup with response captures) and how to judge the result. Loadgate
//! compiles it into an immutable [`compiler::Program`], hands the program to an
//! executor, reduces the samples to a [`report::MetricsSummary`] and decides a
//! [`gate::Verdict`] from comparison rules against a stored baseline plus absolute
//! gate thresholds.
//!
//! # Architecture
//!
//! - [`scenario`] / [`config`]: the document as written, read from JSON or YAML.
//! - [`compiler`]: validation, tag filtering and template parsing. Every problem is
//!   a [`error::ConfigError`] raised before any user starts.
//! - [`session`] / [`template`] / [`capture`]: per-virtual-user state. Placeholders
//!   are resolved on each request against builtins, captures and the environment.
//! - [`executor`]: the load engine boundary. [`RunExecutor`] takes a program and
//!   returns [`metric::Sample`]s; [`executor::UserExecutor`] runs users on tokio over
//!   a [`transport::Transport`], [`executor::ReplayExecutor`] replays a recording.
//! - [`Metric`] -> [`Aggregate`] -> [`report::MetricsSummary`]: samples are folded
//!   into an aggregate, then converted into the summary; a [`Reporter`] sends it
//!   somewhere.
//! - [`gate`]: comparison rules and thresholds, folded into a monotonic verdict.
//! - [`baseline`] / [`store`]: the promoted baseline and per-run artifacts.
//! - [`pipeline`]: compile, run, summarize, judge, record.
//!
//! # Example
//!
//! Judging a recorded run without touching the network:
//!
//! ```rust
//! use std::time::Duration;
//!
//! use loadgate::{
//!     aggregate::{Warmup, summarize},
//!     gate::{Gate, GateMode, Verdict, evaluate},
//!     metric::{Outcome, Sample},
//! };
//!
//! let samples: Vec<Sample> = (0..200)
//!     .map(|i| {
//!         let outcome = if i % 50 == 0 { Outcome::Status(500) } else { Outcome::Status(200) };
//!         Sample::new("GET /", Duration::from_millis(i * 10), Duration::from_millis(40), outcome)
//!     })
//!     .collect();
//!
//! let metrics = summarize(&samples, Warmup::default());
//! let gate = Gate::resolve(Some(GateMode::Acceptance), None).unwrap();
//! let analysis = evaluate(&metrics, None, &[], gate.as_ref());
//! assert_eq!(analysis.status, Verdict::Degradation);
//! ```
//!
//! # Feature flags
//!
//! - `http`: a `reqwest` [`transport::Transport`]. (Enabled by default)
//! - `cli`: the `loadgate` binary. (Enabled by default)

/// Sample aggregation
pub mod aggregate;
/// The promoted reference run
pub mod baseline;
/// Response captures
pub mod capture;
/// Scenario compilation
pub mod compiler;
/// Configuration documents
pub mod config;
pub mod error;
/// Load engines
pub mod executor;
/// Comparison rules, thresholds and verdicts
pub mod gate;
/// Single samples
pub mod metric;
pub mod pipeline;
/// Summaries and reporters
pub mod report;
pub mod scenario;
/// Per-user state
pub mod session;
pub mod starter;
/// Run artifacts
pub mod store;
/// Placeholder templates
pub mod template;
pub mod transport;

pub use aggregate::Aggregate;
pub use error::{Error, Result};
pub use executor::RunExecutor;
pub use metric::Metric;
pub use report::Reporter;

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use loadgate_macros::*;
}
