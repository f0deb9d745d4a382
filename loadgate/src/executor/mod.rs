//! Executor: the load engine boundary.
//!
//! A [`RunExecutor`] accepts a compiled [`Program`] and, given [`LoadParams`],
//! produces the run's sample stream. Everything past that boundary (connections,
//! pacing, concurrency) belongs to the executor; the rest of the crate only sees
//! [`Sample`]s.
//!
//! Two executors ship with the crate:
//!
//! - [`UserExecutor`] runs `users` virtual users on tokio over a pluggable
//!   [`crate::transport::Transport`]. Users are started at `spawn_rate` per second,
//!   each owning its [`crate::session::Session`]. When `run_time` is over the
//!   shutdown signal is raised; users finish their in-flight request and stop, and
//!   anything still running after `stop_timeout` is aborted.
//! - [`ReplayExecutor`] yields a recorded sample stream, for re-analysing a run or
//!   for tests.
//!
//! Samples are returned ordered by completion time. A run cut short yields a shorter
//! stream; that is not an error.

pub mod replay;
pub mod users;

pub use replay::ReplayExecutor;
pub use users::UserExecutor;

use std::sync::Arc;

use crate::{compiler::Program, config::LoadParams, error::ExecutorError, metric::Sample};

pub trait RunExecutor
where
    Self: Send + Sync,
{
    /// Hand the compiled program to the engine. Must precede [`RunExecutor::run`].
    fn load(&mut self, program: Arc<Program>) -> Result<(), ExecutorError>;

    /// Execute the loaded program and return every sample.
    fn run(
        &self,
        params: &LoadParams,
    ) -> impl Future<Output = Result<Vec<Sample>, ExecutorError>> + Send;
}

/// Completion order; ties broken by start time, then name.
pub(crate) fn sort_by_completion(samples: &mut [Sample]) {
    samples.sort_by(|a, b| {
        a.finished()
            .cmp(&b.finished())
            .then_with(|| a.started.cmp(&b.started))
            .then_with(|| a.name.cmp(&b.name))
    });
}
