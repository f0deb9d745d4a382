use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{
    sync::{
        mpsc::{self, UnboundedSender},
        watch::{self, Receiver, Sender},
    },
    task::JoinHandle,
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{RunExecutor, sort_by_completion};
use crate::{
    compiler::{CompiledRequest, Program},
    config::LoadParams,
    error::ExecutorError,
    metric::{Outcome, Sample},
    session::Session,
    transport::Transport,
};

/// Runs virtual users on tokio tasks.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use loadgate::{executor::{RunExecutor, UserExecutor}, transport::HttpTransport};
/// # async fn demo(program: Arc<loadgate::compiler::Program>, params: loadgate::config::LoadParams) {
/// let transport = HttpTransport::new(&params.host).unwrap();
/// let mut executor = UserExecutor::builder().transport(Arc::new(transport)).build();
/// executor.load(program).unwrap();
/// let samples = executor.run(&params).await.unwrap();
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct UserExecutor<T: Transport> {
    pub transport: Arc<T>,
    #[builder(default, setter(skip))]
    program: Option<Arc<Program>>,
}

impl<T: Transport> RunExecutor for UserExecutor<T> {
    fn load(&mut self, program: Arc<Program>) -> Result<(), ExecutorError> {
        self.program = Some(program);
        Ok(())
    }

    async fn run(&self, params: &LoadParams) -> Result<Vec<Sample>, ExecutorError> {
        let program = self.program.clone().ok_or(ExecutorError::NotLoaded)?;
        let (ctx, shutdown_tx) = ExecutionContext::new();
        let (samples_tx, mut samples_rx) = mpsc::unbounded_channel();

        let base_seed = params.seed.unwrap_or_else(rand::random);
        let mut sessions = Vec::with_capacity(params.users as usize);
        for user in 0..params.users {
            let seed = base_seed.wrapping_add(u64::from(user));
            let session = Session::new(Arc::clone(&program), seed)
                .map_err(|e| ExecutorError::Task(e.to_string()))?;
            sessions.push(session);
        }

        tracing::info!(
            users = params.users,
            spawn_rate = params.spawn_rate,
            run_time = ?params.run_time,
            "spawning virtual users..."
        );
        let handles = spawn_users(
            ctx.clone(),
            sessions,
            params.spawn_rate,
            Arc::clone(&self.transport),
            samples_tx,
        );

        tokio::time::sleep(params.run_time).await;
        tracing::info!("run time elapsed, stopping users...");
        shutdown_tx
            .send(true)
            .map_err(|e| ExecutorError::Task(e.to_string()))?;

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(params.stop_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        return Err(ExecutorError::Task(e.to_string()));
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    stop_timeout = ?params.stop_timeout,
                    "users still busy after stop timeout, aborting"
                );
                aborts.iter().for_each(|h| h.abort());
            }
        }

        let mut samples = Vec::new();
        while let Ok(sample) = samples_rx.try_recv() {
            samples.push(sample);
        }
        sort_by_completion(&mut samples);
        tracing::info!(samples = samples.len(), "done running users");
        Ok(samples)
    }
}

#[derive(Clone)]
struct ExecutionContext {
    origin: Instant,
    shutdown: Receiver<bool>,
}

impl ExecutionContext {
    fn new() -> (Self, Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                origin: Instant::now(),
                shutdown: rx,
            },
            tx,
        )
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// One task per session; user `i` starts `i / spawn_rate` seconds after the origin.
/// A user whose start cannot be expressed as an instant is never spawned.
fn spawn_users<T: Transport>(
    ctx: ExecutionContext,
    sessions: Vec<Session>,
    spawn_rate: f64,
    transport: Arc<T>,
    samples: UnboundedSender<Sample>,
) -> Vec<JoinHandle<()>> {
    sessions
        .into_iter()
        .enumerate()
        .filter_map(|(i, session)| {
            let mut ctx = ctx.clone();
            let Some(start_at) = Duration::try_from_secs_f64(i as f64 / spawn_rate)
                .ok()
                .and_then(|offset| ctx.origin.checked_add(offset))
            else {
                tracing::warn!(user = i, spawn_rate, "start offset out of range, user not spawned");
                return None;
            };
            let transport = Arc::clone(&transport);
            let samples = samples.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(start_at) => {}
                    _ = ctx.shutdown.wait_for(|b| *b) => return,
                }
                VirtualUser {
                    ctx,
                    session,
                    transport,
                    samples,
                }
                .run()
                .await;
            });
            Some(handle)
        })
        .collect()
}

struct VirtualUser<T> {
    ctx: ExecutionContext,
    session: Session,
    transport: Arc<T>,
    samples: UnboundedSender<Sample>,
}

impl<T: Transport> VirtualUser<T> {
    async fn run(mut self) {
        let program = Arc::clone(self.session.program());

        for request in &program.on_start {
            if self.ctx.stopping() || !self.execute(request, true).await {
                // an on_start failure to resolve ends this user's session
                return;
            }
        }

        loop {
            if self.ctx.stopping() {
                return;
            }
            let request = &program.pool[self.session.select()];
            self.execute(request, false).await;

            let pause = self.session.think_time();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.ctx.shutdown.wait_for(|b| *b) => return,
            }
        }
    }

    /// Resolve, send and record one request. Returns false when its templates could
    /// not be resolved.
    async fn execute(&mut self, request: &CompiledRequest, setup: bool) -> bool {
        let started = Instant::now();
        let offset = started.duration_since(self.ctx.origin);

        let resolved = if setup {
            self.session.materialize_setup(request)
        } else {
            self.session.materialize(request)
        };
        let resolved = match resolved {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(request = %request.name, error = %e, "template resolution failed");
                self.record(Sample::new(
                    request.name.as_str(),
                    offset,
                    Duration::ZERO,
                    Outcome::Failure(format!("template: {e}")),
                ));
                return false;
            }
        };

        let reply = self.transport.send(&resolved).await;
        let elapsed = started.elapsed();
        if !request.capture.is_empty() {
            self.session.apply_captures(request, reply.body.as_ref());
        }
        self.record(Sample::new(request.name.as_str(), offset, elapsed, reply.outcome));
        true
    }

    fn record(&self, sample: Sample) {
        // the receiver outlives every user unless the run was aborted
        let _ = self.samples.send(sample);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        compiler::compile, config::LoadConfig, scenario::ScenarioSpec, session::ResolvedRequest,
        transport::Reply,
    };

    #[derive(Default)]
    struct FakeTransport {
        seen: Mutex<Vec<ResolvedRequest>>,
        latency: Duration,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: &ResolvedRequest) -> Reply {
            tokio::time::sleep(self.latency).await;
            self.seen.lock().unwrap().push(request.clone());
            match request.path.as_str() {
                "/login" => Reply::status(200).with_body(json!({"token": "t-1"})),
                "/login-denied" => Reply::status(200).with_body(json!({"error": "denied"})),
                "/broken" => Reply::status(503),
                _ => Reply::status(200),
            }
        }
    }

    fn program(value: serde_json::Value) -> Arc<Program> {
        let spec: ScenarioSpec = serde_json::from_value(value).unwrap();
        Arc::new(compile(&spec, &LoadConfig::default()).unwrap())
    }

    fn params(users: u32, run_time: Duration) -> LoadParams {
        LoadParams {
            host: "http://test".into(),
            users,
            spawn_rate: 10.0,
            run_time,
            stop_timeout: Duration::from_secs(1),
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            seed: Some(7),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn users_log_in_once_then_loop_the_pool() {
        let transport = Arc::new(FakeTransport {
            latency: Duration::from_millis(10),
            ..Default::default()
        });
        let mut executor = UserExecutor::builder()
            .transport(Arc::clone(&transport))
            .build();
        executor
            .load(program(json!({
                "think_time": 0.1,
                "auth": {"type": "bearer", "token": "${token}"},
                "on_start": [{
                    "name": "Login",
                    "method": "POST",
                    "path": "/login",
                    "capture": {"token": "token"}
                }],
                "requests": [
                    {"name": "Ok", "path": "/ok", "weight": 3},
                    {"name": "Broken", "path": "/broken"}
                ]
            })))
            .unwrap();

        let samples = executor.run(&params(3, Duration::from_secs(2))).await.unwrap();

        let logins = samples.iter().filter(|s| s.name == "Login").count();
        assert_eq!(logins, 3);
        assert!(samples.len() > 30, "{}", samples.len());
        assert!(samples.iter().any(|s| s.outcome == Outcome::Status(503)));
        assert!(samples.windows(2).all(|w| w[0].finished() <= w[1].finished()));

        let seen = transport.seen.lock().unwrap();
        assert!(seen
            .iter()
            .filter(|r| r.path != "/login")
            .all(|r| r.headers["Authorization"] == "Bearer t-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_on_start_ends_the_session() {
        let transport = Arc::new(FakeTransport::default());
        let mut executor = UserExecutor::builder()
            .transport(Arc::clone(&transport))
            .build();
        executor
            .load(program(json!({
                "on_start": [{"name": "Setup", "path": "/setup/${LOADGATE_TEST_NEVER_SET}"}],
                "requests": [{"name": "Ok", "path": "/ok"}]
            })))
            .unwrap();

        let samples = executor.run(&params(2, Duration::from_secs(1))).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples
            .iter()
            .all(|s| s.name == "Setup" && s.outcome.is_failure()));
        assert!(transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_pool_request_fails_and_the_run_goes_on() {
        let transport = Arc::new(FakeTransport::default());
        let mut executor = UserExecutor::builder()
            .transport(Arc::clone(&transport))
            .build();
        executor
            .load(program(json!({
                "think_time": 0.1,
                "requests": [
                    {"name": "Ok", "path": "/ok"},
                    {"name": "Missing", "path": "/items/${LOADGATE_TEST_NEVER_SET_POOL}"}
                ]
            })))
            .unwrap();

        let samples = executor.run(&params(2, Duration::from_secs(2))).await.unwrap();

        let missing: Vec<_> = samples.iter().filter(|s| s.name == "Missing").collect();
        assert!(!missing.is_empty());
        assert!(missing.iter().all(|s| s.outcome.is_failure()));
        let ok = samples.iter().filter(|s| s.name == "Ok").count();
        assert!(ok > 0);
        // unresolved requests never reach the transport
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), ok);
        assert!(seen.iter().all(|r| r.path == "/ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_login_capture_fails_authenticated_requests() {
        let transport = Arc::new(FakeTransport::default());
        let mut executor = UserExecutor::builder()
            .transport(Arc::clone(&transport))
            .build();
        executor
            .load(program(json!({
                "think_time": 0.1,
                "auth": {"type": "bearer", "token": "${token}"},
                "on_start": [{
                    "name": "Login",
                    "path": "/login-denied",
                    "capture": {"token": "token"}
                }],
                "requests": [{"name": "Me", "path": "/me"}]
            })))
            .unwrap();

        let samples = executor.run(&params(1, Duration::from_secs(1))).await.unwrap();

        assert_eq!(samples[0].name, "Login");
        assert_eq!(samples[0].outcome, Outcome::Status(200));
        let me: Vec<_> = samples.iter().filter(|s| s.name == "Me").collect();
        assert!(!me.is_empty());
        assert!(me.iter().all(|s| s.outcome.is_failure()));
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn users_beyond_the_schedule_are_not_spawned() {
        let transport = Arc::new(FakeTransport::default());
        let mut executor = UserExecutor::builder()
            .transport(Arc::clone(&transport))
            .build();
        executor
            .load(program(json!({
                "on_start": [{"name": "Login", "path": "/login"}],
                "requests": [{"name": "Ok", "path": "/ok"}]
            })))
            .unwrap();

        let mut params = params(3, Duration::from_secs(1));
        params.spawn_rate = 1e-300;
        let samples = executor.run(&params).await.unwrap();

        let logins = samples.iter().filter(|s| s.name == "Login").count();
        assert_eq!(logins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_are_cut_at_stop_timeout() {
        let transport = Arc::new(FakeTransport {
            latency: Duration::from_secs(30),
            ..Default::default()
        });
        let mut executor = UserExecutor::builder().transport(transport).build();
        executor
            .load(program(json!({"requests": [{"name": "Slow", "path": "/slow"}]})))
            .unwrap();

        let samples = executor.run(&params(1, Duration::from_secs(1))).await.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn run_without_program_fails() {
        let executor = UserExecutor::builder()
            .transport(Arc::new(FakeTransport::default()))
            .build();
        let err = executor
            .run(&params(1, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotLoaded));
    }
}
