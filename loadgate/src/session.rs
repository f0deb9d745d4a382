//! Per-virtual-user state.
//!
//! A [`Session`] is owned by exactly one virtual user. It holds that user's
//! captures, its pass counter and its random number generator, and turns the shared
//! [`Program`]'s templates into concrete [`ResolvedRequest`]s.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::{
    Rng, SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};
use serde_json::Value;

use crate::{
    compiler::{Auth, CompiledRequest, Program},
    error::{ConfigError, TemplateError},
    scenario::ValueScope,
    template::{JsonTemplate, Scope},
};

const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 8;

/// A fresh lowercase alphanumeric token for `${random}`.
pub fn random_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..TOKEN_LEN)
        .map(|_| char::from(TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())]))
        .collect()
}

/// A request with every placeholder substituted, ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub name: String,
    pub method: String,
    /// Path (relative to the host) as resolved.
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
    /// Form fields; mutually exclusive with `json`.
    pub data: Option<Vec<(String, String)>>,
    pub timeout: Option<Duration>,
    /// The response body is parsed only when the request captures something.
    pub wants_body: bool,
}

#[derive(Debug)]
pub struct Session {
    program: Arc<Program>,
    chooser: WeightedIndex<u32>,
    rng: StdRng,
    captures: BTreeMap<String, Value>,
    draws: u64,
    iteration: u64,
    timestamp: Option<String>,
    random: Option<String>,
}

impl Session {
    pub fn new(program: Arc<Program>, seed: u64) -> Result<Self, ConfigError> {
        let chooser = WeightedIndex::new(program.weights())
            .map_err(|e| ConfigError::invalid("scenario.requests", e.to_string()))?;
        Ok(Self {
            program,
            chooser,
            rng: StdRng::seed_from_u64(seed),
            captures: BTreeMap::new(),
            draws: 0,
            iteration: 0,
            timestamp: None,
            random: None,
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn captures(&self) -> &BTreeMap<String, Value> {
        &self.captures
    }

    /// Pick the next main-pool request (weighted, with replacement) and return its
    /// index in `program.pool`.
    pub fn select(&mut self) -> usize {
        let pool = self.program.pool.len() as u64;
        self.iteration = self.draws / pool.max(1);
        self.draws += 1;
        self.chooser.sample(&mut self.rng)
    }

    /// Resolve a main-pool `request`: headers in precedence order (program, auth,
    /// request), then path, query and body. Every placeholder must resolve.
    pub fn materialize(
        &mut self,
        request: &CompiledRequest,
    ) -> Result<ResolvedRequest, TemplateError> {
        self.resolve(request, false)
    }

    /// Resolve an `on_start` request. Credentials that come from a capture do not
    /// exist before the step that captures them, so an auth header waiting on a
    /// capture is left out instead of failing the request.
    pub fn materialize_setup(
        &mut self,
        request: &CompiledRequest,
    ) -> Result<ResolvedRequest, TemplateError> {
        self.resolve(request, true)
    }

    fn resolve(
        &mut self,
        request: &CompiledRequest,
        setup: bool,
    ) -> Result<ResolvedRequest, TemplateError> {
        let program = Arc::clone(&self.program);

        let mut headers = BTreeMap::new();
        for (name, value) in &program.headers {
            headers.insert(name.clone(), value.resolve(self)?);
        }
        if let Some(auth) = &program.auth {
            match self.auth_header(auth) {
                Ok((name, value)) => {
                    headers.insert(name, value);
                }
                Err(TemplateError::UndefinedCapture(capture)) if setup => {
                    tracing::debug!(request = %request.name, %capture, "auth header omitted");
                }
                Err(e) => return Err(e),
            }
        }
        for (name, value) in &request.headers {
            headers.insert(name.clone(), value.resolve(self)?);
        }

        let path = request.path.resolve(self)?;

        let query = self.text_fields(&request.query)?;

        let json = request
            .json
            .as_ref()
            .map(|body| body.resolve(self))
            .transpose()?;

        let data = request
            .data
            .as_ref()
            .map(|form| self.text_fields(form))
            .transpose()?;

        Ok(ResolvedRequest {
            name: request.name.clone(),
            method: request.method.clone(),
            path,
            headers,
            query,
            json,
            data,
            timeout: request.timeout,
            wants_body: !request.capture.is_empty(),
        })
    }

    /// Strings are sent as they are, other JSON values in their JSON form.
    fn text_fields(
        &mut self,
        fields: &BTreeMap<String, JsonTemplate>,
    ) -> Result<Vec<(String, String)>, TemplateError> {
        let mut resolved = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let value = match value.resolve(self)? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            resolved.push((key.clone(), value));
        }
        Ok(resolved)
    }

    fn auth_header(&mut self, auth: &Auth) -> Result<(String, String), TemplateError> {
        Ok(match auth {
            Auth::Bearer { token } => (
                "Authorization".to_string(),
                format!("Bearer {}", token.resolve(self)?),
            ),
            Auth::ApiKey { header, key } => (header.clone(), key.resolve(self)?),
            Auth::Basic { username, password } => {
                let username = username.resolve(self)?;
                let password = password.resolve(self)?;
                let credentials = format!("{username}:{password}");
                (
                    "Authorization".to_string(),
                    format!("Basic {}", STANDARD.encode(credentials)),
                )
            }
        })
    }

    /// Store the captures of `request` from its response body. A path that finds
    /// nothing leaves that capture undefined.
    pub fn apply_captures(&mut self, request: &CompiledRequest, body: Option<&Value>) {
        for (name, path) in &request.capture {
            match body.and_then(|b| path.extract(b)) {
                Some(value) => {
                    self.captures.insert(name.clone(), value.clone());
                }
                None => {
                    tracing::debug!(
                        request = %request.name,
                        capture = %name,
                        path = %path,
                        "capture found nothing"
                    );
                    self.captures.remove(name);
                }
            }
        }
    }

    /// Pause before the next main-pool request. The range has been validated when
    /// the program was compiled or loaded.
    pub fn think_time(&mut self) -> Duration {
        let range = self.program.think_time;
        let secs = if range.is_fixed() || range.min > range.max {
            range.min
        } else {
            self.rng.gen_range(range.min..=range.max)
        };
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }
}

impl Scope for Session {
    fn timestamp(&mut self) -> String {
        let now = || chrono::Utc::now().timestamp_millis().to_string();
        match self.program.dynamic_values {
            ValueScope::PerRequest => now(),
            ValueScope::PerSession => self.timestamp.get_or_insert_with(now).clone(),
        }
    }

    fn random(&mut self) -> String {
        match self.program.dynamic_values {
            ValueScope::PerRequest => random_token(&mut self.rng),
            ValueScope::PerSession => self
                .random
                .get_or_insert_with(|| random_token(&mut self.rng))
                .clone(),
        }
    }

    fn iteration(&self) -> u64 {
        self.iteration
    }

    fn capture(&self, name: &str) -> Option<&Value> {
        self.captures.get(name)
    }
}
