//! Scenario compiler: [`ScenarioSpec`] + [`LoadConfig`] -> [`Program`].
//!
//! Compilation is pure. Every string that may carry a placeholder is parsed into a
//! [`Template`] here, so a malformed placeholder, a bad weight, an incomplete `auth`
//! block or a broken capture path is a [`ConfigError`] before any user starts.
//! The tag filter is applied here as well; the program's pool only holds eligible
//! requests.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    capture::CapturePath,
    config::LoadConfig,
    error::ConfigError,
    scenario::{AuthSpec, RequestSpec, ScenarioSpec, ThinkTime, ValueScope},
    template::{BUILTINS, JsonTemplate, Template},
};

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Think time applied when the scenario sets none.
pub const DEFAULT_THINK_TIME: ThinkRange = ThinkRange { min: 0.5, max: 2.0 };

/// Uniform pause range, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThinkRange {
    pub min: f64,
    pub max: f64,
}

impl ThinkRange {
    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    /// Both bounds must be durations and `min <= max`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for bound in [self.min, self.max] {
            Duration::try_from_secs_f64(bound).map_err(|e| {
                ConfigError::invalid(
                    "scenario.think_time",
                    format!("{}..{}: {e}", self.min, self.max),
                )
            })?;
        }
        if self.min > self.max {
            return Err(ConfigError::invalid(
                "scenario.think_time",
                format!("min ({}) is greater than max ({})", self.min, self.max),
            ));
        }
        Ok(())
    }
}

/// Credential injection, resolved per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    /// `Authorization: Bearer <token>`.
    Bearer { token: Template },
    /// `<header>: <key>`.
    ApiKey { header: String, key: Template },
    /// `Authorization: Basic base64(<username>:<password>)`.
    Basic {
        username: Template,
        password: Template,
    },
}

/// A request with every template parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRequest {
    pub name: String,
    pub method: String,
    pub path: Template,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Template>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, JsonTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<JsonTemplate>,
    /// Form-encoded body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, JsonTemplate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capture: BTreeMap<String, CapturePath>,
}

/// The virtual-user program. Shared read-only by every user of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub on_start: Vec<CompiledRequest>,
    /// Eligible main-pool requests only.
    pub pool: Vec<CompiledRequest>,
    pub think_time: ThinkRange,
    /// `load.headers` overlaid by `scenario.headers`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default)]
    pub dynamic_values: ValueScope,
}

impl Program {
    pub fn weights(&self) -> impl Iterator<Item = u32> + '_ {
        self.pool.iter().map(|r| r.weight)
    }

    /// Probability of each pool entry being selected.
    pub fn probabilities(&self) -> Vec<f64> {
        let total: u64 = self.weights().map(u64::from).sum();
        self.weights()
            .map(|w| f64::from(w) / total as f64)
            .collect()
    }
}

/// Whether a request carrying `tags` passes the filter. Exclusion wins.
pub fn is_eligible(tags: &[String], include: &[String], exclude: &[String]) -> bool {
    let included = include.is_empty() || tags.iter().any(|t| include.contains(t));
    let excluded = tags.iter().any(|t| exclude.contains(t));
    included && !excluded
}

pub fn compile(scenario: &ScenarioSpec, load: &LoadConfig) -> Result<Program, ConfigError> {
    if scenario.requests.is_empty() {
        return Err(ConfigError::missing("scenario.requests"));
    }

    let captures = declared_captures(scenario)?;

    let think_time = think_range(scenario.think_time)?;

    let mut headers = BTreeMap::new();
    for (key, value) in load.headers.iter().chain(&scenario.headers) {
        let field = format!("scenario.headers.{key}");
        headers.insert(key.clone(), Template::parse(value, &captures, &field)?);
    }

    let auth = scenario
        .auth
        .as_ref()
        .map(|a| compile_auth(a, &captures))
        .transpose()?;

    let on_start = scenario
        .on_start
        .iter()
        .enumerate()
        .map(|(i, r)| compile_request(r, &format!("scenario.on_start[{i}]"), &captures))
        .collect::<Result<Vec<_>, _>>()?;

    let mut pool = Vec::with_capacity(scenario.requests.len());
    for (i, spec) in scenario.requests.iter().enumerate() {
        let request = compile_request(spec, &format!("scenario.requests[{i}]"), &captures)?;
        if is_eligible(&request.tags, &load.tags, &load.exclude_tags) {
            pool.push(request);
        } else {
            tracing::debug!(request = %request.name, "excluded by tag filter");
        }
    }
    if pool.is_empty() {
        return Err(ConfigError::EmptyPool {
            tags: load.tags.clone(),
            exclude_tags: load.exclude_tags.clone(),
        });
    }

    tracing::info!(
        on_start = on_start.len(),
        pool = pool.len(),
        filtered = scenario.requests.len() - pool.len(),
        "scenario compiled"
    );

    Ok(Program {
        on_start,
        pool,
        think_time,
        headers,
        auth,
        dynamic_values: scenario.dynamic_values,
    })
}

fn declared_captures(scenario: &ScenarioSpec) -> Result<BTreeSet<String>, ConfigError> {
    let mut names = BTreeSet::new();
    let sections = [("on_start", &scenario.on_start), ("requests", &scenario.requests)];
    for (section, requests) in sections {
        for (i, request) in requests.iter().enumerate() {
            for name in request.capture.keys() {
                let field = format!("scenario.{section}[{i}].capture.{name}");
                if name.trim().is_empty() {
                    return Err(ConfigError::invalid(field, "capture name is empty"));
                }
                if BUILTINS.contains(&name.as_str()) {
                    return Err(ConfigError::invalid(
                        field,
                        format!("`{name}` is a built-in placeholder and cannot be captured"),
                    ));
                }
                names.insert(name.clone());
            }
        }
    }
    Ok(names)
}

fn think_range(raw: Option<ThinkTime>) -> Result<ThinkRange, ConfigError> {
    let range = match raw {
        None => DEFAULT_THINK_TIME,
        Some(ThinkTime::Fixed(secs)) => ThinkRange {
            min: secs,
            max: secs,
        },
        Some(ThinkTime::Range { min, max }) => ThinkRange {
            min,
            max: max.unwrap_or(min),
        },
    };
    range.validate()?;
    Ok(range)
}

fn compile_auth(spec: &AuthSpec, captures: &BTreeSet<String>) -> Result<Auth, ConfigError> {
    let kind = spec.kind.trim().to_ascii_lowercase();
    let allowed: &[&str] = match kind.as_str() {
        "bearer" => &["token"],
        "api_key" => &["header", "key"],
        "basic" => &["username", "password"],
        other => {
            return Err(ConfigError::invalid(
                "scenario.auth.type",
                format!("unknown auth type `{other}`, expected bearer, api_key or basic"),
            ));
        }
    };

    let fields = [
        ("token", &spec.token),
        ("header", &spec.header),
        ("key", &spec.key),
        ("username", &spec.username),
        ("password", &spec.password),
    ];
    for (name, value) in fields {
        let field = format!("scenario.auth.{name}");
        match value {
            Some(_) if !allowed.contains(&name) => {
                return Err(ConfigError::invalid(
                    field,
                    format!("not used by `{kind}` auth"),
                ));
            }
            Some(v) if v.trim().is_empty() => {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
            _ => {}
        }
    }

    let template = |value: &Option<String>, fallback: &str, name: &str| {
        Template::parse(
            value.as_deref().unwrap_or(fallback),
            captures,
            &format!("scenario.auth.{name}"),
        )
    };

    Ok(match kind.as_str() {
        "bearer" => Auth::Bearer {
            token: template(&spec.token, "${API_TOKEN}", "token")?,
        },
        "api_key" => Auth::ApiKey {
            header: spec
                .header
                .as_deref()
                .map(str::trim)
                .unwrap_or("X-API-Key")
                .to_string(),
            key: template(&spec.key, "${API_KEY}", "key")?,
        },
        _ => Auth::Basic {
            username: template(&spec.username, "${API_USER}", "username")?,
            password: template(&spec.password, "${API_PASSWORD}", "password")?,
        },
    })
}

fn compile_request(
    spec: &RequestSpec,
    field: &str,
    captures: &BTreeSet<String>,
) -> Result<CompiledRequest, ConfigError> {
    let method = spec
        .method
        .as_deref()
        .map(str::trim)
        .unwrap_or("GET")
        .to_ascii_uppercase();
    if !METHODS.contains(&method.as_str()) {
        return Err(ConfigError::invalid(
            format!("{field}.method"),
            format!("unsupported HTTP method `{method}`"),
        ));
    }

    let path = spec
        .path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::missing(format!("{field}.path")))?;

    let name = match &spec.name {
        Some(name) if name.trim().is_empty() => {
            return Err(ConfigError::invalid(format!("{field}.name"), "must not be empty"));
        }
        Some(name) => name.trim().to_string(),
        None => format!("{method} {path}"),
    };

    let weight = match spec.weight {
        None => 1,
        Some(w) => u32::try_from(w).ok().filter(|w| *w >= 1).ok_or_else(|| {
            ConfigError::invalid(
                format!("{field}.weight"),
                format!("{w} is not a positive integer"),
            )
        })?,
    };

    let timeout = spec
        .timeout
        .map(|secs| -> Result<Duration, ConfigError> {
            let invalid = |reason: String| ConfigError::invalid(format!("{field}.timeout"), reason);
            let timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| invalid(format!("{secs} seconds: {e}")))?;
            if timeout.is_zero() {
                return Err(invalid("must be positive".to_string()));
            }
            Ok(timeout)
        })
        .transpose()?;

    let headers = spec
        .headers
        .iter()
        .map(|(k, v)| {
            let value = Template::parse(v, captures, &format!("{field}.headers.{k}"))?;
            Ok((k.clone(), value))
        })
        .collect::<Result<_, ConfigError>>()?;

    let query = fields(&spec.query, captures, &format!("{field}.query"))?;

    if spec.json.is_some() && spec.data.is_some() {
        return Err(ConfigError::invalid(
            format!("{field}.data"),
            "a request has either a `json` or a `data` body, not both",
        ));
    }
    let data = spec
        .data
        .as_ref()
        .map(|form| fields(form, captures, &format!("{field}.data")))
        .transpose()?;

    let json = spec
        .json
        .as_ref()
        .map(|body| JsonTemplate::parse(body, captures, &format!("{field}.json")))
        .transpose()?;

    let capture = spec
        .capture
        .iter()
        .map(|(name, path)| {
            CapturePath::parse(path)
                .map(|p| (name.clone(), p))
                .map_err(|reason| ConfigError::invalid(format!("{field}.capture.{name}"), reason))
        })
        .collect::<Result<_, _>>()?;

    Ok(CompiledRequest {
        name,
        method,
        path: Template::parse(path, captures, &format!("{field}.path"))?,
        weight,
        headers,
        query,
        json,
        data,
        timeout,
        tags: spec.tags.iter().map(|t| t.trim().to_string()).collect(),
        capture,
    })
}

/// Key/value pairs whose values may be any JSON, sent as text (query, form body).
fn fields(
    raw: &BTreeMap<String, serde_json::Value>,
    captures: &BTreeSet<String>,
    field: &str,
) -> Result<BTreeMap<String, JsonTemplate>, ConfigError> {
    raw.iter()
        .map(|(k, v)| {
            let value = JsonTemplate::parse(v, captures, &format!("{field}.{k}"))?;
            Ok((k.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::template::{Placeholder, Segment};

    fn scenario(value: serde_json::Value) -> ScenarioSpec {
        serde_json::from_value(value).unwrap()
    }

    fn load(tags: &[&str], exclude: &[&str]) -> LoadConfig {
        LoadConfig {
            tags: tags.iter().map(|s| s.to_string()).collect(),
            exclude_tags: exclude.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn compiles_a_full_scenario() {
        let spec = scenario(json!({
            "headers": {"Accept": "application/json"},
            "auth": {"type": "bearer", "token": "${auth_token}"},
            "on_start": [{
                "name": "Login",
                "method": "post",
                "path": "/login",
                "json": {"user": "${USER:-demo}"},
                "capture": {"auth_token": "data.token"}
            }],
            "requests": [
                {"name": "List", "path": "/items?page=${iteration}", "weight": 5},
                {"path": "/items/${random}", "timeout": 2.5}
            ]
        }));
        let mut base = load(&[], &[]);
        base.headers.insert("X-Env".into(), "ci".into());
        base.headers.insert("Accept".into(), "*/*".into());

        let program = compile(&spec, &base).unwrap();
        assert_eq!(program.on_start[0].method, "POST");
        assert_eq!(program.pool.len(), 2);
        assert_eq!(program.pool[1].name, "GET /items/${random}");
        assert_eq!(program.pool[1].timeout, Some(Duration::from_millis(2500)));
        assert_eq!(program.think_time, DEFAULT_THINK_TIME);
        // scenario headers win over load headers
        assert_eq!(program.headers["Accept"].source(), "application/json");
        assert_eq!(program.headers["X-Env"].source(), "ci");
        match &program.auth {
            Some(Auth::Bearer { token }) => assert_eq!(
                token.segments(),
                &[Segment::Placeholder(Placeholder::Capture {
                    name: "auth_token".into()
                })]
            ),
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn weights_must_be_positive() {
        for weight in [0, -3] {
            let spec = scenario(json!({"requests": [{"path": "/", "weight": weight}]}));
            let err = compile(&spec, &load(&[], &[])).unwrap_err();
            assert!(err.to_string().contains("scenario.requests[0].weight"), "{err}");
        }
    }

    #[test]
    fn probabilities_follow_weights() {
        let spec = scenario(json!({"requests": [
            {"path": "/a", "weight": 5},
            {"path": "/b", "weight": 2}
        ]}));
        let program = compile(&spec, &load(&[], &[])).unwrap();
        let p = program.probabilities();
        assert!((p[0] - 5.0 / 7.0).abs() < 1e-12);
        assert!((p[1] - 2.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        assert!(!is_eligible(
            &["api".into(), "slow".into()],
            &["api".into()],
            &["slow".into()]
        ));
        assert!(is_eligible(&["api".into()], &["api".into()], &["slow".into()]));
        assert!(is_eligible(&[], &[], &["slow".into()]));
        assert!(!is_eligible(&[], &["api".into()], &[]));

        let spec = scenario(json!({"requests": [
            {"name": "Slow", "path": "/slow", "tags": ["api", "slow"]},
            {"name": "Fast", "path": "/fast", "tags": ["api"]}
        ]}));
        let program = compile(&spec, &load(&["api"], &["slow"])).unwrap();
        assert_eq!(program.pool.len(), 1);
        assert_eq!(program.pool[0].name, "Fast");
    }

    #[test]
    fn empty_pool_after_filtering_is_an_error() {
        let spec = scenario(json!({"requests": [
            {"path": "/slow", "tags": ["api", "slow"]}
        ]}));
        let err = compile(&spec, &load(&["api"], &["slow"])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPool { .. }));
    }

    #[test]
    fn malformed_capture_path_fails_compilation() {
        let spec = scenario(json!({"requests": [
            {"path": "/", "capture": {"id": "items[abc]"}}
        ]}));
        let err = compile(&spec, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.requests[0].capture.id"), "{err}");
    }

    #[test]
    fn builtin_names_cannot_be_captured() {
        let spec = scenario(json!({"requests": [
            {"path": "/", "capture": {"random": "id"}}
        ]}));
        assert!(compile(&spec, &load(&[], &[])).is_err());
    }

    #[test]
    fn auth_variants_are_checked() {
        let bad_type = scenario(json!({
            "auth": {"type": "oauth"},
            "requests": [{"path": "/"}]
        }));
        let err = compile(&bad_type, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.auth.type"), "{err}");

        let stray_field = scenario(json!({
            "auth": {"type": "bearer", "username": "u"},
            "requests": [{"path": "/"}]
        }));
        let err = compile(&stray_field, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.auth.username"), "{err}");

        let defaults = scenario(json!({
            "auth": {"type": "api_key"},
            "requests": [{"path": "/"}]
        }));
        match compile(&defaults, &load(&[], &[])).unwrap().auth {
            Some(Auth::ApiKey { header, key }) => {
                assert_eq!(header, "X-API-Key");
                assert_eq!(key.source(), "${API_KEY}");
            }
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn malformed_placeholder_names_the_field() {
        let spec = scenario(json!({"requests": [
            {"path": "/", "json": {"items": [{"id": "${unclosed"}]}}
        ]}));
        let err = compile(&spec, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.requests[0].json.items[0].id"), "{err}");
    }

    #[test]
    fn think_time_forms() {
        assert_eq!(
            think_range(Some(ThinkTime::Fixed(1.0))).unwrap(),
            ThinkRange { min: 1.0, max: 1.0 }
        );
        assert_eq!(
            think_range(Some(ThinkTime::Range { min: 0.2, max: None })).unwrap(),
            ThinkRange { min: 0.2, max: 0.2 }
        );
        assert!(think_range(Some(ThinkTime::Range { min: 2.0, max: Some(1.0) })).is_err());
        assert!(think_range(Some(ThinkTime::Fixed(-1.0))).is_err());
        let err = think_range(Some(ThinkTime::Range { min: 0.0, max: Some(1e30) })).unwrap_err();
        assert!(err.to_string().contains("scenario.think_time"), "{err}");
    }

    #[test]
    fn timeouts_must_fit_a_duration() {
        for timeout in [0.0, -1.0, 1e30] {
            let spec = scenario(json!({"requests": [{"path": "/", "timeout": timeout}]}));
            let err = compile(&spec, &load(&[], &[])).unwrap_err();
            assert!(err.to_string().contains("scenario.requests[0].timeout"), "{err}");
        }
    }

    #[test]
    fn form_body_is_compiled() {
        let spec = scenario(json!({
            "on_start": [{"path": "/login", "capture": {"sid": "sid"}}],
            "requests": [{
                "path": "/search",
                "method": "POST",
                "data": {"user": "${sid}", "page": 2}
            }]
        }));
        let program = compile(&spec, &load(&[], &[])).unwrap();
        let data = program.pool[0].data.as_ref().unwrap();
        match &data["user"] {
            JsonTemplate::Text(user) => assert_eq!(user.source(), "${sid}"),
            other => panic!("unexpected form value {other:?}"),
        }
        assert_eq!(data["page"], JsonTemplate::Value(json!(2)));
        assert!(program.pool[0].json.is_none());

        let spec = scenario(json!({"requests": [{"path": "/", "data": {"q": "${broken"}}]}));
        let err = compile(&spec, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.requests[0].data.q"), "{err}");

        let spec = scenario(json!({"requests": [{"path": "/", "json": {}, "data": {}}]}));
        let err = compile(&spec, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.requests[0].data"), "{err}");
    }

    #[test]
    fn missing_path_and_bad_method_are_reported() {
        let spec = scenario(json!({"requests": [{"name": "x"}]}));
        let err = compile(&spec, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.requests[0].path"), "{err}");

        let spec = scenario(json!({"requests": [{"path": "/", "method": "FETCH"}]}));
        let err = compile(&spec, &load(&[], &[])).unwrap_err();
        assert!(err.to_string().contains("scenario.requests[0].method"), "{err}");
    }

    #[test]
    fn program_survives_json() {
        let spec = scenario(json!({"requests": [
            {
                "path": "/x/${id}",
                "capture": {"id": "data[0].id"},
                "query": {"q": "${random}", "n": 3}
            }
        ]}));
        let program = compile(&spec, &load(&[], &[])).unwrap();
        let text = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&text).unwrap();
        assert_eq!(back, program);
    }
}
