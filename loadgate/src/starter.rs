//! `loadgate init`: a commented starter document to edit.

use std::path::Path;

use crate::error::{ConfigError, Error, StoreError};

pub const DEFAULT_HOST: &str = "http://localhost:8000";
pub const DEFAULT_PATH: &str = "loadgate.yaml";

const HOST_MARKER: &str = "{{host}}";

const TEMPLATE: &str = r#"# loadgate configuration. Edit the requests and limits for your service.
load:
  host: {{host}}
  users: 10
  spawn_rate: 2
  run_time: 1m
  stop_timeout: 10s

scenario:
  think_time: {min: 0.5, max: 2.0}
  headers:
    Accept: application/json
    Content-Type: application/json
  # Other auth forms:
  #   {type: api_key, header: X-API-Key, key: "${API_KEY}"}
  #   {type: basic, username: "${API_USER}", password: "${API_PASSWORD}"}
  auth:
    type: bearer
    token: "${auth_token}"
  # Runs once per virtual user. The captured token feeds the bearer header above.
  on_start:
    - name: Login
      method: POST
      path: /auth/login
      json:
        username: "${TEST_USER:-demo}"
        password: "${TEST_PASSWORD:-demo}"
      capture:
        auth_token: token
  requests:
    - name: Health Check
      path: /health
      weight: 1
      tags: [smoke]
    - name: Example POST
      method: POST
      path: /api/resource
      weight: 2
      json:
        field: value
        request_id: "${random}"
      tags: [api]

analysis:
  # Compared against the promoted baseline run.
  rules:
    - {metric: p95_ms, mode: relative, direction: increase, warn: 10, fail: 25}
    - {metric: error_rate, mode: absolute, direction: increase, warn: 1, fail: 5}
    - {metric: rps, mode: relative, direction: decrease, warn: 10, fail: 20}
  # Absolute limits, checked on every run.
  gate:
    mode: acceptance
    min_requests: 50
    warmup_seconds: 5
    thresholds:
      error_rate: {warn: 0.5, fail: 1}
      p95_ms: 1000
  fail_on: DEGRADATION

artifacts:
  storage: artifacts
  run_id: "${GITHUB_SHA:-local}"
  history_limit: 50
"#;

/// The starter document with `host` filled in.
pub fn render(host: &str) -> String {
    TEMPLATE.replace(HOST_MARKER, host)
}

/// Write the starter document to `path`. An existing file is kept unless `force`.
pub fn write(path: &Path, host: &str, force: bool) -> Result<(), Error> {
    if path.exists() && !force {
        return Err(ConfigError::invalid(
            path.display().to_string(),
            "file already exists, pass --force to overwrite it",
        )
        .into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    std::fs::write(path, render(host)).map_err(|e| StoreError::io(path, e))?;
    tracing::info!(path = %path.display(), "starter config written");
    Ok(())
}
