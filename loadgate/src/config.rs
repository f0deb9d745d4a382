//! The configuration document: `load`, `scenario` (or `locust`), `analysis` and
//! `artifacts` sections, read from JSON or YAML.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    error::ConfigError,
    gate::{GateMode, GateSpec, Rule, Verdict},
    scenario::ScenarioSpec,
    template::expand_env,
};

pub const DEFAULT_STORAGE: &str = "artifacts";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// `.yml` / `.yaml` are YAML, everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yml" | "yaml") => Self::Yaml,
            _ => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioSpec>,
    /// A previously compiled program plus its load parameters, used instead of `scenario`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locust: Option<PrecompiledConfig>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<i64>,
    /// Users started per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_rate: Option<f64>,
    #[serde(
        default,
        deserialize_with = "de_duration",
        serialize_with = "ser_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_time: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "de_duration",
        serialize_with = "ser_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,
    /// Lowest-precedence headers, overridden by `scenario.headers`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl LoadConfig {
    /// Fill every unset field of `self` from `other`.
    pub fn or(mut self, other: &LoadConfig) -> Self {
        self.host = self.host.or_else(|| other.host.clone());
        self.users = self.users.or(other.users);
        self.spawn_rate = self.spawn_rate.or(other.spawn_rate);
        self.run_time = self.run_time.or(other.run_time);
        self.stop_timeout = self.stop_timeout.or(other.stop_timeout);
        if self.tags.is_empty() {
            self.tags = other.tags.clone();
        }
        if self.exclude_tags.is_empty() {
            self.exclude_tags = other.exclude_tags.clone();
        }
        for (k, v) in &other.headers {
            self.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.seed = self.seed.or(other.seed);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecompiledConfig {
    #[serde(alias = "locustfile")]
    pub program: PathBuf,
    #[serde(flatten)]
    pub load: LoadConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GateMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
    /// A JSON file holding `{"rules": [...]}`; takes precedence over inline `rules`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on: Option<Verdict>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Validated load parameters handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    pub host: String,
    pub users: u32,
    pub spawn_rate: f64,
    #[serde(with = "humantime_secs")]
    pub run_time: Duration,
    #[serde(with = "humantime_secs")]
    pub stop_timeout: Duration,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub seed: Option<u64>,
}

impl TryFrom<&LoadConfig> for LoadParams {
    type Error = ConfigError;

    fn try_from(load: &LoadConfig) -> Result<Self, Self::Error> {
        let host = load
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::missing("load.host"))?;

        let users = load.users.ok_or_else(|| ConfigError::missing("load.users"))?;
        let users = u32::try_from(users)
            .ok()
            .filter(|u| *u > 0)
            .ok_or_else(|| {
                ConfigError::invalid("load.users", format!("{users} is not a positive user count"))
            })?;

        let spawn_rate = load.spawn_rate.unwrap_or(f64::from(users));
        if !spawn_rate.is_finite() || spawn_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "load.spawn_rate",
                format!("{spawn_rate} is not a positive rate"),
            ));
        }

        // the last user starts (users - 1) / spawn_rate seconds in
        let last_spawn = f64::from(users - 1) / spawn_rate;
        Duration::try_from_secs_f64(last_spawn).map_err(|e| {
            ConfigError::invalid(
                "load.spawn_rate",
                format!("{spawn_rate} is too low for {users} users: {e}"),
            )
        })?;

        let run_time = load
            .run_time
            .ok_or_else(|| ConfigError::missing("load.run_time"))?;
        if run_time.is_zero() {
            return Err(ConfigError::invalid("load.run_time", "must be positive"));
        }

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            users,
            spawn_rate,
            run_time,
            stop_timeout: load.stop_timeout.unwrap_or_default(),
            tags: load.tags.clone(),
            exclude_tags: load.exclude_tags.clone(),
            seed: load.seed,
        })
    }
}

impl Document {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut doc = Self::parse(&text, Format::from_path(path)).map_err(|reason| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            }
        })?;
        doc.expand_env()?;
        if let Some(base) = path.parent() {
            doc.resolve_paths(base);
        }
        Ok(doc)
    }

    /// Parse without touching the environment or the filesystem.
    pub fn parse(text: &str, format: Format) -> Result<Self, String> {
        match format {
            Format::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        }
    }

    /// Expand `${VAR}` references in the host and artifact settings. Scenario strings
    /// are left alone: they are templates resolved per request.
    pub fn expand_env(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = self.load.as_mut().and_then(|l| l.host.as_mut()) {
            *host = expand_env(host, "load.host")?;
        }
        if let Some(host) = self.locust.as_mut().and_then(|l| l.load.host.as_mut()) {
            *host = expand_env(host, "locust.host")?;
        }
        if let Some(storage) = self.artifacts.storage.as_mut() {
            *storage = expand_env(storage, "artifacts.storage")?;
        }
        if let Some(run_id) = self.artifacts.run_id.as_mut() {
            *run_id = expand_env(run_id, "artifacts.run_id")?;
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            if p.is_absolute() || p.as_os_str().is_empty() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        if let Some(locust) = self.locust.as_mut() {
            locust.program = resolve(&locust.program);
        }
        if let Some(rules_file) = self.analysis.rules_file.as_mut() {
            *rules_file = resolve(rules_file);
        }
        if let Some(storage) = self.artifacts.storage.as_mut() {
            *storage = resolve(Path::new(storage)).to_string_lossy().into_owned();
        }
    }

    /// The effective load section: `locust` parameters win over `load` when both exist.
    pub fn load_config(&self) -> LoadConfig {
        let base = self.load.clone().unwrap_or_default();
        match &self.locust {
            Some(locust) => locust.load.clone().or(&base),
            None => base,
        }
    }

    /// Comparison rules from `rules_file` when set, otherwise the inline list.
    pub fn rules(&self) -> Result<Vec<Rule>, ConfigError> {
        let rules = match &self.analysis.rules_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str::<RulesFile>(&text)
                    .map_err(|e| ConfigError::Parse {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?
                    .rules
            }
            None => self.analysis.rules.clone(),
        };
        for (i, rule) in rules.iter().enumerate() {
            rule.validate(&format!("analysis.rules[{i}]"))?;
        }
        Ok(rules)
    }

    pub fn fail_on(&self) -> Verdict {
        self.analysis.fail_on.unwrap_or(Verdict::Degradation)
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(
            self.artifacts
                .storage
                .clone()
                .unwrap_or_else(|| DEFAULT_STORAGE.to_string()),
        )
    }

    pub fn history_limit(&self) -> usize {
        self.artifacts.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

/// Accepts `"1m30s"`-style strings or plain (possibly fractional) seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return seconds(secs);
    }
    humantime::parse_duration(raw).map_err(|e| format!("`{raw}`: {e}"))
}

fn seconds(secs: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{secs} seconds: {e}"))
}

fn de_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    Option::<Raw>::deserialize(deserializer)?
        .map(|raw| match raw {
            Raw::Seconds(s) => seconds(s),
            Raw::Text(t) => parse_duration(&t),
        })
        .transpose()
        .map_err(serde::de::Error::custom)
}

fn ser_duration<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
        None => serializer.serialize_none(),
    }
}

fn de_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    let items = match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::List(list)) => list,
        Some(Raw::Csv(csv)) => csv.split(',').map(str::to_string).collect(),
        None => Vec::new(),
    };
    Ok(split_list(items))
}

/// Trim entries and drop empty ones.
pub fn split_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
