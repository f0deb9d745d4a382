//! Placeholder templates.
//!
//! Strings in a scenario may embed `${name}` placeholders. They are parsed once, at
//! compile time, into a [`Template`]: a list of literal and [`Placeholder`] segments.
//! Resolution walks the segments against a [`Scope`] (the virtual user's session) and
//! never touches the compiled program, so the same template can be resolved by many
//! users at once.
//!
//! Recognised names, in priority order:
//!
//! | name                  | resolves to                                          |
//! |-----------------------|------------------------------------------------------|
//! | `timestamp`           | epoch milliseconds at resolution time                |
//! | `random`              | a fresh random token                                 |
//! | `iteration`           | the user's pass counter through the weighted pool    |
//! | a declared capture    | the value captured earlier in the same session       |
//! | anything else         | the environment variable, `${VAR:-default}` allowed  |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, TemplateError};

const TIMESTAMP: &str = "timestamp";
const RANDOM: &str = "random";
const ITERATION: &str = "iteration";

/// Names that can never be used as capture names.
pub const BUILTINS: [&str; 3] = [TIMESTAMP, RANDOM, ITERATION];

/// One resolvable placeholder kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placeholder {
    EnvVar {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Timestamp,
    Random,
    Iteration,
    Capture {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// The per-user state a template resolves against.
pub trait Scope {
    /// Value for `${timestamp}`.
    fn timestamp(&mut self) -> String;
    /// Value for `${random}`.
    fn random(&mut self) -> String;
    fn iteration(&self) -> u64;
    fn capture(&self, name: &str) -> Option<&Value>;
}

/// A string parsed into literal and placeholder segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`, classifying every placeholder. `captures` holds the capture names
    /// declared anywhere in the scenario; `field` is used in error messages.
    pub fn parse(
        source: &str,
        captures: &BTreeSet<String>,
        field: &str,
    ) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedTemplate {
            field: field.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let body = &rest[start + 2..];
            let end = body.find('}').ok_or_else(|| {
                malformed(format!("unterminated placeholder at byte {}", offset + start))
            })?;
            let inner = &body[..end];
            if inner.contains("${") {
                return Err(malformed(format!(
                    "nested placeholder at byte {}",
                    offset + start
                )));
            }
            let name = inner.trim();
            if name.is_empty() {
                return Err(malformed(format!(
                    "empty placeholder at byte {}",
                    offset + start
                )));
            }
            segments.push(Segment::Placeholder(classify(name, captures)));

            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// A template with no placeholders.
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Literal(text.clone())]
        };
        Self {
            source: text,
            segments,
        }
    }

    /// The text the template was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn resolve(&self, scope: &mut dyn Scope) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(placeholder) => match placeholder {
                    Placeholder::Timestamp => out.push_str(&scope.timestamp()),
                    Placeholder::Random => out.push_str(&scope.random()),
                    Placeholder::Iteration => out.push_str(&scope.iteration().to_string()),
                    Placeholder::Capture { name } => match scope.capture(name) {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => return Err(TemplateError::UndefinedCapture(name.clone())),
                    },
                    Placeholder::EnvVar { name, default } => match std::env::var(name) {
                        Ok(value) => out.push_str(&value),
                        Err(_) => match default {
                            Some(d) => out.push_str(d),
                            None => return Err(TemplateError::UndefinedVariable(name.clone())),
                        },
                    },
                },
            }
        }
        Ok(out)
    }
}

fn classify(name: &str, captures: &BTreeSet<String>) -> Placeholder {
    match name {
        TIMESTAMP => Placeholder::Timestamp,
        RANDOM => Placeholder::Random,
        ITERATION => Placeholder::Iteration,
        _ if captures.contains(name) => Placeholder::Capture {
            name: name.to_string(),
        },
        _ => {
            let (var, default) = match name.split_once(":-") {
                Some((var, default)) => (var, Some(default)),
                None => match name.split_once(':') {
                    Some((var, default)) => (var, Some(default)),
                    None => (name, None),
                },
            };
            Placeholder::EnvVar {
                name: var.trim().to_string(),
                default: default.map(str::to_string),
            }
        }
    }
}

/// A JSON tree whose string leaves are templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonTemplate {
    Text(Template),
    Array(Vec<JsonTemplate>),
    Object(BTreeMap<String, JsonTemplate>),
    /// Numbers, booleans and null pass through untouched.
    Value(Value),
}

impl JsonTemplate {
    pub fn parse(
        value: &Value,
        captures: &BTreeSet<String>,
        field: &str,
    ) -> Result<Self, ConfigError> {
        Ok(match value {
            Value::String(s) => Self::Text(Template::parse(s, captures, field)?),
            Value::Array(items) => Self::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Self::parse(item, captures, &format!("{field}[{i}]")))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| {
                        let value = Self::parse(v, captures, &format!("{field}.{k}"))?;
                        Ok((k.clone(), value))
                    })
                    .collect::<Result<_, ConfigError>>()?,
            ),
            other => Self::Value(other.clone()),
        })
    }

    /// Materialise a fresh JSON value; every string leaf is resolved independently.
    pub fn resolve(&self, scope: &mut dyn Scope) -> Result<Value, TemplateError> {
        Ok(match self {
            Self::Text(t) => Value::String(t.resolve(scope)?),
            Self::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve(scope))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(scope)?)))
                    .collect::<Result<_, TemplateError>>()?,
            ),
            Self::Value(v) => v.clone(),
        })
    }
}

/// Expand environment placeholders in a configuration value at load time.
///
/// Only `${VAR}` / `${VAR:-default}` and the built-ins are meaningful here; there is
/// no session, so captures are never declared and `${iteration}` is always 0.
pub fn expand_env(source: &str, field: &str) -> Result<String, ConfigError> {
    struct LoadScope;

    impl Scope for LoadScope {
        fn timestamp(&mut self) -> String {
            chrono::Utc::now().timestamp_millis().to_string()
        }

        fn random(&mut self) -> String {
            crate::session::random_token(&mut rand::thread_rng())
        }

        fn iteration(&self) -> u64 {
            0
        }

        fn capture(&self, _: &str) -> Option<&Value> {
            None
        }
    }

    Template::parse(source, &BTreeSet::new(), field)?
        .resolve(&mut LoadScope)
        .map_err(|e| ConfigError::invalid(field, e.to_string()))
}
