use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a [`CapturePath`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accessor {
    Key(String),
    Index(usize),
}

/// A dotted/bracketed accessor into a JSON response body, e.g. `data.items[0].id`.
///
/// Paths are validated when the scenario is compiled; extraction itself never fails,
/// it only finds nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapturePath {
    source: String,
    accessors: Vec<Accessor>,
}

impl CapturePath {
    pub fn parse(source: &str) -> Result<Self, String> {
        if source.trim().is_empty() {
            return Err("capture path is empty".to_string());
        }

        let mut accessors = Vec::new();
        for (n, part) in source.split('.').enumerate() {
            if part.is_empty() {
                return Err(format!("empty segment {n} in `{source}`"));
            }
            let (key, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if key.contains(']') {
                return Err(format!("unexpected `]` in `{source}`"));
            }
            if !key.is_empty() {
                accessors.push(Accessor::Key(key.to_string()));
            } else if n > 0 {
                return Err(format!("segment {n} of `{source}` has no key before `[`"));
            }
            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .ok_or_else(|| format!("unclosed `[` in `{source}`"))?;
                let index = &rest[1..close];
                let index = index
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("`{index}` is not an array index in `{source}`"))?;
                accessors.push(Accessor::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(format!("unexpected `{rest}` after index in `{source}`"));
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            accessors,
        })
    }

    pub fn accessors(&self) -> &[Accessor] {
        &self.accessors
    }

    /// Walk `body`; `None` when any step is missing.
    pub fn extract<'a>(&self, body: &'a Value) -> Option<&'a Value> {
        self.accessors
            .iter()
            .try_fold(body, |node, accessor| match accessor {
                Accessor::Key(key) => node.get(key.as_str()),
                Accessor::Index(i) => node.get(*i),
            })
    }
}

impl fmt::Display for CapturePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for CapturePath {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CapturePath> for String {
    fn from(value: CapturePath) -> Self {
        value.source
    }
}
