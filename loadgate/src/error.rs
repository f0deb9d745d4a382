use std::path::PathBuf;

use thiserror::Error;

/// Invalid configuration or scenario. Always fatal and always raised before a run
/// starts; the message names the offending field or request.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is absent.
    #[error("`{field}` is required")]
    Missing { field: String },

    /// A field is present but its value is unusable.
    #[error("`{field}` is invalid: {reason}")]
    Invalid { field: String, reason: String },

    /// Placeholder syntax inside a template string is broken.
    #[error("`{field}` contains a malformed template: {reason}")]
    MalformedTemplate { field: String, reason: String },

    /// Tag filters left no request to select from.
    #[error("no request in `scenario.requests` is eligible after tag filtering (tags: {tags:?}, exclude_tags: {exclude_tags:?})")]
    EmptyPool {
        tags: Vec<String>,
        exclude_tags: Vec<String>,
    },

    /// The document could not be parsed at all.
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A placeholder that could not be resolved for one request of one virtual user.
///
/// Never aborts a run: the executor records it as a failed sample for that request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("environment variable `{0}` is not set")]
    UndefinedVariable(String),

    #[error("capture `{0}` has no value in this session")]
    UndefinedCapture(String),
}

/// Reading or writing run artifacts failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact {0} does not exist")]
    NotFound(PathBuf),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}

/// The load engine could not run the program.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no program has been loaded into the executor")]
    NotLoaded,

    #[error("virtual user task failed: {0}")]
    Task(String),

    #[error("transport could not be created: {0}")]
    Transport(String),
}

/// Umbrella error for the run pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
