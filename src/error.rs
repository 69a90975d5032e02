//! Error types for the crate.

use std::path::PathBuf;

use crate::marker::MarkerError;
use crate::version::ConstraintError;

pub type Result<T> = std::result::Result<T, SolveError>;

/// Everything that can abort a solve, a lock or a manifest read.
///
/// Duplicate requirements that need the dependency graph split are not an
/// error: they surface as [`Completion::NeedsOverride`](crate::Completion).
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("Extra [{0}] is not specified.")]
    InvalidExtra(String),

    #[error("package {name} ({version}) not found")]
    PackageNotFound { name: String, version: String },

    #[error("because version solving failed:\n{0}")]
    Unsolvable(String),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error("invalid pyproject.toml: {0}")]
    Manifest(String),

    #[error("invalid lock file {path}: {reason}")]
    Lock { path: PathBuf, reason: String },

    #[error("dependency {name} comes from a {kind} origin, which is not supported")]
    UnsupportedOrigin { name: String, kind: &'static str },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    TomlDe {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize lock file: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl SolveError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SolveError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn toml(path: impl Into<PathBuf>, source: toml::de::Error) -> Self {
        SolveError::TomlDe {
            path: path.into(),
            source,
        }
    }
}
