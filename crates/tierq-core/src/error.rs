//! Error types for tierq-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::api::GroupKey;

/// Why `schedule` refused an item. The item never entered the dispatcher.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("group `{group}` already has {limit} outstanding items")]
    AdmissionRejected { group: GroupKey, limit: usize },

    #[error("malformed priority `{0}`: expected very high, high, normal, low, very low or 0..=4")]
    MalformedPriority(String),

    #[error("no executor registered under `{0}`")]
    UnknownExecutor(String),

    #[error("dispatcher is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
