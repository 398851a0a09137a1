//! Error taxonomy for the digest pipeline.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | [`FetchError`] | one source | source is absent from the day's document |
//! | [`ValidationError`] | one record | record is dropped |
//! | [`ClassificationError`] | run | run aborts before any archive write |
//! | [`PersistenceError`] | run | run aborts, archive rolled back |
//! | [`ConfigError`] | run | run aborts before any fetch |
//! | [`RunError::AlreadyArchived`], [`RunError::FutureDate`] | run | run aborts before any fetch |

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// Failure of a single source fetch. Absorbed by the pipeline.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("unexpected response shape: {0}")]
    Shape(String),
}

impl FetchError {
    /// Whether a second attempt could plausibly succeed.
    ///
    /// Only network-level failures and 5xx responses qualify; a payload that
    /// failed to parse will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Json(_) | FetchError::Xml(_) | FetchError::Shape(_) => false,
        }
    }
}

/// A malformed record. The record is dropped, its source is kept.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },

    #[error("{field} is negative ({value})")]
    Negative { field: &'static str, value: f64 },

    #[error("news item has an empty title")]
    EmptyTitle,

    #[error("news item has an invalid url: {0}")]
    BadUrl(String),
}

/// The LLM step failed. Fatal for the run.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("environment variable {0} holding the LLM API key is not set")]
    MissingApiKey(String),

    #[error("LLM response was truncated")]
    Truncated,

    #[error("LLM response is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("LLM response violates the expected schema: {0}")]
    Schema(String),
}

/// Writing the archive failed. Fatal for the run.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize archive data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("archive index {path} is corrupt: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The configuration could not be loaded or is incomplete.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Anything that aborts a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Sources are always fetched as of now, so an archived past day is never refiled.
    #[error("{date} is already archived and is not the current day ({today}); use --dry-run to preview it")]
    AlreadyArchived { date: NaiveDate, today: NaiveDate },

    #[error("{date} is after the current day ({today})")]
    FutureDate { date: NaiveDate, today: NaiveDate },
}
