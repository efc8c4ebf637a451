use std::path::PathBuf;

use thiserror::Error;

use crate::sources::SourceKind;

/// Page fetch failures. Never to be read as "content unchanged".
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("no content returned for {url}")]
    Empty { url: String },

    #[error("fetcher misconfigured: {0}")]
    Config(String),
}

impl FetchError {
    /// Rate limiting and server-side errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { message, .. } => {
                message.contains("429")
                    || message.contains("rate")
                    || message.contains("500")
                    || message.contains("502")
                    || message.contains("503")
                    || message.contains("timed out")
            }
            FetchError::Empty { .. } | FetchError::Config(_) => false,
        }
    }
}

/// Errors coming back from the text-understanding collaborator.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited")]
    RateLimited,

    #[error("request timeout")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A single candidate's date could not be pinned to a calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateResolutionError {
    #[error("unparseable date expression: {0:?}")]
    Unparseable(String),

    #[error("invalid calendar date: month {month}, day {day}")]
    InvalidDate { month: u32, day: u32 },

    #[error("no occurrence of {month:02}-{day:02} within {window} years of {reference}")]
    NoOccurrence {
        month: u32,
        day: u32,
        window: i32,
        reference: chrono::NaiveDate,
    },
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mailbox not found: {0}")]
    MissingMailbox(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown message id: {0}")]
    UnknownMessage(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything that can end a single artist/source pairing early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no {endpoint} found for artist '{artist}'")]
    EndpointNotFound {
        artist: String,
        endpoint: &'static str,
    },

    #[error("{kind} source used before resolve()")]
    NotResolved { kind: SourceKind },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    DateResolution(#[from] DateResolutionError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl PipelineError {
    /// Whether the next scheduled run may succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Config(_) | PipelineError::NotResolved { .. }
        )
    }
}
