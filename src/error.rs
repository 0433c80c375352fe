//! Error types for the update pipeline.
//!
//! All failures flow through [`UpdateError`], which carries enough context
//! (edition id, URL, path) to be actionable without further wrapping. Whether
//! an error is worth retrying is a property of its cause, not of the call
//! site; [`UpdateError::is_retryable`] encodes that classification.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while updating editions.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Invalid run configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A URL (endpoint or proxy) could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// The database directory lock is held by another update run.
    #[error("acquiring lock {path}: {source}")]
    Lock {
        /// The lock file path.
        path: PathBuf,
        /// The underlying lock failure.
        #[source]
        source: std::io::Error,
    },

    /// Network-level error (DNS resolution, connection refused, TLS, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response from the distribution service.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The metadata endpoint returned an unusable answer for an edition.
    #[error("metadata for {edition_id}: {reason}")]
    Metadata {
        /// The edition whose metadata was requested.
        edition_id: String,
        /// What was wrong with the answer.
        reason: String,
    },

    /// The downloaded archive could not be decoded.
    #[error("decoding archive for {edition_id}: {reason}")]
    Archive {
        /// The edition whose archive failed to decode.
        edition_id: String,
        /// What was wrong with the stream.
        reason: String,
    },

    /// The response body ended before the archive-declared entry size.
    #[error(
        "truncated archive for {edition_id}: entry declares {expected_bytes} bytes, got {actual_bytes}"
    )]
    Truncated {
        /// The edition whose download was cut short.
        edition_id: String,
        /// Entry size declared by the archive header.
        expected_bytes: u64,
        /// Bytes actually received.
        actual_bytes: u64,
    },

    /// The downloaded content does not hash to the value the metadata
    /// endpoint reported.
    #[error("integrity check failed for {edition_id}: expected hash {expected}, computed {actual}")]
    Integrity {
        /// The edition that failed verification.
        edition_id: String,
        /// Hash reported by the metadata endpoint.
        expected: String,
        /// Hash computed over the received bytes.
        actual: String,
    },

    /// Local filesystem error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the structured report failed.
    #[error("writing report: {reason}")]
    Report {
        /// What went wrong while emitting the report.
        reason: String,
    },

    /// The run was cancelled before this work could complete.
    #[error("update run cancelled")]
    Cancelled,

    /// A job exhausted its retries (or hit a non-retryable error) and failed
    /// permanently. Wraps the final error with the edition id and attempt
    /// count.
    #[error("updating edition {edition_id} after {attempts} attempt(s): {source}")]
    JobFailed {
        /// The edition whose job failed.
        edition_id: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// The final error.
        #[source]
        source: Box<UpdateError>,
    },
}

impl UpdateError {
    /// Creates a network error from a reqwest error, promoting timeouts to
    /// [`UpdateError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a lock acquisition error.
    pub fn lock(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Lock {
            path: path.into(),
            source,
        }
    }

    /// Creates a metadata error.
    pub fn metadata(edition_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            edition_id: edition_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an archive decode error.
    pub fn archive(edition_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Archive {
            edition_id: edition_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a truncated archive error.
    pub fn truncated(edition_id: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Truncated {
            edition_id: edition_id.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(
        edition_id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            edition_id: edition_id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a job's final error with its edition id and attempt count.
    pub fn job_failed(edition_id: impl Into<String>, attempts: u32, source: UpdateError) -> Self {
        Self::JobFailed {
            edition_id: edition_id.into(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Whether retrying the operation that produced this error could help.
    ///
    /// Transient conditions (network failures, error statuses, interrupted or
    /// corrupt downloads, hash mismatches) are retryable; everything local or
    /// structural (configuration, locking, filesystem permissions,
    /// cancellation) is not. A wrapped [`UpdateError::JobFailed`] inherits
    /// the classification of its cause.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::Metadata { .. }
            | Self::Archive { .. }
            | Self::Truncated { .. }
            | Self::Integrity { .. } => true,

            Self::Config(_)
            | Self::InvalidUrl { .. }
            | Self::Lock { .. }
            | Self::Io { .. }
            | Self::Report { .. }
            | Self::Cancelled => false,

            Self::JobFailed { source, .. } => source.is_retryable(),
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>` impls: every variant
// needs context (url, path, edition id) the source error does not carry, so
// the helper constructors are the conversion path.
