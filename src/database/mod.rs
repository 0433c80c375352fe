//! Reader/Writer capabilities for edition database files.
//!
//! A [`Reader`] decides whether a remote edition has changed and, when it
//! has, produces the new content as a streaming payload. A [`Writer`]
//! persists that payload atomically and reports the hash of what is
//! currently on disk. Both are object-safe async traits so the live
//! HTTP/filesystem implementations and deterministic in-memory doubles are
//! interchangeable behind `Arc<dyn _>`.

mod http_reader;
mod local_writer;

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

pub use http_reader::HttpReader;
pub use local_writer::LocalFileWriter;

/// Hash reported for an edition that has never been fetched.
pub const ZERO_MD5: &str = "00000000000000000000000000000000";

/// File extension of edition database files, locally and inside archives.
pub const DATABASE_EXTENSION: &str = ".rdb";

/// Fetches remote edition content.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Checks the remote service for `edition_id` and, if its content hash
    /// differs from `previous_hash`, streams the new content.
    ///
    /// When the remote hash equals `previous_hash` the returned result has
    /// `new_hash == old_hash` and carries no payload; callers must treat
    /// that as nothing to write.
    ///
    /// # Errors
    ///
    /// Network failures, error statuses, and decode failures, classified by
    /// [`UpdateError::is_retryable`].
    async fn read(
        &self,
        edition_id: &str,
        previous_hash: &str,
    ) -> Result<ReadResult, UpdateError>;
}

/// Persists edition content locally.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Atomically persists the result's payload for its edition. A reader
    /// of the final path never observes a partially-written file.
    ///
    /// # Errors
    ///
    /// Transport errors from the payload stream propagate with their
    /// identity preserved; in that case no partial file is left at the
    /// final location.
    async fn write(&self, result: &mut ReadResult) -> Result<(), UpdateError>;

    /// Returns the hash of the edition's current on-disk content, or
    /// [`ZERO_MD5`] if the edition has never been fetched.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if the file exists but cannot be read.
    async fn get_hash(&self, edition_id: &str) -> Result<String, UpdateError>;
}

/// Outcome of checking one edition against the remote service.
///
/// Serialized (payload excluded) into the structured report. Timestamps are
/// UTC and serialize as RFC 3339.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResult {
    /// The edition this result describes.
    pub edition_id: String,
    /// Hash of the previously-stored content.
    pub old_hash: String,
    /// Hash of the newly-fetched content; equal to `old_hash` when the
    /// remote reported no change.
    pub new_hash: String,
    /// When the remote content was last modified.
    pub modified_at: DateTime<Utc>,
    /// When this check was performed locally.
    pub checked_at: DateTime<Utc>,
    /// Streaming payload, present only when new content was downloaded.
    #[serde(skip)]
    data: Option<EditionData>,
}

impl ReadResult {
    /// Result for an edition whose remote content matches `hash`.
    #[must_use]
    pub fn up_to_date(
        edition_id: impl Into<String>,
        hash: impl Into<String>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        let hash = hash.into();
        Self {
            edition_id: edition_id.into(),
            old_hash: hash.clone(),
            new_hash: hash,
            modified_at,
            checked_at: Utc::now(),
            data: None,
        }
    }

    /// Result for an edition with changed remote content.
    #[must_use]
    pub fn updated(
        edition_id: impl Into<String>,
        old_hash: impl Into<String>,
        new_hash: impl Into<String>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            edition_id: edition_id.into(),
            old_hash: old_hash.into(),
            new_hash: new_hash.into(),
            modified_at,
            checked_at: Utc::now(),
            data: None,
        }
    }

    /// Attaches a payload to the result.
    #[must_use]
    pub fn with_data(mut self, data: EditionData) -> Self {
        self.data = Some(data);
        self
    }

    /// Takes the payload out of the result, leaving it empty.
    pub fn take_data(&mut self) -> Option<EditionData> {
        self.data.take()
    }

    /// Whether the result still carries an unconsumed payload.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// Streaming edition content produced by a [`Reader`].
///
/// Consumers pull decoded chunks until `next_chunk` returns `Ok(None)`.
/// For remote payloads, integrity verification (declared entry size and
/// content hash) runs as the final chunk boundary is reached, so a
/// truncated or corrupted transfer surfaces as an error through the write
/// path instead of ever completing cleanly.
pub struct EditionData {
    source: DataSource,
}

enum DataSource {
    Remote(Box<http_reader::RemoteArchive>),
    Buffered {
        chunks: VecDeque<Vec<u8>>,
        trailing_error: Option<Box<UpdateError>>,
    },
}

impl EditionData {
    /// In-memory payload, for deterministic reader implementations.
    #[must_use]
    pub fn buffered(content: Vec<u8>) -> Self {
        Self {
            source: DataSource::Buffered {
                chunks: VecDeque::from([content]),
                trailing_error: None,
            },
        }
    }

    /// In-memory payload that yields `content` and then fails with `error`,
    /// modeling an interrupted transfer.
    #[must_use]
    pub fn interrupted(content: Vec<u8>, error: UpdateError) -> Self {
        Self {
            source: DataSource::Buffered {
                chunks: VecDeque::from([content]),
                trailing_error: Some(Box::new(error)),
            },
        }
    }

    pub(crate) fn remote(archive: http_reader::RemoteArchive) -> Self {
        Self {
            source: DataSource::Remote(Box::new(archive)),
        }
    }

    /// Returns the next decoded chunk, or `Ok(None)` once the payload is
    /// complete and verified.
    ///
    /// # Errors
    ///
    /// Transport errors while streaming, and integrity errors
    /// ([`UpdateError::Truncated`], [`UpdateError::Integrity`]) once the
    /// stream ends.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpdateError> {
        match &mut self.source {
            DataSource::Remote(archive) => archive.next_chunk().await,
            DataSource::Buffered {
                chunks,
                trailing_error,
            } => {
                if let Some(chunk) = chunks.pop_front() {
                    return Ok(Some(chunk));
                }
                match trailing_error.take() {
                    Some(error) => Err(*error),
                    None => Ok(None),
                }
            }
        }
    }
}

impl std::fmt::Debug for EditionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            DataSource::Remote(_) => f.write_str("EditionData(remote)"),
            DataSource::Buffered { chunks, .. } => {
                write!(f, "EditionData(buffered, {} chunk(s))", chunks.len())
            }
        }
    }
}
