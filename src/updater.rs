//! Orchestration of one update run across all configured editions.
//!
//! The [`Updater`] acquires the database directory lock, builds one job per
//! edition (current hash → remote read → conditional write), runs them on a
//! [`JobProcessor`], and emits the collected results as a single JSON report
//! in configuration order.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::database::{HttpReader, LocalFileWriter, ReadResult, Reader, Writer};
use crate::error::UpdateError;
use crate::lock::DirectoryLock;
use crate::processor::JobProcessor;

/// Runs the update pipeline for a set of editions.
pub struct Updater {
    config: Config,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Updater {
    /// Creates an updater with the live HTTP reader and local file writer,
    /// reporting to stdout.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable error if the configuration is invalid or the
    /// database directory cannot be created.
    pub fn new(config: Config) -> Result<Self, UpdateError> {
        config.validate()?;
        let reader = HttpReader::new(&config)?;
        let writer = LocalFileWriter::new(&config.database_directory, config.preserve_file_times)?;
        Ok(Self::with_parts(
            config,
            Arc::new(reader),
            Arc::new(writer),
            Box::new(std::io::stdout()),
        ))
    }

    /// Creates an updater from explicit capabilities and an output sink.
    /// This is the seam deterministic reader/writer doubles plug into.
    #[must_use]
    pub fn with_parts(
        config: Config,
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            config,
            reader,
            writer,
            output: Mutex::new(output),
        }
    }

    /// Runs one update pass over every configured edition.
    ///
    /// The directory lock is held for the whole run and released on every
    /// exit path. All jobs run to a terminal state before the outcome is
    /// decided; the report (when enabled) is emitted in configuration
    /// order, and the first permanent failure — also in configuration
    /// order — is returned after it.
    ///
    /// # Errors
    ///
    /// Lock and configuration errors abort before any job starts. Otherwise
    /// the first permanently-failed job's error is returned; editions that
    /// succeeded stay persisted.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), UpdateError> {
        let _lock = DirectoryLock::acquire(&self.config.lock_file)?;

        info!(
            editions = self.config.edition_ids.len(),
            parallelism = self.config.parallelism,
            "starting update run"
        );

        let results: Arc<tokio::sync::Mutex<Vec<(usize, ReadResult)>>> =
            Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut processor = JobProcessor::new(self.config.parallelism, self.config.retry_for);
        for (index, edition_id) in self.config.edition_ids.iter().enumerate() {
            let reader = Arc::clone(&self.reader);
            let writer = Arc::clone(&self.writer);
            let results = Arc::clone(&results);
            let edition_id = edition_id.clone();

            processor.add(edition_id.clone(), move || {
                let reader = Arc::clone(&reader);
                let writer = Arc::clone(&writer);
                let results = Arc::clone(&results);
                let edition_id = edition_id.clone();
                async move {
                    let mut result = update_edition(&*reader, &*writer, &edition_id).await?;
                    result.checked_at = Utc::now();
                    results.lock().await.push((index, result));
                    Ok(())
                }
            });
        }

        let outcome = processor.run(cancel).await;

        if self.config.output {
            let mut collected = match Arc::try_unwrap(results) {
                Ok(mutex) => mutex.into_inner(),
                // All jobs have terminated, so this is unreachable; drain
                // through the lock instead of giving up.
                Err(shared) => std::mem::take(&mut *shared.lock().await),
            };
            collected.sort_by_key(|(index, _)| *index);
            let report: Vec<ReadResult> =
                collected.into_iter().map(|(_, result)| result).collect();
            self.emit_report(&report)?;
        }

        outcome
    }

    /// Serializes the collected results as one JSON array on the sink.
    fn emit_report(&self, report: &[ReadResult]) -> Result<(), UpdateError> {
        let encoded = serde_json::to_string(report).map_err(|e| UpdateError::Report {
            reason: e.to_string(),
        })?;
        let mut sink = self.output.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(sink, "{encoded}").map_err(|e| UpdateError::Report {
            reason: e.to_string(),
        })?;
        sink.flush().map_err(|e| UpdateError::Report {
            reason: e.to_string(),
        })
    }
}

/// One edition's job body: compare hashes, download if changed, persist.
async fn update_edition(
    reader: &dyn Reader,
    writer: &dyn Writer,
    edition_id: &str,
) -> Result<ReadResult, UpdateError> {
    let old_hash = writer.get_hash(edition_id).await?;
    let mut result = reader.read(edition_id, &old_hash).await?;

    if result.new_hash == result.old_hash {
        debug!(edition_id, hash = %result.old_hash, "edition already up to date");
    } else {
        writer.write(&mut result).await?;
    }

    Ok(result)
}
