//! Integration tests for the update run orchestration.
//!
//! These tests drive the [`Updater`] with deterministic in-memory reader and
//! writer doubles, checking the report contract and error propagation
//! without touching the network.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use refsync_core::{
    Config, DirectoryLock, EditionData, ReadResult, Reader, UpdateError, Updater, Writer, ZERO_MD5,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Output sink whose contents the test can inspect after the run.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Canned remote state for one edition.
struct CannedEdition {
    old_hash: &'static str,
    new_hash: &'static str,
    modified_at: DateTime<Utc>,
    /// Simulated network latency before the result is returned.
    delay: Duration,
}

/// Reader returning canned results, tracking call and concurrency counts.
#[derive(Default)]
struct MockReader {
    editions: HashMap<String, CannedEdition>,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockReader {
    fn with_editions(
        editions: impl IntoIterator<Item = (&'static str, CannedEdition)>,
    ) -> Self {
        Self {
            editions: editions
                .into_iter()
                .map(|(id, canned)| (id.to_string(), canned))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Reader for MockReader {
    async fn read(
        &self,
        edition_id: &str,
        previous_hash: &str,
    ) -> Result<ReadResult, UpdateError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let canned = self.editions.get(edition_id).ok_or_else(|| {
            UpdateError::metadata(edition_id, "edition not present in metadata response")
        })?;
        if !canned.delay.is_zero() {
            tokio::time::sleep(canned.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if canned.new_hash == previous_hash {
            return Ok(ReadResult::up_to_date(
                edition_id,
                previous_hash,
                canned.modified_at,
            ));
        }
        Ok(ReadResult::updated(
            edition_id,
            canned.old_hash,
            canned.new_hash,
            canned.modified_at,
        )
        .with_data(EditionData::buffered(b"payload".to_vec())))
    }
}

/// Writer recording writes, optionally failing every write with a transport
/// error.
#[derive(Default)]
struct MockWriter {
    writes: AtomicUsize,
    fail_writes: bool,
}

#[async_trait]
impl Writer for MockWriter {
    async fn write(&self, result: &mut ReadResult) -> Result<(), UpdateError> {
        if self.fail_writes {
            return Err(UpdateError::timeout(
                "https://updates.test/updates/download",
            ));
        }
        result.take_data();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_hash(&self, _edition_id: &str) -> Result<String, UpdateError> {
        Ok(ZERO_MD5.to_string())
    }
}

fn test_config(dir: &TempDir, edition_ids: &[&str]) -> Config {
    Config {
        edition_ids: edition_ids.iter().map(ToString::to_string).collect(),
        database_directory: dir.path().to_path_buf(),
        lock_file: dir.path().join(".refsync.lock"),
        parallelism: 1,
        retry_for: Duration::ZERO,
        output: true,
        ..Config::default()
    }
}

fn canned(old_hash: &'static str, new_hash: &'static str) -> CannedEdition {
    CannedEdition {
        old_hash,
        new_hash,
        modified_at: Utc.with_ymd_and_hms(2023, 4, 27, 12, 4, 48).unwrap(),
        delay: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_report_matches_configuration_order_and_content() {
    let dir = TempDir::new().unwrap();
    let run_started = Utc::now();

    let reader = Arc::new(MockReader::with_editions([
        ("edition-alpha", canned("A", "B")),
        ("edition-beta", canned("C", "D")),
    ]));
    let writer = Arc::new(MockWriter::default());
    let sink = SharedSink::default();

    let updater = Updater::with_parts(
        test_config(&dir, &["edition-alpha", "edition-beta"]),
        Arc::clone(&reader) as Arc<dyn Reader>,
        Arc::clone(&writer) as Arc<dyn Writer>,
        Box::new(sink.clone()),
    );
    updater.run(&CancellationToken::new()).await.unwrap();

    let report: Vec<ReadResult> = serde_json::from_slice(&sink.contents()).unwrap();
    assert_eq!(report.len(), 2);

    let expected_modified = Utc.with_ymd_and_hms(2023, 4, 27, 12, 4, 48).unwrap();
    let expected = [("edition-alpha", "A", "B"), ("edition-beta", "C", "D")];
    for (entry, (edition_id, old_hash, new_hash)) in report.iter().zip(expected) {
        assert_eq!(entry.edition_id, edition_id);
        assert_eq!(entry.old_hash, old_hash);
        assert_eq!(entry.new_hash, new_hash);
        assert_eq!(entry.modified_at, expected_modified);
        assert!(
            entry.checked_at >= run_started,
            "checked_at {} precedes run start {}",
            entry.checked_at,
            run_started
        );
    }

    // Both editions changed, so both were written.
    assert_eq!(writer.writes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_write_failure_surfaces_transport_error() {
    let dir = TempDir::new().unwrap();

    let reader = Arc::new(MockReader::with_editions([(
        "edition-alpha",
        canned("A", "B"),
    )]));
    let writer = Arc::new(MockWriter {
        fail_writes: true,
        ..MockWriter::default()
    });

    let updater = Updater::with_parts(
        Config {
            output: false,
            ..test_config(&dir, &["edition-alpha"])
        },
        reader as Arc<dyn Reader>,
        writer as Arc<dyn Writer>,
        Box::new(SharedSink::default()),
    );
    let error = updater.run(&CancellationToken::new()).await.unwrap_err();

    // The underlying transport failure must stay identifiable through the
    // job wrapper.
    match error {
        UpdateError::JobFailed {
            edition_id,
            attempts,
            source,
        } => {
            assert_eq!(edition_id, "edition-alpha");
            assert_eq!(attempts, 1);
            assert!(matches!(*source, UpdateError::Timeout { .. }));
        }
        other => panic!("expected JobFailed wrapping a transport error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_unchanged_edition_is_reported_but_not_written() {
    let dir = TempDir::new().unwrap();

    let reader = Arc::new(MockReader::with_editions([(
        "edition-alpha",
        CannedEdition {
            old_hash: ZERO_MD5,
            new_hash: ZERO_MD5,
            modified_at: Utc.with_ymd_and_hms(2023, 4, 27, 0, 0, 0).unwrap(),
            delay: Duration::ZERO,
        },
    )]));
    let writer = Arc::new(MockWriter::default());
    let sink = SharedSink::default();

    let updater = Updater::with_parts(
        test_config(&dir, &["edition-alpha"]),
        Arc::clone(&reader) as Arc<dyn Reader>,
        Arc::clone(&writer) as Arc<dyn Writer>,
        Box::new(sink.clone()),
    );
    updater.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(writer.writes.load(Ordering::SeqCst), 0);

    let report: Vec<ReadResult> = serde_json::from_slice(&sink.contents()).unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].old_hash, report[0].new_hash);
}

#[tokio::test]
async fn test_report_order_is_configuration_order_not_completion_order() {
    let dir = TempDir::new().unwrap();

    // Earlier editions finish last.
    let reader = Arc::new(MockReader::with_editions([
        (
            "edition-slow",
            CannedEdition {
                delay: Duration::from_millis(80),
                ..canned("A", "B")
            },
        ),
        (
            "edition-medium",
            CannedEdition {
                delay: Duration::from_millis(40),
                ..canned("C", "D")
            },
        ),
        ("edition-fast", canned("E", "F")),
    ]));
    let writer = Arc::new(MockWriter::default());
    let sink = SharedSink::default();

    let updater = Updater::with_parts(
        Config {
            parallelism: 3,
            ..test_config(&dir, &["edition-slow", "edition-medium", "edition-fast"])
        },
        reader as Arc<dyn Reader>,
        writer as Arc<dyn Writer>,
        Box::new(sink.clone()),
    );
    updater.run(&CancellationToken::new()).await.unwrap();

    let report: Vec<ReadResult> = serde_json::from_slice(&sink.contents()).unwrap();
    let order: Vec<&str> = report.iter().map(|entry| entry.edition_id.as_str()).collect();
    assert_eq!(order, ["edition-slow", "edition-medium", "edition-fast"]);
}

#[tokio::test]
async fn test_no_more_than_parallelism_reads_run_concurrently() {
    let dir = TempDir::new().unwrap();

    let editions: Vec<(&'static str, CannedEdition)> = [
        "edition-1",
        "edition-2",
        "edition-3",
        "edition-4",
        "edition-5",
        "edition-6",
    ]
    .into_iter()
    .map(|id| {
        (
            id,
            CannedEdition {
                delay: Duration::from_millis(30),
                ..canned("A", "B")
            },
        )
    })
    .collect();
    let reader = Arc::new(MockReader::with_editions(editions));
    let writer = Arc::new(MockWriter::default());

    let updater = Updater::with_parts(
        Config {
            parallelism: 2,
            output: false,
            ..test_config(
                &dir,
                &[
                    "edition-1",
                    "edition-2",
                    "edition-3",
                    "edition-4",
                    "edition-5",
                    "edition-6",
                ],
            )
        },
        Arc::clone(&reader) as Arc<dyn Reader>,
        writer as Arc<dyn Writer>,
        Box::new(SharedSink::default()),
    );
    updater.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(reader.reads.load(Ordering::SeqCst), 6);
    let peak = reader.peak_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrent reads {peak} exceeded parallelism 2");
}

#[tokio::test]
async fn test_run_fails_fast_when_lock_already_held() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, &["edition-alpha"]);

    let _held = DirectoryLock::acquire(&config.lock_file).unwrap();

    let reader = Arc::new(MockReader::with_editions([(
        "edition-alpha",
        canned("A", "B"),
    )]));
    let updater = Updater::with_parts(
        config,
        Arc::clone(&reader) as Arc<dyn Reader>,
        Arc::new(MockWriter::default()) as Arc<dyn Writer>,
        Box::new(SharedSink::default()),
    );

    let error = updater.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(error, UpdateError::Lock { .. }));
    // The run aborted before any job started.
    assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_report_without_output_flag() {
    let dir = TempDir::new().unwrap();

    let reader = Arc::new(MockReader::with_editions([(
        "edition-alpha",
        canned("A", "B"),
    )]));
    let sink = SharedSink::default();

    let updater = Updater::with_parts(
        Config {
            output: false,
            ..test_config(&dir, &["edition-alpha"])
        },
        reader as Arc<dyn Reader>,
        Arc::new(MockWriter::default()) as Arc<dyn Writer>,
        Box::new(sink.clone()),
    );
    updater.run(&CancellationToken::new()).await.unwrap();

    assert!(sink.contents().is_empty());
}
