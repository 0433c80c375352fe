//! HTTP implementation of the [`Reader`] capability.
//!
//! Talks to the distribution service over two endpoints: a metadata query
//! returning the current hash and publication date per edition, and a
//! download endpoint returning the edition as a gzip-compressed tar archive
//! holding a single database entry. Downloads are decoded incrementally —
//! response chunk, gzip decode, archive entry scan — so the payload is never
//! buffered whole, and the decoded bytes are hashed as the consumer drains
//! them so a truncated or corrupted transfer can never complete cleanly.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use flate2::write::GzDecoder;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::Config;
use crate::error::UpdateError;

use super::{DATABASE_EXTENSION, EditionData, ReadResult, Reader};

/// Connect timeout for service requests (30 seconds).
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Overall request timeout, covering the full download (5 minutes).
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Metadata endpoint path, relative to the service base URL.
const METADATA_PATH: &str = "updates/metadata";

/// Download endpoint path, relative to the service base URL.
const DOWNLOAD_PATH: &str = "updates/download";

/// Archive block granularity.
const BLOCK_SIZE: usize = 512;

/// [`Reader`] that fetches editions from the distribution service over
/// HTTP(S).
///
/// Built once per run and shared across all edition jobs; the underlying
/// client pools connections and is safe for concurrent use.
#[derive(Debug)]
pub struct HttpReader {
    client: Client,
    base_url: String,
    account_id: Option<u32>,
    license_key: Option<String>,
}

impl HttpReader {
    /// Creates a reader from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidUrl`] if the service or proxy URL is
    /// malformed (non-retryable), or [`UpdateError::Network`] if the client
    /// cannot be constructed.
    pub fn new(config: &Config) -> Result<Self, UpdateError> {
        let base_url = Url::parse(&config.url)
            .map_err(|_| UpdateError::invalid_url(config.url.clone()))?;

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("refsync/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|_| UpdateError::invalid_url(proxy.clone()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| UpdateError::network(config.url.clone(), e))?;

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            account_id: config.account_id,
            license_key: config.license_key.clone(),
        })
    }

    fn get(&self, url: &str, edition_id: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url).query(&[("edition_id", edition_id)]);
        if let (Some(account_id), Some(license_key)) = (self.account_id, &self.license_key) {
            request = request.basic_auth(account_id, Some(license_key));
        }
        request
    }

    /// Queries the metadata endpoint for one edition's current hash and
    /// publication date.
    #[instrument(level = "debug", skip(self))]
    async fn get_metadata(&self, edition_id: &str) -> Result<EditionMetadata, UpdateError> {
        let url = format!("{}/{METADATA_PATH}", self.base_url);
        let response = self
            .get(&url, edition_id)
            .send()
            .await
            .map_err(|e| UpdateError::network(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::http_status(&url, status.as_u16()));
        }

        let metadata: MetadataResponse = response.json().await.map_err(|e| {
            UpdateError::metadata(edition_id, format!("malformed metadata response: {e}"))
        })?;

        metadata
            .databases
            .into_iter()
            .find(|database| database.edition_id == edition_id)
            .ok_or_else(|| {
                UpdateError::metadata(edition_id, "edition not present in metadata response")
            })
    }
}

#[async_trait]
impl Reader for HttpReader {
    async fn read(
        &self,
        edition_id: &str,
        previous_hash: &str,
    ) -> Result<ReadResult, UpdateError> {
        let metadata = self.get_metadata(edition_id).await?;

        if metadata.md5.eq_ignore_ascii_case(previous_hash) {
            debug!(edition_id, "remote hash unchanged, nothing to download");
            let modified_at = parse_metadata_date(edition_id, &metadata.date)?;
            return Ok(ReadResult::up_to_date(edition_id, previous_hash, modified_at));
        }

        let url = format!("{}/{DOWNLOAD_PATH}", self.base_url);
        let response = self
            .get(&url, edition_id)
            .send()
            .await
            .map_err(|e| UpdateError::network(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::http_status(&url, status.as_u16()));
        }

        let modified_at = match last_modified(&response) {
            Some(time) => time,
            None => parse_metadata_date(edition_id, &metadata.date)?,
        };

        info!(edition_id, new_hash = %metadata.md5, "downloading changed edition");

        let archive = RemoteArchive::new(edition_id, &url, &metadata.md5, response);
        Ok(
            ReadResult::updated(edition_id, previous_hash, &metadata.md5, modified_at)
                .with_data(EditionData::remote(archive)),
        )
    }
}

/// Metadata endpoint response body.
#[derive(Debug, Deserialize)]
struct MetadataResponse {
    databases: Vec<EditionMetadata>,
}

/// One edition's entry in the metadata response.
#[derive(Debug, Deserialize)]
struct EditionMetadata {
    edition_id: String,
    md5: String,
    date: String,
}

/// Parses the metadata `date` field (`YYYY-MM-DD`) as midnight UTC.
fn parse_metadata_date(edition_id: &str, date: &str) -> Result<DateTime<Utc>, UpdateError> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| DateTime::from_naive_utc_and_offset(midnight, Utc))
        .ok_or_else(|| UpdateError::metadata(edition_id, format!("unparseable date {date:?}")))
}

/// Parses the download response's `Last-Modified` header, if present and
/// well-formed.
fn last_modified(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    let value = response.headers().get(reqwest::header::LAST_MODIFIED)?;
    let raw = value.to_str().ok()?;
    let time = httpdate::parse_http_date(raw).ok()?;
    Some(DateTime::from(time))
}

/// Streaming decode of a downloaded edition archive.
///
/// Pulls compressed chunks off the response body, decompresses them through
/// a gzip decoder, scans the decompressed bytes for the single database
/// entry, and hands the entry bytes to the consumer while accumulating
/// their MD5. When the body is exhausted it verifies that the entry reached
/// its declared size and that the computed hash matches the one the
/// metadata endpoint reported.
pub(crate) struct RemoteArchive {
    edition_id: String,
    url: String,
    expected_md5: String,
    response: reqwest::Response,
    decoder: GzDecoder<Vec<u8>>,
    scanner: EntryScanner,
    digest: Option<md5::Context>,
    body_done: bool,
    verified: bool,
}

impl RemoteArchive {
    pub(crate) fn new(
        edition_id: &str,
        url: &str,
        expected_md5: &str,
        response: reqwest::Response,
    ) -> Self {
        Self {
            edition_id: edition_id.to_string(),
            url: url.to_string(),
            expected_md5: expected_md5.to_string(),
            response,
            decoder: GzDecoder::new(Vec::new()),
            scanner: EntryScanner::new(),
            digest: Some(md5::Context::new()),
            body_done: false,
            verified: false,
        }
    }

    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpdateError> {
        loop {
            if self.verified {
                return Ok(None);
            }
            if self.body_done {
                self.verify()?;
                self.verified = true;
                return Ok(None);
            }

            let mut entry_bytes = Vec::new();
            match self
                .response
                .chunk()
                .await
                .map_err(|e| UpdateError::network(&self.url, e))?
            {
                Some(compressed) => {
                    self.decoder.write_all(&compressed).map_err(|e| {
                        UpdateError::archive(&self.edition_id, format!("gzip decode failed: {e}"))
                    })?;
                    let decoded = std::mem::take(self.decoder.get_mut());
                    self.scanner
                        .feed(&decoded, &mut entry_bytes)
                        .map_err(|reason| UpdateError::archive(&self.edition_id, reason))?;
                }
                None => {
                    self.body_done = true;
                    self.decoder.try_finish().map_err(|e| {
                        UpdateError::archive(&self.edition_id, format!("gzip stream incomplete: {e}"))
                    })?;
                    let decoded = std::mem::take(self.decoder.get_mut());
                    self.scanner
                        .feed(&decoded, &mut entry_bytes)
                        .map_err(|reason| UpdateError::archive(&self.edition_id, reason))?;
                }
            }

            if !entry_bytes.is_empty() {
                if let Some(digest) = self.digest.as_mut() {
                    digest.consume(&entry_bytes);
                }
                return Ok(Some(entry_bytes));
            }
        }
    }

    fn verify(&mut self) -> Result<(), UpdateError> {
        if !self.scanner.found() {
            return Err(UpdateError::archive(
                &self.edition_id,
                "archive contains no database entry",
            ));
        }
        if !self.scanner.entry_complete() {
            return Err(UpdateError::truncated(
                &self.edition_id,
                self.scanner.declared_size(),
                self.scanner.entry_bytes(),
            ));
        }

        let computed = match self.digest.take() {
            Some(digest) => format!("{:x}", digest.compute()),
            // Already verified once; nothing left to check.
            None => return Ok(()),
        };
        if !computed.eq_ignore_ascii_case(&self.expected_md5) {
            return Err(UpdateError::integrity(
                &self.edition_id,
                &self.expected_md5,
                computed,
            ));
        }

        debug!(edition_id = %self.edition_id, hash = %computed, "download verified");
        Ok(())
    }
}

#[derive(Debug)]
enum ScanState {
    /// Accumulating a header block.
    Header,
    /// Consuming an entry's data and its block padding.
    Entry {
        matched: bool,
        remaining: u64,
        padding: u64,
    },
    /// The database entry (or the end-of-archive marker) has been passed;
    /// remaining input is ignored.
    Finished,
}

/// Incremental scan of a tar-format stream for its single database entry.
///
/// Only the one extraction path needed here: walk header blocks, stream out
/// the first regular entry whose name ends in [`DATABASE_EXTENSION`], skip
/// everything else. Header fields other than name, size, and type are not
/// interpreted.
#[derive(Debug)]
struct EntryScanner {
    state: ScanState,
    header: Vec<u8>,
    found: bool,
    declared_size: u64,
    entry_bytes: u64,
}

impl EntryScanner {
    fn new() -> Self {
        Self {
            state: ScanState::Header,
            header: Vec::with_capacity(BLOCK_SIZE),
            found: false,
            declared_size: 0,
            entry_bytes: 0,
        }
    }

    /// Feeds decoded archive bytes, appending database entry bytes to `out`.
    fn feed(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<(), String> {
        while !input.is_empty() {
            match &mut self.state {
                ScanState::Finished => return Ok(()),

                ScanState::Header => {
                    let need = BLOCK_SIZE - self.header.len();
                    let take = need.min(input.len());
                    self.header.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.header.len() < BLOCK_SIZE {
                        return Ok(());
                    }

                    let block = std::mem::take(&mut self.header);
                    if block.iter().all(|byte| *byte == 0) {
                        // End-of-archive marker.
                        self.state = ScanState::Finished;
                        continue;
                    }

                    let name = header_name(&block);
                    let size = header_size(&block)?;
                    let type_flag = block[156];
                    let regular = type_flag == b'0' || type_flag == 0;
                    let matched = regular && !self.found && name.ends_with(DATABASE_EXTENSION);
                    if matched {
                        self.found = true;
                        self.declared_size = size;
                    }

                    let block_size = BLOCK_SIZE as u64;
                    let padding = (block_size - size % block_size) % block_size;
                    self.state = ScanState::Entry {
                        matched,
                        remaining: size,
                        padding,
                    };
                }

                ScanState::Entry {
                    matched,
                    remaining,
                    padding,
                } => {
                    if *remaining > 0 {
                        let take = usize::try_from(*remaining)
                            .unwrap_or(usize::MAX)
                            .min(input.len());
                        if *matched {
                            out.extend_from_slice(&input[..take]);
                            self.entry_bytes += take as u64;
                        }
                        *remaining -= take as u64;
                        input = &input[take..];
                    }
                    if *remaining == 0 {
                        let skip = usize::try_from(*padding)
                            .unwrap_or(usize::MAX)
                            .min(input.len());
                        *padding -= skip as u64;
                        input = &input[skip..];
                        if *padding == 0 {
                            let entry_was_the_database = *matched;
                            self.state = if entry_was_the_database {
                                ScanState::Finished
                            } else {
                                ScanState::Header
                            };
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn found(&self) -> bool {
        self.found
    }

    /// Whether the database entry's full declared size has been consumed.
    fn entry_complete(&self) -> bool {
        self.found && self.entry_bytes == self.declared_size
    }

    fn declared_size(&self) -> u64 {
        self.declared_size
    }

    fn entry_bytes(&self) -> u64 {
        self.entry_bytes
    }
}

/// Entry name: NUL-terminated field at offset 0.
fn header_name(block: &[u8]) -> String {
    let field = &block[0..100];
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Entry size: octal field at offset 124.
fn header_size(block: &[u8]) -> Result<u64, String> {
    let field = &block[124..136];
    let text = std::str::from_utf8(field)
        .map_err(|_| "archive header size field is not ASCII".to_string())?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if trimmed.is_empty() {
        return Err("archive header size field is empty".to_string());
    }
    u64::from_str_radix(trimmed, 8)
        .map_err(|_| format!("archive header size field {trimmed:?} is not octal"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Builds one tar header block for a regular file.
    fn tar_header(name: &str, size: u64) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[100..108].copy_from_slice(b"0000644\0");
        let size_field = format!("{size:011o}\0");
        block[124..136].copy_from_slice(size_field.as_bytes());
        block[136..148].copy_from_slice(b"00000000000\0");
        block[156] = b'0';
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        // Checksum: sum of the block with the checksum field spaced out.
        block[148..156].copy_from_slice(b"        ");
        let sum: u64 = block.iter().map(|byte| u64::from(*byte)).sum();
        let checksum = format!("{sum:06o}\0 ");
        block[148..156].copy_from_slice(checksum.as_bytes());
        block
    }

    /// Builds a complete single-entry archive (uncompressed).
    fn tar_archive(name: &str, content: &[u8]) -> Vec<u8> {
        let mut archive = tar_header(name, content.len() as u64);
        archive.extend_from_slice(content);
        let padding = (BLOCK_SIZE - content.len() % BLOCK_SIZE) % BLOCK_SIZE;
        archive.extend(std::iter::repeat_n(0u8, padding));
        archive.extend(std::iter::repeat_n(0u8, BLOCK_SIZE * 2));
        archive
    }

    #[test]
    fn test_scanner_extracts_single_entry() {
        let content = b"binary database contents".to_vec();
        let archive = tar_archive("edition-1.rdb", &content);

        let mut scanner = EntryScanner::new();
        let mut out = Vec::new();
        scanner.feed(&archive, &mut out).unwrap();

        assert_eq!(out, content);
        assert!(scanner.found());
        assert!(scanner.entry_complete());
    }

    #[test]
    fn test_scanner_handles_byte_at_a_time_input() {
        let content = vec![7u8; 700]; // spans two data blocks
        let archive = tar_archive("edition-1.rdb", &content);

        let mut scanner = EntryScanner::new();
        let mut out = Vec::new();
        for byte in &archive {
            scanner.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }

        assert_eq!(out, content);
        assert!(scanner.entry_complete());
    }

    #[test]
    fn test_scanner_skips_entries_without_database_extension() {
        let mut archive = tar_archive("README.txt", b"ignore me");
        archive.truncate(archive.len() - BLOCK_SIZE * 2);
        archive.extend(tar_archive("edition-1.rdb", b"keep me"));

        let mut scanner = EntryScanner::new();
        let mut out = Vec::new();
        scanner.feed(&archive, &mut out).unwrap();

        assert_eq!(out, b"keep me");
    }

    #[test]
    fn test_scanner_detects_truncated_entry() {
        // Header declares 1000 bytes but only 100 arrive.
        let mut archive = tar_header("edition-1.rdb", 1000);
        archive.extend(std::iter::repeat_n(b't', 100));

        let mut scanner = EntryScanner::new();
        let mut out = Vec::new();
        scanner.feed(&archive, &mut out).unwrap();

        assert!(scanner.found());
        assert!(!scanner.entry_complete());
        assert_eq!(scanner.declared_size(), 1000);
        assert_eq!(scanner.entry_bytes(), 100);
    }

    #[test]
    fn test_scanner_reports_no_entry_for_empty_archive() {
        let mut scanner = EntryScanner::new();
        let mut out = Vec::new();
        scanner
            .feed(&vec![0u8; BLOCK_SIZE * 2], &mut out)
            .unwrap();

        assert!(!scanner.found());
        assert!(out.is_empty());
    }

    #[test]
    fn test_scanner_rejects_garbage_size_field() {
        let mut block = tar_header("edition-1.rdb", 0);
        block[124..136].copy_from_slice(b"not-octal!!\0");

        let mut scanner = EntryScanner::new();
        let mut out = Vec::new();
        assert!(scanner.feed(&block, &mut out).is_err());
    }

    #[test]
    fn test_parse_metadata_date() {
        let parsed = parse_metadata_date("edition-1", "2023-04-27").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2023-04-27T00:00:00+00:00");

        assert!(parse_metadata_date("edition-1", "27/04/2023").is_err());
        assert!(parse_metadata_date("edition-1", "").is_err());
    }
}
