//! Run configuration: validated parameters for one update run.
//!
//! Configuration is loaded from a JSON file and optionally overridden by the
//! CLI before validation. The update pipeline itself treats [`Config`] as an
//! opaque, already-validated struct.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Default distribution service endpoint.
pub const DEFAULT_URL: &str = "https://updates.refsync.io";

/// Default number of parallel edition jobs.
pub const DEFAULT_PARALLELISM: usize = 1;

/// Default per-job retry budget (5 minutes).
pub const DEFAULT_RETRY_FOR: Duration = Duration::from_secs(300);

/// Lock file name used when the configuration does not name one.
const DEFAULT_LOCK_FILE_NAME: &str = ".refsync.lock";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("reading config file {path}: {source}")]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON.
    #[error("parsing config file {path}: {source}")]
    Parse {
        /// The file that failed to parse.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// No editions were configured.
    #[error("no edition ids configured")]
    NoEditions,

    /// Parallelism must be at least 1.
    #[error("invalid parallelism {value}: must be at least 1")]
    InvalidParallelism {
        /// The invalid value.
        value: usize,
    },

    /// The service or proxy URL is malformed.
    #[error("invalid URL in config: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// Credentials must be configured as a pair.
    #[error("account_id and license_key must be set together")]
    PartialCredentials,
}

/// Immutable parameters for one update run.
///
/// Invariants after [`Config::validate`]: `parallelism >= 1`, at least one
/// edition id, `url` (and `proxy`, when set) parse as URLs, and credentials
/// are either both present or both absent. `retry_for` of zero disables
/// retries.
#[derive(Debug, Clone)]
pub struct Config {
    /// Edition ids to update, in report order.
    pub edition_ids: Vec<String>,
    /// Base URL of the distribution service.
    pub url: String,
    /// Optional HTTP(S) proxy URL.
    pub proxy: Option<String>,
    /// Account id for HTTP Basic auth, paired with `license_key`.
    pub account_id: Option<u32>,
    /// License key for HTTP Basic auth, paired with `account_id`.
    pub license_key: Option<String>,
    /// Directory holding the edition database files.
    pub database_directory: PathBuf,
    /// Advisory lock file serializing update runs.
    pub lock_file: PathBuf,
    /// Maximum number of editions updated in parallel.
    pub parallelism: usize,
    /// Wall-clock retry budget per edition job.
    pub retry_for: Duration,
    /// Log at debug verbosity.
    pub verbose: bool,
    /// Emit the structured JSON report after the run.
    pub output: bool,
    /// Restore the remote modification time on written files.
    pub preserve_file_times: bool,
}

impl Default for Config {
    fn default() -> Self {
        let database_directory = PathBuf::from(".");
        let lock_file = database_directory.join(DEFAULT_LOCK_FILE_NAME);
        Self {
            edition_ids: Vec::new(),
            url: DEFAULT_URL.to_string(),
            proxy: None,
            account_id: None,
            license_key: None,
            database_directory,
            lock_file,
            parallelism: DEFAULT_PARALLELISM,
            retry_for: DEFAULT_RETRY_FOR,
            verbose: false,
            output: false,
            preserve_file_times: false,
        }
    }
}

/// On-disk configuration file shape. All fields optional; defaults applied
/// in [`Config::load`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    edition_ids: Vec<String>,
    url: Option<String>,
    proxy: Option<String>,
    account_id: Option<u32>,
    license_key: Option<String>,
    database_directory: Option<PathBuf>,
    lock_file: Option<PathBuf>,
    parallelism: Option<usize>,
    retry_for_secs: Option<u64>,
    output: Option<bool>,
    preserve_file_times: Option<bool>,
}

impl Config {
    /// Loads configuration from a JSON file, applying defaults for absent
    /// fields. The lock file defaults to `.refsync.lock` inside the database
    /// directory.
    ///
    /// The result is not yet validated; callers apply their overrides first
    /// and then call [`Config::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let database_directory = file.database_directory.unwrap_or_else(|| PathBuf::from("."));
        let lock_file = file
            .lock_file
            .unwrap_or_else(|| database_directory.join(DEFAULT_LOCK_FILE_NAME));

        Ok(Self {
            edition_ids: file.edition_ids,
            url: file.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            proxy: file.proxy,
            account_id: file.account_id,
            license_key: file.license_key,
            database_directory,
            lock_file,
            parallelism: file.parallelism.unwrap_or(DEFAULT_PARALLELISM),
            retry_for: file
                .retry_for_secs
                .map_or(DEFAULT_RETRY_FOR, Duration::from_secs),
            verbose: false,
            output: file.output.unwrap_or(false),
            preserve_file_times: file.preserve_file_times.unwrap_or(false),
        })
    }

    /// Checks the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant as a [`ConfigError`]. These are
    /// non-retryable: the run aborts before any job starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.edition_ids.is_empty() {
            return Err(ConfigError::NoEditions);
        }
        if self.parallelism < 1 {
            return Err(ConfigError::InvalidParallelism {
                value: self.parallelism,
            });
        }
        if Url::parse(&self.url).is_err() {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
            });
        }
        if let Some(proxy) = &self.proxy {
            if Url::parse(proxy).is_err() {
                return Err(ConfigError::InvalidUrl { url: proxy.clone() });
            }
        }
        if self.account_id.is_some() != self.license_key.is_some() {
            return Err(ConfigError::PartialCredentials);
        }
        Ok(())
    }
}
