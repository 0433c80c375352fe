//! Filesystem implementation of the [`Writer`] capability.
//!
//! New content is staged in a temporary file inside the database directory
//! and renamed into place, so readers of the final path see either the old
//! or the complete new file, never a partial one.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::UpdateError;

use super::{DATABASE_EXTENSION, EditionData, ReadResult, Writer, ZERO_MD5};

/// Suffix of the staging file an edition is written to before the rename.
const TEMPORARY_SUFFIX: &str = ".temporary";

/// Read buffer size for on-disk hashing.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// [`Writer`] that persists editions as files in a local directory.
#[derive(Debug)]
pub struct LocalFileWriter {
    database_directory: PathBuf,
    preserve_file_times: bool,
}

impl LocalFileWriter {
    /// Creates a writer rooted at `database_directory`, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if the directory cannot be created.
    pub fn new(
        database_directory: impl Into<PathBuf>,
        preserve_file_times: bool,
    ) -> Result<Self, UpdateError> {
        let database_directory = database_directory.into();
        std::fs::create_dir_all(&database_directory)
            .map_err(|e| UpdateError::io(&database_directory, e))?;
        Ok(Self {
            database_directory,
            preserve_file_times,
        })
    }

    /// Final path of an edition's database file.
    fn database_path(&self, edition_id: &str) -> PathBuf {
        self.database_directory
            .join(format!("{edition_id}{DATABASE_EXTENSION}"))
    }

    /// Staging path next to the final path, on the same filesystem so the
    /// rename is atomic.
    fn temporary_path(&self, edition_id: &str) -> PathBuf {
        self.database_directory
            .join(format!("{edition_id}{DATABASE_EXTENSION}{TEMPORARY_SUFFIX}"))
    }
}

#[async_trait]
impl Writer for LocalFileWriter {
    async fn write(&self, result: &mut ReadResult) -> Result<(), UpdateError> {
        let Some(mut data) = result.take_data() else {
            debug!(edition_id = %result.edition_id, "result carries no payload, nothing to write");
            return Ok(());
        };

        let final_path = self.database_path(&result.edition_id);
        let temp_path = self.temporary_path(&result.edition_id);

        let staged = stage_payload(&mut data, &temp_path).await;
        if let Err(error) = staged {
            debug!(path = %temp_path.display(), "removing staging file after failed write");
            if let Err(remove_error) = tokio::fs::remove_file(&temp_path).await {
                warn!(
                    path = %temp_path.display(),
                    error = %remove_error,
                    "failed to remove staging file"
                );
            }
            return Err(error);
        }

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| UpdateError::io(&final_path, e))?;

        if self.preserve_file_times {
            set_modified_time(&final_path, result.modified_at.into())?;
        }

        info!(
            edition_id = %result.edition_id,
            path = %final_path.display(),
            new_hash = %result.new_hash,
            "database file updated"
        );
        Ok(())
    }

    async fn get_hash(&self, edition_id: &str) -> Result<String, UpdateError> {
        let path = self.database_path(edition_id);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ZERO_MD5.to_string());
            }
            Err(e) => return Err(UpdateError::io(&path, e)),
        };

        let mut digest = md5::Context::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| UpdateError::io(&path, e))?;
            if read == 0 {
                break;
            }
            digest.consume(&buffer[..read]);
        }
        Ok(format!("{:x}", digest.compute()))
    }
}

/// Streams the payload into the staging file and syncs it to disk.
async fn stage_payload(data: &mut EditionData, temp_path: &Path) -> Result<(), UpdateError> {
    let file = File::create(temp_path)
        .await
        .map_err(|e| UpdateError::io(temp_path, e))?;
    let mut writer = BufWriter::new(file);

    while let Some(chunk) = data.next_chunk().await? {
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| UpdateError::io(temp_path, e))?;
    }

    writer
        .flush()
        .await
        .map_err(|e| UpdateError::io(temp_path, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| UpdateError::io(temp_path, e))?;
    Ok(())
}

/// Sets a file's modification time to the remote content's timestamp.
fn set_modified_time(path: &Path, modified_at: SystemTime) -> Result<(), UpdateError> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| UpdateError::io(path, e))?;
    file.set_modified(modified_at)
        .map_err(|e| UpdateError::io(path, e))
}
