//! Incremental fetch-then-decrypt of a stable remote listing.
//!
//! For every listed item the remote metadata is recorded first, whatever
//! happens next, because merge timestamps depend on it. A transfer is skipped
//! only when the progress record says "fetched" *and* the local file exists;
//! the same rule applies to decryption. A record whose file has gone missing
//! is logged and the work is redone.
//!
//! Transfers land in `.<name>.partial` and are renamed into place on success.
//! Decrypted bytes go through a fsynced temp file in the decrypt directory.
//! Only after the final file is in place is the progress record appended, so
//! an interrupted run redoes at most the one in-flight item.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::contract::{Decryptor, RemoteItem, Transport, TransportError};
use crate::progress::{ProgressError, ProgressStore};
use crate::report::{ItemFailure, Stage, StageSummary};

/// Remote source and local destinations for the stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchLayout {
    pub remote_dir: String,
    pub download_dir: PathBuf,
    pub decrypt_dir: PathBuf,
}

impl FetchLayout {
    pub fn remote_file(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchDecryptReport {
    pub fetch: StageSummary,
    pub decrypt: StageSummary,
    pub failures: Vec<ItemFailure>,
}

/// Run the stage over `items`. Per-item transfer and decryption failures are
/// reported and skipped; only a progress-store failure aborts, because
/// continuing would break the exactly-once guarantees.
pub async fn fetch_and_decrypt<T, D>(
    items: &[RemoteItem],
    layout: &FetchLayout,
    transport: &T,
    decryptor: &D,
    store: &mut ProgressStore,
) -> Result<FetchDecryptReport, ProgressError>
where
    T: Transport + ?Sized,
    D: Decryptor + ?Sized,
{
    let mut report = FetchDecryptReport::default();
    for dir in [&layout.download_dir, &layout.decrypt_dir] {
        fs::create_dir_all(dir).map_err(|source| ProgressError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    for item in items {
        let name = item.name.as_str();
        store.upsert_metadata(name, item.modified_at, item.size)?;

        if !is_plain_file_name(name) {
            warn!(name = %name, "Refusing remote name that is not a plain file name");
            report.fetch.record_failure();
            report
                .failures
                .push(ItemFailure::new(name, Stage::Fetch, "unsafe file name"));
            continue;
        }

        let fetched_path = layout.download_dir.join(name);
        match ensure_fetched(item, layout, &fetched_path, transport, store).await? {
            StepOutcome::Skipped => report.fetch.record_skip(),
            StepOutcome::Done => report.fetch.record_success(),
            StepOutcome::Failed(e) => {
                report.fetch.record_failure();
                report.failures.push(ItemFailure::new(name, Stage::Fetch, e));
                continue;
            }
        }

        let decrypted_path = layout.decrypt_dir.join(name);
        match ensure_decrypted(name, &fetched_path, &decrypted_path, decryptor, store)? {
            StepOutcome::Skipped => report.decrypt.record_skip(),
            StepOutcome::Done => report.decrypt.record_success(),
            StepOutcome::Failed(e) => {
                report.decrypt.record_failure();
                report.failures.push(ItemFailure::new(name, Stage::Decrypt, e));
            }
        }
    }

    info!(
        fetch = %report.fetch,
        decrypt = %report.decrypt,
        "Fetch-decrypt stage finished"
    );
    Ok(report)
}

enum StepOutcome {
    Skipped,
    Done,
    Failed(String),
}

async fn ensure_fetched<T>(
    item: &RemoteItem,
    layout: &FetchLayout,
    fetched_path: &Path,
    transport: &T,
    store: &mut ProgressStore,
) -> Result<StepOutcome, ProgressError>
where
    T: Transport + ?Sized,
{
    let name = item.name.as_str();
    if store.has_fetched(name) {
        if fetched_path.exists() {
            info!(name = %name, "Skipping download (already recorded)");
            return Ok(StepOutcome::Skipped);
        }
        warn!(name = %name, "History says downloaded but local file missing; re-downloading");
    }

    let partial = layout.download_dir.join(format!(".{name}.partial"));
    let remote_file = layout.remote_file(name);
    info!(name = %name, remote = %remote_file, "Downloading");

    let transferred = match transport.fetch(&remote_file, &partial).await {
        Ok(bytes) => finalize_transfer(&partial, fetched_path).map(|_| bytes),
        Err(e) => Err(e),
    };

    match transferred {
        Ok(bytes) => {
            store.mark_fetched(name)?;
            info!(name = %name, bytes, "Download complete");
            Ok(StepOutcome::Done)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            error!(name = %name, error = %e, "Download failed");
            Ok(StepOutcome::Failed(e.to_string()))
        }
    }
}

fn finalize_transfer(partial: &Path, fetched_path: &Path) -> Result<(), TransportError> {
    fs::File::open(partial)?.sync_all()?;
    fs::rename(partial, fetched_path)?;
    Ok(())
}

fn ensure_decrypted<D>(
    name: &str,
    fetched_path: &Path,
    decrypted_path: &Path,
    decryptor: &D,
    store: &mut ProgressStore,
) -> Result<StepOutcome, ProgressError>
where
    D: Decryptor + ?Sized,
{
    if store.has_decrypted(name) {
        if decrypted_path.exists() {
            info!(name = %name, "Skipping decryption (already recorded)");
            return Ok(StepOutcome::Skipped);
        }
        warn!(name = %name, "History says decrypted but local file missing; re-decrypting");
    }

    let ciphertext = match fs::read(fetched_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(name = %name, error = %e, "Failed to read downloaded file");
            return Ok(StepOutcome::Failed(e.to_string()));
        }
    };

    let plaintext = match decryptor.decrypt(&ciphertext) {
        Ok(p) => p,
        Err(e) => {
            error!(name = %name, error = %e, "Decryption failed; fix the key and re-run");
            return Ok(StepOutcome::Failed(e.to_string()));
        }
    };

    if let Err(e) = write_durably(decrypted_path, &plaintext) {
        error!(name = %name, error = %e, "Failed to write decrypted file");
        return Ok(StepOutcome::Failed(e.to_string()));
    }

    store.mark_decrypted(name)?;
    info!(name = %name, bytes = plaintext.len(), "Successfully decrypted");
    Ok(StepOutcome::Done)
}

fn write_durably(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remote names become local file names; anything that could escape the
/// target directory is rejected.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0', '\n', '\r'])
}
