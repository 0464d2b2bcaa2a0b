//! Durable record of what has been fetched and decrypted, plus the last-seen
//! remote metadata for every name ever listed.
//!
//! On-disk layout (inside the state directory by default):
//!
//! - `downloaded_files.txt`: append-only, one fetched name per line
//! - `decrypted_files.txt`: append-only, one decrypted name per line
//! - `remote_file_meta.json`: `{"<name>": {"mtime": i64, "size": u64}}`,
//!   replaced atomically (temp file in the same directory, then rename)
//!
//! Every mutation is flushed to disk before the call returns. The store is
//! constructed once per run and passed by `&mut` to the stages that mutate it.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_FETCHED_LOG: &str = "downloaded_files.txt";
pub const DEFAULT_DECRYPTED_LOG: &str = "decrypted_files.txt";
pub const DEFAULT_METADATA_FILE: &str = "remote_file_meta.json";

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("failed to access progress file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed metadata document {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot mark {0} decrypted before it is fetched")]
    NotFetched(String),

    #[error("names containing line breaks cannot be recorded: {0:?}")]
    InvalidName(String),
}

/// Remote metadata as last observed in a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMeta {
    pub mtime: i64,
    pub size: u64,
}

/// Where the three progress files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPaths {
    pub fetched_log: PathBuf,
    pub decrypted_log: PathBuf,
    pub metadata: PathBuf,
}

impl ProgressPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            fetched_log: dir.join(DEFAULT_FETCHED_LOG),
            decrypted_log: dir.join(DEFAULT_DECRYPTED_LOG),
            metadata: dir.join(DEFAULT_METADATA_FILE),
        }
    }
}

#[derive(Debug)]
pub struct ProgressStore {
    paths: ProgressPaths,
    fetched: HashSet<String>,
    decrypted: HashSet<String>,
    metadata: BTreeMap<String, RemoteMeta>,
}

impl ProgressStore {
    /// Load persisted records. Missing files mean an empty history.
    pub fn open(paths: ProgressPaths) -> Result<Self, ProgressError> {
        let fetched = load_name_log(&paths.fetched_log)?;
        let mut decrypted = load_name_log(&paths.decrypted_log)?;
        let metadata = load_metadata(&paths.metadata)?;

        let orphaned: Vec<String> = decrypted.difference(&fetched).cloned().collect();
        for name in orphaned {
            warn!(name = %name, "Decrypted record without fetched record; dropping it so the item is redone");
            decrypted.remove(&name);
        }

        info!(
            fetched = fetched.len(),
            decrypted = decrypted.len(),
            metadata = metadata.len(),
            "Loaded progress records"
        );

        Ok(Self {
            paths,
            fetched,
            decrypted,
            metadata,
        })
    }

    pub fn paths(&self) -> &ProgressPaths {
        &self.paths
    }

    pub fn has_fetched(&self, name: &str) -> bool {
        self.fetched.contains(name)
    }

    pub fn has_decrypted(&self, name: &str) -> bool {
        self.decrypted.contains(name)
    }

    /// Record a completed transfer. Re-marking a known name writes nothing.
    pub fn mark_fetched(&mut self, name: &str) -> Result<(), ProgressError> {
        if self.fetched.contains(name) {
            return Ok(());
        }
        append_name(&self.paths.fetched_log, name)?;
        self.fetched.insert(name.to_string());
        Ok(())
    }

    /// Record a durably written decrypted file. The name must already be fetched.
    pub fn mark_decrypted(&mut self, name: &str) -> Result<(), ProgressError> {
        if !self.fetched.contains(name) {
            return Err(ProgressError::NotFetched(name.to_string()));
        }
        if self.decrypted.contains(name) {
            return Ok(());
        }
        append_name(&self.paths.decrypted_log, name)?;
        self.decrypted.insert(name.to_string());
        Ok(())
    }

    /// Latest write wins. Unchanged values are not rewritten.
    pub fn upsert_metadata(&mut self, name: &str, mtime: i64, size: u64) -> Result<(), ProgressError> {
        let meta = RemoteMeta { mtime, size };
        if self.metadata.get(name) == Some(&meta) {
            return Ok(());
        }
        let previous = self.metadata.insert(name.to_string(), meta);
        if let Err(e) = save_metadata_atomic(&self.paths.metadata, &self.metadata) {
            // Keep memory consistent with disk.
            match previous {
                Some(old) => self.metadata.insert(name.to_string(), old),
                None => self.metadata.remove(name),
            };
            return Err(e);
        }
        debug!(name = %name, mtime, size, "Recorded remote metadata");
        Ok(())
    }

    pub fn get_metadata(&self, name: &str) -> Option<RemoteMeta> {
        self.metadata.get(name).copied()
    }

    pub fn metadata_len(&self) -> usize {
        self.metadata.len()
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ProgressError + '_ {
    move |source| ProgressError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn load_name_log(path: &Path) -> Result<HashSet<String>, ProgressError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    let mut names = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err(path))?;
        // Names are stored verbatim; only a CRLF line ending is undone.
        let name = line.strip_suffix('\r').unwrap_or(&line);
        if !name.is_empty() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

fn append_name(path: &Path, name: &str) -> Result<(), ProgressError> {
    if name.contains('\n') || name.contains('\r') {
        return Err(ProgressError::InvalidName(name.to_string()));
    }
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    writeln!(file, "{name}").map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))
}

fn load_metadata(path: &Path) -> Result<BTreeMap<String, RemoteMeta>, ProgressError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&content).map_err(|source| ProgressError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

fn save_metadata_atomic(
    path: &Path,
    metadata: &BTreeMap<String, RemoteMeta>,
) -> Result<(), ProgressError> {
    let dir = ensure_parent(path)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(path))?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), metadata).map_err(|source| {
        ProgressError::Metadata {
            path: path.to_path_buf(),
            source,
        }
    })?;
    tmp.as_file_mut().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<PathBuf, ProgressError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    Ok(dir)
}
