//! # contract: capability interfaces for the print-audit engine
//!
//! The engine never talks to SFTP, a cipher, or a renderer binary directly.
//! It goes through the three traits in this module:
//!
//! - [`Transport`]: list a remote directory, fetch one file to a local path.
//! - [`Decryptor`]: turn a ciphertext into plaintext bytes.
//! - [`CommandRunner`]: run an external converter with a bounded timeout.
//!
//! Real implementations live in [`crate::transport`], [`crate::decrypt`] and
//! [`crate::convert`]. With `cfg(test)` or the `test-export-mocks` feature,
//! `mockall` generates `MockTransport`, `MockDecryptor` and
//! `MockCommandRunner` for deterministic pipeline tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a remote listing. Immutable snapshot; `modified_at` is epoch
/// seconds in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub name: String,
    pub size: u64,
    pub modified_at: i64,
}

/// Listing and transfer failures. Distinct from an empty listing, which is `Ok(vec![])`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Other(String),
}

/// Access to the remote drop directory.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// List the regular files directly inside `remote_dir`.
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteItem>, TransportError>;

    /// Copy `remote_file` to `local_path`, returning the number of bytes written.
    ///
    /// Implementors may leave a partial file behind on failure; callers fetch
    /// into a scratch name and rename on success.
    async fn fetch(&self, remote_file: &str, local_path: &Path) -> Result<u64, TransportError>;
}

/// Both variants need operator action (fix the key); neither is retried within a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("invalid decryption key: {0}")]
    InvalidKey(String),

    #[error("invalid or corrupted ciphertext")]
    InvalidCiphertext,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError>;
}

/// A fully-specified external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub input: PathBuf,
    /// Where the converter is expected to leave its output (a file, or a
    /// page pattern for multi-page image output).
    pub output: PathBuf,
}

/// Result of a process that ran to completion (possibly unsuccessfully).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("converter {0} not found in PATH")]
    ToolMissing(String),

    #[error("converter {program} timed out after {seconds} seconds")]
    Timeout { program: String, seconds: u64 },

    #[error("converter {program} exited with {exit_code:?}: {stderr}")]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("converter {0} reported success but produced no output")]
    NoOutput(String),

    #[error("failed to launch converter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("all converters failed for {input}; last error: {last}")]
    AllCandidatesFailed { input: PathBuf, last: String },

    #[error("conversion I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs external converter processes.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Whether `program` can be resolved (e.g. on `PATH`).
    fn is_available(&self, program: &str) -> bool;

    /// Run to completion or until `timeout` elapses. A timeout is an error,
    /// a non-zero exit is an `Ok` outcome the caller inspects.
    async fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> Result<ToolOutcome, ConversionError>;
}
