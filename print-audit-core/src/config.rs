//! Run configuration, as read from YAML by the CLI.
//!
//! Every section and every field is optional; defaults match the existing
//! drop-server deployments. Secrets (the Fernet key, the SFTP password) are
//! never part of this structure.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::convert::{ConvertOptions, OutputFormat, ToolChoice, DEFAULT_DPI};
use crate::fetch::FetchLayout;
use crate::grouping::GrammarChoice;
use crate::merge::{MergeError, MergeOptions, MtimePolicy, DEFAULT_TIMESTAMP_FORMAT, DEFAULT_UTC_OFFSET_MINUTES};
use crate::progress::ProgressPaths;
use crate::stability::StabilityOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteSection,
    pub paths: PathsSection,
    pub stability: StabilitySection,
    pub merge: MergeSection,
    pub convert: ConvertSection,
}

impl Config {
    pub fn trace_loaded(&self) {
        info!(
            remote_kind = ?self.remote.kind,
            remote_path = %self.remote.path,
            download_dir = %self.paths.download_dir.display(),
            decrypt_dir = %self.paths.decrypt_dir.display(),
            merge_dir = %self.paths.merge_dir.display(),
            grammar = ?self.merge.grammar,
            auto_convert = self.convert.auto,
            "Loaded Config"
        );
        debug!(?self, "Config loaded (full debug)");
    }

    pub fn fetch_layout(&self) -> FetchLayout {
        FetchLayout {
            remote_dir: self.remote.path.clone(),
            download_dir: self.paths.download_dir.clone(),
            decrypt_dir: self.paths.decrypt_dir.clone(),
        }
    }

    /// Progress files in `state_dir`, unless individually overridden.
    pub fn progress_paths(&self) -> ProgressPaths {
        let mut paths = ProgressPaths::in_dir(&self.paths.state_dir);
        if let Some(path) = &self.paths.fetched_log {
            paths.fetched_log = path.clone();
        }
        if let Some(path) = &self.paths.decrypted_log {
            paths.decrypted_log = path.clone();
        }
        if let Some(path) = &self.paths.metadata_file {
            paths.metadata = path.clone();
        }
        paths
    }

    pub fn stability_options(&self) -> StabilityOptions {
        StabilityOptions {
            interval: Duration::from_secs(self.stability.interval_secs),
            max_rounds: self.stability.max_rounds,
        }
    }

    pub fn merge_options(&self) -> Result<MergeOptions, MergeError> {
        MergeOptions::new(
            self.paths.merge_dir.clone(),
            &self.merge.timestamp_format,
            self.merge.mtime_policy,
            self.merge.utc_offset_minutes,
        )
    }

    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            format: self.convert.format,
            dpi: self.convert.dpi,
            tool: self.convert.tool,
            timeout: Duration::from_secs(self.convert.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    #[default]
    Sftp,
    /// A directory reachable on the local filesystem (mounted share, test fixture).
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub kind: RemoteKind,
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    /// Private key for public-key login; password login is used when absent.
    pub key_file: Option<PathBuf>,
    pub path: String,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            kind: RemoteKind::Sftp,
            host: None,
            port: 22,
            username: None,
            key_file: None,
            path: "/root/abc/uploads".to_string(),
            connect_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub download_dir: PathBuf,
    pub decrypt_dir: PathBuf,
    pub merge_dir: PathBuf,
    pub converted_dir: PathBuf,
    /// Where the progress records live.
    pub state_dir: PathBuf,
    pub fetched_log: Option<PathBuf>,
    pub decrypted_log: Option<PathBuf>,
    pub metadata_file: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            decrypt_dir: PathBuf::from("./decrypted"),
            merge_dir: PathBuf::from("./merge"),
            converted_dir: PathBuf::from("./converted"),
            state_dir: PathBuf::from("."),
            fetched_log: None,
            decrypted_log: None,
            metadata_file: None,
            log_dir: PathBuf::from("./logs"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilitySection {
    pub interval_secs: u64,
    pub max_rounds: u32,
}

impl Default for StabilitySection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_rounds: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    pub grammar: GrammarChoice,
    pub timestamp_format: String,
    pub mtime_policy: MtimePolicy,
    pub utc_offset_minutes: i32,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            grammar: GrammarChoice::Ctrl,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            mtime_policy: MtimePolicy::Max,
            utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertSection {
    /// Convert merged artifacts at the end of `run`.
    pub auto: bool,
    pub format: OutputFormat,
    pub dpi: u32,
    pub tool: ToolChoice,
    pub timeout_secs: u64,
}

impl Default for ConvertSection {
    fn default() -> Self {
        Self {
            auto: true,
            format: OutputFormat::Png,
            dpi: DEFAULT_DPI,
            tool: ToolChoice::Auto,
            timeout_secs: 300,
        }
    }
}
