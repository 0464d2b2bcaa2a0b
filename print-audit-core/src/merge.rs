//! Reassembles each job into one artifact.
//!
//! Parts are concatenated raw, in ascending sequence order, with nothing in
//! between. The artifact name is `<group_key>_<timestamp>`, where the
//! timestamp is the group's aggregated remote mtime (UTC) shown in the target
//! offset (UTC+8 unless configured otherwise). If the name is taken, `_1`,
//! `_2`, ... are appended; files are opened with create-new semantics so an
//! existing artifact is never truncated.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::grouping::Part;
use crate::progress::ProgressStore;
use crate::report::{ItemFailure, Stage, StageSummary};

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 8 * 60;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid timestamp format {0:?}")]
    InvalidTimestampFormat(String),

    #[error("invalid UTC offset of {0} minutes")]
    InvalidOffset(i32),

    #[error("group {group_key} has more than one part with sequence number {sequence}")]
    DuplicateSequence { group_key: String, sequence: u64 },

    #[error("group {0} has no parts")]
    EmptyGroup(String),

    #[error("mtime {0} is outside the representable range")]
    TimestampOutOfRange(i64),

    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How part modification times collapse into one reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtimePolicy {
    /// Time of the last-arriving part.
    #[default]
    Max,
    /// Time of the first-arriving part.
    Min,
}

impl MtimePolicy {
    pub fn aggregate(self, mtimes: impl IntoIterator<Item = i64>) -> Option<i64> {
        let iter = mtimes.into_iter();
        match self {
            Self::Max => iter.max(),
            Self::Min => iter.min(),
        }
    }
}

impl std::str::FromStr for MtimePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(format!("unknown mtime policy {other:?} (expected max or min)")),
        }
    }
}

/// Validated merge settings.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    output_dir: PathBuf,
    timestamp_format: String,
    policy: MtimePolicy,
    offset: FixedOffset,
}

impl MergeOptions {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        timestamp_format: &str,
        policy: MtimePolicy,
        utc_offset_minutes: i32,
    ) -> Result<Self, MergeError> {
        if timestamp_format.is_empty()
            || StrftimeItems::new(timestamp_format).any(|item| matches!(item, Item::Error))
        {
            return Err(MergeError::InvalidTimestampFormat(timestamp_format.to_string()));
        }
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(MergeError::InvalidOffset(utc_offset_minutes))?;
        Ok(Self {
            output_dir: output_dir.into(),
            timestamp_format: timestamp_format.to_string(),
            policy,
            offset,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn policy(&self) -> MtimePolicy {
        self.policy
    }

    /// Render a UTC epoch in the target offset.
    pub fn format_timestamp(&self, epoch_secs: i64) -> Result<String, MergeError> {
        let utc = DateTime::from_timestamp(epoch_secs, 0)
            .ok_or(MergeError::TimestampOutOfRange(epoch_secs))?;
        let local = utc.with_timezone(&self.offset);
        let rendered = local
            .format_with_items(StrftimeItems::new(&self.timestamp_format))
            .to_string();
        // Keep the artifact inside the output directory whatever the format says.
        Ok(rendered.replace(['/', '\\'], "-"))
    }
}

/// The result of merging one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedArtifact {
    pub path: PathBuf,
    pub group_key: String,
    /// `None` when no part had recorded metadata.
    pub timestamp: Option<String>,
    pub parts_written: usize,
    pub parts_failed: usize,
}

impl MergedArtifact {
    /// True when every part was read successfully.
    pub fn is_complete(&self) -> bool {
        self.parts_failed == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub artifacts: Vec<MergedArtifact>,
    pub summary: StageSummary,
    pub failures: Vec<ItemFailure>,
}

/// Merge one group. `parts` may arrive in any order.
pub fn merge_group(
    group_key: &str,
    parts: &[Part],
    store: &ProgressStore,
    options: &MergeOptions,
) -> Result<MergedArtifact, MergeError> {
    if parts.is_empty() {
        return Err(MergeError::EmptyGroup(group_key.to_string()));
    }

    let mut sorted: Vec<&Part> = parts.iter().collect();
    sorted.sort_by_key(|p| p.sequence);
    if let Some(pair) = sorted.windows(2).find(|w| w[0].sequence == w[1].sequence) {
        return Err(MergeError::DuplicateSequence {
            group_key: group_key.to_string(),
            sequence: pair[0].sequence,
        });
    }

    let mtimes = sorted
        .iter()
        .filter_map(|p| store.get_metadata(&p.name).map(|m| m.mtime));
    let timestamp = match options.policy.aggregate(mtimes) {
        Some(epoch) => Some(options.format_timestamp(epoch)?),
        None => {
            warn!(group_key = %group_key, "No remote mtime metadata for group; output will not be timestamped");
            None
        }
    };

    let base_name = match &timestamp {
        Some(ts) => format!("{group_key}_{ts}"),
        None => group_key.to_string(),
    };

    fs::create_dir_all(&options.output_dir).map_err(|source| MergeError::Io {
        path: options.output_dir.clone(),
        source,
    })?;
    let (path, file) = create_unique(&options.output_dir, &base_name)?;
    info!(path = %path.display(), parts = sorted.len(), "Merging into");

    let (parts_written, parts_failed) = write_artifact(&path, file, &sorted)?;

    if parts_failed > 0 {
        warn!(group_key = %group_key, parts_failed, "Group merged best-effort");
    } else {
        info!(group_key = %group_key, "Group merged successfully");
    }

    Ok(MergedArtifact {
        path,
        group_key: group_key.to_string(),
        timestamp,
        parts_written,
        parts_failed,
    })
}

/// Merge every group in key order. A failed group is reported and the rest continue.
pub fn merge_groups(
    groups: &BTreeMap<String, Vec<Part>>,
    store: &ProgressStore,
    options: &MergeOptions,
) -> MergeReport {
    let mut report = MergeReport::default();
    for (group_key, parts) in groups {
        match merge_group(group_key, parts, store, options) {
            Ok(artifact) => {
                if artifact.is_complete() {
                    report.summary.record_success();
                } else {
                    report.summary.record_failure();
                    report.failures.push(ItemFailure::new(
                        group_key.clone(),
                        Stage::Merge,
                        format!("{} part(s) unreadable; artifact is partial", artifact.parts_failed),
                    ));
                }
                report.artifacts.push(artifact);
            }
            Err(e) => {
                error!(group_key = %group_key, error = %e, "Group merge failed");
                report.summary.record_failure();
                report
                    .failures
                    .push(ItemFailure::new(group_key.clone(), Stage::Merge, e));
            }
        }
    }
    info!(summary = %report.summary, "Merge stage finished");
    report
}

/// Fill the freshly claimed artifact. A write failure removes it again so a
/// truncated artifact is never left for a later render.
fn write_artifact(path: &Path, file: File, parts: &[&Part]) -> Result<(usize, usize), MergeError> {
    append_all(file, parts).map_err(|source| {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove incomplete artifact");
        }
        MergeError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn append_all(file: File, parts: &[&Part]) -> io::Result<(usize, usize)> {
    let mut writer = BufWriter::new(file);
    let mut parts_written = 0;
    let mut parts_failed = 0;
    for part in parts {
        info!(name = %part.name, seq = part.sequence, "Appending");
        match append_part(&mut writer, &part.path) {
            Ok(()) => parts_written += 1,
            Err(AppendError::Read(e)) => {
                error!(name = %part.name, error = %e, "Failed to read part; omitting it");
                parts_failed += 1;
            }
            Err(AppendError::Write(e)) => return Err(e),
        }
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok((parts_written, parts_failed))
}

enum AppendError {
    Read(io::Error),
    Write(io::Error),
}

fn append_part<W: Write>(writer: &mut W, path: &Path) -> Result<(), AppendError> {
    // Read fully first so a failing part never leaves half its bytes behind.
    let bytes = fs::read(path).map_err(AppendError::Read)?;
    writer.write_all(&bytes).map_err(AppendError::Write)
}

/// Claim `<base>`, or `<base>_1`, `<base>_2`, ... whichever is free first.
fn create_unique(dir: &Path, base: &str) -> Result<(PathBuf, File), MergeError> {
    let mut suffix: u32 = 0;
    loop {
        let candidate = if suffix == 0 {
            dir.join(base)
        } else {
            dir.join(format!("{base}_{suffix}"))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => {
                return Err(MergeError::Io {
                    path: candidate,
                    source,
                })
            }
        }
    }
}
