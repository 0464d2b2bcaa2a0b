//! High-level pipeline: stability wait → fetch → decrypt → merge → convert.
//!
//! This module wires the stages together for the CLI and for integration
//! tests. Each stage is also callable on its own:
//!
//! - [`synchronise`]: wait for the remote folder to settle, then fetch and
//!   decrypt everything not yet recorded in the [`ProgressStore`].
//! - [`merge_all`]: group the decrypted folder by the naming grammar and merge
//!   every group into the merge directory.
//! - [`convert_all`]: hand merged artifacts to the [`Converter`].
//! - [`run`]: all of the above in order, returning a [`PipelineReport`].
//!
//! # Error Handling
//! Only run-level problems are errors here: the remote listing failing, the
//! progress records becoming unwritable, or invalid settings. Per-item
//! failures are counted in the stage summaries and listed in `failures`;
//! they never stop the remaining items.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::contract::{CommandRunner, Decryptor, Transport, TransportError};
use crate::convert::Converter;
use crate::fetch::{fetch_and_decrypt, FetchLayout};
use crate::grouping::{group_directory, GrammarError, NamingGrammar};
use crate::merge::{merge_groups, MergeError, MergeOptions, MergeReport, MergedArtifact};
use crate::progress::{ProgressError, ProgressStore};
use crate::report::{ItemFailure, StageSummary};
use crate::stability::{wait_for_stable, StabilityOptions};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote listing failed: {0}")]
    Transport(#[from] TransportError),

    #[error("progress records unusable: {0}")]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Everything a full run needs besides the capability implementations.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub layout: FetchLayout,
    pub stability: StabilityOptions,
    pub grammar: NamingGrammar,
    pub merge: MergeOptions,
    /// Where rendered output goes; `None` skips conversion.
    pub converted_dir: Option<PathBuf>,
}

impl PipelineConfig {
    /// Validate `config` into pipeline settings. Grammar and merge settings
    /// are checked here so a bad value fails before any remote work.
    pub fn from_config(config: &Config, auto_convert: bool) -> Result<Self, SyncError> {
        Ok(Self {
            layout: config.fetch_layout(),
            stability: config.stability_options(),
            grammar: config.merge.grammar.build()?,
            merge: config.merge_options()?,
            converted_dir: auto_convert.then(|| config.paths.converted_dir.clone()),
        })
    }
}

/// Outcome of the stability wait plus fetch-decrypt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items in the final (stable) listing.
    pub listed: usize,
    pub rounds: u32,
    /// False when the stability wait hit its round limit.
    pub settled: bool,
    pub fetch: StageSummary,
    pub decrypt: StageSummary,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertReport {
    pub summary: StageSummary,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub sync: SyncReport,
    pub merge: MergeReport,
    /// `None` when conversion was not requested.
    pub convert: Option<ConvertReport>,
}

impl PipelineReport {
    /// Every per-item failure across all stages, in stage order.
    pub fn failures(&self) -> impl Iterator<Item = &ItemFailure> {
        self.sync
            .failures
            .iter()
            .chain(self.merge.failures.iter())
            .chain(self.convert.iter().flat_map(|c| c.failures.iter()))
    }
}

/// Wait for the remote folder to settle, then fetch and decrypt what is new.
pub async fn synchronise<T, D>(
    layout: &FetchLayout,
    stability: StabilityOptions,
    transport: &T,
    decryptor: &D,
    store: &mut ProgressStore,
) -> Result<SyncReport, SyncError>
where
    T: Transport + ?Sized,
    D: Decryptor + ?Sized,
{
    info!(remote_dir = %layout.remote_dir, "[SYNC] Starting synchronisation");
    let listing = wait_for_stable(transport, &layout.remote_dir, stability).await?;
    if !listing.settled {
        warn!(rounds = listing.rounds, "[SYNC] Proceeding with a listing that never settled");
    }

    let stage = fetch_and_decrypt(&listing.items, layout, transport, decryptor, store).await?;
    info!(
        listed = listing.items.len(),
        fetch = %stage.fetch,
        decrypt = %stage.decrypt,
        "[SYNC] Synchronisation finished"
    );
    Ok(SyncReport {
        listed: listing.items.len(),
        rounds: listing.rounds,
        settled: listing.settled,
        fetch: stage.fetch,
        decrypt: stage.decrypt,
        failures: stage.failures,
    })
}

/// Group `decrypt_dir` and merge every group.
pub fn merge_all(
    decrypt_dir: &Path,
    grammar: &NamingGrammar,
    store: &ProgressStore,
    options: &MergeOptions,
) -> MergeReport {
    info!(
        src = %decrypt_dir.display(),
        dst = %options.output_dir().display(),
        grammar = grammar.label(),
        "[MERGE] Starting merge"
    );
    let groups = group_directory(grammar, decrypt_dir);
    if groups.is_empty() {
        warn!(src = %decrypt_dir.display(), "[MERGE] No groups to merge");
    }
    merge_groups(&groups, store, options)
}

/// Convert each merged artifact into `out_dir`.
pub async fn convert_all<R>(
    artifacts: &[MergedArtifact],
    converter: &Converter<R>,
    out_dir: &Path,
) -> ConvertReport
where
    R: CommandRunner,
{
    info!(artifacts = artifacts.len(), dst = %out_dir.display(), "[CONVERT] Starting conversion");
    let (summary, failures) = converter
        .convert_all(artifacts.iter().map(|a| a.path.as_path()), out_dir)
        .await;
    ConvertReport { summary, failures }
}

/// Full pipeline. Conversion runs only when `config.converted_dir` is set.
pub async fn run<T, D, R>(
    config: &PipelineConfig,
    transport: &T,
    decryptor: &D,
    converter: &Converter<R>,
    store: &mut ProgressStore,
) -> Result<PipelineReport, SyncError>
where
    T: Transport + ?Sized,
    D: Decryptor + ?Sized,
    R: CommandRunner,
{
    let sync = synchronise(&config.layout, config.stability, transport, decryptor, store)
        .await
        .map_err(|e| {
            error!(error = %e, "[SYNC][ERROR] Synchronisation aborted");
            e
        })?;

    let merge = merge_all(&config.layout.decrypt_dir, &config.grammar, store, &config.merge);

    let convert = match &config.converted_dir {
        Some(out_dir) => Some(convert_all(&merge.artifacts, converter, out_dir).await),
        None => {
            info!("[CONVERT] Automatic conversion disabled");
            None
        }
    };

    Ok(PipelineReport {
        sync,
        merge,
        convert,
    })
}
