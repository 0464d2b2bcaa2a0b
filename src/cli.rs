use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use print_audit_core::config::{Config, RemoteKind};
use print_audit_core::contract::Transport;
use print_audit_core::convert::{Converter, OutputFormat, TokioCommandRunner, ToolChoice};
use print_audit_core::decrypt::FernetDecryptor;
use print_audit_core::grouping::GrammarChoice;
use print_audit_core::merge::{MergeReport, MtimePolicy};
use print_audit_core::progress::ProgressStore;
use print_audit_core::report::{ItemFailure, StageSummary};
use print_audit_core::synchronise::{
    self, ConvertReport, PipelineConfig, PipelineReport, SyncReport,
};
use print_audit_core::transport::{LocalDirTransport, SftpAuth, SftpSettings, SftpTransport};

use crate::load_config::{fernet_key, load_or_default, sftp_password, SFTP_PASSWORD_ENV};

/// CLI for print-audit: sync, decrypt, reassemble and render print-stream captures.
#[derive(Parser, Debug)]
#[clap(
    name = "print-audit",
    version,
    about = "Fetch encrypted print-stream fragments, reassemble each job and render it for audit"
)]
pub struct Cli {
    /// Path to the YAML config file (defaults are used when omitted)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Defaults to `run` when omitted
    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wait for the remote folder to settle, then fetch and decrypt new files
    Sync {
        #[clap(flatten)]
        remote: RemoteArgs,
        #[clap(flatten)]
        paths: PathArgs,
        #[clap(flatten)]
        stability: StabilityArgs,
        #[clap(flatten)]
        key: KeyArgs,
    },
    /// Group decrypted parts by job and merge each job into one artifact
    Merge {
        #[clap(flatten)]
        paths: PathArgs,
        #[clap(flatten)]
        merge: MergeArgs,
        #[clap(flatten)]
        convert: ConvertArgs,
        #[clap(flatten)]
        auto: AutoConvertArgs,
    },
    /// Render a merged artifact, or every file in a directory
    #[clap(alias = "convert")]
    Render {
        /// File or directory to render (defaults to the merge directory)
        src: Option<PathBuf>,
        /// Output directory (defaults to the converted directory)
        #[clap(long)]
        out: Option<PathBuf>,
        #[clap(flatten)]
        paths: PathArgs,
        #[clap(flatten)]
        convert: ConvertArgs,
    },
    /// Sync, merge and (unless disabled) render in one go
    Run {
        #[clap(flatten)]
        remote: RemoteArgs,
        #[clap(flatten)]
        paths: PathArgs,
        #[clap(flatten)]
        stability: StabilityArgs,
        #[clap(flatten)]
        merge: MergeArgs,
        #[clap(flatten)]
        convert: ConvertArgs,
        #[clap(flatten)]
        auto: AutoConvertArgs,
        #[clap(flatten)]
        key: KeyArgs,
    },
}

impl Commands {
    /// `run` with every flag left to the config file.
    pub fn default_run() -> Self {
        Self::Run {
            remote: RemoteArgs::default(),
            paths: PathArgs::default(),
            stability: StabilityArgs::default(),
            merge: MergeArgs::default(),
            convert: ConvertArgs::default(),
            auto: AutoConvertArgs::default(),
            key: KeyArgs::default(),
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct RemoteArgs {
    /// SFTP host
    #[clap(long)]
    pub host: Option<String>,
    #[clap(long)]
    pub port: Option<u16>,
    #[clap(long)]
    pub username: Option<String>,
    /// Private key for public-key login
    #[clap(long)]
    pub key_file: Option<PathBuf>,
    /// Remote directory to sync from
    #[clap(long)]
    pub remote_path: Option<String>,
    /// Sync from a local directory instead of SFTP
    #[clap(long, conflicts_with = "host")]
    pub local_remote_dir: Option<PathBuf>,
    /// Connection timeout in seconds
    #[clap(long)]
    pub connect_timeout: Option<u64>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct PathArgs {
    #[clap(long)]
    pub download_dir: Option<PathBuf>,
    #[clap(long)]
    pub decrypt_dir: Option<PathBuf>,
    #[clap(long)]
    pub merge_dir: Option<PathBuf>,
    #[clap(long)]
    pub converted_dir: Option<PathBuf>,
    /// Directory holding the progress records
    #[clap(long)]
    pub state_dir: Option<PathBuf>,
    /// Fetched-name history file (overrides the one in the state directory)
    #[clap(long)]
    pub download_history: Option<PathBuf>,
    /// Decrypted-name history file
    #[clap(long)]
    pub decrypt_history: Option<PathBuf>,
    /// Remote metadata JSON document
    #[clap(long)]
    pub remote_meta: Option<PathBuf>,
    #[clap(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct StabilityArgs {
    /// Seconds between remote listings
    #[clap(long)]
    pub stability_interval: Option<u64>,
    /// Give up waiting after this many rounds (0 = wait forever)
    #[clap(long)]
    pub stability_max_rounds: Option<u32>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct MergeArgs {
    /// strftime pattern for artifact timestamps
    #[clap(long)]
    pub timestamp_format: Option<String>,
    /// Which part mtime names the artifact: max or min
    #[clap(long)]
    pub mtime_policy: Option<MtimePolicy>,
    /// File-name grammar: ctrl, ctrl-job, or a regex with seq/host/job/op captures
    #[clap(long)]
    pub grammar: Option<GrammarChoice>,
    /// Target timezone as minutes east of UTC
    #[clap(long, allow_hyphen_values = true)]
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ConvertArgs {
    /// png or pdf
    #[clap(long)]
    pub convert_format: Option<OutputFormat>,
    #[clap(long)]
    pub convert_dpi: Option<u32>,
    /// auto, gs, gpcl6 or pcl6
    #[clap(long)]
    pub convert_tool: Option<ToolChoice>,
    /// Seconds before a converter is killed
    #[clap(long)]
    pub convert_timeout: Option<u64>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct AutoConvertArgs {
    /// Render merged artifacts after merging
    #[clap(long, overrides_with = "no_auto_convert")]
    pub auto_convert: bool,
    #[clap(long, overrides_with = "auto_convert")]
    pub no_auto_convert: bool,
}

impl AutoConvertArgs {
    pub fn resolve(&self, default: bool) -> bool {
        if self.no_auto_convert {
            false
        } else if self.auto_convert {
            true
        } else {
            default
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct KeyArgs {
    /// Fernet key (overrides the FERNET_KEY environment variable)
    #[clap(long)]
    pub fernet_key: Option<String>,
}

impl RemoteArgs {
    fn apply(&self, config: &mut Config) {
        let remote = &mut config.remote;
        if let Some(dir) = &self.local_remote_dir {
            remote.kind = RemoteKind::Local;
            remote.path = dir.to_string_lossy().into_owned();
        }
        if let Some(host) = &self.host {
            remote.kind = RemoteKind::Sftp;
            remote.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            remote.port = port;
        }
        if let Some(username) = &self.username {
            remote.username = Some(username.clone());
        }
        if let Some(key_file) = &self.key_file {
            remote.key_file = Some(key_file.clone());
        }
        if let Some(path) = &self.remote_path {
            remote.path = path.clone();
        }
        if let Some(secs) = self.connect_timeout {
            remote.connect_timeout_secs = secs;
        }
    }
}

impl PathArgs {
    fn apply(&self, config: &mut Config) {
        let paths = &mut config.paths;
        for (flag, target) in [
            (&self.download_dir, &mut paths.download_dir),
            (&self.decrypt_dir, &mut paths.decrypt_dir),
            (&self.merge_dir, &mut paths.merge_dir),
            (&self.converted_dir, &mut paths.converted_dir),
            (&self.state_dir, &mut paths.state_dir),
            (&self.log_dir, &mut paths.log_dir),
        ] {
            if let Some(value) = flag {
                *target = value.clone();
            }
        }
        for (flag, target) in [
            (&self.download_history, &mut paths.fetched_log),
            (&self.decrypt_history, &mut paths.decrypted_log),
            (&self.remote_meta, &mut paths.metadata_file),
        ] {
            if flag.is_some() {
                target.clone_from(flag);
            }
        }
    }
}

impl StabilityArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(secs) = self.stability_interval {
            config.stability.interval_secs = secs;
        }
        if let Some(rounds) = self.stability_max_rounds {
            config.stability.max_rounds = rounds;
        }
    }
}

impl MergeArgs {
    fn apply(&self, config: &mut Config) {
        let merge = &mut config.merge;
        if let Some(format) = &self.timestamp_format {
            merge.timestamp_format = format.clone();
        }
        if let Some(policy) = self.mtime_policy {
            merge.mtime_policy = policy;
        }
        if let Some(grammar) = &self.grammar {
            merge.grammar = grammar.clone();
        }
        if let Some(offset) = self.utc_offset_minutes {
            merge.utc_offset_minutes = offset;
        }
    }
}

impl ConvertArgs {
    fn apply(&self, config: &mut Config) {
        let convert = &mut config.convert;
        if let Some(format) = self.convert_format {
            convert.format = format;
        }
        if let Some(dpi) = self.convert_dpi {
            convert.dpi = dpi;
        }
        if let Some(tool) = self.convert_tool {
            convert.tool = tool;
        }
        if let Some(secs) = self.convert_timeout {
            convert.timeout_secs = secs;
        }
    }
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn settings(&self) -> Result<Config> {
        let mut config = load_or_default(self.config.as_deref())?;
        let default_run = Commands::default_run();
        match self.command.as_ref().unwrap_or(&default_run) {
            Commands::Sync {
                remote,
                paths,
                stability,
                ..
            } => {
                remote.apply(&mut config);
                paths.apply(&mut config);
                stability.apply(&mut config);
            }
            Commands::Merge {
                paths,
                merge,
                convert,
                ..
            } => {
                paths.apply(&mut config);
                merge.apply(&mut config);
                convert.apply(&mut config);
            }
            Commands::Render { paths, convert, .. } => {
                paths.apply(&mut config);
                convert.apply(&mut config);
            }
            Commands::Run {
                remote,
                paths,
                stability,
                merge,
                convert,
                ..
            } => {
                remote.apply(&mut config);
                paths.apply(&mut config);
                stability.apply(&mut config);
                merge.apply(&mut config);
                convert.apply(&mut config);
            }
        }
        Ok(config)
    }

    /// The chosen subcommand, `run` for a bare invocation.
    pub fn into_command(self) -> Commands {
        self.command.unwrap_or_else(Commands::default_run)
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");
    let config = cli.settings()?;
    config.trace_loaded();
    run_with_config(cli.into_command(), config).await
}

/// Dispatch a parsed command against resolved settings.
pub async fn run_with_config(command: Commands, config: Config) -> Result<()> {
    let result = match command {
        Commands::Sync { key, .. } => sync_command(&config, key.fernet_key.as_deref()).await,
        Commands::Merge { auto, .. } => merge_command(&config, auto.resolve(false)).await,
        Commands::Render { src, out, .. } => render_command(&config, src, out).await,
        Commands::Run { auto, key, .. } => {
            run_command(&config, auto.resolve(config.convert.auto), key.fernet_key.as_deref()).await
        }
    };
    if let Err(e) = &result {
        error!(error = %e, "[ERROR] Command failed");
    }
    result
}

async fn sync_command(config: &Config, key_flag: Option<&str>) -> Result<()> {
    let decryptor = build_decryptor(key_flag)?;
    let transport = connect_transport(config).await?;
    let mut store = open_store(config)?;

    println!("Synchronise starting...");
    let report = synchronise::synchronise(
        &config.fetch_layout(),
        config.stability_options(),
        transport.as_ref(),
        &decryptor,
        &mut store,
    )
    .await?;
    print_sync(&report);
    Ok(())
}

async fn merge_command(config: &Config, auto_convert: bool) -> Result<()> {
    let grammar = config
        .merge
        .grammar
        .build()
        .context("Invalid file-name grammar")?;
    let options = config.merge_options().context("Invalid merge settings")?;
    let store = open_store(config)?;

    let report = synchronise::merge_all(&config.paths.decrypt_dir, &grammar, &store, &options);
    print_merge(&report);

    if auto_convert {
        let converter = Converter::new(TokioCommandRunner, config.convert_options());
        let converted =
            synchronise::convert_all(&report.artifacts, &converter, &config.paths.converted_dir)
                .await;
        print_convert(&converted);
    }
    Ok(())
}

async fn render_command(config: &Config, src: Option<PathBuf>, out: Option<PathBuf>) -> Result<()> {
    let src = src.unwrap_or_else(|| config.paths.merge_dir.clone());
    let out = out.unwrap_or_else(|| config.paths.converted_dir.clone());
    if !src.exists() {
        anyhow::bail!("Render source {} does not exist", src.display());
    }
    info!(src = %src.display(), out = %out.display(), "Rendering");

    let converter = Converter::new(TokioCommandRunner, config.convert_options());
    let (summary, failures) = converter.render_path(&src, &out).await;
    print_convert(&ConvertReport { summary, failures });
    Ok(())
}

async fn run_command(config: &Config, auto_convert: bool, key_flag: Option<&str>) -> Result<()> {
    let pipeline = PipelineConfig::from_config(config, auto_convert)?;
    let decryptor = build_decryptor(key_flag)?;
    let transport = connect_transport(config).await?;
    let mut store = open_store(config)?;
    let converter = Converter::new(TokioCommandRunner, config.convert_options());

    println!("Pipeline starting...");
    let report = synchronise::run(&pipeline, transport.as_ref(), &decryptor, &converter, &mut store).await?;
    print_pipeline(&report);
    Ok(())
}

fn build_decryptor(key_flag: Option<&str>) -> Result<FernetDecryptor> {
    let key = fernet_key(key_flag)?;
    FernetDecryptor::new(&key).context("Invalid Fernet key")
}

fn open_store(config: &Config) -> Result<ProgressStore> {
    ProgressStore::open(config.progress_paths()).with_context(|| {
        format!(
            "Failed to load progress records from {}",
            config.paths.state_dir.display()
        )
    })
}

/// SFTP settings from config plus secrets from the environment.
pub fn sftp_settings(config: &Config) -> Result<SftpSettings> {
    let remote = &config.remote;
    let host = remote
        .host
        .clone()
        .context("remote.host (or --host) is required for SFTP")?;
    let username = remote
        .username
        .clone()
        .context("remote.username (or --username) is required for SFTP")?;
    let auth = match (&remote.key_file, sftp_password()) {
        (Some(path), _) => SftpAuth::KeyFile {
            path: path.clone(),
            passphrase: None,
        },
        (None, Some(password)) => SftpAuth::Password { password },
        (None, None) => anyhow::bail!(
            "No SFTP credentials: set remote.key_file or {}",
            SFTP_PASSWORD_ENV
        ),
    };
    Ok(SftpSettings {
        host,
        port: remote.port,
        username,
        auth,
        connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
    })
}

async fn connect_transport(config: &Config) -> Result<Box<dyn Transport>> {
    match config.remote.kind {
        RemoteKind::Local => {
            let dir = Path::new(&config.remote.path);
            if !dir.is_dir() {
                anyhow::bail!("Local remote directory {} does not exist", dir.display());
            }
            info!(dir = %dir.display(), "Using local directory as remote");
            Ok(Box::new(LocalDirTransport))
        }
        RemoteKind::Sftp => {
            let settings = sftp_settings(config)?;
            let transport = tokio::task::spawn_blocking(move || SftpTransport::connect(&settings))
                .await
                .context("SFTP connect task failed")?
                .context("Failed to connect to data server")?;
            Ok(Box::new(transport))
        }
    }
}

fn print_summary(label: &str, summary: &StageSummary) {
    println!("  {label:<8} {summary}");
}

fn print_failures<'a>(failures: impl IntoIterator<Item = &'a ItemFailure>) {
    for failure in failures {
        println!(
            "  FAILED [{}] {}: {}",
            failure.stage, failure.name, failure.error
        );
    }
}

fn print_sync(report: &SyncReport) {
    println!(
        "Synchronise complete. listed={} rounds={} settled={}",
        report.listed, report.rounds, report.settled
    );
    print_summary("fetch", &report.fetch);
    print_summary("decrypt", &report.decrypt);
    print_failures(&report.failures);
}

fn print_merge(report: &MergeReport) {
    println!("Merge complete. artifacts={}", report.artifacts.len());
    print_summary("merge", &report.summary);
    for artifact in &report.artifacts {
        println!("  -> {}", artifact.path.display());
    }
    print_failures(&report.failures);
}

fn print_convert(report: &ConvertReport) {
    println!("Render complete.");
    print_summary("convert", &report.summary);
    print_failures(&report.failures);
}

fn print_pipeline(report: &PipelineReport) {
    print_sync(&report.sync);
    print_merge(&report.merge);
    match &report.convert {
        Some(convert) => print_convert(convert),
        None => println!("Render skipped (auto-convert disabled)."),
    }
}
