//! Best-effort rendering of merged print streams for audit viewing.
//!
//! The first bytes of the input decide which interpreters to try and in what
//! order (Ghostscript for PDF/PostScript, GhostPDL's PCL interpreter for
//! everything else). Each candidate runs as its own process under a timeout
//! and only counts as a success if it exits zero *and* leaves non-empty output
//! behind. Failures are logged and the next candidate is tried.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::contract::{CommandRunner, ConversionError, ToolInvocation, ToolOutcome};
use crate::report::{ItemFailure, Stage, StageSummary};

/// How many leading bytes are inspected to classify a stream.
pub const SNIFF_LEN: usize = 8192;
pub const DEFAULT_DPI: u32 = 300;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const UEL: &[u8] = b"\x1b%-12345X";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Pdf,
    PostScript,
    PjlOrPcl,
    Unknown,
}

impl StreamKind {
    /// Classify from a byte prefix. The ESC fallback for PCL is a guess, not proof.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(b"%PDF-") {
            Self::Pdf
        } else if head.starts_with(b"%!PS") {
            Self::PostScript
        } else if contains(head, UEL) || contains(head, b"@PJL") || head.contains(&0x1b) {
            Self::PjlOrPcl
        } else {
            Self::Unknown
        }
    }

    /// Read at most [`SNIFF_LEN`] bytes of `path` and classify them.
    pub fn detect(path: &Path) -> Self {
        let mut head = Vec::with_capacity(SNIFF_LEN);
        match fs::File::open(path).and_then(|f| f.take(SNIFF_LEN as u64).read_to_end(&mut head)) {
            Ok(_) => Self::sniff(&head),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read stream header");
                Self::Unknown
            }
        }
    }

    /// Interpreters to try, most likely first.
    pub fn candidates(self) -> Vec<Tool> {
        match self {
            Self::Pdf | Self::PostScript => vec![Tool::Gs, Tool::Gpcl6, Tool::Pcl6],
            Self::PjlOrPcl | Self::Unknown => vec![Tool::Gpcl6, Tool::Pcl6, Tool::Gs],
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// External interpreters known to render print streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// Ghostscript (PostScript / PDF).
    Gs,
    /// GhostPDL PCL/PCL XL interpreter.
    Gpcl6,
    /// Same interpreter under the name some distributions install.
    Pcl6,
}

impl Tool {
    pub fn program(self) -> &'static str {
        match self {
            Self::Gs => "gs",
            Self::Gpcl6 => "gpcl6",
            Self::Pcl6 => "pcl6",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// `auto` sniffs the input; anything else pins a single tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    Gs,
    Gpcl6,
    Pcl6,
}

impl ToolChoice {
    pub fn pinned(self) -> Option<Tool> {
        match self {
            Self::Auto => None,
            Self::Gs => Some(Tool::Gs),
            Self::Gpcl6 => Some(Tool::Gpcl6),
            Self::Pcl6 => Some(Tool::Pcl6),
        }
    }
}

impl std::str::FromStr for ToolChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "gs" => Ok(Self::Gs),
            "gpcl6" => Ok(Self::Gpcl6),
            "pcl6" => Ok(Self::Pcl6),
            other => Err(format!("unknown tool {other:?} (expected auto, gs, gpcl6 or pcl6)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One PNG per page, `<base>-001.png`, `<base>-002.png`, ...
    #[default]
    Png,
    /// A single `<base>.pdf`.
    Pdf,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "png" => Ok(Self::Png),
            "pdf" => Ok(Self::Pdf),
            other => Err(format!("unknown output format {other:?} (expected png or pdf)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    pub format: OutputFormat,
    pub dpi: u32,
    pub tool: ToolChoice,
    pub timeout: Duration,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            dpi: DEFAULT_DPI,
            tool: ToolChoice::Auto,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Portable artifact base name: anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_basename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Build the command line for `tool`.
pub fn build_invocation(
    tool: Tool,
    input: &Path,
    out_dir: &Path,
    base: &str,
    options: &ConvertOptions,
) -> ToolInvocation {
    let output = match options.format {
        OutputFormat::Pdf => out_dir.join(format!("{base}.pdf")),
        OutputFormat::Png => out_dir.join(format!("{base}-%03d.png")),
    };
    let mut args: Vec<String> = vec!["-dSAFER".into()];
    if tool == Tool::Gs {
        args.push("-dBATCH".into());
        args.push("-dNOPAUSE".into());
    }
    match options.format {
        OutputFormat::Pdf => args.push("-sDEVICE=pdfwrite".into()),
        OutputFormat::Png => {
            args.push("-sDEVICE=png16m".into());
            args.push(format!("-r{}", options.dpi));
        }
    }
    args.push("-o".into());
    args.push(output.to_string_lossy().into_owned());
    args.push(input.to_string_lossy().into_owned());

    ToolInvocation {
        program: tool.program().to_string(),
        args,
        input: input.to_path_buf(),
        output,
    }
}

/// Output files (any size) already present for `base`.
fn existing_outputs(out_dir: &Path, base: &str, format: OutputFormat) -> Vec<PathBuf> {
    match format {
        OutputFormat::Pdf => {
            let path = out_dir.join(format!("{base}.pdf"));
            if path.is_file() {
                vec![path]
            } else {
                Vec::new()
            }
        }
        OutputFormat::Png => {
            let mut pages: Vec<PathBuf> = fs::read_dir(out_dir)
                .into_iter()
                .flatten()
                .filter_map(|entry| entry.ok())
                .filter(|entry| is_page_of(&entry.file_name().to_string_lossy(), base))
                .map(|entry| entry.path())
                .collect();
            pages.sort();
            pages
        }
    }
}

/// `<base>-<digits>.png`, as written by the `-%03d` output template.
fn is_page_of(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".png"))
        .is_some_and(|page| !page.is_empty() && page.bytes().all(|b| b.is_ascii_digit()))
}

/// Non-empty output files the converter produced for `base`.
pub fn collect_outputs(out_dir: &Path, base: &str, format: OutputFormat) -> Vec<PathBuf> {
    existing_outputs(out_dir, base, format)
        .into_iter()
        .filter(|path| non_empty(path))
        .collect()
}

/// Remove outputs left by an earlier render so only fresh files count.
fn clear_outputs(out_dir: &Path, base: &str, format: OutputFormat) -> Result<(), ConversionError> {
    for stale in existing_outputs(out_dir, base, format) {
        debug!(path = %stale.display(), "Removing previous output");
        fs::remove_file(&stale)?;
    }
    Ok(())
}

fn non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Tries candidate converters in order under a uniform interface.
pub struct Converter<R> {
    runner: R,
    options: ConvertOptions,
}

impl<R: CommandRunner> Converter<R> {
    pub fn new(runner: R, options: ConvertOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Candidate order for `input`, honouring a pinned tool.
    pub fn plan(&self, input: &Path) -> Vec<Tool> {
        match self.options.tool.pinned() {
            Some(tool) => vec![tool],
            None => StreamKind::detect(input).candidates(),
        }
    }

    /// Convert one file into `out_dir`, returning the produced files.
    pub async fn convert(&self, input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ConversionError> {
        fs::create_dir_all(out_dir)?;
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());
        let base = sanitize_basename(&file_name);

        let mut last: Option<ConversionError> = None;
        for tool in self.plan(input) {
            match self.attempt(tool, input, out_dir, &base).await {
                Ok(outputs) => {
                    info!(
                        input = %input.display(),
                        tool = %tool,
                        files = outputs.len(),
                        first = %outputs[0].display(),
                        "Converted OK"
                    );
                    return Ok(outputs);
                }
                Err(e) => {
                    warn!(input = %input.display(), tool = %tool, error = %e, "Convert attempt failed");
                    last = Some(e);
                }
            }
        }

        let last = last.map(|e| e.to_string()).unwrap_or_else(|| "no candidates".to_string());
        error!(input = %input.display(), last_error = %last, "Conversion failed (all attempts)");
        Err(ConversionError::AllCandidatesFailed {
            input: input.to_path_buf(),
            last,
        })
    }

    async fn attempt(
        &self,
        tool: Tool,
        input: &Path,
        out_dir: &Path,
        base: &str,
    ) -> Result<Vec<PathBuf>, ConversionError> {
        if !self.runner.is_available(tool.program()) {
            return Err(ConversionError::ToolMissing(tool.program().to_string()));
        }
        let invocation = build_invocation(tool, input, out_dir, base, &self.options);
        clear_outputs(out_dir, base, self.options.format)?;
        info!(
            tool = %tool,
            command = %format!("{} {}", invocation.program, invocation.args.join(" ")),
            "Rendering"
        );
        let outcome = self.runner.run(&invocation, self.options.timeout).await?;
        if !outcome.success() {
            return Err(ConversionError::Failed {
                program: invocation.program,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr.trim().to_string(),
            });
        }
        let outputs = collect_outputs(out_dir, base, self.options.format);
        if outputs.is_empty() {
            return Err(ConversionError::NoOutput(invocation.program));
        }
        Ok(outputs)
    }

    /// Convert several files; one failure never stops the others.
    pub async fn convert_all<'a, I>(&self, inputs: I, out_dir: &Path) -> (StageSummary, Vec<ItemFailure>)
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let mut summary = StageSummary::default();
        let mut failures = Vec::new();
        for input in inputs {
            match self.convert(input, out_dir).await {
                Ok(_) => summary.record_success(),
                Err(e) => {
                    summary.record_failure();
                    failures.push(ItemFailure::new(
                        input.display().to_string(),
                        Stage::Convert,
                        e,
                    ));
                }
            }
        }
        info!(summary = %summary, "Conversion stage finished");
        (summary, failures)
    }

    /// Convert a single file, or every regular file directly inside a directory.
    pub async fn render_path(&self, src: &Path, out_dir: &Path) -> (StageSummary, Vec<ItemFailure>) {
        if src.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(src)
                .into_iter()
                .flatten()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.path())
                .collect();
            files.sort();
            self.convert_all(files.iter().map(PathBuf::as_path), out_dir).await
        } else {
            self.convert_all([src], out_dir).await
        }
    }
}

/// Runs converters with `tokio::process`, killing them when the timeout elapses.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> Result<ToolOutcome, ConversionError> {
        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConversionError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ToolOutcome {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(ConversionError::Io(e)),
            Err(_) => Err(ConversionError::Timeout {
                program: invocation.program.clone(),
                seconds: timeout.as_secs(),
            }),
        }
    }
}
