//! Recovers job structure from decrypted file names.
//!
//! Part files carry no metadata besides their name, and deployments disagree
//! on the naming convention. A [`NamingGrammar`] is a regex with four named
//! captures, `seq`, `host`, `job` and `op`; anything that does not match is
//! not a part and is ignored (including merged outputs sharing the folder).
//!
//! Parts with the same `(host, job, op)` belong to one job and are keyed as
//! `"<host>-<job>-<op>"`. Groups come back in a `BTreeMap`, so iteration
//! order is the lexicographic key order and stable across runs.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

/// `(Sequence)(Hostname)_ctrl_(JobName)_(ID)-(Type)`, e.g. `46wpa_ctrl_job13_10013-2`.
pub const CTRL_PATTERN: &str =
    r"^(?P<seq>\d+)(?P<host>[a-zA-Z0-9]+)_ctrl_(?P<job>[a-zA-Z0-9]+)_\d+-(?P<op>\d+)$";

/// `(Prefix)_ctrl__job(Job)_(Subtask)-(Operation)[.ext]`, e.g. `printer_ctrl__job123_001-print.dat`.
pub const CTRL_JOB_PATTERN: &str =
    r"^(?P<host>.+?)_ctrl__job(?P<job>[^_]+)_(?P<seq>\d+)-(?P<op>[^.]+)(?:\.[^.]*)?$";

const REQUIRED_CAPTURES: [&str; 4] = ["seq", "host", "job", "op"];

#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("invalid naming pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("naming pattern is missing the named capture `{0}`")]
    MissingCapture(&'static str),
}

/// Which grammar to use, as written in configuration: a preset name
/// (`ctrl`, `ctrl-job`) or a `{custom: "<regex>"}` map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "GrammarRepr", into = "GrammarRepr")]
pub enum GrammarChoice {
    #[default]
    Ctrl,
    CtrlJob,
    Custom(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum GrammarRepr {
    Preset(String),
    Custom { custom: String },
}

impl TryFrom<GrammarRepr> for GrammarChoice {
    type Error = String;

    fn try_from(repr: GrammarRepr) -> Result<Self, Self::Error> {
        match repr {
            GrammarRepr::Preset(name) => match name.as_str() {
                "ctrl" => Ok(Self::Ctrl),
                "ctrl-job" | "ctrl_job" => Ok(Self::CtrlJob),
                other => Err(format!(
                    "unknown grammar preset `{other}`; use `ctrl`, `ctrl-job` or {{custom: <regex>}}"
                )),
            },
            GrammarRepr::Custom { custom } => Ok(Self::Custom(custom)),
        }
    }
}

impl From<GrammarChoice> for GrammarRepr {
    fn from(choice: GrammarChoice) -> Self {
        match choice {
            GrammarChoice::Ctrl => Self::Preset("ctrl".to_string()),
            GrammarChoice::CtrlJob => Self::Preset("ctrl-job".to_string()),
            GrammarChoice::Custom(custom) => Self::Custom { custom },
        }
    }
}

impl GrammarChoice {
    pub fn build(&self) -> Result<NamingGrammar, GrammarError> {
        match self {
            Self::Ctrl => NamingGrammar::new("ctrl", CTRL_PATTERN),
            Self::CtrlJob => NamingGrammar::new("ctrl-job", CTRL_JOB_PATTERN),
            Self::Custom(pattern) => NamingGrammar::new("custom", pattern),
        }
    }
}

impl std::str::FromStr for GrammarChoice {
    type Err = std::convert::Infallible;

    /// `ctrl`, `ctrl-job`, or any other text taken as a custom regex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ctrl" => Self::Ctrl,
            "ctrl-job" | "ctrl_job" => Self::CtrlJob,
            other => Self::Custom(other.to_string()),
        })
    }
}

/// Fields pulled out of one matching name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub sequence: u64,
    pub host: String,
    pub job: String,
    pub operation: String,
}

impl ParsedName {
    pub fn group_key(&self) -> String {
        format!("{}-{}-{}", self.host, self.job, self.operation)
    }
}

/// One fragment of a job, ready to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub sequence: u64,
    pub name: String,
    pub group_key: String,
    pub path: PathBuf,
}

#[derive(Clone)]
pub struct NamingGrammar {
    label: String,
    regex: Regex,
}

impl fmt::Debug for NamingGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamingGrammar")
            .field("label", &self.label)
            .field("pattern", &self.regex.as_str())
            .finish()
    }
}

impl NamingGrammar {
    pub fn new(label: impl Into<String>, pattern: &str) -> Result<Self, GrammarError> {
        let regex = Regex::new(pattern)?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();
        for required in REQUIRED_CAPTURES {
            if !names.contains(&required) {
                return Err(GrammarError::MissingCapture(required));
            }
        }
        Ok(Self {
            label: label.into(),
            regex,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// `None` when the name is not a part under this grammar. A sequence
    /// number that does not fit in `u64` also counts as a mismatch.
    pub fn parse_filename(&self, name: &str) -> Option<ParsedName> {
        let caps = self.regex.captures(name)?;
        let sequence = caps.name("seq")?.as_str().parse::<u64>().ok()?;
        Some(ParsedName {
            sequence,
            host: caps.name("host")?.as_str().to_string(),
            job: caps.name("job")?.as_str().to_string(),
            operation: caps.name("op")?.as_str().to_string(),
        })
    }

    /// Build a [`Part`] for `name` located in `dir`.
    pub fn part(&self, dir: &Path, name: &str) -> Option<Part> {
        let parsed = self.parse_filename(name)?;
        Some(Part {
            sequence: parsed.sequence,
            group_key: parsed.group_key(),
            name: name.to_string(),
            path: dir.join(name),
        })
    }
}

/// Group names (already listed) into jobs, each sorted by sequence number.
pub fn group_names<I, S>(grammar: &NamingGrammar, dir: &Path, names: I) -> BTreeMap<String, Vec<Part>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut groups: BTreeMap<String, Vec<Part>> = BTreeMap::new();
    for name in names {
        let name = name.as_ref();
        match grammar.part(dir, name) {
            Some(part) => groups.entry(part.group_key.clone()).or_default().push(part),
            None => debug!(name = %name, grammar = grammar.label(), "Name does not match grammar; ignoring"),
        }
    }
    for parts in groups.values_mut() {
        parts.sort_by_key(|p| p.sequence);
    }
    groups
}

/// Scan `dir` for regular files and group them. A missing or unreadable
/// directory yields no groups.
pub fn group_directory(grammar: &NamingGrammar, dir: &Path) -> BTreeMap<String, Vec<Part>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "Source directory not readable");
            return BTreeMap::new();
        }
    };

    let names = entries.filter_map(|entry| {
        let entry = entry.ok()?;
        if !entry.file_type().ok()?.is_file() {
            return None;
        }
        entry.file_name().into_string().ok()
    });

    let groups = group_names(grammar, dir, names);
    info!(groups = groups.len(), dir = %dir.display(), "Parsing complete");
    groups
}
