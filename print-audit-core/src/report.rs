//! Per-stage counters returned by every pipeline stage.

use std::fmt;

use serde::Serialize;

/// Which part of the pipeline an item failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Decrypt,
    Merge,
    Convert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Decrypt => write!(f, "decrypt"),
            Self::Merge => write!(f, "merge"),
            Self::Convert => write!(f, "convert"),
        }
    }
}

/// `attempted` counts real work; `skipped` counts items already done in an
/// earlier run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StageSummary {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} failed={} skipped={}",
            self.attempted, self.succeeded, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub name: String,
    pub stage: Stage,
    pub error: String,
}

impl ItemFailure {
    pub fn new(name: impl Into<String>, stage: Stage, error: impl ToString) -> Self {
        Self {
            name: name.into(),
            stage,
            error: error.to_string(),
        }
    }
}
