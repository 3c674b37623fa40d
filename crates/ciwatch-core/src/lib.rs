use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod backoff;
pub mod format;
pub mod progress;
pub mod protocol;
pub mod reconcile;
pub mod route;

pub use backoff::{next_backoff, Backoff, INITIAL_BACKOFF, MAX_BACKOFF};
pub use progress::{ClockSkew, Progress, ProgressEstimator};
pub use protocol::{decode_frame, Delta, DeltaKind, FrameError, Message, Snapshot};
pub use reconcile::{Effect, Outcome, ReconcileError, Reconciler, ViewState};
pub use route::{Query, Route, RouteError, RunNumber, ViewKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    Unknown,
    Queued,
    Running,
    Success,
    Failed,
    Aborted,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Unknown => "unknown",
            RunResult::Queued => "queued",
            RunResult::Running => "running",
            RunResult::Success => "success",
            RunResult::Failed => "failed",
            RunResult::Aborted => "aborted",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            RunResult::Success | RunResult::Failed | RunResult::Aborted
        )
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunResult {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(RunResult::Unknown),
            "queued" => Ok(RunResult::Queued),
            "running" => Ok(RunResult::Running),
            "success" => Ok(RunResult::Success),
            "failed" => Ok(RunResult::Failed),
            "aborted" => Ok(RunResult::Aborted),
            other => Err(format!("Unknown run result: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub num: u64,
}

/// One numbered execution of a job, as the server reports it.
///
/// Collection views also use this record as the per-job summary: the entry
/// for a job is its most recent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub result: Option<RunResult>,
    #[serde(default)]
    pub queued: Option<i64>,
    #[serde(default)]
    pub started: Option<i64>,
    #[serde(default)]
    pub completed: Option<i64>,
    #[serde(default)]
    pub queue_index: Option<usize>,
    /// Estimated completion time, unix seconds.
    #[serde(default)]
    pub etc: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub upstream: Option<Upstream>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
    #[serde(skip)]
    pub progress: Option<Progress>,
}

impl Run {
    pub fn new(name: impl Into<String>, number: u64) -> Self {
        Self {
            name: name.into(),
            number,
            ..Self::default()
        }
    }

    pub fn is_same_run(&self, other: &Run) -> bool {
        self.name == other.name && self.number == other.number
    }

    pub fn is_complete(&self) -> bool {
        self.result.map(|result| result.is_complete()).unwrap_or(false)
    }

    /// Overlays the fields present in `update` onto this record.
    pub fn merge_from(&mut self, update: &Run) {
        self.name.clone_from(&update.name);
        self.number = update.number;
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.queued.is_some() {
            self.queued = update.queued;
        }
        if update.started.is_some() {
            self.started = update.started;
        }
        if update.completed.is_some() {
            self.completed = update.completed;
        }
        if update.queue_index.is_some() {
            self.queue_index = update.queue_index;
        }
        if update.etc.is_some() {
            self.etc = update.etc;
        }
        if update.reason.is_some() {
            self.reason.clone_from(&update.reason);
        }
        if !update.artifacts.is_empty() {
            self.artifacts.clone_from(&update.artifacts);
        }
        if update.upstream.is_some() {
            self.upstream.clone_from(&update.upstream);
        }
        for (key, value) in &update.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}
