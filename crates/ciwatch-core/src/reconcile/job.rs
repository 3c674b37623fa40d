use serde::Deserialize;
use std::fmt;

use super::{parse_snapshot, upsert_front, Outcome, ReconcileError, Reconciler};
use crate::protocol::{Delta, DeltaKind, Snapshot};
use crate::route::{Query, ViewKind};
use crate::Run;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Dsc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Dsc => "dsc",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Dsc,
            SortOrder::Dsc => SortOrder::Asc,
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pagination and ordering of a job's run history, as echoed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SortState {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_sort_field")]
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

fn default_sort_field() -> String {
    "number".to_string()
}

impl Default for SortState {
    fn default() -> Self {
        Self {
            page: 0,
            field: default_sort_field(),
            order: SortOrder::default(),
        }
    }
}

impl SortState {
    pub fn to_query(&self) -> Query {
        Query::new()
            .with("page", self.page)
            .with("field", &self.field)
            .with("order", self.order)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    description: String,
    #[serde(default)]
    running: Vec<Run>,
    #[serde(default)]
    recent: Vec<Run>,
    #[serde(default)]
    last_success: Option<Run>,
    #[serde(default)]
    last_failed: Option<Run>,
    #[serde(default)]
    n_queued: u32,
    #[serde(default)]
    pages: u32,
    #[serde(default)]
    sort: SortState,
    #[serde(default)]
    average_runtime: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub name: String,
    pub description: String,
    pub running: Vec<Run>,
    pub recent: Vec<Run>,
    pub last_success: Option<Run>,
    pub last_failed: Option<Run>,
    /// Runs queued for this job; the server does not say which.
    pub n_queued: u32,
    pub pages: u32,
    pub sort: SortState,
    pub average_runtime: Option<f64>,
}

impl JobView {
    pub fn new(name: String) -> Self {
        Self {
            name,
            description: String::new(),
            running: Vec::new(),
            recent: Vec::new(),
            last_success: None,
            last_failed: None,
            n_queued: 0,
            pages: 0,
            sort: SortState::default(),
            average_runtime: None,
        }
    }

    /// Query for the next page of history, or `None` on the last page.
    pub fn page_next(&self) -> Option<Query> {
        let page = self.sort.page.checked_add(1)?;
        if page >= self.pages {
            return None;
        }
        let mut sort = self.sort.clone();
        sort.page = page;
        Some(sort.to_query())
    }

    pub fn page_prev(&self) -> Option<Query> {
        let page = self.sort.page.checked_sub(1)?;
        let mut sort = self.sort.clone();
        sort.page = page;
        Some(sort.to_query())
    }

    /// Query ordering history by `field`. Repeating the current field flips
    /// the order; a new field starts descending.
    pub fn sort_by(&self, field: &str) -> Query {
        let mut sort = self.sort.clone();
        if sort.field == field {
            sort.order = sort.order.toggled();
        } else {
            sort.field = field.to_string();
            sort.order = SortOrder::Dsc;
        }
        sort.to_query()
    }
}

impl Reconciler for JobView {
    fn kind(&self) -> ViewKind {
        ViewKind::JobDetail
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Outcome, ReconcileError> {
        let status: JobStatus = parse_snapshot(self.kind(), &snapshot.data)?;
        self.description = status.description;
        self.running = status.running;
        self.recent = status.recent;
        self.last_success = status.last_success;
        self.last_failed = status.last_failed;
        self.n_queued = status.n_queued;
        self.pages = status.pages;
        self.sort = status.sort;
        self.average_runtime = status.average_runtime;
        Ok(Outcome::changed())
    }

    fn apply_delta(&mut self, delta: &Delta) -> Outcome {
        let run = &delta.run;
        if run.name != self.name {
            return Outcome::ignored();
        }
        match delta.kind {
            DeltaKind::JobQueued => {
                self.n_queued += 1;
                Outcome::changed()
            }
            DeltaKind::JobStarted => {
                if upsert_front(&mut self.running, run.clone(), |a, b| a.number == b.number) {
                    self.n_queued = self.n_queued.saturating_sub(1);
                }
                Outcome::changed()
            }
            // running entries on this page carry only a number
            DeltaKind::JobCompleted => {
                let Some(index) = self.running.iter().position(|r| r.number == run.number) else {
                    return Outcome::ignored();
                };
                self.running.remove(index);
                self.recent.insert(0, run.clone());
                Outcome::changed()
            }
        }
    }

    fn running(&self) -> &[Run] {
        &self.running
    }

    fn running_mut(&mut self) -> &mut [Run] {
        &mut self.running
    }
}
