use regex::Regex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

use super::{parse_snapshot, upsert_front, Outcome, ReconcileError, Reconciler};
use crate::protocol::{Delta, DeltaKind, Snapshot};
use crate::route::{Query, ViewKind};
use crate::{Run, RunResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionLayout {
    JobList,
    Wallboard,
}

/// Named bucket of jobs whose names match `pattern`.
#[derive(Debug, Clone)]
pub struct JobGroup {
    pub name: String,
    pub pattern: String,
    regex: Option<Regex>,
}

impl JobGroup {
    fn compile(name: String, pattern: String) -> Self {
        let regex = match Regex::new(&pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                warn!("collection_group_regex_invalid: group={name} err={err}");
                None
            }
        };
        Self {
            name,
            pattern,
            regex,
        }
    }

    pub fn matches(&self, job_name: &str) -> bool {
        self.regex
            .as_ref()
            .map(|regex| regex.is_match(job_name))
            .unwrap_or(false)
    }
}

impl PartialEq for JobGroup {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.pattern == other.pattern
    }
}

#[derive(Debug, Deserialize)]
struct CollectionStatus {
    #[serde(default)]
    jobs: Vec<Run>,
    #[serde(default)]
    running: Vec<Run>,
    #[serde(default)]
    groups: BTreeMap<String, String>,
}

/// Every job's latest run, for the job list and the wallboard.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionView {
    pub layout: CollectionLayout,
    /// Sorted by name ascending, one entry per job.
    pub jobs: Vec<Run>,
    pub running: Vec<Run>,
    pub groups: Vec<JobGroup>,
    pub ungrouped: Vec<String>,
    /// Selected group; `None` shows the ungrouped jobs.
    pub group: Option<String>,
}

impl CollectionView {
    pub fn new(layout: CollectionLayout) -> Self {
        Self {
            layout,
            jobs: Vec::new(),
            running: Vec::new(),
            groups: Vec::new(),
            ungrouped: Vec::new(),
            group: None,
        }
    }

    pub fn select_group(&mut self, group: Option<&str>) -> bool {
        match group {
            None => {
                self.group = None;
                true
            }
            Some(name) if self.groups.iter().any(|g| g.name == name) => {
                self.group = Some(name.to_string());
                true
            }
            Some(_) => false,
        }
    }

    fn selected_group(&self) -> Option<&JobGroup> {
        let name = self.group.as_deref()?;
        self.groups.iter().find(|group| group.name == name)
    }

    fn is_grouped(&self, job_name: &str) -> bool {
        self.groups.iter().any(|group| group.matches(job_name))
    }

    /// Jobs in the selected group (or the ungrouped set) whose name contains
    /// `search`.
    pub fn filtered_jobs(&self, search: &str) -> Vec<&Run> {
        let selected = self.selected_group();
        self.jobs
            .iter()
            .filter(|job| match selected {
                Some(group) => group.matches(&job.name),
                None => self.ungrouped.iter().any(|name| *name == job.name),
            })
            .filter(|job| search.is_empty() || job.name.contains(search))
            .collect()
    }

    /// Jobs for the wallboard: unsuccessful first, newest first within each.
    pub fn wallboard_jobs(&self, filter: Option<&str>) -> Vec<&Run> {
        let filter = filter.and_then(|expr| match Regex::new(expr) {
            Ok(regex) => Some(regex),
            Err(err) => {
                warn!("wallboard_filter_invalid: {err}");
                None
            }
        });
        let mut jobs: Vec<&Run> = self
            .jobs
            .iter()
            .filter(|job| {
                filter
                    .as_ref()
                    .map(|regex| regex.is_match(&job.name))
                    .unwrap_or(true)
            })
            .collect();
        jobs.sort_by(|a, b| wallboard_order(a, b));
        jobs
    }

    /// Query for the wallboard showing the selected group.
    pub fn wallboard_query(&self) -> Query {
        match self.selected_group() {
            Some(group) => Query::new().with("filter", &group.pattern),
            None => Query::new(),
        }
    }

    fn insert_job_sorted(&mut self, run: Run) {
        if !self.is_grouped(&run.name) && !self.ungrouped.contains(&run.name) {
            self.ungrouped.push(run.name.clone());
        }
        self.jobs.insert(0, run);
        self.jobs.sort_by(|a, b| a.name.cmp(&b.name));
    }

    fn on_started(&mut self, run: &Run) -> Outcome {
        let mut run = run.clone();
        run.result = Some(RunResult::Running);

        upsert_front(&mut self.running, run.clone(), |a, b| a.name == b.name);
        match self.jobs.iter().position(|job| job.name == run.name) {
            Some(index) => self.jobs[index] = run,
            None => self.insert_job_sorted(run),
        }
        Outcome::changed()
    }

    fn on_completed(&mut self, run: &Run) -> Outcome {
        let mut changed = false;
        if let Some(index) = self.jobs.iter().position(|job| job.name == run.name) {
            self.jobs[index] = run.clone();
            changed = true;
        }
        if let Some(index) = self.running.iter().position(|job| job.name == run.name) {
            self.running.remove(index);
            changed = true;
        }
        if changed {
            Outcome::changed()
        } else {
            Outcome::ignored()
        }
    }
}

fn wallboard_order(a: &Run, b: &Run) -> Ordering {
    let a_success = a.result == Some(RunResult::Success);
    let b_success = b.result == Some(RunResult::Success);
    a_success
        .cmp(&b_success)
        .then_with(|| b.started.cmp(&a.started))
}

impl Reconciler for CollectionView {
    fn kind(&self) -> ViewKind {
        ViewKind::Collection
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Outcome, ReconcileError> {
        let status: CollectionStatus = parse_snapshot(self.kind(), &snapshot.data)?;

        self.groups = status
            .groups
            .into_iter()
            .map(|(name, pattern)| JobGroup::compile(name, pattern))
            .collect();
        self.jobs = status.jobs;
        self.jobs.sort_by(|a, b| a.name.cmp(&b.name));
        self.running = Vec::with_capacity(status.running.len());
        for mut run in status.running {
            run.result.get_or_insert(RunResult::Running);
            match self.jobs.iter().position(|job| job.name == run.name) {
                Some(index) => self.jobs[index] = run.clone(),
                None => {
                    // first run of a job
                    self.jobs.push(run.clone());
                    self.jobs.sort_by(|a, b| a.name.cmp(&b.name));
                }
            }
            self.running.push(run);
        }

        self.ungrouped = self
            .jobs
            .iter()
            .filter(|job| !self.is_grouped(&job.name))
            .map(|job| job.name.clone())
            .collect();
        self.group = if self.ungrouped.is_empty() {
            self.groups.first().map(|group| group.name.clone())
        } else {
            None
        };
        Ok(Outcome::changed())
    }

    fn apply_delta(&mut self, delta: &Delta) -> Outcome {
        match delta.kind {
            DeltaKind::JobQueued => Outcome::ignored(),
            DeltaKind::JobStarted => self.on_started(&delta.run),
            DeltaKind::JobCompleted => self.on_completed(&delta.run),
        }
    }

    fn running(&self) -> &[Run] {
        &self.running
    }

    fn running_mut(&mut self) -> &mut [Run] {
        &mut self.running
    }
}
