use serde::Deserialize;
use std::collections::BTreeMap;

use super::{parse_snapshot, position_of, Outcome, ReconcileError, Reconciler};
use crate::protocol::{Delta, DeltaKind, Snapshot};
use crate::route::ViewKind;
use crate::{Run, RunResult};

const DEFAULT_RECENT_WINDOW: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct DayCounts {
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Utilization {
    pub busy: u32,
    pub total: u32,
}

impl Utilization {
    pub fn idle(&self) -> u32 {
        self.total.saturating_sub(self.busy)
    }
}

/// Aggregates behind the dashboard charts. Renderers read these; only the
/// reconciler writes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardCharts {
    pub utilization: Utilization,
    /// Seven buckets, oldest first; the last bucket is today.
    pub builds_per_day: Vec<DayCounts>,
    pub builds_per_job: BTreeMap<String, u64>,
    pub time_per_job: BTreeMap<String, f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardStatus {
    #[serde(default)]
    queued: Vec<Run>,
    #[serde(default)]
    running: Vec<Run>,
    #[serde(default)]
    recent: Vec<Run>,
    #[serde(default)]
    executors_busy: u32,
    #[serde(default)]
    executors_total: u32,
    #[serde(default)]
    builds_per_day: Vec<DayCounts>,
    #[serde(default)]
    builds_per_job: BTreeMap<String, u64>,
    #[serde(default)]
    time_per_job: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    /// Newest first; the oldest queued run is at the tail.
    pub queued: Vec<Run>,
    pub running: Vec<Run>,
    pub recent: Vec<Run>,
    pub charts: DashboardCharts,
    recent_window: usize,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            queued: Vec::new(),
            running: Vec::new(),
            recent: Vec::new(),
            charts: DashboardCharts::default(),
            recent_window: DEFAULT_RECENT_WINDOW,
        }
    }
}

impl DashboardView {
    fn on_queued(&mut self, run: &Run) -> Outcome {
        if position_of(&self.queued, run).is_some() {
            return Outcome::ignored();
        }
        self.queued.insert(0, run.clone());
        Outcome::changed()
    }

    fn on_started(&mut self, run: &Run) -> Outcome {
        if let Some(index) = position_of(&self.running, run) {
            self.running[index] = run.clone();
            return Outcome::changed();
        }
        if let Some(index) = self.queued_slot(run) {
            self.queued.remove(index);
        }
        self.running.insert(0, run.clone());
        self.charts.utilization.busy = self.charts.utilization.busy.saturating_add(1);
        Outcome::changed()
    }

    fn on_completed(&mut self, run: &Run) -> Outcome {
        let Some(index) = position_of(&self.running, run) else {
            return Outcome::ignored();
        };
        self.running.remove(index);
        self.recent.insert(0, run.clone());
        self.recent.truncate(self.recent_window);

        if let Some(today) = self.charts.builds_per_day.last_mut() {
            if run.result == Some(RunResult::Success) {
                today.success += 1;
            } else {
                today.failed += 1;
            }
        }
        if let Some(count) = self.charts.builds_per_job.get_mut(&run.name) {
            *count += 1;
        }
        self.charts.utilization.busy = self.charts.utilization.busy.saturating_sub(1);
        Outcome::changed()
    }

    /// Queue slot of a run being promoted to running.
    ///
    /// The queue is stored newest first, so the run's FIFO position counts
    /// from the tail. If the entry there is not this run, or the index is out
    /// of range, fall back to matching by identity.
    fn queued_slot(&self, run: &Run) -> Option<usize> {
        let by_position = run.queue_index.and_then(|queue_index| {
            let index = self.queued.len().checked_sub(queue_index)?.checked_sub(1)?;
            self.queued
                .get(index)
                .filter(|queued| queued.is_same_run(run))
                .map(|_| index)
        });
        by_position.or_else(|| {
            self.queued
                .iter()
                .rposition(|queued| queued.is_same_run(run))
        })
    }
}

impl Reconciler for DashboardView {
    fn kind(&self) -> ViewKind {
        ViewKind::Dashboard
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Outcome, ReconcileError> {
        let status: DashboardStatus = parse_snapshot(self.kind(), &snapshot.data)?;
        self.recent_window = status.recent.len().max(DEFAULT_RECENT_WINDOW);
        self.queued = status.queued;
        self.running = status.running;
        self.recent = status.recent;
        self.charts = DashboardCharts {
            utilization: Utilization {
                busy: status.executors_busy,
                total: status.executors_total,
            },
            builds_per_day: status.builds_per_day,
            builds_per_job: status.builds_per_job,
            time_per_job: status.time_per_job,
        };
        Ok(Outcome::changed())
    }

    fn apply_delta(&mut self, delta: &Delta) -> Outcome {
        match delta.kind {
            DeltaKind::JobQueued => self.on_queued(&delta.run),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::fixtures::{completed, delta, queued, snapshot, started};
    use serde_json::{json, Value};

    fn synced(data: Value) -> DashboardView {
        let mut view = DashboardView::default();
        view.apply_snapshot(&snapshot(data)).expect("snapshot");
        view
    }

    fn base_status() -> Value {
        json!({
            "queued": [],
            "running": [{"name": "deploy", "number": 3, "started": 1_700_000_000}],
            "recent": [{"name": "lint", "number": 9, "result": "success"}],
            "executorsBusy": 1,
            "executorsTotal": 4,
            "buildsPerDay": [{}, {}, {}, {}, {}, {}, {"success": 2, "failed": 1}],
            "buildsPerJob": {"deploy": 4, "lint": 7},
            "timePerJob": {"deploy": 120.0},
            "resultChanged": [],
            "lowPassRates": [],
            "buildTimeChanges": [{"name": "deploy", "durations": [100.0, 110.0]}]
        })
    }

    fn names_and_numbers(runs: &[Run]) -> Vec<(String, u64)> {
        runs.iter().map(|r| (r.name.clone(), r.number)).collect()
    }

    #[test]
    fn snapshot_replaces_lists_and_aggregates() {
        let view = synced(base_status());
        assert!(view.queued.is_empty());
        assert_eq!(names_and_numbers(&view.running), vec![("deploy".to_string(), 3)]);
        assert_eq!(view.charts.utilization, Utilization { busy: 1, total: 4 });
        assert_eq!(view.charts.utilization.idle(), 3);
        assert_eq!(view.charts.builds_per_day.len(), 7);
        assert_eq!(view.charts.builds_per_job.get("lint"), Some(&7));
    }

    #[test]
    fn applying_the_same_snapshot_twice_is_idempotent() {
        let mut view = synced(base_status());
        view.apply_delta(&delta(DeltaKind::JobQueued, queued("build", 1)));
        let once = {
            let mut fresh = DashboardView::default();
            fresh.apply_snapshot(&snapshot(base_status())).expect("snapshot");
            fresh
        };
        view.apply_snapshot(&snapshot(base_status())).expect("first");
        assert_eq!(view, once);
        view.apply_snapshot(&snapshot(base_status())).expect("second");
        assert_eq!(view, once);
    }

    #[test]
    fn sole_queued_run_moves_to_running() {
        let mut status = base_status();
        status["queued"] = json!([{"name": "build", "number": 5, "queueIndex": 0}]);
        status["running"] = json!([]);
        status["executorsBusy"] = json!(0);
        let mut view = synced(status);

        let outcome = view.apply_delta(&delta(DeltaKind::JobStarted, started("build", 5, 0)));

        assert!(outcome.changed);
        assert!(view.queued.is_empty());
        assert_eq!(names_and_numbers(&view.running), vec![("build".to_string(), 5)]);
        assert_eq!(view.charts.utilization.busy, 1);
    }

    #[test]
    fn promotion_counts_queue_position_from_tail() {
        let mut view = synced(base_status());
        for (name, number) in [("a", 1), ("b", 1), ("c", 1)] {
            view.apply_delta(&delta(DeltaKind::JobQueued, queued(name, number)));
        }
        assert_eq!(
            view.queued.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["c", "b", "a"]
        );

        view.apply_delta(&delta(DeltaKind::JobStarted, started("a", 1, 0)));
        assert_eq!(
            view.queued.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["c", "b"]
        );
        assert_eq!(view.running[0].name, "a");
    }

    #[test]
    fn out_of_order_promotion_falls_back_to_identity() {
        let mut view = synced(base_status());
        for (name, number) in [("a", 1), ("b", 1), ("c", 1)] {
            view.apply_delta(&delta(DeltaKind::JobQueued, queued(name, number)));
        }
        view.apply_delta(&delta(DeltaKind::JobStarted, started("c", 1, 0)));
        assert_eq!(
            view.queued.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn positional_slot_holding_another_run_of_the_same_job_is_skipped() {
        let mut view = synced(base_status());
        for (name, number) in [("x", 1), ("build", 1), ("build", 2)] {
            view.apply_delta(&delta(DeltaKind::JobQueued, queued(name, number)));
        }
        view.apply_delta(&delta(DeltaKind::JobStarted, started("x", 1, 0)));
        view.apply_delta(&delta(DeltaKind::JobStarted, started("build", 1, 1)));

        assert_eq!(names_and_numbers(&view.queued), vec![("build".to_string(), 2)]);
        assert!(view.running.iter().any(|r| r.name == "build" && r.number == 1));
        assert!(!view.queued.iter().any(|q| view.running.iter().any(|r| r.is_same_run(q))));
    }

    #[test]
    fn oversized_queue_index_does_not_panic() {
        let mut view = synced(base_status());
        view.apply_delta(&delta(DeltaKind::JobQueued, queued("build", 4)));

        let outcome = view.apply_delta(&delta(DeltaKind::JobStarted, started("build", 4, usize::MAX)));

        assert!(outcome.changed);
        assert!(view.queued.is_empty());
        assert_eq!(view.running[0].number, 4);

        let outcome = view.apply_delta(&delta(DeltaKind::JobStarted, started("ghost", 1, usize::MAX - 1)));
        assert!(outcome.changed);
        assert_eq!(view.running[0].name, "ghost");
    }

    #[test]
    fn completion_moves_run_to_recent_and_updates_aggregates() {
        let mut view = synced(base_status());
        let outcome =
            view.apply_delta(&delta(DeltaKind::JobCompleted, completed("deploy", 3, RunResult::Success)));

        assert!(outcome.changed);
        assert!(view.running.is_empty());
        assert_eq!(view.recent[0].name, "deploy");
        assert_eq!(view.charts.builds_per_day[6], DayCounts { success: 3, failed: 1 });
        assert_eq!(view.charts.builds_per_job.get("deploy"), Some(&5));
        assert_eq!(view.charts.utilization.busy, 0);
    }

    #[test]
    fn repeated_completion_does_not_duplicate_history() {
        let mut view = synced(base_status());
        let done = delta(DeltaKind::JobCompleted, completed("deploy", 3, RunResult::Failed));
        view.apply_delta(&done);
        let after_first = view.clone();

        let outcome = view.apply_delta(&done);

        assert!(!outcome.changed);
        assert_eq!(view, after_first);
        assert_eq!(view.recent.iter().filter(|r| r.name == "deploy").count(), 1);
    }

    #[test]
    fn unknown_runs_are_ignored() {
        let mut view = synced(base_status());
        let before = view.clone();
        let outcome =
            view.apply_delta(&delta(DeltaKind::JobCompleted, completed("ghost", 1, RunResult::Success)));
        assert!(!outcome.changed);
        assert_eq!(view, before);
    }

    #[test]
    fn snapshot_with_wrong_shape_is_an_error() {
        let mut view = DashboardView::default();
        let result = view.apply_snapshot(&snapshot(json!({"queued": "nope"})));
        assert!(matches!(
            result,
            Err(ReconcileError::SnapshotShape {
                view: ViewKind::Dashboard,
                ..
            })
        ));
    }
}
