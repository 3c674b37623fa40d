use serde::Deserialize;

use super::{parse_snapshot, Effect, Outcome, ReconcileError, Reconciler};
use crate::protocol::{Delta, DeltaKind, Snapshot};
use crate::route::{RunNumber, ViewKind};
use crate::{Run, RunResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunStatus {
    #[serde(default)]
    latest_num: Option<u64>,
    #[serde(flatten)]
    run: Run,
}

/// A single run of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunView {
    pub name: String,
    pub requested: RunNumber,
    pub run: Option<Run>,
    /// Newest run number the server has told us about, for the "a newer run
    /// exists" affordance.
    pub latest_num: Option<u64>,
    /// Holds the run while it is in flight so progress can be estimated.
    pub running: Vec<Run>,
}

impl RunView {
    pub fn new(name: String, requested: RunNumber) -> Self {
        Self {
            name,
            requested,
            run: None,
            latest_num: None,
            running: Vec::new(),
        }
    }

    pub(crate) fn rebind(&mut self, name: String, requested: RunNumber) {
        self.name = name;
        self.requested = requested;
    }

    pub fn number(&self) -> Option<u64> {
        match self.requested {
            RunNumber::Number(number) => Some(number),
            RunNumber::Latest => None,
        }
    }

    pub fn has_newer_run(&self) -> bool {
        match (self.number(), self.latest_num) {
            (Some(number), Some(latest)) => latest > number,
            _ => false,
        }
    }

    fn is_subscribed_run(&self, run: &Run) -> bool {
        run.name == self.name && Some(run.number) == self.number()
    }
}

impl Reconciler for RunView {
    fn kind(&self) -> ViewKind {
        ViewKind::RunDetail
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Outcome, ReconcileError> {
        let status: RunStatus = parse_snapshot(self.kind(), &snapshot.data)?;

        let number = match self.requested {
            RunNumber::Number(number) => number,
            RunNumber::Latest => {
                let number = status.latest_num.ok_or(ReconcileError::MissingField {
                    view: self.kind(),
                    field: "latestNum",
                })?;
                return Ok(Outcome::ignored().with_effect(Effect::Redirect {
                    name: self.name.clone(),
                    number,
                }));
            }
        };

        let mut run = status.run;
        if run.name.is_empty() {
            run.name.clone_from(&self.name);
        }
        run.number = number;
        self.latest_num = status.latest_num;
        self.running = if run.started.is_some() && !run.is_complete() {
            vec![run.clone()]
        } else {
            Vec::new()
        };
        let effect = if run.started.is_some() {
            Effect::StartLogStream {
                name: run.name.clone(),
                number,
            }
        } else {
            Effect::StopLogStream
        };
        self.run = Some(run);
        Ok(Outcome::changed().with_effect(effect))
    }

    fn apply_delta(&mut self, delta: &Delta) -> Outcome {
        let update = &delta.run;
        match delta.kind {
            DeltaKind::JobQueued => {
                if update.name != self.name {
                    return Outcome::ignored();
                }
                if self.latest_num.is_some_and(|latest| latest >= update.number) {
                    return Outcome::ignored();
                }
                self.latest_num = Some(update.number);
                Outcome::changed()
            }
            DeltaKind::JobStarted => {
                if !self.is_subscribed_run(update) {
                    return Outcome::ignored();
                }
                let Some(run) = self.run.as_mut() else {
                    return Outcome::ignored();
                };
                run.merge_from(update);
                run.result = Some(RunResult::Running);
                self.running = vec![run.clone()];
                Outcome::changed().with_effect(Effect::StartLogStream {
                    name: update.name.clone(),
                    number: update.number,
                })
            }
            DeltaKind::JobCompleted => {
                if !self.is_subscribed_run(update) {
                    return Outcome::ignored();
                }
                let Some(run) = self.run.as_mut() else {
                    return Outcome::ignored();
                };
                run.merge_from(update);
                self.running.clear();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::fixtures::{completed, delta, queued, snapshot, started};
    use serde_json::json;

    fn view(number: u64) -> RunView {
        RunView::new("build".to_string(), RunNumber::Number(number))
    }

    #[test]
    fn latest_alias_redirects_instead_of_binding() {
        let mut view = RunView::new("build".to_string(), RunNumber::Latest);
        let outcome = view
            .apply_snapshot(&snapshot(json!({"name": "build", "number": 42, "latestNum": 42})))
            .expect("snapshot");

        assert!(!outcome.changed);
        assert_eq!(
            outcome.effects,
            vec![Effect::Redirect {
                name: "build".to_string(),
                number: 42
            }]
        );
        assert!(view.run.is_none());
    }

    #[test]
    fn latest_alias_without_latest_number_is_an_error() {
        let mut view = RunView::new("build".to_string(), RunNumber::Latest);
        let result = view.apply_snapshot(&snapshot(json!({"name": "build"})));
        assert!(matches!(
            result,
            Err(ReconcileError::MissingField {
                field: "latestNum",
                ..
            })
        ));
    }

    #[test]
    fn started_run_snapshot_begins_log_stream() {
        let mut view = view(7);
        let outcome = view
            .apply_snapshot(&snapshot(json!({
                "name": "build",
                "number": 7,
                "result": "running",
                "started": 1_700_000_000,
                "etc": 1_700_000_100,
                "latestNum": 7
            })))
            .expect("snapshot");

        assert_eq!(
            outcome.effects,
            vec![Effect::StartLogStream {
                name: "build".to_string(),
                number: 7
            }]
        );
        assert_eq!(view.running.len(), 1);
        assert_eq!(view.latest_num, Some(7));
    }

    #[test]
    fn queued_run_snapshot_stops_log_stream() {
        let mut view = view(8);
        let outcome = view
            .apply_snapshot(&snapshot(json!({"name": "build", "number": 8, "result": "queued", "latestNum": 8})))
            .expect("snapshot");
        assert_eq!(outcome.effects, vec![Effect::StopLogStream]);
        assert!(view.running.is_empty());
    }

    #[test]
    fn deltas_only_touch_the_subscribed_run() {
        let mut view = view(8);
        view.apply_snapshot(&snapshot(json!({"name": "build", "number": 8, "result": "queued", "latestNum": 8})))
            .expect("snapshot");

        let other = view.apply_delta(&delta(DeltaKind::JobStarted, started("build", 7, 0)));
        assert!(!other.changed);
        assert!(other.effects.is_empty());

        let newer = view.apply_delta(&delta(DeltaKind::JobQueued, queued("build", 9)));
        assert!(newer.changed);
        assert!(view.has_newer_run());

        let start = view.apply_delta(&delta(DeltaKind::JobStarted, started("build", 8, 0)));
        assert_eq!(
            start.effects,
            vec![Effect::StartLogStream {
                name: "build".to_string(),
                number: 8
            }]
        );
        assert_eq!(view.run.as_ref().and_then(|r| r.result), Some(RunResult::Running));
        assert_eq!(view.running.len(), 1);

        view.apply_delta(&delta(DeltaKind::JobCompleted, completed("build", 8, RunResult::Success)));
        assert_eq!(view.run.as_ref().and_then(|r| r.result), Some(RunResult::Success));
        assert!(view.running.is_empty());
    }
}
