//! State-transition logic that folds channel messages into view state.
//!
//! Every view kind follows the same contract: a [`Snapshot`] replaces the
//! derived state wholesale, and a [`Delta`] patches it. Deltas that name a
//! run the view does not know about are no-ops.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Delta, Message, Snapshot};
use crate::route::{Route, ViewKind};
use crate::Run;

pub mod collection;
pub mod dashboard;
pub mod job;
pub mod run;

pub use collection::{CollectionLayout, CollectionView, JobGroup};
pub use dashboard::{DashboardCharts, DashboardView, DayCounts, Utilization};
pub use job::{JobView, SortOrder, SortState};
pub use run::RunView;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{view} snapshot payload did not parse: {source}")]
    SnapshotShape {
        view: ViewKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{view} snapshot is missing '{field}'")]
    MissingField { view: ViewKind, field: &'static str },
}

/// Work a reconciler asks its owner to perform after a message is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Resubscribe to the concrete run the `latest` alias resolved to.
    Redirect { name: String, number: u64 },
    /// Abort any active log stream and stream this run from offset zero.
    StartLogStream { name: String, number: u64 },
    StopLogStream,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub changed: bool,
    pub effects: Vec<Effect>,
}

impl Outcome {
    pub fn changed() -> Self {
        Self {
            changed: true,
            effects: Vec::new(),
        }
    }

    pub fn ignored() -> Self {
        Self::default()
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub trait Reconciler {
    fn kind(&self) -> ViewKind;

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Outcome, ReconcileError>;

    fn apply_delta(&mut self, delta: &Delta) -> Outcome;

    /// Runs currently in flight; the progress estimator refreshes these.
    fn running(&self) -> &[Run];

    fn running_mut(&mut self) -> &mut [Run];

    fn apply(&mut self, message: &Message) -> Result<Outcome, ReconcileError> {
        match message {
            Message::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            Message::Delta(delta) => Ok(self.apply_delta(delta)),
        }
    }
}

pub(crate) fn parse_snapshot<T: DeserializeOwned>(
    view: ViewKind,
    data: &Value,
) -> Result<T, ReconcileError> {
    T::deserialize(data).map_err(|source| ReconcileError::SnapshotShape { view, source })
}

/// Index of the entry keyed by `(name, number)`.
pub(crate) fn position_of(runs: &[Run], run: &Run) -> Option<usize> {
    runs.iter().position(|candidate| candidate.is_same_run(run))
}

/// Inserts `run` at the front, or replaces the entry with the same key in place.
pub(crate) fn upsert_front(runs: &mut Vec<Run>, run: Run, same: impl Fn(&Run, &Run) -> bool) -> bool {
    match runs.iter().position(|candidate| same(candidate, &run)) {
        Some(index) => {
            runs[index] = run;
            false
        }
        None => {
            runs.insert(0, run);
            true
        }
    }
}

/// View state for one subscription, one variant per view kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Dashboard(DashboardView),
    Collection(CollectionView),
    Job(JobView),
    Run(RunView),
}

impl ViewState {
    pub fn for_route(route: &Route) -> Self {
        match route {
            Route::Dashboard => ViewState::Dashboard(DashboardView::default()),
            Route::Jobs => ViewState::Collection(CollectionView::new(CollectionLayout::JobList)),
            Route::Wallboard => {
                ViewState::Collection(CollectionView::new(CollectionLayout::Wallboard))
            }
            Route::Job { name } => ViewState::Job(JobView::new(name.clone())),
            Route::Run { name, number } => ViewState::Run(RunView::new(name.clone(), *number)),
        }
    }

    /// Points this view at a new route of the same kind. Returns false when
    /// the route needs a different kind of view.
    pub fn rebind(&mut self, route: &Route) -> bool {
        match (self, route) {
            (ViewState::Dashboard(_), Route::Dashboard) => true,
            (ViewState::Collection(view), Route::Jobs) => {
                view.layout = CollectionLayout::JobList;
                true
            }
            (ViewState::Collection(view), Route::Wallboard) => {
                view.layout = CollectionLayout::Wallboard;
                true
            }
            (ViewState::Job(view), Route::Job { name }) => {
                view.name.clone_from(name);
                true
            }
            (ViewState::Run(view), Route::Run { name, number }) => {
                view.rebind(name.clone(), *number);
                true
            }
            _ => false,
        }
    }

    fn inner(&self) -> &dyn Reconciler {
        match self {
            ViewState::Dashboard(view) => view,
            ViewState::Collection(view) => view,
            ViewState::Job(view) => view,
            ViewState::Run(view) => view,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Reconciler {
        match self {
            ViewState::Dashboard(view) => view,
            ViewState::Collection(view) => view,
            ViewState::Job(view) => view,
            ViewState::Run(view) => view,
        }
    }
}

impl Reconciler for ViewState {
    fn kind(&self) -> ViewKind {
        self.inner().kind()
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Outcome, ReconcileError> {
        self.inner_mut().apply_snapshot(snapshot)
    }

    fn apply_delta(&mut self, delta: &Delta) -> Outcome {
        self.inner_mut().apply_delta(delta)
    }

    fn running(&self) -> &[Run] {
        self.inner().running()
    }

    fn running_mut(&mut self) -> &mut [Run] {
        self.inner_mut().running_mut()
    }
}
