//! Synchronous half of the subscription manager: owns at most one channel
//! connection and the view state bound to it, and tells the async driver
//! which transport to open next.

use ciwatch_core::{
    ClockSkew, Delta, DeltaKind, Effect, ProgressEstimator, Query, Reconciler, Route, RunNumber,
    Snapshot, ViewState,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::collaborators::{LogFetcher, LogStreamHandle, Notice, NotificationSink};
use crate::config::{ClientConfig, ConfigError};
use crate::connection::{ChannelConnection, ConnectionState, IgnoreReason, Inbound, SyncKind, Target};
use crate::transport::TransportError;

/// Instruction to open a transport for the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub generation: u64,
    pub url: Url,
}

/// What read-only consumers see of the active subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewStatus {
    pub route: Option<Route>,
    pub query: Query,
    pub state: Option<ConnectionState>,
    pub connected: bool,
    pub title: String,
    pub version: String,
    pub clock_skew: ClockSkew,
    pub view: Option<ViewState>,
}

struct ActiveLogStream {
    job: String,
    number: u64,
    handle: Box<dyn LogStreamHandle>,
}

pub struct Session {
    config: ClientConfig,
    connection: Option<ChannelConnection>,
    /// Bound once the first snapshot for the subscription has been applied.
    view: Option<ViewState>,
    estimator: ProgressEstimator,
    logs: Box<dyn LogFetcher>,
    notifier: Box<dyn NotificationSink>,
    log_stream: Option<ActiveLogStream>,
    connected: bool,
    title: String,
    version: String,
    next_generation: u64,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        logs: Box<dyn LogFetcher>,
        notifier: Box<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            connection: None,
            view: None,
            estimator: ProgressEstimator::default(),
            logs,
            notifier,
            log_stream: None,
            connected: false,
            title: String::new(),
            version: String::new(),
            next_generation: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn view(&self) -> Option<&ViewState> {
        self.view.as_ref()
    }

    pub fn connection(&self) -> Option<&ChannelConnection> {
        self.connection.as_ref()
    }

    fn fresh_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Subscribes to `route` with a fresh view state, replacing any current
    /// subscription.
    pub fn enter(&mut self, route: Route, query: Query) -> Result<Dial, ConfigError> {
        self.close_channel();
        self.stop_log_stream();
        self.view = None;
        self.open(route, query)
    }

    /// Resubscribes to `route`, keeping the current view state when it is of
    /// the same kind. The query string is cleared.
    pub fn update(&mut self, route: Route) -> Result<Dial, ConfigError> {
        self.close_channel();
        let keep = self
            .view
            .as_mut()
            .map(|view| view.rebind(&route))
            .unwrap_or(false);
        if !keep {
            self.stop_log_stream();
            self.view = None;
        }
        self.open(route, Query::new())
    }

    /// Resubscribes to the current route with a new query string.
    pub fn requery(&mut self, query: Query) -> Result<Option<Dial>, ConfigError> {
        let Some(route) = self.connection.as_ref().map(|conn| conn.target().route.clone()) else {
            return Ok(None);
        };
        self.close_channel();
        self.open(route, query).map(Some)
    }

    pub fn leave(&mut self) {
        if self.connection.is_some() {
            info!("subscription_leave");
        }
        self.close_channel();
        self.stop_log_stream();
        self.connection = None;
        self.view = None;
    }

    fn open(&mut self, route: Route, query: Query) -> Result<Dial, ConfigError> {
        // a failed open leaves no subscription behind
        self.connection = None;
        let url = self.config.channel_url(&route, &query)?;
        let generation = self.fresh_generation();
        info!("subscription_open: {route} generation={generation}");
        self.connection = Some(ChannelConnection::open(
            Target { route, query },
            generation,
            self.config.max_frame_bytes,
        ));
        Ok(Dial { generation, url })
    }

    fn close_channel(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.close();
        }
        self.connected = false;
    }

    /// Handles one text frame from the transport tagged `generation`.
    /// Returns a dial when the frame caused a resubscription.
    pub fn on_frame(&mut self, generation: u64, frame: &str, local_now: i64) -> Option<Dial> {
        let connection = self.connection.as_mut()?;
        let inbound = match connection.receive(generation, frame) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!("channel_decode_error: {err}");
                return None;
            }
        };
        match inbound {
            Inbound::Snapshot { snapshot, first } => self.on_snapshot(snapshot, first, local_now),
            Inbound::Delta(delta) => {
                self.on_delta(delta, local_now);
                None
            }
            Inbound::Ignored(IgnoreReason::BeforeSnapshot(kind)) => {
                debug!("channel_delta_dropped: {kind} before snapshot");
                None
            }
            Inbound::Ignored(reason) => {
                debug!("channel_frame_ignored: {reason:?}");
                None
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: Snapshot, first: bool, local_now: i64) -> Option<Dial> {
        let route = self.connection.as_ref()?.target().route.clone();
        let bound = self.view.is_some();
        let mut view = self
            .view
            .take()
            .unwrap_or_else(|| ViewState::for_route(&route));

        let outcome = match view.apply_snapshot(&snapshot) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("channel_snapshot_rejected: {err}");
                if bound {
                    self.view = Some(view);
                }
                return None;
            }
        };

        let redirect = outcome.effects.iter().find_map(|effect| match effect {
            Effect::Redirect { name, number } => Some((name.clone(), *number)),
            _ => None,
        });
        if let Some((name, number)) = redirect {
            info!("run_latest_redirect: {name} -> #{number}");
            if bound {
                self.view = Some(view);
            }
            let target = Route::Run {
                name,
                number: RunNumber::Number(number),
            };
            return match self.update(target) {
                Ok(dial) => Some(dial),
                Err(err) => {
                    warn!("run_latest_redirect_error: {err}");
                    None
                }
            };
        }

        self.view = Some(view);
        if first {
            if let Some(connection) = self.connection.as_mut() {
                match connection.mark_synced() {
                    SyncKind::First => info!("channel_synced: {route}"),
                    SyncKind::Resync => info!("channel_resynced: {route}"),
                }
            }
            self.connected = true;
            self.title = snapshot.title.clone();
            self.version = snapshot.version.clone();
            if let Some(server_time) = snapshot.time {
                self.estimator.sync(server_time, local_now);
            }
        }
        self.run_effects(outcome.effects);
        self.refresh_progress(local_now);
        None
    }

    fn on_delta(&mut self, delta: Delta, local_now: i64) {
        if delta.kind == DeltaKind::JobCompleted {
            self.notify(&delta);
        }
        let Some(view) = self.view.as_mut() else {
            debug!("channel_delta_unbound: {}", delta.kind);
            return;
        };
        let outcome = view.apply_delta(&delta);
        self.run_effects(outcome.effects);
        if outcome.changed {
            self.refresh_progress(local_now);
        }
    }

    fn notify(&mut self, delta: &Delta) {
        if !self.config.notifications {
            return;
        }
        let notice = Notice::for_run(&delta.run);
        if let Err(err) = self.notifier.notify(&notice) {
            warn!("notify_error: {err}");
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartLogStream { name, number } => self.start_log_stream(name, number),
                Effect::StopLogStream => self.stop_log_stream(),
                Effect::Redirect { .. } => {}
            }
        }
    }

    fn start_log_stream(&mut self, job: String, number: u64) {
        self.stop_log_stream();
        let handle = self.logs.fetch(&job, number);
        self.log_stream = Some(ActiveLogStream { job, number, handle });
    }

    fn stop_log_stream(&mut self) {
        if let Some(mut active) = self.log_stream.take() {
            debug!("log_stream_abort: {} #{}", active.job, active.number);
            active.handle.abort();
        }
    }

    /// Transport `generation` failed or closed. Returns the retry delay when
    /// a reconnect should be scheduled.
    pub fn on_transport_failure(
        &mut self,
        generation: u64,
        error: &TransportError,
    ) -> Option<std::time::Duration> {
        let connection = self.connection.as_mut()?;
        let delay = connection.transport_failed(generation)?;
        self.connected = false;
        warn!(
            "channel_transport_error: {} {error}; retry in {}ms",
            connection.target().route,
            delay.as_millis()
        );
        Some(delay)
    }

    /// Retry delay for `generation` elapsed.
    pub fn retry(&mut self, generation: u64) -> Option<Dial> {
        let next = self.next_generation + 1;
        let connection = self.connection.as_mut()?;
        if !connection.reconnect(generation, next) {
            return None;
        }
        let target = connection.target().clone();
        self.next_generation = next;
        match self.config.channel_url(&target.route, &target.query) {
            Ok(url) => Some(Dial { generation: next, url }),
            Err(err) => {
                warn!("channel_retry_error: {err}");
                None
            }
        }
    }

    /// Whether any run in the bound view is in flight.
    pub fn has_running(&self) -> bool {
        self.view
            .as_ref()
            .map(|view| !view.running().is_empty())
            .unwrap_or(false)
    }

    pub fn refresh_progress(&mut self, local_now: i64) {
        if let Some(view) = self.view.as_mut() {
            self.estimator.refresh(view.running_mut(), local_now);
        }
    }

    pub fn status(&self) -> ViewStatus {
        let target = self.connection.as_ref().map(|conn| conn.target());
        ViewStatus {
            route: target.map(|target| target.route.clone()),
            query: target.map(|target| target.query.clone()).unwrap_or_default(),
            state: self.connection.as_ref().map(|conn| conn.state()),
            connected: self.connected,
            title: self.title.clone(),
            version: self.version.clone(),
            clock_skew: self.estimator.skew(),
            view: self.view.clone(),
        }
    }
}
