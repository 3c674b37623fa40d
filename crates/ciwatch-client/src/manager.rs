use chrono::Utc;
use ciwatch_core::{Query, Route};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::future::pending;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, Sleep};
use tracing::{debug, info, warn};

use crate::collaborators::{LogFetcher, NotificationSink};
use crate::config::ClientConfig;
use crate::session::{Dial, Session, ViewStatus};
use crate::transport::{Connector, FrameStream, TransportError};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enter { route: Route, query: Query },
    Update { route: Route },
    Requery { query: Query },
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscription manager has shut down")]
pub struct ManagerClosed;

/// Cloneable front end to a running [`SubscriptionManager`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ViewStatus>,
}

impl SubscriptionHandle {
    async fn send(&self, command: Command) -> Result<(), ManagerClosed> {
        self.commands.send(command).await.map_err(|_| ManagerClosed)
    }

    pub async fn enter(&self, route: Route) -> Result<(), ManagerClosed> {
        self.enter_with(route, Query::new()).await
    }

    pub async fn enter_with(&self, route: Route, query: Query) -> Result<(), ManagerClosed> {
        self.send(Command::Enter { route, query }).await
    }

    pub async fn update(&self, route: Route) -> Result<(), ManagerClosed> {
        self.send(Command::Update { route }).await
    }

    pub async fn requery(&self, query: Query) -> Result<(), ManagerClosed> {
        self.send(Command::Requery { query }).await
    }

    pub async fn leave(&self) -> Result<(), ManagerClosed> {
        self.send(Command::Leave).await
    }

    pub fn status(&self) -> watch::Receiver<ViewStatus> {
        self.status.clone()
    }
}

enum Link {
    Idle,
    Connecting {
        generation: u64,
        attempt: BoxFuture<'static, Result<FrameStream, TransportError>>,
    },
    Open {
        generation: u64,
        frames: FrameStream,
    },
    Waiting {
        generation: u64,
        until: Pin<Box<Sleep>>,
    },
}

enum LinkEvent {
    Connected { generation: u64, frames: FrameStream },
    Frame { generation: u64, text: String },
    Failed { generation: u64, error: TransportError },
    RetryDue { generation: u64 },
}

impl Link {
    async fn next_event(&mut self) -> LinkEvent {
        match self {
            Link::Idle => pending().await,
            Link::Connecting {
                generation,
                attempt,
            } => {
                let generation = *generation;
                match attempt.as_mut().await {
                    Ok(frames) => LinkEvent::Connected { generation, frames },
                    Err(error) => LinkEvent::Failed { generation, error },
                }
            }
            Link::Open { generation, frames } => {
                let generation = *generation;
                match frames.next().await {
                    Some(Ok(text)) => LinkEvent::Frame { generation, text },
                    Some(Err(error)) => LinkEvent::Failed { generation, error },
                    None => LinkEvent::Failed {
                        generation,
                        error: TransportError::Closed,
                    },
                }
            }
            Link::Waiting { generation, until } => {
                until.as_mut().await;
                LinkEvent::RetryDue {
                    generation: *generation,
                }
            }
        }
    }
}

async fn tick(progress: &mut Option<Interval>) {
    match progress {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

fn wall_clock() -> i64 {
    Utc::now().timestamp()
}

/// Actor that owns the active subscription and drives its transport.
pub struct SubscriptionManager<C> {
    session: Session,
    connector: C,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ViewStatus>,
    /// Local unix time in seconds.
    clock: Box<dyn Fn() -> i64 + Send>,
}

impl<C: Connector + 'static> SubscriptionManager<C> {
    pub fn new(
        config: ClientConfig,
        connector: C,
        logs: Box<dyn LogFetcher>,
        notifier: Box<dyn NotificationSink>,
    ) -> (Self, SubscriptionHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(ViewStatus::default());
        let manager = Self {
            session: Session::new(config, logs, notifier),
            connector,
            commands: command_rx,
            status: status_tx,
            clock: Box::new(wall_clock),
        };
        let handle = SubscriptionHandle {
            commands: command_tx,
            status: status_rx,
        };
        (manager, handle)
    }

    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until every handle is dropped, then leaves the subscription.
    pub async fn run(mut self) {
        let mut link = Link::Idle;
        let mut progress: Option<Interval> = None;
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.session.leave();
                        self.publish();
                        break;
                    };
                    let dial = self.on_command(command);
                    link = self.dial(dial);
                }
                event = link.next_event() => {
                    if let Some(next) = self.on_link_event(event) {
                        link = next;
                    }
                }
                _ = tick(&mut progress) => {
                    let now = (self.clock)();
                    self.session.refresh_progress(now);
                }
            }
            self.schedule_progress(&mut progress);
            self.publish();
        }
        debug!("subscription_manager_stopped");
    }

    fn on_command(&mut self, command: Command) -> Option<Dial> {
        let result = match command {
            Command::Enter { route, query } => self.session.enter(route, query).map(Some),
            Command::Update { route } => self.session.update(route).map(Some),
            Command::Requery { query } => self.session.requery(query),
            Command::Leave => {
                self.session.leave();
                Ok(None)
            }
        };
        result.unwrap_or_else(|err| {
            warn!("subscription_config_error: {err}");
            None
        })
    }

    /// Returns the link to switch to, or `None` to keep the current one.
    fn on_link_event(&mut self, event: LinkEvent) -> Option<Link> {
        match event {
            LinkEvent::Connected { generation, frames } => {
                debug!("channel_open: generation={generation}");
                Some(Link::Open { generation, frames })
            }
            LinkEvent::Frame { generation, text } => {
                let now = (self.clock)();
                self.session
                    .on_frame(generation, &text, now)
                    .map(|dial| self.dial(Some(dial)))
            }
            LinkEvent::Failed { generation, error } => {
                match self.session.on_transport_failure(generation, &error) {
                    Some(delay) => Some(Link::Waiting {
                        generation,
                        until: Box::pin(sleep(delay)),
                    }),
                    None => Some(Link::Idle),
                }
            }
            LinkEvent::RetryDue { generation } => {
                let dial = self.session.retry(generation);
                Some(self.dial(dial))
            }
        }
    }

    fn dial(&self, dial: Option<Dial>) -> Link {
        match dial {
            Some(Dial { generation, url }) => {
                info!("channel_connecting: {url}");
                Link::Connecting {
                    generation,
                    attempt: self.connector.connect(url),
                }
            }
            None => Link::Idle,
        }
    }

    /// The refresh timer exists only while some run is in flight.
    fn schedule_progress(&self, progress: &mut Option<Interval>) {
        match (self.session.has_running(), progress.is_some()) {
            (true, false) => {
                let period = self.session.config().progress_interval;
                *progress = Some(interval_at(Instant::now() + period, period));
            }
            (false, true) => *progress = None,
            _ => {}
        }
    }

    fn publish(&self) {
        let next = self.session.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
