//! Live subscription runtime: keeps one push channel open for the view the
//! user is looking at and folds its messages into view state.

pub mod collaborators;
pub mod config;
pub mod connection;
pub mod manager;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_http;

pub use collaborators::{
    HttpLogFetcher, LogChunk, LogFetcher, LogStreamHandle, Notice, NotificationSink, NotifyError,
};
pub use config::{parse_bool_flag, ChannelTransport, ClientConfig, ConfigError};
pub use connection::{ChannelConnection, ConnectionState};
pub use manager::{Command, ManagerClosed, SubscriptionHandle, SubscriptionManager};
pub use session::{Dial, Session, ViewStatus};
pub use transport::{
    Connector, EventStreamConnector, FrameStream, TransportError, WebSocketConnector,
};
