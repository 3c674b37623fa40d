use ciwatch_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use ciwatch_core::{Query, Route};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/";
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid server url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("unknown channel transport '{0}' (expected sse or ws)")]
    UnknownTransport(String),
}

/// Wire protocol of the push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelTransport {
    /// `text/event-stream` over plain HTTP, what the server speaks natively.
    #[default]
    EventStream,
    WebSocket,
}

impl ChannelTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelTransport::EventStream => "sse",
            ChannelTransport::WebSocket => "ws",
        }
    }
}

impl fmt::Display for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelTransport {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sse" | "eventstream" | "event-stream" => Ok(ChannelTransport::EventStream),
            "ws" | "websocket" => Ok(ChannelTransport::WebSocket),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server root; always ends with `/` so resource paths join beneath it.
    pub base_url: Url,
    pub transport: ChannelTransport,
    pub notifications: bool,
    pub max_frame_bytes: usize,
    pub progress_interval: Duration,
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            transport: ChannelTransport::default(),
            notifications: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(None, None, |key| std::env::var(key).ok())
    }

    /// Explicit values win over the environment, which wins over defaults.
    pub fn resolve(
        url: Option<&str>,
        notifications: Option<bool>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw = url
            .map(str::to_string)
            .or_else(|| env("CIWATCH_URL"))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        let notifications = notifications
            .or_else(|| env("CIWATCH_NOTIFY").and_then(|value| parse_bool_flag(&value)))
            .unwrap_or(false);
        let transport = match env("CIWATCH_TRANSPORT").filter(|value| !value.trim().is_empty()) {
            Some(value) => value.parse()?,
            None => ChannelTransport::default(),
        };
        let mut config = Self::new(base_url);
        config.transport = transport;
        config.notifications = notifications;
        Ok(config)
    }

    /// Address of the push channel for `route` with `query`, with the scheme
    /// matching the configured transport.
    pub fn channel_url(&self, route: &Route, query: &Query) -> Result<Url, ConfigError> {
        let relative = format!("{}{}", route.path(), query.to_query_string());
        let mut url = self
            .base_url
            .join(&relative)
            .map_err(|source| ConfigError::InvalidUrl {
                url: relative.clone(),
                source,
            })?;
        let secure = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let scheme = match (self.transport, secure) {
            (ChannelTransport::EventStream, false) => "http",
            (ChannelTransport::EventStream, true) => "https",
            (ChannelTransport::WebSocket, false) => "ws",
            (ChannelTransport::WebSocket, true) => "wss",
        };
        if url.set_scheme(scheme).is_err() {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(url)
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
