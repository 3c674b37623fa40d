use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use reqwest::header::ACCEPT;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("binary frame is not utf-8")]
    NonUtf8,
    #[error("closed by peer")]
    Closed,
}

/// Text frames from one live transport, in arrival order. The stream ends or
/// yields an error when the transport drops.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens push channels. One `connect` call is one transport attempt.
pub trait Connector: Send + Sync {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

impl<T: Connector + ?Sized> Connector for Box<T> {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        (**self).connect(url)
    }
}

/// Server-sent events over HTTP: each event's `data` lines form one frame.
#[derive(Debug, Clone, Default)]
pub struct EventStreamConnector {
    client: reqwest::Client,
}

impl EventStreamConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Connector for EventStreamConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let request = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream");
        async move {
            let connect_error = |message: String| TransportError::Connect {
                url: url.to_string(),
                message,
            };
            let response = request
                .send()
                .await
                .map_err(|err| connect_error(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(connect_error(format!("server answered {status}")));
            }
            debug!("event_stream_connected: {url}");
            let mut decoder = EventStreamDecoder::default();
            let frames = response
                .bytes_stream()
                .map(move |chunk| match chunk {
                    Ok(chunk) => decoder.push(&chunk),
                    Err(err) => vec![Err(TransportError::Read(err.to_string()))],
                })
                .flat_map(stream::iter);
            Ok(frames.boxed())
        }
        .boxed()
    }
}

/// Incremental `text/event-stream` parser. Only the `data` field matters;
/// comments and the `event`, `id` and `retry` fields are skipped.
#[derive(Debug, Default)]
struct EventStreamDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, TransportError>> {
        let mut frames = Vec::new();
        self.line.extend_from_slice(chunk);
        while let Some(newline) = self.line.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.line.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(line) => frames.extend(self.field(&line).map(Ok)),
                Err(_) => frames.push(Err(TransportError::NonUtf8)),
            }
        }
        frames
    }

    /// Consumes one line; a blank line dispatches the pending event.
    fn field(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let frame = self.data.join("\n");
            self.data.clear();
            return Some(frame);
        }
        if line.starts_with(':') {
            return None;
        }
        let (name, value) = line.split_once(':').unwrap_or((line, ""));
        if name == "data" {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        async move {
            let (ws, _) =
                connect_async(url.as_str())
                    .await
                    .map_err(|err| TransportError::Connect {
                        url: url.to_string(),
                        message: err.to_string(),
                    })?;
            debug!("ws_connected: {url}");
            let frames = ws.filter_map(|message| async move { text_frame(message) });
            Ok(frames.boxed())
        }
        .boxed()
    }
}

fn text_frame(
    message: Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match message {
        Ok(WsMessage::Text(text)) => Some(Ok(text)),
        Ok(WsMessage::Binary(bytes)) => {
            Some(String::from_utf8(bytes).map_err(|_| TransportError::NonUtf8))
        }
        Ok(WsMessage::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(_) => None,
        Err(err) => Some(Err(TransportError::Read(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::{local_client, serve_once};

    fn frames(decoder: &mut EventStreamDecoder, chunk: &str) -> Vec<Result<String, TransportError>> {
        decoder.push(chunk.as_bytes())
    }

    #[test]
    fn event_stream_events_become_frames() {
        let mut decoder = EventStreamDecoder::default();
        assert_eq!(
            frames(&mut decoder, "data: {\"type\":\"status\"}\n\n: keepalive\n\n"),
            vec![Ok("{\"type\":\"status\"}".to_string())]
        );
        assert_eq!(
            frames(&mut decoder, "event: message\r\nid: 4\r\ndata:[1,\r\ndata: 2]\r\n\r\n"),
            vec![Ok("[1,\n2]".to_string())]
        );
    }

    #[test]
    fn event_split_across_chunks_is_reassembled() {
        let mut decoder = EventStreamDecoder::default();
        assert!(frames(&mut decoder, "da").is_empty());
        assert!(frames(&mut decoder, "ta: {\"a\"").is_empty());
        assert!(frames(&mut decoder, ": 1}\n").is_empty());
        assert_eq!(
            frames(&mut decoder, "\n"),
            vec![Ok("{\"a\": 1}".to_string())]
        );
        assert_eq!(
            decoder.push(b"data: \xff\n\n"),
            vec![Err(TransportError::NonUtf8)]
        );
    }

    #[tokio::test]
    async fn event_stream_connector_reads_events_until_close() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
             data: {\"type\":\"status\",\"data\":{}}\n\n\
             data: {\"type\":\"job_queued\",\"data\":{\"name\":\"build\"}}\n\n",
        )
        .await;
        let url = base.join("jobs/build?page=1").expect("url");
        let connector = EventStreamConnector::with_client(local_client());

        let stream = connector.connect(url).await.expect("connect");
        let received: Vec<_> = stream.collect().await;

        assert_eq!(
            received,
            vec![
                Ok("{\"type\":\"status\",\"data\":{}}".to_string()),
                Ok("{\"type\":\"job_queued\",\"data\":{\"name\":\"build\"}}".to_string()),
            ]
        );
        let request = server.await.expect("server").to_ascii_lowercase();
        assert!(request.starts_with("get /jobs/build?page=1 http/1.1"));
        assert!(request.contains("accept: text/event-stream"));
    }

    #[tokio::test]
    async fn event_stream_error_status_fails_the_attempt() {
        let (base, _server) =
            serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let connector = EventStreamConnector::with_client(local_client());
        let result = connector.connect(base.join("jobs/ghost").expect("url")).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn websocket_messages_map_to_text_frames() {
        assert_eq!(
            text_frame(Ok(WsMessage::Text("{}".to_string()))),
            Some(Ok("{}".to_string()))
        );
        assert_eq!(
            text_frame(Ok(WsMessage::Binary(b"{\"type\":\"status\"}".to_vec()))),
            Some(Ok("{\"type\":\"status\"}".to_string()))
        );
        assert_eq!(
            text_frame(Ok(WsMessage::Binary(vec![0xff, 0xfe]))),
            Some(Err(TransportError::NonUtf8))
        );
        assert_eq!(text_frame(Ok(WsMessage::Ping(Vec::new()))), None);
        assert_eq!(
            text_frame(Ok(WsMessage::Close(None))),
            Some(Err(TransportError::Closed))
        );
    }
}
