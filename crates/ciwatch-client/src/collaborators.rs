//! Side effects the subscription manager delegates to its owner.

use ciwatch_core::{Run, RunResult};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notifications unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Desktop-style notice for a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub job: String,
    pub number: u64,
    pub result: Option<RunResult>,
}

impl Notice {
    pub fn for_run(run: &Run) -> Self {
        Self {
            job: run.name.clone(),
            number: run.number,
            result: run.result,
        }
    }

    fn result_label(&self) -> &'static str {
        self.result.map(|result| result.as_str()).unwrap_or("unknown")
    }

    pub fn title(&self) -> String {
        format!("Job {}", self.result_label())
    }

    pub fn body(&self) -> String {
        format!("{} #{}: {}", self.job, self.number, self.result_label())
    }
}

pub trait NotificationSink: Send {
    fn notify(&mut self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Handle to an in-flight log fetch. Aborting twice is harmless.
pub trait LogStreamHandle: Send {
    fn abort(&mut self);
}

/// Starts incremental log fetches for one run, from offset zero.
pub trait LogFetcher: Send {
    fn fetch(&mut self, job: &str, number: u64) -> Box<dyn LogStreamHandle>;
}

/// A piece of a run's log, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub job: String,
    pub number: u64,
    pub text: String,
}

/// Streams `log/{job}/{number}` from the server and forwards each chunk of
/// text on `output`. One background task per fetch.
pub struct HttpLogFetcher {
    client: reqwest::Client,
    base_url: Url,
    output: mpsc::UnboundedSender<LogChunk>,
}

impl HttpLogFetcher {
    pub fn new(base_url: Url, output: mpsc::UnboundedSender<LogChunk>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            output,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

struct FetchTask {
    job: String,
    number: u64,
    task: JoinHandle<()>,
}

impl LogStreamHandle for FetchTask {
    fn abort(&mut self) {
        if !self.task.is_finished() {
            info!("log_stream_stop: {} #{}", self.job, self.number);
        }
        self.task.abort();
    }
}

impl LogFetcher for HttpLogFetcher {
    fn fetch(&mut self, job: &str, number: u64) -> Box<dyn LogStreamHandle> {
        info!("log_stream_start: {job} #{number}");
        let url = self.base_url.join(&format!("log/{job}/{number}"));
        let task = tokio::spawn(stream_log(
            self.client.clone(),
            url,
            self.output.clone(),
            job.to_string(),
            number,
        ));
        Box::new(FetchTask {
            job: job.to_string(),
            number,
            task,
        })
    }
}

async fn stream_log(
    client: reqwest::Client,
    url: Result<Url, url::ParseError>,
    output: mpsc::UnboundedSender<LogChunk>,
    job: String,
    number: u64,
) {
    let response = match url {
        Ok(url) => client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status()),
        Err(err) => {
            warn!("log_stream_error: {job} #{number}: {err}");
            return;
        }
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            warn!("log_stream_error: {job} #{number}: {err}");
            return;
        }
    };
    let mut body = response.bytes_stream();
    let mut pending = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("log_stream_error: {job} #{number}: {err}");
                return;
            }
        };
        pending.extend_from_slice(&chunk);
        let text = take_utf8(&mut pending);
        if text.is_empty() {
            continue;
        }
        let sent = output.send(LogChunk {
            job: job.clone(),
            number,
            text,
        });
        if sent.is_err() {
            return;
        }
    }
    debug!("log_stream_done: {job} #{number}");
}

/// Drains the decodable prefix of `pending`, keeping an incomplete trailing
/// code point for the next chunk. Invalid bytes become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let keep = match std::str::from_utf8(pending) {
        Ok(_) => 0,
        Err(err) if err.error_len().is_none() => pending.len() - err.valid_up_to(),
        Err(_) => 0,
    };
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::{local_client, serve_once};

    #[test]
    fn notice_text_names_job_and_result() {
        let run = Run {
            result: Some(RunResult::Failed),
            ..Run::new("build", 12)
        };
        let notice = Notice::for_run(&run);
        assert_eq!(notice.title(), "Job failed");
        assert_eq!(notice.body(), "build #12: failed");

        let unknown = Notice::for_run(&Run::new("lint", 3));
        assert_eq!(unknown.body(), "lint #3: unknown");
    }

    #[test]
    fn split_code_points_wait_for_the_next_chunk() {
        let mut pending = "ok \u{e9}".as_bytes().to_vec();
        let last = pending.pop().expect("byte");
        assert_eq!(take_utf8(&mut pending), "ok ");
        assert_eq!(pending.len(), 1);

        pending.push(last);
        assert_eq!(take_utf8(&mut pending), "\u{e9}");
        assert!(pending.is_empty());

        pending.extend_from_slice(b"a\xffb");
        assert_eq!(take_utf8(&mut pending), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn http_log_fetcher_forwards_log_text() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n\
             [laminar] Executing cfg/jobs/build.run\nok\n",
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetcher =
            HttpLogFetcher::new(base.join("ci/").expect("url"), tx).with_client(local_client());

        let _handle = fetcher.fetch("build", 7);
        drop(fetcher);
        let mut log = String::new();
        while let Some(chunk) = rx.recv().await {
            assert_eq!((chunk.job.as_str(), chunk.number), ("build", 7));
            log.push_str(&chunk.text);
        }

        assert_eq!(log, "[laminar] Executing cfg/jobs/build.run\nok\n");
        let request = server.await.expect("server");
        assert!(request.starts_with("GET /ci/log/build/7 HTTP/1.1"));
    }

    #[tokio::test]
    async fn aborted_fetch_stops_forwarding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let base = Url::parse("http://127.0.0.1:9/").expect("url");
        let mut fetcher = HttpLogFetcher::new(base, tx).with_client(local_client());

        let mut handle = fetcher.fetch("build", 1);
        handle.abort();
        handle.abort();
        drop(fetcher);

        assert!(rx.recv().await.is_none());
    }
}
