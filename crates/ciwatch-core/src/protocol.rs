use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::Run;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const SNAPSHOT_TYPE: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    JobQueued,
    JobStarted,
    JobCompleted,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::JobQueued => "job_queued",
            DeltaKind::JobStarted => "job_started",
            DeltaKind::JobCompleted => "job_completed",
        }
    }

    pub fn from_type(tag: &str) -> Option<Self> {
        match tag {
            "job_queued" => Some(DeltaKind::JobQueued),
            "job_started" => Some(DeltaKind::JobStarted),
            "job_completed" => Some(DeltaKind::JobCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full state for one view. `data` is view-kind specific and is parsed by the
/// reconciler bound to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub title: String,
    pub version: String,
    /// Server wall clock, unix seconds.
    pub time: Option<i64>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub kind: DeltaKind,
    pub run: Run,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Snapshot(Snapshot),
    Delta(Delta),
}

impl Message {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::Snapshot(_) => SNAPSHOT_TYPE,
            Message::Delta(delta) => delta.kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame has no type tag")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownKind(String),
    #[error("{kind} payload decode failed: {message}")]
    Payload { kind: DeltaKind, message: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    data: Value,
}

/// Parses one text frame from the push channel.
pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<Message, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    let kind = frame.kind.ok_or(FrameError::MissingType)?;

    if kind == SNAPSHOT_TYPE {
        return Ok(Message::Snapshot(Snapshot {
            title: frame.title.unwrap_or_default(),
            version: frame.version.unwrap_or_default(),
            time: frame.time,
            data: frame.data,
        }));
    }

    let kind = DeltaKind::from_type(&kind).ok_or(FrameError::UnknownKind(kind))?;
    let run = Run::deserialize(&frame.data).map_err(|err| FrameError::Payload {
        kind,
        message: err.to_string(),
    })?;
    if run.name.is_empty() {
        return Err(FrameError::Payload {
            kind,
            message: "missing job name".to_string(),
        });
    }
    Ok(Message::Delta(Delta { kind, run }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunResult;

    #[test]
    fn status_frame_decodes_as_snapshot() {
        let frame = r#"{"type":"status","title":"Laminar","version":"1.3","time":1700000000,"data":{"queued":[]}}"#;
        let message = decode_frame(frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        match message {
            Message::Snapshot(snapshot) => {
                assert_eq!(snapshot.title, "Laminar");
                assert_eq!(snapshot.version, "1.3");
                assert_eq!(snapshot.time, Some(1_700_000_000));
                assert!(snapshot.data.get("queued").is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn job_frames_decode_as_typed_deltas() {
        let frame = r#"{"type":"job_started","data":{"name":"build","number":7,"queueIndex":0,"started":10}}"#;
        let message = decode_frame(frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(message.type_tag(), "job_started");
        let Message::Delta(delta) = message else {
            panic!("expected delta");
        };
        assert_eq!(delta.kind, DeltaKind::JobStarted);
        assert_eq!(delta.run.name, "build");
        assert_eq!(delta.run.queue_index, Some(0));

        let completed = decode_frame(
            r#"{"type":"job_completed","data":{"name":"build","number":7,"result":"failed"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode completed");
        let Message::Delta(delta) = completed else {
            panic!("expected delta");
        };
        assert_eq!(delta.run.result, Some(RunResult::Failed));
    }

    #[test]
    fn malformed_frames_report_errors() {
        assert!(matches!(
            decode_frame("{\"type\":\"status\"", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert_eq!(
            decode_frame(r#"{"data":{}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::MissingType)
        );
        assert_eq!(
            decode_frame(r#"{"type":"job_exploded","data":{}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::UnknownKind("job_exploded".to_string()))
        );
        assert!(matches!(
            decode_frame(r#"{"type":"job_queued","data":{"number":1}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Payload {
                kind: DeltaKind::JobQueued,
                ..
            })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = format!(
            r#"{{"type":"status","data":{{"blob":"{}"}}}}"#,
            "x".repeat(256)
        );
        assert!(matches!(
            decode_frame(&frame, 64),
            Err(FrameError::OversizedFrame { max: 64, .. })
        ));
    }
}
