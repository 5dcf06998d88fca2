use serde::{Deserialize, Serialize};

/// Which stream of the remote process a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An event pushed to the live subscriber of a session.
///
/// For one session the order is always: one `Start`, any number of `Chunk`,
/// then exactly one of `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ExecEvent {
    #[serde(rename_all = "camelCase")]
    Start { session_id: String, message: String },
    Chunk {
        #[serde(rename = "type")]
        stream: OutputStream,
        content: String,
        done: bool,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        exit_code: i32,
        duration_ms: u64,
        output: String,
    },
    Error { error: String },
}

impl ExecEvent {
    pub fn start(session_id: impl Into<String>) -> Self {
        ExecEvent::Start {
            session_id: session_id.into(),
            message: "Command execution started".to_string(),
        }
    }

    pub fn chunk(stream: OutputStream, content: impl Into<String>) -> Self {
        ExecEvent::Chunk {
            stream,
            content: content.into(),
            done: false,
        }
    }

    /// Event name as seen by the transport (`start`, `chunk`, `done`, `error`).
    pub fn name(&self) -> &'static str {
        match self {
            ExecEvent::Start { .. } => "start",
            ExecEvent::Chunk { .. } => "chunk",
            ExecEvent::Done { .. } => "done",
            ExecEvent::Error { .. } => "error",
        }
    }

    /// True for `Done` and `Error`; nothing follows a terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecEvent::Done { .. } | ExecEvent::Error { .. })
    }

    /// The event's payload alone, without the event-name envelope.
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("data").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}
