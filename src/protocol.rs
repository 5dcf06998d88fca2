//! JSON messages exchanged with a Fleet Mate node.
//!
//! Outbound: `{"type": "execute_command", "payload": {...}}` asks the node to
//! run a command for a session. Inbound: `{"type": "command_output",
//! "data": {...}}` and friends stream output and the final exit code back.

use serde::{Deserialize, Serialize};

use crate::session::ExecutionRequest;

/// Working directory used on the node when the request names none.
pub const DEFAULT_WORKING_DIR: &str = "/tmp";

/// Server → node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MateCommand {
    ExecuteCommand(ExecuteCommandMsg),
}

impl MateCommand {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of an `execute_command` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandMsg {
    pub session_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: String,
    /// Seconds the node may let the command run.
    pub timeout: u64,
    pub capture_stderr: bool,
}

impl ExecuteCommandMsg {
    /// Build the dispatch payload for `request`, filling node-side defaults.
    pub fn for_request(
        session_id: impl Into<String>,
        request: &ExecutionRequest,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            command: request.command.clone(),
            args: request.args.clone(),
            working_dir: request
                .working_directory
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
            timeout: request.timeout_seconds.unwrap_or(default_timeout_secs),
            capture_stderr: request.capture_stderr,
        }
    }
}

/// Node → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MateMessage {
    /// A piece of the command's stdout.
    #[serde(rename_all = "camelCase")]
    CommandOutput { session_id: String, content: String },
    /// A piece of the command's stderr.
    #[serde(rename_all = "camelCase")]
    CommandError { session_id: String, content: String },
    /// The command exited. A missing exit code is reported as `-1`.
    #[serde(rename_all = "camelCase")]
    CommandComplete {
        session_id: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    /// The node could not run the command at all.
    #[serde(rename_all = "camelCase")]
    CommandFailed { session_id: String, error: String },
}

impl MateMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn session_id(&self) -> &str {
        match self {
            MateMessage::CommandOutput { session_id, .. }
            | MateMessage::CommandError { session_id, .. }
            | MateMessage::CommandComplete { session_id, .. }
            | MateMessage::CommandFailed { session_id, .. } => session_id,
        }
    }
}
