use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::command::{validate_command, CommandError};

fn default_capture_stderr() -> bool {
    true
}

/// A request to run one allow-listed command on behalf of a Fleet Mate.
///
/// Built by the caller and never mutated once a session has been created
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Identifier of the node the command runs on.
    #[serde(alias = "mateId")]
    pub node_id: String,
    /// Base command, possibly followed by inline arguments (e.g. `systemctl status`).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory on the node. The node's default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Execution budget on the node. The engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_capture_stderr")]
    pub capture_stderr: bool,
}

impl ExecutionRequest {
    pub fn new(
        node_id: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_directory: None,
            timeout_seconds: None,
            capture_stderr: true,
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }
}

/// State of one in-flight command execution.
///
/// A `Session` lives in the [`SessionStore`] from creation until its
/// completion is processed; it never outlives the execution.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub request: ExecutionRequest,
    /// Wall-clock creation time, epoch milliseconds.
    pub started_at_ms: u64,
    started: Instant,
    output: String,
}

impl Session {
    /// Output accumulated so far, in arrival order.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Consume the session and hand back its frozen output buffer.
    pub fn into_output(self) -> String {
        self.output
    }

    /// Time since the session was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Format a session identifier from its node and millisecond component.
pub fn format_session_id(node_id: &str, millis: u64) -> String {
    format!("{node_id}-cmd-{millis}")
}

struct StoreInner {
    sessions: HashMap<String, Session>,
    /// Highest millisecond component issued per node. Keeps identifiers from
    /// repeating when two sessions for one node are created within the same
    /// millisecond.
    last_issued: HashMap<String, u64>,
}

/// Concurrent map from session identifier to live [`Session`].
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                sessions: HashMap::new(),
                last_issued: HashMap::new(),
            })),
        }
    }

    /// Validate the request's command and register a new session for it.
    ///
    /// The identifier is `{node}-cmd-{epoch_ms}`. Validation happens before
    /// anything is registered, so a rejected command leaves no trace.
    pub fn create(&self, request: ExecutionRequest) -> Result<String, CommandError> {
        validate_command(&request.command)?;

        let now_ms = epoch_millis();
        let mut inner = self.inner.write();
        let millis = match inner.last_issued.get(&request.node_id) {
            Some(&last) if last >= now_ms => last + 1,
            _ => now_ms,
        };
        inner.last_issued.insert(request.node_id.clone(), millis);

        let id = format_session_id(&request.node_id, millis);
        let session = Session {
            id: id.clone(),
            request,
            started_at_ms: now_ms,
            started: Instant::now(),
            output: String::new(),
        };
        inner.sessions.insert(id.clone(), session);
        Ok(id)
    }

    /// Look up a live session, returning a clone if found.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Return true if the session is still live.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    /// Append a chunk to a live session's output buffer.
    ///
    /// Returns `false` (and changes nothing) when the session is unknown or
    /// already completed; late output never resurrects a session.
    pub fn append_output(&self, id: &str, chunk: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.output.push_str(chunk);
                true
            }
            None => false,
        }
    }

    /// Remove a session, returning it if it was live. Idempotent.
    ///
    /// Only one caller ever receives `Some` for a given identifier, which is
    /// what makes completion at-most-once.
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.inner.write().sessions.remove(id)
    }

    /// Identifiers of all live sessions.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    /// Identifiers of live sessions that have run longer than their budget
    /// (request timeout, else `default_timeout`) plus `grace`.
    pub fn overdue(&self, default_timeout: Duration, grace: Duration) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .sessions
            .values()
            .filter(|s| {
                let budget = s
                    .request
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout);
                s.elapsed() > budget.saturating_add(grace)
            })
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ls_request(node: &str) -> ExecutionRequest {
        ExecutionRequest::new(node, "ls", ["-la"])
    }

    #[test]
    fn create_then_get_returns_request() {
        let store = SessionStore::new();
        let request = ls_request("mate-1");
        let id = store.create(request.clone()).unwrap();
        let session = store.get(&id).expect("session should exist");
        assert_eq!(session.request, request);
        assert_eq!(session.id, id);
        assert!(session.output().is_empty());
        assert!(id.starts_with("mate-1-cmd-"));
    }

    #[test]
    fn rejected_command_registers_nothing() {
        let store = SessionStore::new();
        let err = store
            .create(ExecutionRequest::new("mate-1", "rm -rf /", Vec::<String>::new()))
            .unwrap_err();
        assert_eq!(err, CommandError::CommandNotWhitelisted("rm".into()));
        assert!(store.is_empty());

        let err = store
            .create(ExecutionRequest::new("mate-1", "", Vec::<String>::new()))
            .unwrap_err();
        assert_eq!(err, CommandError::EmptyCommand);
        assert!(store.is_empty());
    }

    #[test]
    fn ids_never_repeat_for_same_node() {
        let store = SessionStore::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..500 {
            let id = store.create(ls_request("mate-1")).unwrap();
            assert!(ids.insert(id.clone()), "duplicate id {id}");
            store.remove(&id);
        }
    }

    #[test]
    fn append_is_ordered_and_ignores_unknown() {
        let store = SessionStore::new();
        let id = store.create(ls_request("mate-1")).unwrap();
        assert!(store.append_output(&id, "a"));
        assert!(store.append_output(&id, "b"));
        assert_eq!(store.get(&id).unwrap().output(), "ab");

        assert!(!store.append_output("nonexistent", "x"));
        assert!(store.get("nonexistent").is_none());
    }

    #[test]
    fn append_after_remove_does_not_resurrect() {
        let store = SessionStore::new();
        let id = store.create(ls_request("mate-1")).unwrap();
        let removed = store.remove(&id).unwrap();
        assert_eq!(removed.id, id);
        assert!(!store.append_output(&id, "late"));
        assert!(!store.contains(&id));
        assert!(store.remove(&id).is_none());
    }

    #[test]
    fn request_deserializes_mate_id_alias() {
        let json = r#"{"mateId":"mate-7","command":"df","args":["-h"]}"#;
        let request: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.node_id, "mate-7");
        assert_eq!(request.args, vec!["-h"]);
        assert!(request.capture_stderr);
        assert!(request.timeout_seconds.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_respects_request_timeout_and_grace() {
        let store = SessionStore::new();
        let short = store
            .create(ls_request("mate-1").with_timeout_seconds(5))
            .unwrap();
        let long = store.create(ls_request("mate-2")).unwrap();

        let default_timeout = Duration::from_secs(60);
        let grace = Duration::from_secs(2);
        assert!(store.overdue(default_timeout, grace).is_empty());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.overdue(default_timeout, grace), vec![short.clone()]);

        tokio::time::advance(Duration::from_secs(60)).await;
        let mut overdue = store.overdue(default_timeout, grace);
        overdue.sort();
        let mut expected = vec![short, long];
        expected.sort();
        assert_eq!(overdue, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_request_timeout_is_never_overdue() {
        let store = SessionStore::new();
        let id = store
            .create(ls_request("mate-1").with_timeout_seconds(u64::MAX))
            .unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(store.overdue(Duration::from_secs(60), Duration::from_secs(30)).is_empty());
        assert!(store.contains(&id));
    }
}
