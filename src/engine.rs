use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channel::{EventChannelRegistry, Subscriber};
use crate::command::{full_command_line, CommandError};
use crate::config::EngineConfig;
use crate::events::{ExecEvent, OutputStream};
use crate::history::{truncate_output, ExecutionStatus, HistoryEntry, HistoryLedger};
use crate::protocol::{ExecuteCommandMsg, MateCommand, MateMessage};
use crate::session::{ExecutionRequest, Session, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// Closes the session's subscriber when dropped, so cleanup happens even if
/// an earlier step of completion panics.
struct CloseOnDrop<'a> {
    channels: &'a EventChannelRegistry,
    session_id: &'a str,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.channels.close(self.session_id);
    }
}

/// Coordinates one command execution from creation to its history entry.
///
/// Owns (by handle) the session store, the subscriber registry and the
/// history ledger. Cloning is cheap and clones share all state, so one engine
/// can be handed to every driver and transport task in the process.
#[derive(Clone)]
pub struct ExecutionEngine {
    sessions: SessionStore,
    channels: EventChannelRegistry,
    history: HistoryLedger,
    config: Arc<EngineConfig>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let channels = EventChannelRegistry::with_limits(
            config.subscriber_idle_timeout(),
            config.subscriber_buffer,
        );
        let history = HistoryLedger::with_capacity(config.history_capacity);
        Self::with_parts(SessionStore::new(), channels, history, config)
    }

    /// Build an engine around existing stores.
    pub fn with_parts(
        sessions: SessionStore,
        channels: EventChannelRegistry,
        history: HistoryLedger,
        config: EngineConfig,
    ) -> Self {
        Self {
            sessions,
            channels,
            history,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn channels(&self) -> &EventChannelRegistry {
        &self.channels
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Validate the request and register a session for it.
    ///
    /// A rejected command creates nothing: no session, no event, no history.
    pub fn create_session(&self, request: ExecutionRequest) -> Result<String, EngineError> {
        let node_id = request.node_id.clone();
        let command = request.command.clone();
        let session_id = self.sessions.create(request).map_err(|e| {
            tracing::warn!(node = %node_id, %command, error = %e, "command rejected");
            e
        })?;
        tracing::info!(session = %session_id, node = %node_id, %command, "created execution session");
        Ok(session_id)
    }

    /// Attach a live subscriber to a session. Any previous subscriber for the
    /// same session stops receiving events.
    pub fn attach(&self, session_id: &str) -> Result<Subscriber, EngineError> {
        if !self.sessions.contains(session_id) {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        self.confirm_attached(self.channels.attach(session_id))
    }

    /// Keep `subscriber` only if its session is still live once the slot is
    /// in place. A completion that slipped in before the slot was inserted
    /// has already sent its terminal event to nobody.
    fn confirm_attached(&self, subscriber: Subscriber) -> Result<Subscriber, EngineError> {
        let session_id = subscriber.session_id();
        if self.sessions.contains(session_id) {
            return Ok(subscriber);
        }
        tracing::debug!(session = %session_id, "session completed during attach");
        self.channels.deregister(session_id, subscriber.id());
        Err(EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Append a chunk of output and push it to the subscriber, if any.
    ///
    /// Output for an unknown or completed session is ignored.
    pub fn append_output(&self, session_id: &str, stream: OutputStream, content: &str) {
        if !self.sessions.append_output(session_id, content) {
            tracing::warn!(session = %session_id, "output for unknown session ignored");
            return;
        }
        tracing::trace!(session = %session_id, ?stream, bytes = content.len(), "output chunk");
        self.channels.emit(session_id, ExecEvent::chunk(stream, content));
    }

    /// Finish a session with the command's exit code.
    ///
    /// Records the history entry (with truncated output), sends `done` with
    /// the full output, then removes the session and closes its subscriber.
    /// Returns the recorded entry, or `None` if the session was unknown or
    /// already completed.
    pub fn complete_execution(&self, session_id: &str, exit_code: i32) -> Option<HistoryEntry> {
        let Some(session) = self.sessions.remove(session_id) else {
            tracing::warn!(session = %session_id, "completion for unknown session ignored");
            return None;
        };
        let _cleanup = CloseOnDrop {
            channels: &self.channels,
            session_id,
        };

        let duration_ms = session.elapsed().as_millis() as u64;
        let entry = self.history_entry(
            &session,
            exit_code,
            duration_ms,
            ExecutionStatus::from_exit_code(exit_code),
        );
        self.history.record(&entry.node_id, entry.clone());

        self.channels.emit(
            session_id,
            ExecEvent::Done {
                exit_code,
                duration_ms,
                output: session.into_output(),
            },
        );

        tracing::info!(session = %session_id, exit_code, duration_ms, "command execution completed");
        Some(entry)
    }

    /// Abort a session because the node could not run the command.
    ///
    /// Sends the terminal `error` event and cleans up. No history is kept for
    /// a command that never ran.
    pub fn fail_execution(&self, session_id: &str, error: &str) -> bool {
        let Some(_session) = self.sessions.remove(session_id) else {
            tracing::warn!(session = %session_id, "failure for unknown session ignored");
            return false;
        };
        let _cleanup = CloseOnDrop {
            channels: &self.channels,
            session_id,
        };
        self.channels.emit(
            session_id,
            ExecEvent::Error {
                error: error.to_string(),
            },
        );
        tracing::warn!(session = %session_id, %error, "command execution failed");
        true
    }

    /// Finish a session whose execution budget ran out.
    ///
    /// Recorded in history with exit code `-1` and status `timeout`; the
    /// subscriber receives a terminal `error` event.
    pub fn time_out(&self, session_id: &str) -> Option<HistoryEntry> {
        let session = self.sessions.remove(session_id)?;
        let _cleanup = CloseOnDrop {
            channels: &self.channels,
            session_id,
        };

        let duration_ms = session.elapsed().as_millis() as u64;
        let budget = session
            .request
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_secs);
        let entry = self.history_entry(&session, -1, duration_ms, ExecutionStatus::Timeout);
        self.history.record(&entry.node_id, entry.clone());

        self.channels.emit(
            session_id,
            ExecEvent::Error {
                error: format!("command timed out after {budget}s"),
            },
        );
        tracing::warn!(session = %session_id, duration_ms, "command execution timed out");
        Some(entry)
    }

    /// Drop a session without completing it: no event, no history.
    pub fn abandon(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        self.channels.close(session_id);
        if removed {
            tracing::info!(session = %session_id, "execution session abandoned");
        }
        removed
    }

    /// Route a message received from a node.
    pub fn handle_mate_message(&self, msg: MateMessage) {
        match msg {
            MateMessage::CommandOutput {
                session_id,
                content,
            } => self.append_output(&session_id, OutputStream::Stdout, &content),
            MateMessage::CommandError {
                session_id,
                content,
            } => self.append_output(&session_id, OutputStream::Stderr, &content),
            MateMessage::CommandComplete {
                session_id,
                exit_code,
            } => {
                self.complete_execution(&session_id, exit_code.unwrap_or(-1));
            }
            MateMessage::CommandFailed { session_id, error } => {
                self.fail_execution(&session_id, &error);
            }
        }
    }

    /// The `execute_command` message that tells the node to start running a
    /// live session.
    pub fn dispatch_message(&self, session_id: &str) -> Option<MateCommand> {
        let session = self.sessions.get(session_id)?;
        Some(MateCommand::ExecuteCommand(ExecuteCommandMsg::for_request(
            session_id,
            &session.request,
            self.config.default_timeout_secs,
        )))
    }

    // ── Timeouts ───────────────────────────────────────────────────

    /// Time out every session that has outlived its budget plus grace.
    /// Returns how many were timed out.
    pub fn reap_overdue(&self) -> usize {
        self.sessions
            .overdue(self.config.default_timeout(), self.config.timeout_grace())
            .iter()
            .filter(|id| self.time_out(id).is_some())
            .count()
    }

    /// Run [`reap_overdue`](Self::reap_overdue) periodically until `cancel`
    /// fires.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = engine.reap_overdue();
                        if reaped > 0 {
                            tracing::debug!(reaped, "timed out overdue sessions");
                        }
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }

    /// Abandon every live session and close every subscriber.
    pub fn shutdown(&self) {
        let ids = self.sessions.ids();
        for id in &ids {
            self.abandon(id);
        }
        self.channels.close_all();
        tracing::info!(abandoned = ids.len(), "execution engine shut down");
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Finished executions for a node, newest first.
    pub fn history(&self, node_id: &str) -> Vec<HistoryEntry> {
        self.history.list(node_id)
    }

    /// A live session, if the execution has not completed.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }

    /// Identifiers of all live sessions.
    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions.ids()
    }

    fn history_entry(
        &self,
        session: &Session,
        exit_code: i32,
        duration_ms: u64,
        status: ExecutionStatus,
    ) -> HistoryEntry {
        let request = &session.request;
        HistoryEntry {
            session_id: session.id.clone(),
            node_id: request.node_id.clone(),
            command: request.command.clone(),
            full_command: full_command_line(&request.command, &request.args),
            exit_code,
            output: truncate_output(session.output(), self.config.output_cap_chars),
            duration_ms,
            executed_at: session.started_at_ms,
            status,
        }
    }
}
