use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Entries kept per node.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Characters of output kept in a history entry.
pub const DEFAULT_OUTPUT_CAP: usize = 5000;

/// Appended to output that was cut at the cap.
pub const TRUNCATION_MARKER: &str = "\n... (truncated)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Summary of one finished execution. Created once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: String,
    pub node_id: String,
    pub command: String,
    pub full_command: String,
    pub exit_code: i32,
    /// Output, cut at the configured cap.
    pub output: String,
    pub duration_ms: u64,
    /// Start of the execution, epoch milliseconds.
    pub executed_at: u64,
    pub status: ExecutionStatus,
}

/// Cut `output` to at most `max_chars` characters, appending
/// [`TRUNCATION_MARKER`] when anything was removed.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        None => output.to_string(),
        Some((cut, _)) => {
            let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
            truncated.push_str(&output[..cut]);
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
    }
}

type NodeHistory = Arc<Mutex<VecDeque<HistoryEntry>>>;

/// Per-node, newest-first, bounded list of finished executions.
///
/// The outer map is only write-locked to add a node; recording into an
/// existing node takes that node's own lock, so different nodes never
/// contend.
#[derive(Clone)]
pub struct HistoryLedger {
    nodes: Arc<RwLock<HashMap<String, NodeHistory>>>,
    capacity: usize,
}

impl Default for HistoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn node(&self, node_id: &str) -> NodeHistory {
        if let Some(history) = self.nodes.read().get(node_id) {
            return Arc::clone(history);
        }
        let mut nodes = self.nodes.write();
        Arc::clone(
            nodes
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.capacity)))),
        )
    }

    /// Insert `entry` at the head of the node's history, dropping the oldest
    /// entry once the node is at capacity.
    pub fn record(&self, node_id: &str, entry: HistoryEntry) {
        let history = self.node(node_id);
        let mut history = history.lock();
        if history.len() >= self.capacity {
            history.pop_back();
        }
        history.push_front(entry);
    }

    /// The node's history, newest first. Empty if the node has none.
    pub fn list(&self, node_id: &str) -> Vec<HistoryEntry> {
        let history = match self.nodes.read().get(node_id) {
            Some(history) => Arc::clone(history),
            None => return Vec::new(),
        };
        let history = history.lock();
        history.iter().cloned().collect()
    }

    /// Number of entries recorded for the node.
    pub fn count(&self, node_id: &str) -> usize {
        self.nodes
            .read()
            .get(node_id)
            .map(|h| h.lock().len())
            .unwrap_or(0)
    }

    /// Every node with at least one entry.
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }
}
