//! Session model (spec §3): the bookkeeping record for one pipeline run,
//! owning the set of nodes and channels it allocated so cancellation and
//! cleanup have something concrete to tear down.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A session's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Running,
    Terminating,
    Terminated,
    Error,
}

/// One execution of a pipeline: created per `execute_*` invocation, destroyed
/// after the final output is returned or a fatal error occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub status: SessionStatus,
    pub nodes: HashSet<String>,
    pub channels: HashSet<String>,
}

impl Session {
    /// A freshly initializing session with no nodes or channels registered
    /// yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: chrono::Utc::now(),
            status: SessionStatus::Initializing,
            nodes: HashSet::new(),
            channels: HashSet::new(),
        }
    }

    pub fn add_node(&mut self, node_id: impl Into<String>) {
        self.nodes.insert(node_id.into());
    }

    pub fn add_channel(&mut self, channel_name: impl Into<String>) {
        self.channels.insert(channel_name.into());
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }
}
