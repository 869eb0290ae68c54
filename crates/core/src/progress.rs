//! Per-session initialization progress tracking (C9).
//!
//! Each node in a session moves through `Starting -> LoadingModel ->
//! Connecting -> Ready`, with `Failed` reachable from any state. A session
//! is `Ready` once every node it tracks is `Ready`. `emit_progress` keeps
//! the teacher's broadcast-channel-plus-tracing idiom for observers that
//! just want a live event stream; `wait_for_initialization` is the
//! synchronous readiness gate the process supervisor (C8) blocks on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;

use crate::error::Error;
use crate::node::InitPhase;

/// The fraction of initialization work a phase represents, used to populate
/// `ProgressEvent::fraction` when a caller doesn't supply one explicitly.
fn default_fraction(phase: InitPhase) -> f32 {
    match phase {
        InitPhase::Starting => 0.0,
        InitPhase::LoadingModel => 0.33,
        InitPhase::Connecting => 0.66,
        InitPhase::Ready => 1.0,
        InitPhase::Failed => 0.0,
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// A state transition for one node, broadcast to any subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub node_id: String,
    pub phase: InitPhase,
    /// Progress within this phase, clamped to `[0.0, 1.0]`.
    pub fraction: f32,
    pub message: Option<String>,
    /// Wall-clock timestamp (nanoseconds since the Unix epoch) the
    /// transition was recorded at.
    pub ts: i64,
}

/// One node's tracked initialization state: phase plus fraction, so a late
/// subscriber to `session_statuses` can render a progress bar without
/// replaying the event log.
#[derive(Debug, Clone, Copy)]
pub struct NodeProgress {
    pub phase: InitPhase,
    pub fraction: f32,
}

/// Tracks node states for every session in a process and aggregates
/// session-level readiness.
pub struct InitProgressTracker {
    sessions: RwLock<HashMap<String, HashMap<String, NodeProgress>>>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for InitProgressTracker {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(HashMap::new()),
            sender,
        }
    }
}

impl InitProgressTracker {
    /// A fresh, empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Register a node as part of a session, in `Starting` state. Must be
    /// called before the session's readiness can be evaluated.
    pub async fn register_node(&self, session_id: &str, node_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_default().insert(
            node_id.to_string(),
            NodeProgress {
                phase: InitPhase::Starting,
                fraction: default_fraction(InitPhase::Starting),
            },
        );
    }

    /// Transition a node's phase, with an explicit fraction (clamped to
    /// `[0, 1]`). `Failed` absorbs from any prior phase; other transitions
    /// follow the declared phase order but are not rejected if out of order,
    /// since a node may skip `LoadingModel` or `Connecting` when neither
    /// phase applies to it.
    pub async fn set_phase(&self, session_id: &str, node_id: &str, phase: InitPhase, fraction: f32, message: Option<String>) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.to_string())
                .or_default()
                .insert(node_id.to_string(), NodeProgress { phase, fraction });
        }

        match phase {
            InitPhase::Failed => {
                tracing::error!(session_id, node_id, ?phase, message = message.as_deref().unwrap_or(""), "node initialization failed");
            }
            InitPhase::Ready => {
                tracing::info!(session_id, node_id, "node ready");
            }
            _ => {
                tracing::debug!(session_id, node_id, ?phase, fraction, "node initialization progress");
            }
        }

        let _ = self.sender.send(ProgressEvent {
            session_id: session_id.to_string(),
            node_id: node_id.to_string(),
            phase,
            fraction,
            message,
            ts: now_nanos(),
        });
    }

    /// Transition a node's phase using the phase's default fraction.
    pub async fn set_status(&self, session_id: &str, node_id: &str, phase: InitPhase, message: Option<String>) {
        let fraction = default_fraction(phase);
        self.set_phase(session_id, node_id, phase, fraction, message).await;
    }

    /// The current status of every node in a session.
    pub async fn session_statuses(&self, session_id: &str) -> HashMap<String, NodeProgress> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether every registered node in the session is `Ready`. Returns
    /// `Err` immediately if any node has `Failed`.
    pub async fn is_session_ready(&self, session_id: &str) -> crate::Result<bool> {
        let statuses = self.session_statuses(session_id).await;
        if statuses.is_empty() {
            return Ok(false);
        }
        for (node_id, progress) in &statuses {
            if progress.phase == InitPhase::Failed {
                return Err(Error::init_failed(format!("node '{node_id}' failed to initialize")).with_node(node_id.clone()));
            }
        }
        Ok(statuses.values().all(|p| p.phase == InitPhase::Ready))
    }

    /// Poll until the session is ready, a node fails, or `timeout_dur`
    /// elapses (default 30s per the readiness handshake contract).
    pub async fn wait_for_initialization(
        &self,
        session_id: &str,
        timeout_dur: Duration,
        poll_interval: Duration,
    ) -> crate::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            if self.is_session_ready(session_id).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "session '{session_id}' did not become ready within {:?}",
                    timeout_dur
                )));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let _ = timeout(remaining.min(poll_interval), tokio::time::sleep(poll_interval)).await;
        }
    }
}

/// Shared handle to a process-wide tracker.
pub type SharedInitProgressTracker = Arc<InitProgressTracker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_ready_once_all_nodes_ready() {
        let tracker = InitProgressTracker::new();
        tracker.register_node("s1", "a").await;
        tracker.register_node("s1", "b").await;
        assert!(!tracker.is_session_ready("s1").await.unwrap());

        tracker.set_status("s1", "a", InitPhase::Ready, None).await;
        assert!(!tracker.is_session_ready("s1").await.unwrap());

        tracker.set_status("s1", "b", InitPhase::Ready, None).await;
        assert!(tracker.is_session_ready("s1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_node_short_circuits_readiness() {
        let tracker = InitProgressTracker::new();
        tracker.register_node("s1", "a").await;
        tracker.set_status("s1", "a", InitPhase::Failed, Some("boom".into())).await;
        assert!(tracker.is_session_ready("s1").await.is_err());
    }

    #[tokio::test]
    async fn wait_for_initialization_times_out() {
        let tracker = InitProgressTracker::new();
        tracker.register_node("s1", "a").await;
        let result = tracker
            .wait_for_initialization("s1", Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_initialization_succeeds_once_ready() {
        let tracker = Arc::new(InitProgressTracker::new());
        tracker.register_node("s1", "a").await;
        let t2 = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t2.set_status("s1", "a", InitPhase::Ready, None).await;
        });
        let result = tracker
            .wait_for_initialization("s1", Duration::from_secs(1), Duration::from_millis(5))
            .await;
        assert!(result.is_ok());
    }
}
