//! The node execution contract (C5/C11): the trait every built-in and
//! instance-bypass node implements, and the capability/status types the
//! scheduler and registry drive it through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::RuntimeData;

/// Initialization phase a node reports to the init-progress tracker (C9).
/// Distinct from [`NodeStatus`], which tracks the node's runtime lifecycle
/// for the lifetime of a session, not just its startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPhase {
    Starting,
    LoadingModel,
    Connecting,
    Ready,
    Failed,
}

/// Runtime lifecycle status of a node within a session, tracked independently
/// of its [`InitPhase`]: a node reaches `Ready` once, then cycles between
/// `Processing` and `Ready` for every item it handles over the life of the
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Initializing,
    Ready,
    Processing,
    Error,
    Stopping,
    Stopped,
}

/// What a node can do, declared up front so the scheduler and validator can
/// reject combinations that don't make sense (e.g. wiring a one-shot node
/// into a streaming fan-in).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Whether `process_streaming` should be driven instead of one-shot
    /// `process`.
    pub streaming: bool,
    /// Whether this node needs GPU placement (informational; the core
    /// implements no scheduling policy around this itself).
    pub needs_gpu: bool,
}

/// The trait every node, built-in or instance-bypass, implements.
///
/// `initialize` runs exactly once before the first `process`/
/// `process_streaming` call. `flush` is called once at end-of-input for
/// streaming nodes that buffer internally. `cleanup` runs exactly once,
/// after which the node must not be called again.
#[async_trait]
pub trait StreamingNode: Send + Sync {
    /// Human-readable node type, matching the manifest's `node_type`.
    fn node_type(&self) -> &str;

    /// Declared capabilities.
    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::default()
    }

    /// One-time setup (model loads, connection opens). Errors here are
    /// reported as `ErrorKind::InitFailed`.
    async fn initialize(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// Process one unit of data, producing zero or more outputs.
    async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>>;

    /// Process one unit of data in streaming mode. Defaults to delegating
    /// to `process`; streaming-capable nodes override this to maintain
    /// internal buffering state across calls.
    async fn process_streaming(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
        self.process(input).await
    }

    /// Called once at end-of-input for streaming nodes, to flush any
    /// buffered state into final outputs.
    async fn flush(&mut self) -> crate::Result<Vec<RuntimeData>> {
        Ok(Vec::new())
    }

    /// One-time teardown. Must be safe to call even if `initialize` was
    /// never called or failed.
    async fn cleanup(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// Opaque state to persist across a stream for instance-bypass
    /// serialization (C7). Nodes with no meaningful state return `None`.
    fn state_for_serialization(&self) -> crate::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Restore state captured by `state_for_serialization`.
    fn restore_from_state(&mut self, _state: &[u8]) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl StreamingNode for Echo {
        fn node_type(&self) -> &str {
            "echo"
        }

        async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
            Ok(vec![input])
        }
    }

    #[tokio::test]
    async fn default_process_streaming_delegates_to_process() {
        let mut node = Echo;
        let input = RuntimeData::text("s", 0, "hi");
        let out = node.process_streaming(input.clone()).await.unwrap();
        assert_eq!(out, vec![input]);
    }

    #[tokio::test]
    async fn default_flush_is_empty() {
        let mut node = Echo;
        assert!(node.flush().await.unwrap().is_empty());
    }
}
