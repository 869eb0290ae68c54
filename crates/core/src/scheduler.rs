//! Scheduler/executor (C10) and the streaming execution contract (C11).
//!
//! A pipeline is driven by building its graph from a [`Manifest`], then
//! walking the topological order, feeding each node the outputs of its
//! declared predecessors (or the synthesized sequential wiring when a
//! manifest declares none). A cancellation flag is checked before every
//! node runs so a cancelled run stops promptly rather than draining the
//! rest of its input.
//!
//! Nodes whose manifest entry declares `capabilities.out_of_process` are not
//! built in-process at all: [`Scheduler::spawn_out_of_process_nodes`] hands
//! them to the process supervisor (C8), waits for each to clear the
//! readiness handshake (C9), and the drive loop bridges to them over their
//! SHM input/output channels (C2) instead of calling `process` directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio_stream::Stream;

use crate::channel::{self, ChannelPublisher, ChannelRegistry, ChannelSubscriber};
use crate::data::RuntimeData;
use crate::error::Error;
use crate::manifest::Manifest;
use crate::metrics::PipelineMetrics;
use crate::node::{InitPhase, StreamingNode};
use crate::process::{ProcessHandle, SpawnConfig, DEFAULT_READY_TIMEOUT};
use crate::progress::InitProgressTracker;
use crate::registry::StreamingNodeRegistry;
use crate::session::Session;

/// Default grace period between a cancellation request and a forced stop.
pub const CANCELLATION_GRACE: Duration = Duration::from_secs(10);

/// How long the drive loop waits for one reply frame from an out-of-process
/// node before treating the exchange as having produced no output.
const OUT_OF_PROCESS_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cooperative cancellation signal, checked before every node runs.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A node handed off to the process supervisor: its spawned handle plus the
/// publisher/subscriber pair the drive loop bridges data through.
struct OutOfProcessNode {
    process: ProcessHandle,
    input: ChannelPublisher,
    output: ChannelSubscriber,
}

/// A pipeline built from a validated manifest: nodes in topological order,
/// plus the edges feeding each one.
pub struct Scheduler {
    order: Vec<String>,
    nodes: HashMap<String, Box<dyn StreamingNode>>,
    out_of_process: HashMap<String, OutOfProcessNode>,
    incoming: HashMap<String, Vec<(String, String, String)>>, // node_id -> [(from, from_port, to_port)]
    sources: Vec<String>,
    metrics: Arc<PipelineMetrics>,
}

impl Scheduler {
    /// Build a scheduler from a manifest and a node registry. The manifest
    /// must already have passed [`Manifest::validate`]. Nodes marked
    /// `capabilities.out_of_process` are left unbuilt here; call
    /// [`Scheduler::spawn_out_of_process_nodes`] to supervise them before
    /// running the pipeline.
    pub fn build(manifest: &Manifest, registry: &StreamingNodeRegistry) -> crate::Result<Self> {
        let order = manifest.topological_order()?;

        let mut nodes = HashMap::new();
        for node in &manifest.nodes {
            if node.instance || node.out_of_process() {
                continue;
            }
            let instance = registry.build(&node.node_type, &node.params)?;
            nodes.insert(node.id.clone(), instance);
        }

        let connections = manifest.effective_connections();

        let mut incoming: HashMap<String, Vec<(String, String, String)>> = HashMap::new();
        for conn in &connections {
            incoming
                .entry(conn.to.clone())
                .or_default()
                .push((conn.from.clone(), conn.from_port.clone(), conn.to_port.clone()));
        }

        let targets: std::collections::HashSet<&str> = connections.iter().map(|c| c.to.as_str()).collect();
        let sources = manifest
            .nodes
            .iter()
            .filter(|n| !targets.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();

        Ok(Self {
            order,
            nodes,
            out_of_process: HashMap::new(),
            incoming,
            sources,
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    /// Metrics accumulated by this scheduler's runs.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Install an already-constructed instance for a node the manifest
    /// marked `instance: true` (bypassing the registry).
    pub fn install_instance(&mut self, node_id: &str, instance: Box<dyn StreamingNode>) {
        self.nodes.insert(node_id.to_string(), instance);
    }

    /// Spawn a worker process (C8) for every manifest node marked
    /// `capabilities.out_of_process`, register each with the init-progress
    /// tracker (C9), and block until all of them clear the readiness
    /// handshake. Opens one SHM input/output channel pair per such node
    /// (C2) and records them on `session`.
    pub async fn spawn_out_of_process_nodes(
        &mut self,
        manifest: &Manifest,
        session: &mut Session,
        worker_binary: &str,
        channels: &ChannelRegistry,
        progress: &InitProgressTracker,
        ready_timeout: Duration,
    ) -> crate::Result<()> {
        let session_id = session.id.clone();

        for node in &manifest.nodes {
            if !node.out_of_process() {
                continue;
            }

            progress.register_node(&session_id, &node.id).await;

            let input_name = channel::input_channel_name(&session_id, &node.id);
            let output_name = channel::output_channel_name(&session_id, &node.id);

            // Create the input publisher before spawning so the worker
            // never races to open a channel nobody has created yet.
            let input_pub = channels.publisher(&input_name)?;

            let spawn_config = SpawnConfig {
                worker_binary: worker_binary.to_string(),
                node_type: node.node_type.clone(),
                node_id: node.id.clone(),
                session_id: session_id.clone(),
                params: node.params.clone(),
                register_modules: Vec::new(),
                log_level: "info".to_string(),
            };

            progress.set_status(&session_id, &node.id, InitPhase::Starting, None).await;
            let mut handle = ProcessHandle::spawn(spawn_config)?;
            progress.set_status(&session_id, &node.id, InitPhase::Connecting, None).await;
            handle.wait_ready(channels, ready_timeout).await?;
            progress.set_status(&session_id, &node.id, InitPhase::Ready, None).await;

            let output_sub = channels.subscriber(&output_name)?;

            session.add_node(node.id.clone());
            session.add_channel(input_name);
            session.add_channel(output_name);

            self.out_of_process.insert(
                node.id.clone(),
                OutOfProcessNode {
                    process: handle,
                    input: input_pub,
                    output: output_sub,
                },
            );
        }

        Ok(())
    }

    /// Request graceful shutdown of every supervised out-of-process node,
    /// allowing `grace` for each to exit before it is killed.
    pub async fn shutdown_out_of_process_nodes(&mut self, channels: &ChannelRegistry, grace: Duration) {
        for (node_id, node) in self.out_of_process.iter_mut() {
            if let Err(e) = node.process.shutdown(channels, grace).await {
                tracing::warn!(node_id, "error shutting down worker: {e}");
            }
        }
    }

    /// Run one item through an out-of-process node: publish the framed
    /// bytes on its input channel, then wait up to
    /// [`OUT_OF_PROCESS_REPLY_TIMEOUT`] for a reply on its output channel.
    fn run_out_of_process(&self, node_id: &str, item: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
        let node = self
            .out_of_process
            .get(node_id)
            .ok_or_else(|| Error::validation(format!("node '{node_id}' has no supervised process")))?;

        let bytes = item.to_bytes()?;
        node.input.publish(&bytes)?;

        let mut produced = Vec::new();
        if let Some(reply) = node.output.receive_timeout(OUT_OF_PROCESS_REPLY_TIMEOUT)? {
            produced.push(RuntimeData::from_bytes(&reply)?);
        }
        Ok(produced)
    }

    async fn run_node(&mut self, node_id: &str, inputs: Vec<RuntimeData>) -> crate::Result<Vec<RuntimeData>> {
        let started = Instant::now();
        let messages_in = inputs.len() as u64;

        let result: crate::Result<Vec<RuntimeData>> = if self.out_of_process.contains_key(node_id) {
            let mut produced = Vec::new();
            let mut failure = None;
            for item in inputs {
                match self.run_out_of_process(node_id, item) {
                    Ok(mut items) => produced.append(&mut items),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(produced),
            }
        } else {
            let node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| Error::validation(format!("node '{node_id}' has no installed instance")))?;
            let mut produced = Vec::new();
            let mut failure = None;
            for item in inputs {
                match node.process(item).await {
                    Ok(mut items) => produced.append(&mut items),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(produced),
            }
        };

        match &result {
            Ok(produced) => self.metrics.record(node_id, messages_in, produced.len() as u64, started.elapsed(), false),
            Err(_) => self.metrics.record(node_id, messages_in, 0, started.elapsed(), true),
        }
        result
    }

    /// Run the pipeline once with a single input delivered to every source
    /// node, returning the outputs of terminal nodes (nodes nothing else
    /// consumes from) in topological order.
    pub async fn run_unary(&mut self, input: RuntimeData, token: CancellationToken) -> crate::Result<Vec<RuntimeData>> {
        let mut outputs: HashMap<String, Vec<RuntimeData>> = HashMap::new();

        let order = self.order.clone();
        for node_id in &order {
            if token.is_cancelled() {
                return Err(Error::timeout("pipeline run cancelled"));
            }

            let inputs: Vec<RuntimeData> = if self.sources.contains(node_id) {
                vec![input.clone()]
            } else {
                let mut gathered = Vec::new();
                if let Some(edges) = self.incoming.get(node_id) {
                    for (from, _from_port, _to_port) in edges.clone() {
                        if let Some(produced) = outputs.get(&from) {
                            gathered.extend(produced.iter().cloned());
                        }
                    }
                }
                gathered
            };

            let produced = self.run_node(node_id, inputs).await.map_err(|e| e.with_node(node_id.clone()))?;
            outputs.insert(node_id.clone(), produced);
        }

        let consumed: std::collections::HashSet<&str> =
            self.incoming.values().flatten().map(|(from, _, _)| from.as_str()).collect();
        let mut terminal = Vec::new();
        for node_id in &order {
            if !consumed.contains(node_id.as_str()) {
                if let Some(items) = outputs.get(node_id) {
                    terminal.extend(items.iter().cloned());
                }
            }
        }
        Ok(terminal)
    }

    /// Stream a sequence of inputs through the pipeline, flushing every
    /// in-process node at end-of-input. Each item runs through the full
    /// graph via [`Scheduler::run_unary`] before the next is pulled, so a
    /// fan-in node observes inputs in the arrival order of the stream.
    ///
    /// Accepts any [`Stream`] of inputs, not just an `mpsc::Receiver` --
    /// callers wire a channel in with [`tokio_stream::wrappers::ReceiverStream`].
    pub async fn run_streaming(
        &mut self,
        inputs: impl Stream<Item = RuntimeData> + Unpin,
        token: CancellationToken,
    ) -> crate::Result<Vec<RuntimeData>> {
        let mut collected = Vec::new();
        let mut inputs = std::pin::pin!(inputs);

        while let Some(item) = inputs.next().await {
            if token.is_cancelled() {
                return Err(Error::timeout("streaming run cancelled"));
            }
            let out = self.run_unary(item, token.clone()).await?;
            collected.extend(out);
        }

        let order = self.order.clone();
        for node_id in &order {
            if let Some(node) = self.nodes.get_mut(node_id) {
                let started = Instant::now();
                match node.flush().await {
                    Ok(items) => {
                        self.metrics.record(node_id, 0, items.len() as u64, started.elapsed(), false);
                        collected.extend(items);
                    }
                    Err(e) => {
                        self.metrics.record(node_id, 0, 0, started.elapsed(), true);
                        return Err(e.with_node(node_id.clone()));
                    }
                }
            }
        }

        Ok(collected)
    }
}

/// Default timeout the scheduler waits for an out-of-process node's
/// readiness handshake, re-exported for callers building their own
/// `spawn_out_of_process_nodes` call.
pub fn default_ready_timeout() -> Duration {
    DEFAULT_READY_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manifest::Manifest;

    fn linear_manifest() -> Manifest {
        Manifest::from_json(
            r#"{
                "version": "v1",
                "metadata": {"name": "linear"},
                "nodes": [
                    {"id": "m", "node_type": "multiply", "params": {"factor": 2}},
                    {"id": "a", "node_type": "add", "params": {"amount": 1}}
                ],
                "connections": [{"from": "m", "to": "a"}]
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn run_unary_multiply_then_add() {
        let manifest = linear_manifest();
        let registry = StreamingNodeRegistry::with_builtins();
        let mut scheduler = Scheduler::build(&manifest, &registry).unwrap();
        let input = RuntimeData::json("s", 0, serde_json::json!(5));
        let out = scheduler.run_unary(input, CancellationToken::new()).await.unwrap();
        assert_eq!(out[0].as_json().unwrap(), &serde_json::json!(11.0));
    }

    #[tokio::test]
    async fn implicit_sequential_wiring_runs_without_declared_connections() {
        let manifest: Manifest = Manifest::from_json(
            r#"{
                "version": "v1",
                "metadata": {"name": "implicit"},
                "nodes": [
                    {"id": "m", "node_type": "multiply", "params": {"factor": 2}},
                    {"id": "a", "node_type": "add", "params": {"amount": 10}}
                ],
                "connections": []
            }"#,
        )
        .unwrap();
        let registry = StreamingNodeRegistry::with_builtins();
        manifest.validate(&registry.known_types()).unwrap();
        let mut scheduler = Scheduler::build(&manifest, &registry).unwrap();
        let input = RuntimeData::json("s", 0, serde_json::json!(1));
        let out = scheduler.run_unary(input, CancellationToken::new()).await.unwrap();
        assert_eq!(out[0].as_json().unwrap(), &serde_json::json!(12.0));
    }

    #[tokio::test]
    async fn metrics_recorded_per_node() {
        let manifest = linear_manifest();
        let registry = StreamingNodeRegistry::with_builtins();
        let mut scheduler = Scheduler::build(&manifest, &registry).unwrap();
        let input = RuntimeData::json("s", 0, serde_json::json!(1));
        scheduler.run_unary(input, CancellationToken::new()).await.unwrap();
        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.per_node["m"].messages_in, 1);
        assert_eq!(snapshot.per_node["a"].messages_in, 1);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_processing() {
        let manifest = linear_manifest();
        let registry = StreamingNodeRegistry::with_builtins();
        let mut scheduler = Scheduler::build(&manifest, &registry).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let input = RuntimeData::json("s", 0, serde_json::json!(1));
        let err = scheduler.run_unary(input, token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn streaming_run_flushes_and_collects_all_outputs() {
        let manifest = linear_manifest();
        let registry = StreamingNodeRegistry::with_builtins();
        let mut scheduler = Scheduler::build(&manifest, &registry).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(RuntimeData::json("s", 0, serde_json::json!(1))).await.unwrap();
        tx.send(RuntimeData::json("s", 1, serde_json::json!(2))).await.unwrap();
        drop(tx);

        let rx = tokio_stream::wrappers::ReceiverStream::new(rx);
        let out = scheduler.run_streaming(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_json().unwrap(), &serde_json::json!(3.0));
        assert_eq!(out[1].as_json().unwrap(), &serde_json::json!(5.0));
    }
}
