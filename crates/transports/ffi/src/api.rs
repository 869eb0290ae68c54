//! Plain-Rust implementations of the three `execute_pipeline*` entry points
//! (C12). A [`PipelineSource`] picks between the manifest path (builds a
//! [`remotemedia_core::Scheduler`] graph) and the instance-bypass path
//! (drives a flat chain of already-constructed or registry-built nodes);
//! binding layers decide which variant to construct from whatever shape
//! their host language handed them. When `enable_metrics` is set, the result
//! carries a metrics snapshot alongside the outputs.

use std::time::Instant;

use serde::Serialize;

use remotemedia_core::error::Error;
use remotemedia_core::instance::{build_mixed_list, is_pure_instance_list, MixedListEntry};
use remotemedia_core::manifest::Manifest;
use remotemedia_core::metrics::{MetricsSnapshot, PipelineMetrics};
use remotemedia_core::registry::StreamingNodeRegistry;
use remotemedia_core::scheduler::{CancellationToken, Scheduler};
use remotemedia_core::RuntimeData;

/// The result of any `execute_pipeline*` call.
#[derive(Serialize)]
pub struct ExecuteOutcome {
    pub outputs: Vec<RuntimeDataJson>,
    pub metrics: Option<MetricsSnapshot>,
}

/// A host-facing, JSON-friendly projection of [`RuntimeData`]. Binding
/// layers convert this into their native value type (bytes, a dict, a numpy
/// array, ...).
#[derive(Serialize)]
pub struct RuntimeDataJson {
    pub session_id: String,
    pub timestamp: i64,
    pub kind: String,
    pub text: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
}

impl From<RuntimeData> for RuntimeDataJson {
    fn from(data: RuntimeData) -> Self {
        use remotemedia_core::RuntimeDataKind::*;
        let session_id = data.session_id.clone();
        let timestamp = data.timestamp;
        match data.kind {
            Text(text) => Self {
                session_id,
                timestamp,
                kind: "text".into(),
                text: Some(text),
                binary: None,
                json: None,
            },
            Binary(bytes) => Self {
                session_id,
                timestamp,
                kind: "binary".into(),
                text: None,
                binary: Some(bytes),
                json: None,
            },
            Json(value) => Self {
                session_id,
                timestamp,
                kind: "json".into(),
                text: None,
                binary: None,
                json: Some(value),
            },
            Audio(_) | Numpy(_) | Video(_) => Self {
                session_id,
                timestamp,
                kind: "binary".into(),
                text: None,
                binary: None,
                json: None,
            },
        }
    }
}

/// What a host handed the FFI boundary: a manifest to build from the
/// registry, or a (possibly mixed) list of instances/`{node_type, params}`
/// entries to run as a flat chain, bypassing the registry where the host
/// already holds a live node.
pub enum PipelineSource {
    Manifest(String),
    Instances(Vec<MixedListEntry>),
}

/// Execute a pipeline with no input (every source node runs with a null JSON
/// placeholder). Used for pipelines whose sources are self-driving (e.g.
/// they read from a file node).
pub async fn execute_pipeline(source: PipelineSource, enable_metrics: bool) -> remotemedia_core::Result<ExecuteOutcome> {
    execute_pipeline_with_input(
        source,
        vec![RuntimeData::json("default", 0, serde_json::Value::Null)],
        enable_metrics,
    )
    .await
}

/// Execute a pipeline once per entry in `inputs`, in order. `inputs` must be
/// non-empty.
pub async fn execute_pipeline_with_input(
    source: PipelineSource,
    inputs: Vec<RuntimeData>,
    enable_metrics: bool,
) -> remotemedia_core::Result<ExecuteOutcome> {
    if inputs.is_empty() {
        return Err(Error::validation("execute_pipeline_with_input requires a non-empty list of inputs"));
    }
    match source {
        PipelineSource::Manifest(manifest_json) => run_manifest(&manifest_json, inputs, enable_metrics).await,
        PipelineSource::Instances(entries) => run_instances(entries, inputs, enable_metrics).await,
    }
}

async fn run_manifest(manifest_json: &str, inputs: Vec<RuntimeData>, enable_metrics: bool) -> remotemedia_core::Result<ExecuteOutcome> {
    let manifest = Manifest::from_json(manifest_json)?;
    let registry = StreamingNodeRegistry::with_builtins();
    manifest.validate(&registry.known_types())?;

    tracing::debug!(nodes = manifest.nodes.len(), inputs = inputs.len(), "running manifest pipeline");
    let mut scheduler = Scheduler::build(&manifest, &registry)?;
    let stream = futures::stream::iter(inputs);
    let outputs = scheduler.run_streaming(stream, CancellationToken::new()).await?;

    Ok(ExecuteOutcome {
        outputs: outputs.into_iter().map(RuntimeDataJson::from).collect(),
        metrics: enable_metrics.then(|| scheduler.metrics().snapshot()),
    })
}

/// The raw instance path (C12): runs `entries` as a flat chain, bypassing
/// the registry for any entry that's already a live instance and building
/// the rest from it. Exposed directly so a host that only ever deals in
/// instances (never a manifest) can skip [`PipelineSource`].
pub async fn execute_pipeline_with_instances(
    entries: Vec<MixedListEntry>,
    initial_input: Option<RuntimeData>,
    enable_metrics: bool,
) -> remotemedia_core::Result<ExecuteOutcome> {
    let inputs = vec![initial_input.unwrap_or_else(|| RuntimeData::json("default", 0, serde_json::Value::Null))];
    run_instances(entries, inputs, enable_metrics).await
}

async fn run_instances(entries: Vec<MixedListEntry>, inputs: Vec<RuntimeData>, enable_metrics: bool) -> remotemedia_core::Result<ExecuteOutcome> {
    if entries.is_empty() {
        return Err(Error::validation("execute_pipeline_with_instances requires at least one instance"));
    }

    let mut nodes = if is_pure_instance_list(&entries) {
        entries
            .into_iter()
            .map(|entry| match entry {
                MixedListEntry::Instance(node) => node,
                MixedListEntry::Manifest { .. } => unreachable!("is_pure_instance_list guarantees no Manifest entries"),
            })
            .collect()
    } else {
        let registry = StreamingNodeRegistry::with_builtins();
        build_mixed_list(entries, &registry)?
    };

    for node in nodes.iter_mut() {
        node.initialize().await?;
    }

    tracing::debug!(nodes = nodes.len(), inputs = inputs.len(), "running instance chain");
    let metrics = PipelineMetrics::new();
    let mut collected = Vec::new();
    let mut run_error = None;

    'inputs: for input in inputs {
        let mut current = vec![input];
        for (index, node) in nodes.iter_mut().enumerate() {
            let node_id = format!("node-{index}");
            let started = Instant::now();
            let mut next = Vec::new();
            for item in current {
                match node.process(item).await {
                    Ok(mut out) => next.append(&mut out),
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, "instance chain node failed: {e}");
                        metrics.record(&node_id, 1, 0, started.elapsed(), true);
                        run_error = Some(e.with_node(node_id));
                        break 'inputs;
                    }
                }
            }
            metrics.record(&node_id, 1, next.len() as u64, started.elapsed(), false);
            current = next;
        }
        collected.extend(current);
    }

    for node in nodes.iter_mut() {
        let _ = node.cleanup().await;
    }

    if let Some(e) = run_error {
        return Err(e);
    }

    Ok(ExecuteOutcome {
        outputs: collected.into_iter().map(RuntimeDataJson::from).collect(),
        metrics: enable_metrics.then(|| metrics.snapshot()),
    })
}

/// The semver of this crate, for a binding layer's version-compat checks.
pub fn get_runtime_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Whether the multiprocess (shared-memory) transport is compiled into
/// `remotemedia-core`. Always `true`: this crate depends on
/// `remotemedia-core` with the `multiprocess` feature enabled.
pub fn is_available() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotemedia_core::node::StreamingNode;

    #[test]
    fn test_version() {
        assert!(!get_runtime_version().is_empty());
    }

    fn linear_manifest() -> String {
        r#"{
            "version": "v1",
            "metadata": {"name": "t"},
            "nodes": [
                {"id": "m", "node_type": "multiply", "params": {"factor": 2}}
            ],
            "connections": []
        }"#
        .to_string()
    }

    #[tokio::test]
    async fn execute_pipeline_with_input_runs_linear_manifest() {
        let input = RuntimeData::json("s", 0, serde_json::json!(4));
        let outcome = execute_pipeline_with_input(PipelineSource::Manifest(linear_manifest()), vec![input], true)
            .await
            .unwrap();
        assert_eq!(outcome.outputs.len(), 1);
        assert!(outcome.metrics.is_some());
    }

    #[tokio::test]
    async fn execute_pipeline_with_input_rejects_empty_input_list() {
        let err = execute_pipeline_with_input(PipelineSource::Manifest(linear_manifest()), vec![], true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, remotemedia_core::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn execute_pipeline_with_input_runs_once_per_input() {
        let inputs = vec![RuntimeData::json("s", 0, serde_json::json!(1)), RuntimeData::json("s", 1, serde_json::json!(2))];
        let outcome = execute_pipeline_with_input(PipelineSource::Manifest(linear_manifest()), inputs, false)
            .await
            .unwrap();
        assert_eq!(outcome.outputs.len(), 2);
    }

    #[tokio::test]
    async fn execute_pipeline_with_instances_requires_at_least_one() {
        let err = execute_pipeline_with_instances(vec![], None, false).await.unwrap_err();
        assert_eq!(err.kind, remotemedia_core::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn execute_pipeline_with_instances_builds_manifest_entries_from_the_registry() {
        let entries = vec![MixedListEntry::Manifest {
            node_type: "multiply".into(),
            params: serde_json::json!({"factor": 3}),
        }];
        let input = RuntimeData::json("s", 0, serde_json::json!(2));
        let outcome = execute_pipeline_with_instances(entries, Some(input), true).await.unwrap();
        assert_eq!(outcome.outputs.len(), 1);
        assert!(outcome.metrics.unwrap().per_node.contains_key("node-0"));
    }

    struct PassThrough;

    #[async_trait::async_trait]
    impl StreamingNode for PassThrough {
        fn node_type(&self) -> &str {
            "pass-through"
        }

        async fn process(&mut self, input: RuntimeData) -> remotemedia_core::Result<Vec<RuntimeData>> {
            Ok(vec![input])
        }
    }

    #[tokio::test]
    async fn execute_pipeline_with_instances_runs_a_live_instance_directly() {
        let entries = vec![MixedListEntry::Instance(Box::new(PassThrough))];
        let outcome = execute_pipeline_with_instances(entries, None, false).await.unwrap();
        assert_eq!(outcome.outputs.len(), 1);
    }
}
