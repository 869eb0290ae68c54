//! Instance-bypass execution (C7): running a live node instance the caller
//! already constructed, instead of building one from the registry by
//! `node_type`.
//!
//! Instances cross the host/worker boundary serialized. `serialize_for_ipc`
//! runs a pre-send `cleanup()` pass (so sockets, file handles and similar
//! non-serializable resources are released before the bytes are produced)
//! then calls the pluggable [`InstanceSerializer`]. On the receiving side,
//! `deserialize_from_ipc` restores the bytes and calls `initialize()`
//! exactly once; state then persists for the life of the stream.

use crate::data::RuntimeData;
use crate::error::Error;
use crate::node::StreamingNode;
use crate::registry::StreamingNodeRegistry;

/// Default cap on a single serialized instance payload.
pub const DEFAULT_MAX_SERIALIZED_BYTES: usize = 100 * 1024 * 1024;

/// Pluggable wire format for instance state. [`PassthroughSerializer`] is the
/// default; [`BincodeSerializer`] is available for transports that want a
/// self-describing envelope instead.
pub trait InstanceSerializer: Send + Sync {
    fn encode(&self, state: &[u8]) -> crate::Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> crate::Result<Vec<u8>>;
}

/// The default serializer: state bytes pass through unchanged, since
/// `StreamingNode::state_for_serialization` already returns an
/// implementation-defined encoded blob.
pub struct PassthroughSerializer;

impl InstanceSerializer for PassthroughSerializer {
    fn encode(&self, state: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(state.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Wraps the state bytes in a `bincode`-encoded envelope, so transport that
/// prefer a self-describing frame over a raw byte passthrough can round-trip
/// instance state without assuming anything about what `state_for_serialization`
/// produced.
pub struct BincodeSerializer;

impl InstanceSerializer for BincodeSerializer {
    fn encode(&self, state: &[u8]) -> crate::Result<Vec<u8>> {
        bincode::serialize(&state.to_vec())
            .map_err(|e| Error::serialization("bincode", format!("encode failed: {e}"), "check that the node's serialized state is valid bytes"))
    }

    fn decode(&self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        bincode::deserialize::<Vec<u8>>(bytes)
            .map_err(|e| Error::serialization("bincode", format!("decode failed: {e}"), "check that the bytes came from BincodeSerializer::encode"))
    }
}

/// Serialize a node instance's state for IPC transfer, running `cleanup()`
/// first and enforcing a size limit.
///
/// The `node_name` is used purely for diagnostics in the resulting error;
/// it need not match any registry `node_type`.
pub async fn serialize_for_ipc(
    node_name: &str,
    node: &mut dyn StreamingNode,
    serializer: &dyn InstanceSerializer,
    max_bytes: usize,
) -> crate::Result<Vec<u8>> {
    node.cleanup().await?;

    let state = node.state_for_serialization()?.ok_or_else(|| {
        Error::serialization(
            node_name,
            "node has no serializable state (state_for_serialization returned None)",
            "implement state_for_serialization/restore_from_state to carry instance state across the IPC boundary, or run this node by node_type instead of by instance",
        )
    })?;

    let encoded = serializer.encode(&state)?;
    if encoded.len() > max_bytes {
        return Err(Error::serialization(
            node_name,
            format!("serialized size {} exceeds limit {}", encoded.len(), max_bytes),
            "reduce the instance's retained state, or raise the serialization size limit",
        ));
    }
    Ok(encoded)
}

/// Restore a node instance from bytes produced by `serialize_for_ipc`, then
/// call `initialize()` exactly once.
pub async fn deserialize_from_ipc(
    node_name: &str,
    node: &mut dyn StreamingNode,
    bytes: &[u8],
    serializer: &dyn InstanceSerializer,
) -> crate::Result<()> {
    let state = serializer.decode(bytes)?;
    node.restore_from_state(&state).map_err(|e| {
        Error::serialization(node_name, format!("failed to restore state: {e}"), "ensure the receiving worker registers the same node type the state was captured from")
    })?;
    node.initialize().await?;
    Ok(())
}

/// One entry in a mixed list of instances and manifest-style node
/// definitions passed to `execute_pipeline_with_instances` (C12). A
/// transport builds these from whatever its host list element turned out to
/// be: a live node it already holds, or a `{node_type, params}` dict to
/// construct from the registry.
pub enum MixedListEntry {
    /// A live node instance, bypassing the registry.
    Instance(Box<dyn StreamingNode>),
    /// A `{node_type, params}` dict to build from the registry.
    Manifest { node_type: String, params: serde_json::Value },
}

impl MixedListEntry {
    /// Interpret a JSON value as a manifest-style entry
    /// (`{"node_type": ..., "params": ...}`). Live instances never pass
    /// through this path; they're constructed directly as
    /// `MixedListEntry::Instance` by whatever transport holds them.
    pub fn manifest_from_json(value: &serde_json::Value) -> crate::Result<Self> {
        let node_type = value
            .get("node_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::type_mismatch("entry is neither a node instance nor a {node_type, params} object"))?;
        let params = value.get("params").cloned().unwrap_or(serde_json::Value::Null);
        Ok(Self::Manifest {
            node_type: node_type.to_string(),
            params,
        })
    }
}

/// Whether every entry in a mixed list is a live instance, letting a caller
/// take a fast path that skips the registry entirely.
pub fn is_pure_instance_list(entries: &[MixedListEntry]) -> bool {
    entries.iter().all(|e| matches!(e, MixedListEntry::Instance(_)))
}

/// Build live node instances for a mixed list, in order: instances pass
/// through unchanged, manifest entries are constructed from `registry`.
/// Errors are attributed to the offending position so a caller can report
/// which entry in the list failed.
pub fn build_mixed_list(
    entries: Vec<MixedListEntry>,
    registry: &StreamingNodeRegistry,
) -> crate::Result<Vec<Box<dyn StreamingNode>>> {
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            MixedListEntry::Instance(node) => Ok(node),
            MixedListEntry::Manifest { node_type, params } => registry
                .build(&node_type, &params)
                .map_err(|e| e.with_node(format!("position {index} ({node_type})"))),
        })
        .collect()
}

/// One unit of work processed through an instance list: input flows into
/// the first entry and each entry's output feeds the next, implementing the
/// same "no declared connections means sequential wiring in list order"
/// rule a manifest's node list follows.
pub async fn run_instance_chain(
    nodes: &mut [Box<dyn StreamingNode>],
    input: RuntimeData,
) -> crate::Result<Vec<RuntimeData>> {
    let mut current = vec![input];
    for node in nodes.iter_mut() {
        let mut next = Vec::new();
        for item in current {
            next.extend(node.process(item).await?);
        }
        current = next;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Counter {
        count: u64,
    }

    #[async_trait]
    impl StreamingNode for Counter {
        fn node_type(&self) -> &str {
            "counter"
        }

        async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
            self.count += 1;
            Ok(vec![input])
        }

        fn state_for_serialization(&self) -> crate::Result<Option<Vec<u8>>> {
            Ok(Some(self.count.to_le_bytes().to_vec()))
        }

        fn restore_from_state(&mut self, state: &[u8]) -> crate::Result<()> {
            self.count = u64::from_le_bytes(state.try_into().unwrap());
            Ok(())
        }
    }

    struct NotSerializable;

    #[async_trait]
    impl StreamingNode for NotSerializable {
        fn node_type(&self) -> &str {
            "not-serializable"
        }

        async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
            Ok(vec![input])
        }
    }

    #[tokio::test]
    async fn serialize_then_deserialize_preserves_state() {
        let mut node = Counter { count: 3 };
        let bytes = serialize_for_ipc("counter-1", &mut node, &PassthroughSerializer, DEFAULT_MAX_SERIALIZED_BYTES)
            .await
            .unwrap();

        let mut restored = Counter { count: 0 };
        deserialize_from_ipc("counter-1", &mut restored, &bytes, &PassthroughSerializer)
            .await
            .unwrap();
        assert_eq!(restored.count, 3);
    }

    #[tokio::test]
    async fn serialize_rejects_node_with_no_state_hook() {
        let mut node = NotSerializable;
        let err = serialize_for_ipc("ns", &mut node, &PassthroughSerializer, DEFAULT_MAX_SERIALIZED_BYTES)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SerializationError);
        assert!(err.suggestion.is_some());
        assert_eq!(err.node_id.as_deref(), Some("ns"));
    }

    #[tokio::test]
    async fn serialize_rejects_oversized_state() {
        let mut node = Counter { count: 1 };
        let err = serialize_for_ipc("counter-1", &mut node, &PassthroughSerializer, 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::SerializationError);
    }

    #[tokio::test]
    async fn bincode_serializer_preserves_state_across_the_envelope() {
        let mut node = Counter { count: 7 };
        let bytes = serialize_for_ipc("counter-1", &mut node, &BincodeSerializer, DEFAULT_MAX_SERIALIZED_BYTES)
            .await
            .unwrap();

        let mut restored = Counter { count: 0 };
        deserialize_from_ipc("counter-1", &mut restored, &bytes, &BincodeSerializer)
            .await
            .unwrap();
        assert_eq!(restored.count, 7);
    }

    #[test]
    fn manifest_from_json_rejects_non_manifest_values() {
        let err = MixedListEntry::manifest_from_json(&serde_json::json!("not-an-object")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TypeMismatch);
    }

    #[test]
    fn manifest_from_json_accepts_node_type_and_params() {
        let entry = MixedListEntry::manifest_from_json(&serde_json::json!({"node_type": "multiply", "params": {"factor": 2}})).unwrap();
        match entry {
            MixedListEntry::Manifest { node_type, params } => {
                assert_eq!(node_type, "multiply");
                assert_eq!(params, serde_json::json!({"factor": 2}));
            }
            MixedListEntry::Instance(_) => panic!("expected Manifest entry"),
        }
    }

    #[test]
    fn pure_instance_list_detected() {
        let entries = vec![
            MixedListEntry::Instance(Box::new(Counter { count: 0 })),
            MixedListEntry::Instance(Box::new(NotSerializable)),
        ];
        assert!(is_pure_instance_list(&entries));

        let mixed = vec![
            MixedListEntry::Instance(Box::new(Counter { count: 0 })),
            MixedListEntry::Manifest {
                node_type: "multiply".into(),
                params: serde_json::json!({}),
            },
        ];
        assert!(!is_pure_instance_list(&mixed));
    }

    #[test]
    fn build_mixed_list_builds_manifest_entries_and_keeps_instances() {
        let registry = StreamingNodeRegistry::with_builtins();
        let entries = vec![
            MixedListEntry::Instance(Box::new(Counter { count: 5 })),
            MixedListEntry::Manifest {
                node_type: "multiply".into(),
                params: serde_json::json!({"factor": 2}),
            },
        ];
        let built = build_mixed_list(entries, &registry).unwrap();
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].node_type(), "counter");
        assert_eq!(built[1].node_type(), "multiply");
    }

    #[test]
    fn build_mixed_list_attributes_errors_to_position() {
        let registry = StreamingNodeRegistry::with_builtins();
        let entries = vec![
            MixedListEntry::Manifest {
                node_type: "multiply".into(),
                params: serde_json::json!({"factor": 2}),
            },
            MixedListEntry::Manifest {
                node_type: "nonexistent".into(),
                params: serde_json::json!({}),
            },
        ];
        let err = build_mixed_list(entries, &registry).unwrap_err();
        assert_eq!(err.node_id.as_deref(), Some("position 1 (nonexistent)"));
    }

    #[tokio::test]
    async fn instance_chain_feeds_first_output_into_next_node() {
        let mut nodes: Vec<Box<dyn StreamingNode>> = vec![Box::new(Counter { count: 0 }), Box::new(Counter { count: 0 })];
        let input = RuntimeData::text("s", 0, "x");
        let out = run_instance_chain(&mut nodes, input.clone()).await.unwrap();
        assert_eq!(out, vec![input]);
    }
}
