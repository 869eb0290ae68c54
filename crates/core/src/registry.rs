//! Node type registry and factory (C5).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::data::{RuntimeData, RuntimeDataKind};
use crate::error::Error;
use crate::node::{NodeCapabilities, StreamingNode};

/// A factory closure: manifest config JSON in, boxed node out.
pub type NodeFactory = Arc<dyn Fn(&serde_json::Value) -> crate::Result<Box<dyn StreamingNode>> + Send + Sync>;

/// Maps `node_type` strings to factories. Built-ins are auto-registered by
/// [`StreamingNodeRegistry::with_builtins`]; callers register their own
/// node types with [`StreamingNodeRegistry::register`].
#[derive(Clone, Default)]
pub struct StreamingNodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl StreamingNodeRegistry {
    /// An empty registry with no node types registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("multiply", |config| Ok(Box::new(Multiply::from_config(config)?)));
        registry.register("add", |config| Ok(Box::new(Add::from_config(config)?)));
        registry.register("passthrough", |_config| Ok(Box::new(Passthrough)));
        registry
    }

    /// Register a node type under a single constructor signature: a
    /// closure from manifest config JSON to a boxed node. This is the one
    /// fallback path built-ins and user node types share; there is no
    /// per-node-type constructor pattern matching.
    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> crate::Result<Box<dyn StreamingNode>> + Send + Sync + 'static,
    {
        self.factories.insert(node_type.to_string(), Arc::new(factory));
    }

    /// Whether `node_type` is registered.
    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// All registered node type names.
    pub fn known_types(&self) -> std::collections::HashSet<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Build a node instance for `node_type` using `config`.
    pub fn build(&self, node_type: &str, config: &serde_json::Value) -> crate::Result<Box<dyn StreamingNode>> {
        let factory = self.factories.get(node_type).ok_or_else(|| {
            Error::validation(format!("no factory registered for node_type '{node_type}'"))
        })?;
        factory(config)
    }
}

fn numeric_operand(config: &serde_json::Value, key: &str, default: f64) -> crate::Result<f64> {
    match config.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| Error::validation(format!("'{key}' config value must be a number"))),
    }
}

fn apply_numeric(input: &RuntimeData, f: impl Fn(f64) -> f64) -> crate::Result<RuntimeData> {
    match &input.kind {
        RuntimeDataKind::Json(serde_json::Value::Number(n)) => {
            let value = n.as_f64().ok_or_else(|| Error::type_mismatch("non-finite number"))?;
            Ok(RuntimeData::json(
                input.session_id.clone(),
                input.timestamp,
                serde_json::json!(f(value)),
            ))
        }
        other => Err(Error::type_mismatch(format!(
            "expected a numeric Json value, found {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

#[remotemedia_core_derive::node_config]
struct MultiplyConfig {
    #[serde(default = "default_factor")]
    factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

/// Multiplies a numeric `Json` value by a configured `factor` (default 1).
struct Multiply {
    factor: f64,
}

impl Multiply {
    fn from_config(config: &serde_json::Value) -> crate::Result<Self> {
        let config = MultiplyConfig::from_manifest_config(config).map_err(Error::validation)?;
        Ok(Self { factor: config.factor })
    }
}

#[async_trait]
impl StreamingNode for Multiply {
    fn node_type(&self) -> &str {
        "multiply"
    }

    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            streaming: true,
            needs_gpu: false,
        }
    }

    async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
        Ok(vec![apply_numeric(&input, |v| v * self.factor)?])
    }
}

/// Adds a configured `amount` (default 0) to a numeric `Json` value.
struct Add {
    amount: f64,
}

impl Add {
    fn from_config(config: &serde_json::Value) -> crate::Result<Self> {
        Ok(Self {
            amount: numeric_operand(config, "amount", 0.0)?,
        })
    }
}

#[async_trait]
impl StreamingNode for Add {
    fn node_type(&self) -> &str {
        "add"
    }

    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            streaming: true,
            needs_gpu: false,
        }
    }

    async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
        Ok(vec![apply_numeric(&input, |v| v + self.amount)?])
    }
}

/// Returns its input unchanged. Useful as a pipeline source/sink stub in
/// tests and manifests.
struct Passthrough;

#[async_trait]
impl StreamingNode for Passthrough {
    fn node_type(&self) -> &str {
        "passthrough"
    }

    async fn process(&mut self, input: RuntimeData) -> crate::Result<Vec<RuntimeData>> {
        Ok(vec![input])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multiply_applies_configured_factor() {
        let registry = StreamingNodeRegistry::with_builtins();
        let mut node = registry.build("multiply", &serde_json::json!({"factor": 3})).unwrap();
        let input = RuntimeData::json("s", 0, serde_json::json!(2));
        let out = node.process(input).await.unwrap();
        assert_eq!(out[0].as_json().unwrap(), &serde_json::json!(6.0));
    }

    #[tokio::test]
    async fn add_defaults_amount_to_zero() {
        let registry = StreamingNodeRegistry::with_builtins();
        let mut node = registry.build("add", &serde_json::json!({})).unwrap();
        let input = RuntimeData::json("s", 0, serde_json::json!(5));
        let out = node.process(input).await.unwrap();
        assert_eq!(out[0].as_json().unwrap(), &serde_json::json!(5.0));
    }

    #[test]
    fn unknown_node_type_build_fails() {
        let registry = StreamingNodeRegistry::with_builtins();
        assert!(registry.build("nonexistent", &serde_json::json!({})).is_err());
    }

    #[test]
    fn known_types_include_builtins() {
        let registry = StreamingNodeRegistry::with_builtins();
        let known = registry.known_types();
        assert!(known.contains("multiply"));
        assert!(known.contains("add"));
        assert!(known.contains("passthrough"));
    }
}
