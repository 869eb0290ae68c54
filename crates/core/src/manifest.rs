//! Pipeline manifest model and validation (C4).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Error;

fn default_out_port() -> String {
    "out".to_string()
}

fn default_in_port() -> String {
    "in".to_string()
}

/// Manifest metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Declared node capabilities (spec §3): `{ streaming, needs_gpu, ... }`. The
/// `...` is this crate's `out_of_process` extension, letting a manifest ask
/// the scheduler to run a node as a supervised worker process (C8) rather
/// than in-process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeManifestCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub needs_gpu: bool,
    #[serde(default)]
    pub out_of_process: bool,
}

/// A single node entry in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeManifest {
    pub id: String,
    pub node_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub capabilities: Option<NodeManifestCapabilities>,
    /// True when this node is supplied as a live instance at execution time
    /// rather than constructed from the registry (spec §6, instance bypass).
    #[serde(default)]
    pub instance: bool,
}

impl NodeManifest {
    /// Whether this node should run as a supervised worker process (C8)
    /// instead of in-process.
    pub fn out_of_process(&self) -> bool {
        self.capabilities.map(|c| c.out_of_process).unwrap_or(false)
    }
}

/// A directed edge between two nodes' ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(default = "default_out_port")]
    pub from_port: String,
    #[serde(default = "default_in_port")]
    pub to_port: String,
}

/// The current manifest dialect. Unknown versions are rejected; new
/// versions are additive (Design Notes §9).
pub const MANIFEST_VERSION: &str = "v1";

/// The v1 pipeline manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub metadata: ManifestMetadata,
    pub nodes: Vec<NodeManifest>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Manifest {
    /// Parse a manifest from JSON.
    pub fn from_json(s: &str) -> crate::Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::validation(format!("invalid manifest json: {e}")))
    }

    /// Parse a manifest from YAML.
    pub fn from_yaml(s: &str) -> crate::Result<Self> {
        serde_yaml::from_str(s).map_err(|e| Error::validation(format!("invalid manifest yaml: {e}")))
    }

    /// Parse a manifest from TOML.
    pub fn from_toml(s: &str) -> crate::Result<Self> {
        toml::from_str(s).map_err(|e| Error::validation(format!("invalid manifest toml: {e}")))
    }

    /// The connections to wire the graph with: the declared `connections`
    /// list if non-empty, otherwise a sequential chain synthesized from
    /// `nodes` in list order (spec §3: "absence of explicit connections on a
    /// node list implies sequential wiring in list order"). The declared
    /// `connections` field itself is never mutated, so round-tripping a
    /// manifest with no connections stays byte-stable.
    pub fn effective_connections(&self) -> Vec<Connection> {
        if !self.connections.is_empty() || self.nodes.len() < 2 {
            return self.connections.clone();
        }
        self.nodes
            .windows(2)
            .map(|pair| Connection {
                from: pair[0].id.clone(),
                to: pair[1].id.clone(),
                from_port: default_out_port(),
                to_port: default_in_port(),
            })
            .collect()
    }

    /// Validate structural invariants: unique ids, no dangling connection
    /// refs, known node types, no cycles, every non-source node has at
    /// least one input.
    pub fn validate(&self, known_node_types: &HashSet<&str>) -> crate::Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(Error::validation(format!("unsupported manifest version '{}'", self.version)));
        }

        if self.nodes.is_empty() {
            return Err(Error::validation("manifest must declare at least one node"));
        }

        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(Error::validation(format!("duplicate node id '{}'", node.id)));
            }
            if !node.instance && !known_node_types.contains(node.node_type.as_str()) {
                return Err(Error::validation(format!(
                    "unknown node_type '{}' for node '{}'",
                    node.node_type, node.id
                )));
            }
        }

        let connections = self.effective_connections();

        for conn in &connections {
            if !seen_ids.contains(conn.from.as_str()) {
                return Err(Error::validation(format!("connection references unknown node '{}'", conn.from)));
            }
            if !seen_ids.contains(conn.to.as_str()) {
                return Err(Error::validation(format!("connection references unknown node '{}'", conn.to)));
            }
        }

        self.check_acyclic(&connections)?;

        let mut has_input: HashMap<&str, bool> = self.nodes.iter().map(|n| (n.id.as_str(), false)).collect();
        for conn in &connections {
            has_input.insert(conn.to.as_str(), true);
        }
        let has_any_connection = !connections.is_empty();
        if has_any_connection {
            for node in &self.nodes {
                let is_source = !has_input.get(node.id.as_str()).copied().unwrap_or(false);
                let receives_nothing = !has_input[node.id.as_str()];
                let is_target_anywhere = connections.iter().any(|c| c.to == node.id);
                let is_source_anywhere = connections.iter().any(|c| c.from == node.id);
                if receives_nothing && !is_target_anywhere && !is_source_anywhere && self.nodes.len() > 1 {
                    return Err(Error::validation(format!("node '{}' is disconnected from the pipeline", node.id)));
                }
                let _ = is_source;
            }
        }

        Ok(())
    }

    fn check_acyclic(&self, connections: &[Connection]) -> crate::Result<()> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in connections {
            adjacency.entry(conn.from.as_str()).or_default().push(conn.to.as_str());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = self.nodes.iter().map(|n| (n.id.as_str(), Mark::Unvisited)).collect();

        fn visit<'a>(
            node: &'a str,
            adjacency: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> crate::Result<()> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(Error::validation(format!("cycle detected at node '{node}'")))
                }
                _ => {}
            }
            marks.insert(node, Mark::InProgress);
            if let Some(next) = adjacency.get(node) {
                for &n in next {
                    visit(n, adjacency, marks)?;
                }
            }
            marks.insert(node, Mark::Done);
            Ok(())
        }

        let ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for id in ids {
            visit(id, &adjacency, &mut marks)?;
        }
        Ok(())
    }

    /// Topologically sorted node ids. Assumes `validate` already passed.
    pub fn topological_order(&self) -> crate::Result<Vec<String>> {
        let connections = self.effective_connections();
        let mut in_degree: HashMap<&str, usize> = self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in &connections {
            *in_degree.entry(conn.to.as_str()).or_insert(0) += 1;
            adjacency.entry(conn.from.as_str()).or_default().push(conn.to.as_str());
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        queue.sort_unstable();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop() {
            order.push(id.to_string());
            if let Some(next) = adjacency.get(id) {
                let mut newly_free = Vec::new();
                for &n in next {
                    let deg = in_degree.get_mut(n).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_free.push(n);
                    }
                }
                newly_free.sort_unstable();
                queue.extend(newly_free);
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::validation("manifest graph contains a cycle"));
        }
        Ok(order)
    }
}
