//! Registry of node config struct schemas (C5 introspection).
//!
//! `#[remotemedia_core_derive::node_config]` submits one
//! [`NodeConfigDescriptor`] per annotated struct via `inventory::submit!`, so
//! a host can list every built-in node's config schema without constructing
//! an instance first.

/// One node config struct's identity and JSON schema, collected from every
/// `#[node_config]`-annotated struct linked into the binary.
pub struct NodeConfigDescriptor {
    /// The struct's name, as written in source.
    pub name: &'static str,
    /// Produces the struct's JSON schema on demand; schemars builds this
    /// lazily since `RootSchema` isn't const-constructible.
    pub schema_fn: fn() -> schemars::schema::RootSchema,
}

inventory::collect!(NodeConfigDescriptor);

/// Every node config struct registered in this binary.
pub fn all_node_configs() -> impl Iterator<Item = &'static NodeConfigDescriptor> {
    inventory::iter::<NodeConfigDescriptor>.into_iter()
}
