//! Host-facing `execute_pipeline*` boundary (C12).
//!
//! This crate is the thin seam a language binding (Python, Node, etc.)
//! builds its own binding layer on top of; it exposes plain async Rust
//! entry points and carries no PyO3/napi code itself.

mod api;

pub use api::{
    execute_pipeline, execute_pipeline_with_input, execute_pipeline_with_instances, get_runtime_version,
    is_available, ExecuteOutcome, PipelineSource, RuntimeDataJson,
};
