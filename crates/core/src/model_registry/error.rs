//! Model registry error conversions.

use crate::error::Error;

/// Wrap a loader failure as `ErrorKind::InitFailed`, attributed to the
/// model id rather than a node, since a model can be shared across nodes.
pub fn load_failed(model_id: &str, device: &str, reason: impl std::fmt::Display) -> Error {
    Error::init_failed(format!("failed to load model '{model_id}' on device '{device}': {reason}"))
}
