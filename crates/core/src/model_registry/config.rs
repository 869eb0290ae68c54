//! Model registry cache key and load configuration.

use serde::{Deserialize, Serialize};

/// Identifies one cache slot: a model id on a specific device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub model_id: String,
    pub device: String,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            device: device.into(),
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.model_id, self.device)
    }
}
