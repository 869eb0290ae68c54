//! A reference-counted handle to a cached model.

use std::any::Any;
use std::sync::Arc;

/// A loaded model, type-erased so the registry can cache heterogeneous
/// model types behind one map. Callers downcast with [`ModelHandle::get`].
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ModelHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self { inner: Arc::new(value) }
    }

    /// Downcast to the concrete model type a node expects.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}
