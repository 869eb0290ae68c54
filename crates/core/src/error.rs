//! Error types for the RemoteMedia dataflow engine.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for RemoteMedia Core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The ten error kinds carried across the FFI boundary (spec C13).
///
/// `retryable()` on [`Error`] derives a default from the kind; callers that
/// know better (e.g. a transport that already retried) may ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Manifest malformed, unknown node_type, duplicate id, cycle.
    Validation,
    /// `RuntimeData` accessor called for the wrong variant, or a mixed list
    /// contained an entry that is neither a manifest dict nor a worker.
    TypeMismatch,
    /// Worker exited before `READY`, or `initialize()` failed.
    InitFailed,
    /// Worker exited during processing.
    WorkerCrashed,
    /// Readiness wait, channel-open retry, or cancellation grace exceeded.
    Timeout,
    /// Instance not serializable, or the size limit was exceeded.
    SerializationError,
    /// Publish to, or receive from, a closed channel.
    ChannelClosed,
    /// Memory/GPU resource limit observed in a worker.
    ResourceLimit,
    /// Sandbox policy rejected the operation (forwarded from an external
    /// sandbox; the core implements no sandbox policy itself).
    Security,
    /// Catch-all, with the original message (and traceback, if any).
    Unknown,
}

/// A structured error payload: `{ kind, message, suggestion?, retryable,
/// traceback?, node_id? }` (spec §4.10 / §7).
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    /// Which of the ten taxonomy kinds this error belongs to.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Actionable suggestion, when one can be derived (e.g. serialization
    /// failures always carry one).
    pub suggestion: Option<String>,
    /// Whether a caller may retry the same operation and expect it to
    /// possibly succeed.
    pub retryable: bool,
    /// Captured backtrace/traceback text, if available.
    pub traceback: Option<String>,
    /// The node this error is attributed to, if any.
    pub node_id: Option<String>,
}

impl Error {
    /// Construct an error of the given kind with a plain message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ErrorKind::Timeout | ErrorKind::ResourceLimit | ErrorKind::ChannelClosed
        );
        Self {
            kind,
            message: message.into(),
            suggestion: None,
            retryable,
            traceback: None,
            node_id: None,
        }
    }

    /// Attach a node id.
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Attach an actionable suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Override the default retryability for this kind.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach a captured traceback/backtrace string.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Convenience constructors matching each `ErrorKind` variant.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// `ErrorKind::TypeMismatch`.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, message)
    }

    /// `ErrorKind::InitFailed`.
    pub fn init_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InitFailed, message)
    }

    /// `ErrorKind::WorkerCrashed`.
    pub fn worker_crashed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerCrashed, message)
    }

    /// `ErrorKind::Timeout`.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// `ErrorKind::SerializationError`, always carrying a suggestion.
    pub fn serialization(
        node_name: impl Into<String>,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        let node_name = node_name.into();
        let reason = reason.into();
        Self::new(
            ErrorKind::SerializationError,
            format!("node '{node_name}' failed to serialize: {reason}"),
        )
        .with_node(node_name)
        .with_suggestion(suggestion)
    }

    /// `ErrorKind::ChannelClosed`.
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelClosed, message)
    }

    /// `ErrorKind::ResourceLimit`.
    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    /// `ErrorKind::Unknown`, wrapping an arbitrary upstream error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::unknown(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::validation(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::unknown(err.to_string())
    }
}
