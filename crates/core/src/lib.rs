//! RemoteMedia Core: a transport-agnostic, typed, multi-process dataflow
//! engine. A pipeline is described by a versioned manifest (see
//! [`manifest`]), built into an executable graph by the [`scheduler`], and
//! run across one or more worker processes talking over shared-memory
//! channels (see [`channel`] and [`process`]).

pub mod channel;
pub mod data;
pub mod error;
pub mod instance;
pub mod manifest;
pub mod metrics;
pub mod model_registry;
pub mod node;
pub mod node_config;
pub mod process;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod worker_env;

pub use data::{AudioFormat, AudioPayload, DType, NumpyPayload, RuntimeData, RuntimeDataKind};
pub use error::{Error, ErrorKind, Result};
pub use manifest::{Connection, Manifest, ManifestMetadata, NodeManifest};
pub use node::{InitPhase, NodeCapabilities, NodeStatus, StreamingNode};
pub use scheduler::{CancellationToken, Scheduler};
pub use session::{Session, SessionStatus};
