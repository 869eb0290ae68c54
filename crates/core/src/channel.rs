//! Shared-memory pub/sub channel layer (C2).
//!
//! Channels are named `"{session_id}_{node_id}_input"` /
//! `"{session_id}_{node_id}_output"` for data, and
//! `"control/{session_id}_{node_id}"` for control messages (readiness,
//! shutdown, progress events). With the `multiprocess` feature (the
//! default), publishers create the underlying iceoryx2 shared-memory
//! service and subscribers that race ahead of the publisher retry for a
//! short window before creating it themselves, so either side may come up
//! first. Without it, the same names resolve to a process-local, lock-free
//! queue (see [`local`]) so a pipeline can still run entirely in-process on
//! platforms without SHM support.

/// Default number of historical samples a late subscriber can still see.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// What to do when a publish would block because the subscriber's buffer is
/// full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Return `ErrorKind::ResourceLimit` (`WouldBlock`) to the caller.
    Block,
    /// Drop the oldest buffered sample to make room, matching a live-stream
    /// "latest wins" policy.
    DropOldest,
}

/// Channel sizing and backpressure configuration.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub history_size: usize,
    pub subscriber_max_buffer_size: usize,
    pub backpressure: Backpressure,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            subscriber_max_buffer_size: DEFAULT_HISTORY_SIZE,
            backpressure: Backpressure::Block,
        }
    }
}

fn data_channel_name(session_id: &str, node_id: &str, direction: &str) -> String {
    format!("{session_id}_{node_id}_{direction}")
}

/// Channel name a worker publishes readiness and progress events on
/// (worker -> supervisor).
pub fn control_channel_name(session_id: &str, node_id: &str) -> String {
    format!("control/{session_id}_{node_id}")
}

/// Channel name the supervisor publishes shutdown/signal requests on
/// (supervisor -> worker). Kept distinct from [`control_channel_name`] so a
/// worker publishing `READY` can never be mistaken for a shutdown request it
/// never sent, and so `wait_ready`/`shutdown` don't contend for the same
/// subscriber.
pub fn supervisor_channel_name(session_id: &str, node_id: &str) -> String {
    format!("control/{session_id}_{node_id}_supervisor")
}

/// Channel name for a node's data input port.
pub fn input_channel_name(session_id: &str, node_id: &str) -> String {
    data_channel_name(session_id, node_id, "input")
}

/// Channel name for a node's data output port.
pub fn output_channel_name(session_id: &str, node_id: &str) -> String {
    data_channel_name(session_id, node_id, "output")
}

#[cfg(feature = "multiprocess")]
mod mp {
    //! iceoryx2-backed channels, shared across processes via SHM.

    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use dashmap::DashMap;
    use iceoryx2::port::publisher::Publisher as Iceoryx2Publisher;
    use iceoryx2::port::subscriber::Subscriber as Iceoryx2Subscriber;
    use iceoryx2::prelude::*;
    use iceoryx2::service::ipc::Service as IpcService;

    use super::{Backpressure, ChannelConfig};
    use crate::error::Error;

    /// How long a subscriber retries opening a not-yet-created channel before
    /// giving up and creating it itself.
    const LATE_SUBSCRIBER_RETRY_WINDOW: Duration = Duration::from_secs(5);
    const LATE_SUBSCRIBER_RETRY_INTERVAL: Duration = Duration::from_millis(20);

    /// A publisher handle, created idempotently by the supervisor (or any
    /// process first to the channel).
    pub struct ChannelPublisher {
        name: String,
        config: ChannelConfig,
        port: Iceoryx2Publisher<IpcService, [u8], ()>,
    }

    impl ChannelPublisher {
        /// Publish one framed message. Honors the configured backpressure
        /// policy when the subscriber's buffer is full.
        pub fn publish(&self, bytes: &[u8]) -> crate::Result<()> {
            loop {
                let sample = self
                    .port
                    .loan_slice_uninit(bytes.len())
                    .map_err(|e| Error::channel_closed(format!("loan failed on '{}': {e:?}", self.name)));

                match sample {
                    Ok(sample) => {
                        let sample = sample.write_from_slice(bytes);
                        sample
                            .send()
                            .map_err(|e| Error::channel_closed(format!("send failed on '{}': {e:?}", self.name)))?;
                        return Ok(());
                    }
                    Err(err) => {
                        if self.config.backpressure == Backpressure::DropOldest {
                            // The loan itself failing (buffer exhaustion) is the
                            // only way iceoryx2 signals backpressure here; retry
                            // once immediately since the oldest sample is
                            // reclaimed on the subscriber side as it drains.
                            std::thread::yield_now();
                            continue;
                        }
                        return Err(err.with_retryable(true));
                    }
                }
            }
        }

        /// Channel name, for diagnostics.
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    /// A subscriber handle.
    pub struct ChannelSubscriber {
        name: String,
        port: Iceoryx2Subscriber<IpcService, [u8], ()>,
    }

    impl ChannelSubscriber {
        /// Try to receive one message without blocking.
        pub fn try_receive(&self) -> crate::Result<Option<Vec<u8>>> {
            match self.port.receive() {
                Ok(Some(sample)) => Ok(Some(sample.payload().to_vec())),
                Ok(None) => Ok(None),
                Err(e) => Err(Error::channel_closed(format!("receive failed on '{}': {e:?}", self.name))),
            }
        }

        /// Block (polling internally) until a message arrives or `timeout`
        /// elapses.
        pub fn receive_timeout(&self, timeout: Duration) -> crate::Result<Option<Vec<u8>>> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(bytes) = self.try_receive()? {
                    return Ok(Some(bytes));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        /// Channel name, for diagnostics.
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    /// Registry of open iceoryx2 ports, keyed by channel name. Idempotent on the
    /// publisher side; subscribers retry-then-create on the late-joiner path.
    pub struct ChannelRegistry {
        node: Arc<Node<IpcService>>,
        config: ChannelConfig,
    }

    impl ChannelRegistry {
        /// Create a registry backed by a fresh iceoryx2 node.
        pub fn new(config: ChannelConfig) -> crate::Result<Self> {
            let node = NodeBuilder::new()
                .create::<IpcService>()
                .map_err(|e| Error::init_failed(format!("failed to create iceoryx2 node: {e:?}")))?;
            Ok(Self {
                node: Arc::new(node),
                config,
            })
        }

        fn service(&self, name: &str) -> crate::Result<iceoryx2::service::port_factory::publish_subscribe::PortFactory<IpcService, [u8], ()>> {
            self.node
                .service_builder(
                    &name
                        .try_into()
                        .map_err(|e| Error::validation(format!("invalid channel name '{name}': {e:?}")))?,
                )
                .publish_subscribe::<[u8]>()
                .open_with_attributes(&AttributeVerifier::new())
                .or_else(|_| {
                    self.node
                        .service_builder(
                            &name
                                .try_into()
                                .map_err(|e| Error::validation(format!("invalid channel name '{name}': {e:?}")))?,
                        )
                        .publish_subscribe::<[u8]>()
                        .history_size(self.config.history_size)
                        .subscriber_max_buffer_size(self.config.subscriber_max_buffer_size)
                        .enable_safe_overflow(self.config.backpressure == Backpressure::DropOldest)
                        .open_or_create()
                })
                .map_err(|e| Error::init_failed(format!("failed to open/create service '{name}': {e:?}")))
        }

        /// Create (or attach to) a publisher for `name`. Always succeeds
        /// immediately; iceoryx2's `open_or_create` makes this idempotent
        /// regardless of process start order.
        pub fn publisher(&self, name: &str) -> crate::Result<ChannelPublisher> {
            let service = self.service(name)?;
            let port = service
                .publisher_builder()
                .create()
                .map_err(|e| Error::init_failed(format!("failed to create publisher on '{name}': {e:?}")))?;
            Ok(ChannelPublisher {
                name: name.to_string(),
                config: self.config,
                port,
            })
        }

        /// Open a subscriber for `name`. If the channel doesn't exist yet (the
        /// publisher hasn't started), retries for
        /// [`LATE_SUBSCRIBER_RETRY_WINDOW`] before creating it itself so either
        /// side of the handshake may come up first.
        pub fn subscriber(&self, name: &str) -> crate::Result<ChannelSubscriber> {
            let deadline = Instant::now() + LATE_SUBSCRIBER_RETRY_WINDOW;
            let service = loop {
                match self.service(name) {
                    Ok(service) => break service,
                    Err(err) => {
                        if Instant::now() >= deadline {
                            return Err(err);
                        }
                        // Jitter by +/-25% so many nodes racing the same
                        // not-yet-created channel don't all retry in lockstep.
                        let jitter_range = (LATE_SUBSCRIBER_RETRY_INTERVAL.as_millis() / 4) as i64;
                        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range as f64;
                        let wait_ms = (LATE_SUBSCRIBER_RETRY_INTERVAL.as_millis() as i64 + jitter as i64).max(1) as u64;
                        std::thread::sleep(Duration::from_millis(wait_ms));
                    }
                }
            };
            let port = service
                .subscriber_builder()
                .create()
                .map_err(|e| Error::init_failed(format!("failed to create subscriber on '{name}': {e:?}")))?;
            Ok(ChannelSubscriber {
                name: name.to_string(),
                port,
            })
        }
    }

    /// Process-global channel registry, lazily initialized on first use so
    /// every node in a process shares one iceoryx2 node.
    pub fn global_registry(config: ChannelConfig) -> crate::Result<Arc<ChannelRegistry>> {
        static REGISTRY: std::sync::OnceLock<DashMap<(), Arc<ChannelRegistry>>> = std::sync::OnceLock::new();
        let map = REGISTRY.get_or_init(DashMap::new);
        if let Some(existing) = map.get(&()) {
            return Ok(existing.clone());
        }
        let created = Arc::new(ChannelRegistry::new(config)?);
        map.insert((), created.clone());
        Ok(created)
    }
}

/// Process-local channels backed by a lock-free ring buffer, used when the
/// `multiprocess` feature is disabled. Each name maps to one bounded
/// [`crossbeam::queue::ArrayQueue`] shared by every publisher/subscriber
/// that opens it; there is no cross-process visibility, so this only
/// supports running an entire session in one process.
pub mod local {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crossbeam::queue::ArrayQueue;
    use dashmap::DashMap;

    use super::{Backpressure, ChannelConfig};
    use crate::error::Error;

    struct Queue {
        buffer: ArrayQueue<Vec<u8>>,
        config: ChannelConfig,
    }

    /// Registry of process-local channels, keyed by name.
    pub struct ChannelRegistry {
        channels: DashMap<String, Arc<Queue>>,
        config: ChannelConfig,
    }

    impl ChannelRegistry {
        /// Create an empty registry. `config` is applied to every channel
        /// opened through it.
        pub fn new(config: ChannelConfig) -> crate::Result<Self> {
            Ok(Self {
                channels: DashMap::new(),
                config,
            })
        }

        fn queue(&self, name: &str) -> Arc<Queue> {
            self.channels
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(Queue {
                        buffer: ArrayQueue::new(self.config.subscriber_max_buffer_size.max(1)),
                        config: self.config,
                    })
                })
                .clone()
        }

        /// Open (or attach to) a publisher for `name`.
        pub fn publisher(&self, name: &str) -> crate::Result<ChannelPublisher> {
            Ok(ChannelPublisher {
                name: name.to_string(),
                queue: self.queue(name),
            })
        }

        /// Open (or attach to) a subscriber for `name`.
        pub fn subscriber(&self, name: &str) -> crate::Result<ChannelSubscriber> {
            Ok(ChannelSubscriber {
                name: name.to_string(),
                queue: self.queue(name),
            })
        }
    }

    /// A publisher handle onto a process-local queue.
    pub struct ChannelPublisher {
        name: String,
        queue: Arc<Queue>,
    }

    impl ChannelPublisher {
        /// Publish one framed message. Honors the configured backpressure
        /// policy when the queue is full.
        pub fn publish(&self, bytes: &[u8]) -> crate::Result<()> {
            let mut item = bytes.to_vec();
            loop {
                match self.queue.buffer.push(item) {
                    Ok(()) => return Ok(()),
                    Err(rejected) => {
                        if self.queue.config.backpressure == Backpressure::DropOldest {
                            let _ = self.queue.buffer.pop();
                            item = rejected;
                            continue;
                        }
                        return Err(Error::channel_closed(format!("buffer full on '{}'", self.name)).with_retryable(true));
                    }
                }
            }
        }

        /// Channel name, for diagnostics.
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    /// A subscriber handle onto a process-local queue.
    pub struct ChannelSubscriber {
        name: String,
        queue: Arc<Queue>,
    }

    impl ChannelSubscriber {
        /// Try to receive one message without blocking.
        pub fn try_receive(&self) -> crate::Result<Option<Vec<u8>>> {
            Ok(self.queue.buffer.pop())
        }

        /// Poll until a message arrives or `timeout` elapses.
        pub fn receive_timeout(&self, timeout: Duration) -> crate::Result<Option<Vec<u8>>> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(bytes) = self.try_receive()? {
                    return Ok(Some(bytes));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        /// Channel name, for diagnostics.
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    /// Process-global channel registry, lazily initialized on first use.
    pub fn global_registry(config: ChannelConfig) -> crate::Result<Arc<ChannelRegistry>> {
        static REGISTRY: std::sync::OnceLock<DashMap<(), Arc<ChannelRegistry>>> = std::sync::OnceLock::new();
        let map = REGISTRY.get_or_init(DashMap::new);
        if let Some(existing) = map.get(&()) {
            return Ok(existing.clone());
        }
        let created = Arc::new(ChannelRegistry::new(config)?);
        map.insert((), created.clone());
        Ok(created)
    }
}

#[cfg(feature = "multiprocess")]
pub use mp::{global_registry, ChannelPublisher, ChannelRegistry, ChannelSubscriber};

#[cfg(not(feature = "multiprocess"))]
pub use local::{global_registry, ChannelPublisher, ChannelRegistry, ChannelSubscriber};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_follow_spec_convention() {
        assert_eq!(input_channel_name("sess-1", "node-a"), "sess-1_node-a_input");
        assert_eq!(output_channel_name("sess-1", "node-a"), "sess-1_node-a_output");
        assert_eq!(control_channel_name("sess-1", "node-a"), "control/sess-1_node-a");
        assert_eq!(supervisor_channel_name("sess-1", "node-a"), "control/sess-1_node-a_supervisor");
    }

    #[test]
    fn default_config_blocks_on_backpressure() {
        let config = ChannelConfig::default();
        assert_eq!(config.backpressure, Backpressure::Block);
        assert_eq!(config.history_size, DEFAULT_HISTORY_SIZE);
    }

    #[cfg(not(feature = "multiprocess"))]
    #[test]
    fn local_channel_roundtrips_a_message() {
        let registry = ChannelRegistry::new(ChannelConfig::default()).unwrap();
        let publisher = registry.publisher("s_n_input").unwrap();
        let subscriber = registry.subscriber("s_n_input").unwrap();
        publisher.publish(b"hello").unwrap();
        assert_eq!(subscriber.try_receive().unwrap(), Some(b"hello".to_vec()));
    }

    #[cfg(not(feature = "multiprocess"))]
    #[test]
    fn local_channel_drops_oldest_when_full() {
        let config = ChannelConfig {
            subscriber_max_buffer_size: 2,
            backpressure: Backpressure::DropOldest,
            ..ChannelConfig::default()
        };
        let registry = ChannelRegistry::new(config).unwrap();
        let publisher = registry.publisher("s_n_input").unwrap();
        let subscriber = registry.subscriber("s_n_input").unwrap();
        publisher.publish(b"1").unwrap();
        publisher.publish(b"2").unwrap();
        publisher.publish(b"3").unwrap();
        assert_eq!(subscriber.try_receive().unwrap(), Some(b"2".to_vec()));
        assert_eq!(subscriber.try_receive().unwrap(), Some(b"3".to_vec()));
    }
}
