//! Worker process supervision (C8): spawning a worker, the readiness
//! handshake ordering, and crash/timeout handling.
//!
//! The handshake is ordered precisely (spec §4.4) because deviating from it
//! loses data: the supervisor must create the worker's `*_input` channel as
//! a publisher *before* spawning the process, so the worker never races to
//! open a channel nobody has created yet. The worker then opens `*_input`
//! as a subscriber and `*_output` as a publisher, yields once to let its
//! event loop settle, and only then publishes the `READY` marker. The
//! supervisor blocks on that marker with a timeout.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::channel::{control_channel_name, supervisor_channel_name, ChannelRegistry};
use crate::error::Error;

/// Default time the supervisor waits for a worker's `READY` marker, used
/// when a caller doesn't pass an explicit timeout to [`ProcessHandle::wait_ready`].
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default grace period after a shutdown request before the process is
/// killed, used when a caller doesn't pass an explicit duration to
/// [`ProcessHandle::shutdown`].
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const READY_MARKER: &[u8] = b"READY";
const SHUTDOWN_MARKER: &[u8] = b"SHUTDOWN";

/// Observed lifecycle state of a supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Spawned,
    Ready,
    Running,
    Exited(i32),
    Crashed,
    Killed,
}

/// Parameters for spawning a worker process, matching the generic `worker`
/// CLI contract: `--node-type --node-id --session-id [--params|
/// --params-stdin] [--register-module]... [--log-level]`.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub worker_binary: String,
    pub node_type: String,
    pub node_id: String,
    pub session_id: String,
    pub params: serde_json::Value,
    pub register_modules: Vec<String>,
    pub log_level: String,
}

/// A handle to a spawned worker process and its control channel.
pub struct ProcessHandle {
    child: Child,
    config: SpawnConfig,
    status: ProcessStatus,
}

impl ProcessHandle {
    /// Spawn the worker process. Parameters are passed on stdin (`--params-
    /// stdin`) to avoid argv length/escaping limits for large configs.
    pub fn spawn(config: SpawnConfig) -> crate::Result<Self> {
        let params = serde_json::to_string(&config.params)?;

        let mut command = Command::new(&config.worker_binary);
        command
            .arg("--node-type")
            .arg(&config.node_type)
            .arg("--node-id")
            .arg(&config.node_id)
            .arg("--session-id")
            .arg(&config.session_id)
            .arg("--params-stdin")
            .arg("--log-level")
            .arg(&config.log_level);
        for module in &config.register_modules {
            command.arg("--register-module").arg(module);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::init_failed(format!("failed to spawn worker '{}': {e}", config.worker_binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let params = params.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(params.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let node_id = config.node_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(node_id = %node_id, "worker stderr: {line}");
                }
            });
        }

        Ok(Self {
            child,
            config,
            status: ProcessStatus::Spawned,
        })
    }

    /// Current process-exit-independent status as last observed.
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Block until the worker publishes its `READY` marker on its control
    /// channel, or `timeout_dur` elapses.
    pub async fn wait_ready(&mut self, registry: &ChannelRegistry, timeout_dur: Duration) -> crate::Result<()> {
        let channel_name = control_channel_name(&self.config.session_id, &self.config.node_id);
        let subscriber = registry.subscriber(&channel_name)?;

        let node_id = self.config.node_id.clone();
        let result = timeout(timeout_dur, async move {
            loop {
                if let Some(bytes) = subscriber.try_receive()? {
                    if bytes == READY_MARKER {
                        return Ok(());
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.status = ProcessStatus::Ready;
                Ok(())
            }
            Ok(Err(e)) => {
                self.status = ProcessStatus::Crashed;
                Err(e)
            }
            Err(_) => {
                self.status = ProcessStatus::Crashed;
                Err(Error::timeout(format!(
                    "worker '{node_id}' did not become ready within {timeout_dur:?}"
                ))
                .with_node(node_id))
            }
        }
    }

    /// Request graceful shutdown via the supervisor-to-worker control
    /// channel and a SIGTERM (Unix) / best-effort kill (Windows), then wait
    /// up to `grace` before sending an unconditional kill signal.
    pub async fn shutdown(&mut self, registry: &ChannelRegistry, grace: Duration) -> crate::Result<()> {
        let channel_name = supervisor_channel_name(&self.config.session_id, &self.config.node_id);
        if let Ok(publisher) = registry.publisher(&channel_name) {
            let _ = publisher.publish(SHUTDOWN_MARKER);
        }
        self.send_terminate_signal();

        let result = timeout(grace, self.child.wait()).await;
        match result {
            Ok(Ok(status)) => {
                self.status = ProcessStatus::Exited(status.code().unwrap_or(-1));
                Ok(())
            }
            _ => {
                self.kill().await?;
                Ok(())
            }
        }
    }

    /// Send the process a termination request it can catch and act on
    /// before the hard kill: SIGTERM on Unix, nothing on Windows (which has
    /// no equivalent signal — the caller's grace-period wait still applies,
    /// it just can't be a cooperative shutdown on that platform).
    fn send_terminate_signal(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
            }
        }
    }

    /// Forcibly terminate the worker.
    pub async fn kill(&mut self) -> crate::Result<()> {
        self.child.kill().await.map_err(Error::from)?;
        self.status = ProcessStatus::Killed;
        Ok(())
    }

    /// Poll whether the worker has exited, updating status if so.
    pub fn try_wait(&mut self) -> crate::Result<Option<ProcessStatus>> {
        match self.child.try_wait().map_err(Error::from)? {
            Some(exit_status) => {
                let code = exit_status.code().unwrap_or(-1);
                self.status = if code == 0 {
                    ProcessStatus::Exited(0)
                } else {
                    ProcessStatus::Crashed
                };
                Ok(Some(self.status))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_config_is_cloneable_for_retry() {
        let config = SpawnConfig {
            worker_binary: "worker".into(),
            node_type: "multiply".into(),
            node_id: "n1".into(),
            session_id: "s1".into(),
            params: serde_json::json!({"factor": 2}),
            register_modules: vec![],
            log_level: "info".into(),
        };
        let cloned = config.clone();
        assert_eq!(cloned.node_id, "n1");
    }

    #[test]
    fn default_ready_timeout_matches_handshake_contract() {
        assert_eq!(DEFAULT_READY_TIMEOUT, Duration::from_secs(30));
    }

    #[test]
    fn default_shutdown_grace_is_ten_seconds() {
        assert_eq!(DEFAULT_SHUTDOWN_GRACE, Duration::from_secs(10));
    }
}
