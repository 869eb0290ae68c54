//! Generic worker process entry point (spec §6).
//!
//! Invoked by the supervisor as:
//!
//! ```text
//! worker --node-type <type> --node-id <id> --session-id <id>
//!        [--params <json> | --params-stdin]
//!        [--register-module <path>]...
//!        [--log-level <level>]
//! ```
//!
//! Exit codes: `0` clean shutdown, `1` init or processing failure, `130`
//! terminated by SIGINT/SIGTERM during the run.

use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use remotemedia_core::channel::{
    control_channel_name, input_channel_name, output_channel_name, supervisor_channel_name, ChannelConfig,
    ChannelRegistry, ChannelSubscriber,
};
use remotemedia_core::registry::StreamingNodeRegistry;
use remotemedia_core::worker_env::WorkerEnvironment;
use remotemedia_core::RuntimeData;

#[derive(Parser, Debug)]
#[command(name = "worker")]
struct Args {
    #[arg(long = "node-type")]
    node_type: String,
    #[arg(long = "node-id")]
    node_id: String,
    #[arg(long = "session-id")]
    session_id: String,
    #[arg(long = "params")]
    params: Option<String>,
    #[arg(long = "params-stdin")]
    params_stdin: bool,
    #[arg(long = "register-module")]
    register_modules: Vec<String>,
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !args.register_modules.is_empty() {
        tracing::debug!(modules = ?args.register_modules, "module registration requested (no-op: built-ins only)");
    }

    let env = WorkerEnvironment::detect();
    if env.containerized {
        tracing::debug!(signal = ?env.signal, "running inside a container; IPC paths are advisory-scoped accordingly");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to start tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let params = match read_params(&args) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to read params: {e}");
            return ExitCode::from(1);
        }
    };

    let registry = StreamingNodeRegistry::with_builtins();
    let mut node = match registry.build(&args.node_type, &params) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(node_type = %args.node_type, "failed to construct node: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = node.initialize().await {
        tracing::error!(node_id = %args.node_id, "initialize() failed: {e}");
        return ExitCode::from(1);
    }

    let channel_config = ChannelConfig::default();
    let channels = match ChannelRegistry::new(channel_config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to open channel registry: {e}");
            return ExitCode::from(1);
        }
    };

    let input_name = input_channel_name(&args.session_id, &args.node_id);
    let output_name = output_channel_name(&args.session_id, &args.node_id);
    let control_name = control_channel_name(&args.session_id, &args.node_id);
    let supervisor_name = supervisor_channel_name(&args.session_id, &args.node_id);

    let input_sub = match channels.subscriber(&input_name) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to open input channel '{input_name}': {e}");
            return ExitCode::from(1);
        }
    };
    let output_pub = match channels.publisher(&output_name) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to create output channel '{output_name}': {e}");
            return ExitCode::from(1);
        }
    };
    let control_pub = match channels.publisher(&control_name) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to create control channel '{control_name}': {e}");
            return ExitCode::from(1);
        }
    };
    // Opened once at startup: the supervisor publishes SHUTDOWN here, and
    // re-opening this subscriber on every poll would race the supervisor's
    // publisher for channel creation on the idle path.
    let supervisor_sub = match channels.subscriber(&supervisor_name) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to open supervisor channel '{supervisor_name}': {e}");
            return ExitCode::from(1);
        }
    };

    // Yield once so the event loop settles before announcing readiness,
    // matching the handshake ordering the supervisor waits on.
    tokio::task::yield_now().await;
    if let Err(e) = control_pub.publish(b"READY") {
        tracing::error!("failed to publish READY: {e}");
        return ExitCode::from(1);
    }

    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("received shutdown signal");
                let _ = node.cleanup().await;
                return ExitCode::from(130);
            }
            frame = receive_frame(&input_sub, &supervisor_sub) => {
                match frame {
                    FrameOutcome::Data(bytes) => {
                        let data = match RuntimeData::from_bytes(&bytes) {
                            Ok(d) => d,
                            Err(e) => {
                                tracing::error!("malformed input frame: {e}");
                                continue;
                            }
                        };
                        match node.process_streaming(data).await {
                            Ok(outputs) => {
                                for output in outputs {
                                    if let Ok(bytes) = output.to_bytes() {
                                        let _ = output_pub.publish(&bytes);
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!(node_id = %args.node_id, "process failed: {e}");
                                let _ = node.cleanup().await;
                                return ExitCode::from(1);
                            }
                        }
                    }
                    FrameOutcome::Shutdown => {
                        let flushed = node.flush().await;
                        if let Ok(outputs) = flushed {
                            for output in outputs {
                                if let Ok(bytes) = output.to_bytes() {
                                    let _ = output_pub.publish(&bytes);
                                }
                            }
                        }
                        let _ = node.cleanup().await;
                        return ExitCode::from(0);
                    }
                    FrameOutcome::Idle => continue,
                }
            }
        }
    }
}

enum FrameOutcome {
    Data(Vec<u8>),
    Shutdown,
    Idle,
}

async fn receive_frame(input_sub: &ChannelSubscriber, supervisor_sub: &ChannelSubscriber) -> FrameOutcome {
    if let Ok(Some(bytes)) = input_sub.receive_timeout(Duration::from_millis(50)) {
        return FrameOutcome::Data(bytes);
    }
    if let Ok(Some(bytes)) = supervisor_sub.try_receive() {
        if bytes == b"SHUTDOWN" {
            return FrameOutcome::Shutdown;
        }
    }
    FrameOutcome::Idle
}

fn read_params(args: &Args) -> remotemedia_core::Result<serde_json::Value> {
    if args.params_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(remotemedia_core::Error::from)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(params) = &args.params {
        return Ok(serde_json::from_str(params)?);
    }
    Ok(serde_json::Value::Object(Default::default()))
}
