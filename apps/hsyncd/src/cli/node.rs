use std::time::Duration;

use eyre::Context;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use hsync_engine::events::EventBus;
use hsync_engine::{Control, EngineHandle, Supervisor};

use crate::bridge;
use crate::config::HsyncdConfig;

/// The limit of time to wait for the supervisor to shut down if it hasn't already.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Owns the running supervisor task and the handle callers drive it through.
pub struct Node {
    handle: EngineHandle,
    shutdown_timeout: Duration,
    cancellation: CancellationToken,
    task_tracker: TaskTracker,
}

impl Node {
    pub async fn new(config: HsyncdConfig) -> eyre::Result<Self> {
        hsync_engine::persist::ensure_cert_dir(&config.config_dir)
            .wrap_err("failed to prepare certs directory")?;

        let tls_connector = config
            .tls
            .to_connector()
            .wrap_err("failed to build TLS connector")?;
        let constants = config
            .network
            .to_constants()
            .wrap_err("failed to resolve network constants")?;

        let event_bus = EventBus::new();
        let typed_bus = bridge::init_bus();
        bridge::wire(&event_bus, typed_bus);

        let (commands_tx, commands_rx) = flume::unbounded();
        let handle = EngineHandle::new(commands_tx);
        let cancellation = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let supervisor = Supervisor::new(
            config.engine,
            constants,
            Some(config.config_dir),
            tls_connector,
            event_bus,
        );

        task_tracker.spawn(supervisor.run(commands_rx, cancellation.clone()));
        task_tracker.close();

        let shutdown_timeout = Duration::from_secs(
            config
                .shutdown_timeout
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        );

        Ok(Self {
            handle,
            shutdown_timeout,
            cancellation,
            task_tracker,
        })
    }

    /// A cloneable handle onto the running engine.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Wait for the supervisor to ask for cancellation on its own (e.g. a fatal
    /// internal error), as opposed to an external shutdown signal.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub async fn shutdown(&self) {
        info!("shutting down engine, finishing in-flight requests...");

        let _ = self.handle.stop().await;
        self.cancellation.cancel();

        select! {
            _ = self.task_tracker.wait() => {},
            _ = sleep(self.shutdown_timeout) => {
                info!("shutdown timeout reached, exiting...");
            },
        }
    }
}
