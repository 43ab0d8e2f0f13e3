//! Capture agent wiring.
//!
//! Runs the capture scheduler and the upload client on two named OS threads
//! that share the spool. The capture loop survives panicking cycles, and a
//! dead loop never takes the other one down; both stop when the shutdown
//! signal fires.

use crate::camera::LightMeter;
use crate::config::AgentConfig;
use crate::services::{CaptureScheduler, UploadClient, panic_reason};
use crate::shutdown::Shutdown;
use crate::storage::SpoolQueue;
use crate::transport::{HttpTransport, PhotoTransport};
use crate::{Error, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The running pieces of one capture device.
pub struct Agent {
    config: AgentConfig,
    meter: Box<dyn LightMeter>,
    queue: Arc<SpoolQueue>,
    transport: Arc<dyn PhotoTransport>,
}

impl Agent {
    /// Opens the spool and builds the HTTP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be opened or the HTTP client
    /// cannot be built.
    pub fn new(config: AgentConfig, meter: Box<dyn LightMeter>) -> Result<Self> {
        let queue = Arc::new(SpoolQueue::open(config.spool_path())?);
        let transport = Arc::new(HttpTransport::new(&config.upload, config.device_id.clone())?);
        Ok(Self::with_parts(config, meter, queue, transport))
    }

    /// Assembles an agent from prepared parts.
    #[must_use]
    pub fn with_parts(
        config: AgentConfig,
        meter: Box<dyn LightMeter>,
        queue: Arc<SpoolQueue>,
        transport: Arc<dyn PhotoTransport>,
    ) -> Self {
        Self {
            config,
            meter,
            queue,
            transport,
        }
    }

    /// Runs both loops until `shutdown` fires, then waits for them to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if a thread cannot be spawned or
    /// if either loop panicked.
    pub fn run_until_shutdown(self, shutdown: &Shutdown) -> Result<()> {
        let Self {
            config,
            meter,
            queue,
            transport,
        } = self;

        tracing::info!(
            device_id = %config.device_id,
            spool = %config.spool_path().display(),
            endpoint = %config.upload.endpoint,
            "Agent starting"
        );

        let capture = {
            let queue = Arc::clone(&queue);
            let capture_shutdown = shutdown.clone();
            let config = config.clone();
            spawn_named("lapse-capture", move || {
                let mut scheduler = CaptureScheduler::new(&config, meter, queue);
                scheduler.run(&capture_shutdown);
            })?
        };

        let upload = {
            let queue = Arc::clone(&queue);
            let upload_shutdown = shutdown.clone();
            let upload_config = config.upload.clone();
            match spawn_named("lapse-upload", move || {
                let mut client = UploadClient::new(queue, transport, &upload_config);
                client.drain(&upload_shutdown);
            }) {
                Ok(handle) => handle,
                Err(e) => {
                    shutdown.trigger();
                    let _ = capture.join();
                    return Err(e);
                },
            }
        };

        shutdown.wait();
        queue.wake();

        let capture = join_loop("lapse-capture", capture);
        let upload = join_loop("lapse-upload", upload);

        if let Ok(stats) = queue.stats() {
            tracing::info!(
                pending = stats.pending,
                delivered = stats.delivered,
                failed = stats.failed_permanent,
                "Agent stopped"
            );
        }
        capture.and(upload)
    }
}

fn spawn_named<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| Error::operation("spawn_thread", format!("{name}: {e}")))
}

fn join_loop(name: &str, handle: JoinHandle<()>) -> Result<()> {
    handle.join().map_err(|panic| {
        let reason = panic_reason(panic.as_ref());
        tracing::error!(thread = name, reason = %reason, "Agent loop panicked");
        Error::operation("agent_loop", format!("{name} panicked: {reason}"))
    })
}
