//! Prometheus metrics.
//!
//! Counters are recorded through the `metrics` facade everywhere; they only
//! go anywhere once [`install_prometheus`] has installed a recorder.

use crate::config::MetricsSettings;
use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

/// Installs the Prometheus recorder and its scrape listener.
///
/// Returns `None` when metrics are disabled.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the exporter cannot be built or a
/// recorder is already installed.
pub fn install_prometheus(settings: &MetricsSettings) -> Result<Option<PrometheusHandle>> {
    if !settings.enabled {
        return Ok(None);
    }

    let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.port);
    let builder = PrometheusBuilder::new().with_http_listener(listen);
    let handle = install_listener(builder)?;
    describe_metrics();
    tracing::info!(%listen, "Prometheus exporter listening");
    Ok(Some(handle))
}

/// Registers help text for the agent's metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "lapse_frames_captured_total",
        "Frames captured and committed to the spool"
    );
    metrics::describe_counter!(
        "lapse_capture_failures_total",
        "Capture cycles skipped because the camera failed"
    );
    metrics::describe_counter!(
        "lapse_uploads_total",
        "Upload attempts by outcome (delivered, transient, permanent)"
    );
    metrics::describe_counter!("lapse_queue_enqueued_total", "Frames written to the spool");
    metrics::describe_counter!(
        "lapse_spool_mutex_poison_recovery_total",
        "Spool locks recovered after a panicking holder"
    );
    metrics::describe_counter!(
        "lapse_receiver_uploads_total",
        "Receiver responses by outcome (stored, rejected)"
    );
    metrics::describe_histogram!(
        "lapse_capture_duration_ms",
        metrics::Unit::Milliseconds,
        "Duration of one capture cycle"
    );
}

/// The exporter is a future; it gets a small runtime on its own thread so the
/// agent itself can stay synchronous.
fn install_listener(builder: PrometheusBuilder) -> Result<PrometheusHandle> {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        return install_with_runtime(builder, &handle);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::operation("metrics_runtime_init", e))?;
    let handle = runtime.handle().clone();
    let prometheus = install_with_runtime(builder, &handle)?;
    thread::Builder::new()
        .name("lapse-metrics".to_string())
        .spawn(move || runtime.block_on(std::future::pending::<()>()))
        .map_err(|e| Error::operation("metrics_runtime_thread", e))?;
    Ok(prometheus)
}

fn install_with_runtime(
    builder: PrometheusBuilder,
    runtime: &tokio::runtime::Handle,
) -> Result<PrometheusHandle> {
    let (recorder, exporter) = {
        let _guard = runtime.enter();
        builder
            .build()
            .map_err(|e| Error::operation("metrics_exporter_build", e))?
    };
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| Error::operation("metrics_recorder_install", e))?;
    runtime.spawn(exporter);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_installs_nothing() {
        let settings = MetricsSettings::default();
        assert!(install_prometheus(&settings).unwrap().is_none());
    }
}
