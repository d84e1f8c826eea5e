//! Prometheus metrics for the attach engine
//!
//! The engine runs as a one-shot command, so instead of serving `/metrics`
//! the recorder is rendered into a node-exporter textfile when the command
//! finishes.

use std::path::Path;
use std::time::Instant;

use metrics::counter;
use metrics::histogram;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of workflow operations by type and status
    pub const OPERATIONS_TOTAL: &str = "node_attach_operations_total";
    /// Histogram: Duration of workflow operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "node_attach_operation_duration_seconds";
    /// Counter: Number of retry waits taken by bounded polling loops
    pub const RETRIES_TOTAL: &str = "node_attach_retries_total";
    /// Counter: External commands killed after their timeout
    pub const COMMAND_TIMEOUTS_TOTAL: &str = "node_attach_command_timeouts_total";
    /// Counter: Filesystem expansions that left the size unchanged
    pub const RESIZE_UNCHANGED_TOTAL: &str = "node_attach_resize_unchanged_total";
}

/// Install the Prometheus recorder and return a handle for rendering.
pub fn init_metrics() -> Result<PrometheusHandle, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Write the current exposition to `path`, atomically via a sibling temp file.
pub fn write_textfile(handle: &PrometheusHandle, path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, handle.render())?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

/// Record a workflow operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a retry wait
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a command killed by its timeout
pub fn record_command_timeout(program: &str) {
    counter!(names::COMMAND_TIMEOUTS_TOTAL, "program" => program.to_string()).increment(1);
}

/// Record an expansion whose size did not change
pub fn record_resize_unchanged() {
    counter!(names::RESIZE_UNCHANGED_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, status, duration);
    }

    /// Complete with the status derived from `result`.
    pub fn finish<T>(self, result: &crate::error::Result<T>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if e.is_timeout() => self.failure("timeout"),
            Err(_) => self.failure("error"),
        }
    }
}
