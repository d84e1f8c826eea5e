//! Device-mapper multipath coordination.
//!
//! Multipath is optional: when only one path exists or `multipathd` is not
//! running, the raw device is used directly and nothing here waits.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::exec::Executor;
use crate::retry::{ProbeOutcome, RetryPolicy, probe_fn, retry};
use crate::sysfs::Sysfs;

const MULTIPATH_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSHBUFS_TIMEOUT: Duration = Duration::from_secs(5);

static PID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("Invalid regex pattern"));
static PID_RUNNING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid \d+ running").expect("Invalid regex pattern"));

#[derive(Debug, Clone)]
pub struct MultipathCoordinator {
    exec: Executor,
    sysfs: Sysfs,
    config: Arc<EngineConfig>,
}

impl MultipathCoordinator {
    pub fn new(exec: Executor, sysfs: Sysfs, config: Arc<EngineConfig>) -> Self {
        Self {
            exec,
            sysfs,
            config,
        }
    }

    /// `multipathd` is up, judged by `pgrep` then by the daemon's own report.
    pub async fn daemon_running(&self) -> bool {
        match self.exec.exec("pgrep", &["multipathd"]).await {
            Ok(out) => {
                let text = String::from_utf8_lossy(&out);
                let pid = text.trim();
                if PID_REGEX.is_match(pid) {
                    debug!(pid, "multipathd is running");
                    return true;
                }
            }
            Err(e) => error!(error = %e, "pgrep multipathd failed"),
        }

        match self.exec.exec("multipathd", &["show", "daemon"]).await {
            Ok(out) => {
                if PID_RUNNING_REGEX.is_match(&String::from_utf8_lossy(&out)) {
                    debug!("multipathd is running");
                    return true;
                }
            }
            Err(e) => error!(error = %e, "multipathd show daemon failed"),
        }

        false
    }

    /// Wait for any of `devices` to gain a `dm-*` holder.
    ///
    /// Returns `None` without waiting for a single path or when the daemon
    /// is not running, and `None` with a warning when the budget runs out.
    #[instrument(skip(self))]
    pub async fn wait_for_multipath_device(&self, devices: &[String]) -> Option<String> {
        if devices.len() <= 1 {
            debug!(count = devices.len(), "Skipping multipath discovery");
            return None;
        }
        if !self.daemon_running().await {
            debug!("Skipping multipath discovery, multipathd isn't running");
            return None;
        }

        let probe = probe_fn(move || async move {
            for device in devices {
                if let Some(dm) = self.sysfs.multipath_holder(device).await {
                    return ProbeOutcome::Ready(dm);
                }
            }
            ProbeOutcome::Retry("multipath device not yet present".to_string())
        });

        let policy = RetryPolicy::polling(self.config.multipath_timeout);
        match retry(&policy, "wait_for_multipath_device", probe).await {
            Ok(dm) => {
                info!(multipath_device = %dm, "Multipath device found");
                Some(dm)
            }
            Err(e) => {
                warn!(
                    timeout_secs = self.config.multipath_timeout.as_secs(),
                    error = %e,
                    "Could not find multipath device"
                );
                None
            }
        }
    }

    /// Flush the multipath map. Failures are logged and ignored.
    pub async fn flush(&self, multipath_device: &str) {
        let path = format!("/dev/{multipath_device}");
        if let Err(e) = self
            .exec
            .exec_with_timeout("multipath", MULTIPATH_COMMAND_TIMEOUT, &["-f", &path])
            .await
        {
            warn!(device = %multipath_device, error = %e, "Error encountered in multipath flush device command");
        }
    }

    /// Make multipathd re-read the map, e.g. after its paths grew.
    pub async fn reload(&self, multipath_device: &str) -> Result<()> {
        let path = format!("/dev/{multipath_device}");
        self.exec
            .exec_with_timeout("multipath", MULTIPATH_COMMAND_TIMEOUT, &["-r", &path])
            .await
            .map_err(|e| {
                error!(device = %multipath_device, error = %e, "Failed to reload multipath device");
                e
            })?;
        Ok(())
    }

    /// Flush outstanding I/O on each raw path. Failures are logged and ignored.
    pub async fn flush_buffers(&self, devices: &[String]) {
        for device in devices {
            let path = format!("/dev/{device}");
            if let Err(e) = self
                .exec
                .exec_with_timeout("blockdev", FLUSHBUFS_TIMEOUT, &["--flushbufs", &path])
                .await
            {
                warn!(device = %device, error = %e, "Error encountered in blockdev --flushbufs command");
            }
        }
    }
}
