//! Engine configuration.
//!
//! One [`EngineConfig`] value is built at startup and handed to every
//! component; nothing reads the environment after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AttachError, Result};
use crate::types::DEFAULT_ISCSI_PORT;

/// Host root used when running as a container plugin.
pub const DOCKER_PLUGIN_HOST_ROOT: &str = "/host";

pub const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Durations are written as whole seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for every sysfs and /dev path; empty means the real root
    pub host_root: PathBuf,
    /// Port used for portals given without one
    pub iscsi_port: u16,
    /// Initiator interface when the publish info names none
    pub iscsi_interface: String,
    /// Overall budget for a LUN's block devices to appear
    #[serde(with = "secs")]
    pub device_discovery_timeout: Duration,
    /// Part of the discovery budget spent waiting for every path at once
    #[serde(with = "secs")]
    pub all_paths_window: Duration,
    /// Budget for multipath binding and for the device node to show up
    #[serde(with = "secs")]
    pub multipath_timeout: Duration,
    #[serde(with = "secs")]
    pub resource_deletion_timeout: Duration,
    #[serde(with = "secs")]
    pub format_timeout: Duration,
    /// Pause after deleting SCSI devices
    #[serde(with = "secs")]
    pub removal_settle: Duration,
    /// Pause after a capacity rescan before re-reading sizes
    #[serde(with = "secs")]
    pub resize_grace: Duration,
    /// Mount table of the engine's own mount namespace
    pub mountinfo_path: PathBuf,
    /// Log CHAP secrets in command lines
    pub log_sensitive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_root: PathBuf::new(),
            iscsi_port: DEFAULT_ISCSI_PORT,
            iscsi_interface: "default".to_string(),
            device_discovery_timeout: Duration::from_secs(90),
            all_paths_window: Duration::from_secs(5),
            multipath_timeout: Duration::from_secs(90),
            resource_deletion_timeout: Duration::from_secs(40),
            format_timeout: Duration::from_secs(30),
            removal_settle: Duration::from_secs(1),
            resize_grace: Duration::from_secs(1),
            mountinfo_path: PathBuf::from(PROC_SELF_MOUNTINFO),
            log_sensitive: false,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AttachError::io(format!("reading {}", path.display()), e))?;
        let config: EngineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the host root: an explicit value wins, then plugin mode.
    pub fn resolve_host_root(explicit: Option<PathBuf>, docker_plugin_mode: bool) -> PathBuf {
        match explicit {
            Some(root) => root,
            None if docker_plugin_mode => PathBuf::from(DOCKER_PLUGIN_HOST_ROOT),
            None => PathBuf::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.all_paths_window > self.device_discovery_timeout {
            return Err(AttachError::InvalidArgument(format!(
                "all_paths_window ({}s) exceeds device_discovery_timeout ({}s)",
                self.all_paths_window.as_secs(),
                self.device_discovery_timeout.as_secs()
            )));
        }
        if self.iscsi_port == 0 {
            return Err(AttachError::InvalidArgument(
                "iscsi_port must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Map an absolute host path under `host_root`.
    pub fn host_path(&self, path: &str) -> PathBuf {
        if self.host_root.as_os_str().is_empty() {
            PathBuf::from(path)
        } else {
            self.host_root.join(path.trim_start_matches('/'))
        }
    }
}
