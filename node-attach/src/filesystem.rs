//! Filesystem detection, creation and growth on attached block devices.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{AttachError, Result};
use crate::exec::{Executor, Invocation};
use crate::iscsi::Inventory;
use crate::metrics;
use crate::retry::{ProbeOutcome, RetryPolicy, probe_fn, retry};
use crate::sysfs::Sysfs;

/// Requested type meaning "hand over the block device, no filesystem".
pub const FS_RAW: &str = "raw";

const BLKID_TIMEOUT: Duration = Duration::from_secs(5);
const DD_TIMEOUT: Duration = Duration::from_secs(5);
/// blkid exits 2 both for unformatted devices and for unreadable ones.
const BLKID_NOT_FOUND: i32 = 2;

/// Filesystems the engine can create and grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Xfs,
    Ext3,
    Ext4,
}

impl FilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Xfs => "xfs",
            FilesystemType::Ext3 => "ext3",
            FilesystemType::Ext4 => "ext4",
        }
    }

    fn mkfs_command(&self) -> (&'static str, &'static str) {
        match self {
            FilesystemType::Xfs => ("mkfs.xfs", "-f"),
            FilesystemType::Ext3 => ("mkfs.ext3", "-F"),
            FilesystemType::Ext4 => ("mkfs.ext4", "-F"),
        }
    }

    /// Growth tool and its single argument. `xfs_growfs` only accepts a
    /// mount point.
    fn grow_command<'a>(&self, device: &'a str, mount_point: &'a str) -> (&'static str, &'a str) {
        match self {
            FilesystemType::Xfs => ("xfs_growfs", mount_point),
            FilesystemType::Ext3 | FilesystemType::Ext4 => ("resize2fs", device),
        }
    }
}

impl FromStr for FilesystemType {
    type Err = AttachError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xfs" => Ok(FilesystemType::Xfs),
            "ext3" => Ok(FilesystemType::Ext3),
            "ext4" => Ok(FilesystemType::Ext4),
            other => Err(AttachError::UnsupportedFilesystem(other.to_string())),
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of growing a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemExpansion {
    pub size_bytes: u64,
    /// False when the size reported after growing equals the size before.
    pub grew: bool,
}

/// `TYPE` value from `blkid` output, ignoring `PTTYPE` and friends.
pub fn parse_blkid_type(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("TYPE="))
        .map(|value| value.trim_matches('"').trim().to_string())
        .rfind(|value| !value.is_empty())
}

/// Total size in bytes from `df -P -k` output.
pub fn parse_df_size(output: &str) -> Result<u64> {
    let line = output.lines().nth(1).ok_or_else(|| AttachError::Parse {
        what: "df output",
        detail: output.trim().to_string(),
    })?;
    let blocks = line
        .split_whitespace()
        .nth(1)
        .and_then(|b| b.parse::<u64>().ok())
        .ok_or_else(|| AttachError::Parse {
            what: "df output",
            detail: line.to_string(),
        })?;
    Ok(blocks * 1024)
}

#[derive(Debug, Clone)]
pub struct FilesystemManager {
    exec: Executor,
    sysfs: Sysfs,
    config: Arc<EngineConfig>,
    inventory: Inventory,
}

impl FilesystemManager {
    pub fn new(
        exec: Executor,
        sysfs: Sysfs,
        config: Arc<EngineConfig>,
        inventory: Inventory,
    ) -> Self {
        Self {
            exec,
            sysfs,
            config,
            inventory,
        }
    }

    /// Wait for a `/dev/...` node to exist under the host root.
    pub async fn wait_for_device(&self, device_path: &str) -> Result<()> {
        let probe = probe_fn(move || async move {
            if self.sysfs.exists(device_path).await {
                ProbeOutcome::Ready(())
            } else {
                ProbeOutcome::Retry("device not yet present".to_string())
            }
        });
        let policy = RetryPolicy::polling(self.config.multipath_timeout);
        retry(&policy, "wait_for_device", probe).await?;
        debug!(device = %device_path, "Device found");
        Ok(())
    }

    /// Filesystem type on `device_path`, `None` for a zeroed device.
    #[instrument(skip(self))]
    pub async fn get_fs_type(&self, device_path: &str) -> Result<Option<String>> {
        self.wait_for_device(device_path).await?;

        match self
            .exec
            .exec_with_timeout("blkid", BLKID_TIMEOUT, &[device_path])
            .await
        {
            Ok(out) => Ok(parse_blkid_type(&String::from_utf8_lossy(&out))),
            Err(e) if e.is_timeout() => {
                self.inventory.log_snapshot("blkid timeout").await;
                Err(e.into())
            }
            Err(e) if e.exit_code() == Some(BLKID_NOT_FOUND) => {
                info!(device = %device_path, error = %e, "Could not get FSType for device");
                self.ensure_unformatted(device_path).await?;
                Ok(None)
            }
            Err(e) => {
                error!(device = %device_path, error = %e, "Could not determine FSType for device");
                Err(e.into())
            }
        }
    }

    /// Fail unless the first 2 MiB of the device are zero.
    pub async fn ensure_unformatted(&self, device_path: &str) -> Result<()> {
        let input = format!("if={device_path}");
        let invocation = Invocation::new("dd", [input.as_str(), "bs=4096", "count=512", "status=none"])
            .with_timeout(DD_TIMEOUT)
            .without_output_logging();
        let out = self.exec.run(invocation).await.map_err(|e| {
            error!(device = %device_path, error = %e, "Failed to read the device");
            e
        })?;

        if out.iter().any(|b| *b != 0) {
            error!(device = %device_path, "Device contains non-zero values");
            return Err(AttachError::DeviceNotUnformatted(device_path.to_string()));
        }

        info!(device = %device_path, "Device is unformatted");
        Ok(())
    }

    /// Create a filesystem, retrying the tool under the format policy.
    #[instrument(skip(self))]
    pub async fn format(&self, device_path: &str, fs_type: &str) -> Result<()> {
        let fs_type: FilesystemType = fs_type.parse()?;
        let (program, force) = fs_type.mkfs_command();

        let probe = probe_fn(move || async move {
            match self.exec.exec(program, &[force, device_path]).await {
                Ok(_) => ProbeOutcome::Ready(()),
                Err(e) => ProbeOutcome::Retry(e.to_string()),
            }
        });

        let policy = RetryPolicy::format(self.config.format_timeout);
        retry(&policy, "format", probe).await.map_err(|e| {
            warn!(
                timeout_secs = self.config.format_timeout.as_secs(),
                "Could not format device"
            );
            e
        })?;

        info!(device = %device_path, fs_type = %fs_type, "Device formatted");
        Ok(())
    }

    /// Size of a block device in bytes.
    pub async fn disk_size(&self, device_path: &str) -> Result<u64> {
        let out = self
            .exec
            .exec("blockdev", &["--getsize64", device_path])
            .await?;
        let text = String::from_utf8_lossy(&out);
        text.trim().parse::<u64>().map_err(|_| AttachError::Parse {
            what: "device size",
            detail: text.trim().to_string(),
        })
    }

    /// Size in bytes of the filesystem mounted at `mount_point`.
    pub async fn filesystem_size(&self, mount_point: &str) -> Result<u64> {
        let out = self.exec.exec("df", &["-P", "-k", mount_point]).await?;
        parse_df_size(&String::from_utf8_lossy(&out))
    }

    /// Grow the filesystem mounted at `mount_point` to fill its device.
    ///
    /// An unchanged size is logged and counted but is not an error.
    #[instrument(skip(self))]
    pub async fn grow(
        &self,
        fs_type: FilesystemType,
        device_path: &str,
        mount_point: &str,
    ) -> Result<FilesystemExpansion> {
        let before = self.filesystem_size(mount_point).await?;

        let (program, argument) = fs_type.grow_command(device_path, mount_point);
        self.exec.exec(program, &[argument]).await.map_err(|e| {
            error!(error = %e, "Expanding filesystem failed");
            e
        })?;

        let after = self.filesystem_size(mount_point).await?;
        let grew = after != before;
        if !grew {
            warn!(size = after, "Failed to expand filesystem");
            metrics::record_resize_unchanged();
        } else {
            info!(before, after, "Filesystem expanded");
        }

        Ok(FilesystemExpansion {
            size_bytes: after,
            grew,
        })
    }
}
