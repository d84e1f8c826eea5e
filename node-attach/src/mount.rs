//! Mount table queries and mount/unmount helpers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{AttachError, Result};
use crate::exec::Executor;
use crate::retry::{ProbeOutcome, RetryPolicy, probe_fn, retry};
use crate::sysfs::Sysfs;
use crate::types::DfInfo;

/// Directory under a staging path used to mount a filesystem for resize.
pub const TEMPORARY_MOUNT_DIR: &str = "tmp_mnt";

const UMOUNT_TIMEOUT: Duration = Duration::from_secs(10);
/// Mount points of persistent volumes contain this component.
const PVC_MOUNT_MARKER: &str = "/pvc-";

/// One line of `/proc/<pid>/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_id: u32,
    pub parent_id: u32,
    pub major_minor: String,
    pub root: String,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub fs_type: String,
    pub mount_source: String,
    pub super_options: Vec<String>,
}

/// Undo the kernel's octal escaping (`\040` for space and so on).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_mountinfo_line(line: &str) -> Result<MountInfo> {
    let parse_error = || AttachError::Parse {
        what: "mountinfo line",
        detail: line.to_string(),
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(parse_error());
    }
    let separator = fields[6..]
        .iter()
        .position(|f| *f == "-")
        .map(|p| p + 6)
        .ok_or_else(parse_error)?;
    if fields.len() < separator + 3 {
        return Err(parse_error());
    }

    Ok(MountInfo {
        mount_id: fields[0].parse().map_err(|_| parse_error())?,
        parent_id: fields[1].parse().map_err(|_| parse_error())?,
        major_minor: fields[2].to_string(),
        root: unescape(fields[3]),
        mount_point: unescape(fields[4]),
        mount_options: fields[5].split(',').map(str::to_string).collect(),
        fs_type: unescape(fields[separator + 1]),
        mount_source: unescape(fields[separator + 2]),
        super_options: fields
            .get(separator + 3)
            .map(|o| o.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

/// Parse a whole mountinfo file, skipping blank lines.
pub fn parse_mountinfo(contents: &str) -> Result<Vec<MountInfo>> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_mountinfo_line)
        .collect()
}

/// Target/source pairs from `df --output=target,source`, header dropped.
pub fn parse_df_output(output: &str) -> Vec<DfInfo> {
    let mut entries: Vec<DfInfo> = output
        .trim()
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(target), Some(source)) => Some(DfInfo {
                    target: target.to_string(),
                    source: source.to_string(),
                }),
                _ => None,
            }
        })
        .collect();
    if entries.len() > 1 {
        entries.remove(0);
    }
    entries
}

/// Create `path` as a directory unless it already is one.
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            error!(path = %path.display(), "Path exists but is not a directory");
            Err(AttachError::InvalidArgument(format!(
                "path exists but is not a directory: {}",
                path.display()
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| AttachError::io(format!("failed to mkdir {}", path.display()), e)),
        Err(e) => Err(AttachError::io(
            format!("can't determine if directory {} exists", path.display()),
            e,
        )),
    }
}

/// Create `path` as an empty file unless a file is already there.
pub async fn ensure_file_exists(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            error!(path = %path.display(), "Path exists but is a directory");
            Err(AttachError::InvalidArgument(format!(
                "path exists but is a directory: {}",
                path.display()
            )))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::File::create(path)
            .await
            .map(|_| ())
            .map_err(|e| AttachError::io(format!("failed to create file {}", path.display()), e)),
        Err(e) => Err(AttachError::io(
            format!("can't determine if file {} exists", path.display()),
            e,
        )),
    }
}

/// Mounts, unmounts and inspects the mount table.
#[derive(Debug, Clone)]
pub struct MountManager {
    exec: Executor,
    sysfs: Sysfs,
    config: Arc<EngineConfig>,
}

impl MountManager {
    pub fn new(exec: Executor, sysfs: Sysfs, config: Arc<EngineConfig>) -> Self {
        Self {
            exec,
            sysfs,
            config,
        }
    }

    pub async fn mount_table(&self) -> Result<Vec<MountInfo>> {
        let path = &self.config.mountinfo_path;
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AttachError::io(format!("reading {}", path.display()), e))?;
        parse_mountinfo(&contents)
    }

    /// Follow symlinks of a host `/dev` path, returning the real host path.
    pub async fn resolve_device_path(&self, device_path: &str) -> Result<String> {
        let resolved = tokio::fs::canonicalize(self.sysfs.path(device_path))
            .await
            .map_err(|e| AttachError::io(format!("resolving {device_path}"), e))?;

        let root = self.sysfs.root();
        if root.as_os_str().is_empty() {
            return Ok(resolved.to_string_lossy().into_owned());
        }
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| AttachError::io(format!("resolving {}", root.display()), e))?;
        let host_path = match resolved.strip_prefix(&root) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => resolved,
        };
        Ok(host_path.to_string_lossy().into_owned())
    }

    /// Device name (no `/dev/`) behind a mount table entry.
    ///
    /// Sources outside `/dev` fall back to the entry's root field.
    async fn mounted_device(&self, entry: &MountInfo) -> Option<String> {
        if entry.mount_source.starts_with("/dev/") {
            match self.resolve_device_path(&entry.mount_source).await {
                Ok(path) => Some(path.trim_start_matches("/dev/").to_string()),
                Err(e) => {
                    error!(source = %entry.mount_source, error = %e, "Could not resolve mount source");
                    None
                }
            }
        } else {
            Some(entry.root.trim_start_matches('/').to_string())
        }
    }

    /// Whether `mount_point` is mounted, and from `source_device` if one is given.
    pub async fn is_mounted(&self, source_device: Option<&str>, mount_point: &str) -> Result<bool> {
        let table = self.mount_table().await.map_err(|e| {
            error!(error = %e, "Checking mounted failed");
            e
        })?;

        let source_name = source_device
            .and_then(|d| d.strip_prefix("/dev/"))
            .unwrap_or_default();

        for entry in table.iter().filter(|m| m.mount_point.contains(mount_point)) {
            debug!(mount_point = %entry.mount_point, source = %entry.mount_source, "Mountpoint found");
            if source_device.is_none() {
                return Ok(true);
            }
            if self.mounted_device(entry).await.as_deref() == Some(source_name) {
                debug!(source = source_name, target = mount_point, "Is mounted");
                return Ok(true);
            }
        }

        debug!(source = ?source_device, target = mount_point, "Not mounted");
        Ok(false)
    }

    /// Device names mounted at persistent-volume mount points.
    pub async fn mounted_volume_devices(&self) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        for entry in self.mount_table().await? {
            if !entry.mount_point.contains(PVC_MOUNT_MARKER) {
                continue;
            }
            if let Some(device) = self.mounted_device(&entry).await {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    /// Mount source of the entry mounted exactly at `mount_path`.
    pub async fn device_for_mount_path(&self, mount_path: &str) -> Result<String> {
        self.mount_table()
            .await?
            .into_iter()
            .find(|m| m.mount_point == mount_path)
            .map(|m| m.mount_source)
            .ok_or_else(|| AttachError::NoDevice(mount_path.to_string()))
    }

    /// Mount `device` at `mount_point` unless it is already mounted there.
    ///
    /// The mount point is created first, as a file when publishing a raw
    /// block device.
    #[instrument(skip(self))]
    pub async fn mount_device(
        &self,
        device: &str,
        mount_point: &str,
        options: &str,
        mount_point_is_file: bool,
    ) -> Result<()> {
        let options = options.trim_start_matches("-o ");
        let mut args = Vec::with_capacity(4);
        if !options.is_empty() {
            args.extend(["-o", options]);
        }
        args.extend([device, mount_point]);

        let mounted = self
            .is_mounted(Some(device), mount_point)
            .await
            .unwrap_or(false);
        let path = Path::new(mount_point);
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        debug!(mounted, exists, "Checked mount point");

        if !exists {
            let created = if mount_point_is_file {
                ensure_file_exists(path).await
            } else {
                ensure_dir_exists(path).await
            };
            if let Err(e) = created {
                warn!(error = %e, "Mount point creation failed");
            }
        }

        if !mounted {
            self.exec.exec("mount", &args).await.map_err(|e| {
                error!(error = %e, "Mount failed");
                e
            })?;
        }
        Ok(())
    }

    /// Mount an NFS export (`server:path`).
    #[instrument(skip(self))]
    pub async fn mount_nfs(&self, export_path: &str, mount_point: &str, options: &str) -> Result<()> {
        let options = options.trim_start_matches("-o ");
        let mut args = vec!["-t", "nfs"];
        if !options.is_empty() {
            args.extend(["-o", options]);
        }
        args.extend([export_path, mount_point]);

        if let Err(e) = ensure_dir_exists(Path::new(mount_point)).await {
            warn!(error = %e, "Mkdir failed");
        }

        self.exec.exec("mount", &args).await.map_err(|e| {
            error!(export = export_path, mount_point, error = %e, "Error mounting NFS volume");
            e
        })?;
        info!(export = export_path, mount_point, "NFS volume mounted");
        Ok(())
    }

    /// Unmount, forcing it if the plain unmount hangs.
    #[instrument(skip(self))]
    pub async fn umount(&self, mount_point: &str) -> Result<()> {
        let err = match self
            .exec
            .exec_with_timeout("umount", UMOUNT_TIMEOUT, &[mount_point])
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        error!(error = %err, "Umount failed");
        if !err.is_timeout() {
            return Err(err.into());
        }

        match self
            .exec
            .exec_with_timeout("umount", UMOUNT_TIMEOUT, &[mount_point, "-f"])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if String::from_utf8_lossy(e.output()).contains("not mounted") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unmount `path` and remove the directory.
    pub async fn remove_mount_point(&self, path: &Path) -> Result<()> {
        let mount_point = path.to_string_lossy();
        self.umount(&mount_point).await.map_err(|e| {
            error!(mount_point = %mount_point, error = %e, "Umount failed");
            e
        })?;
        tokio::fs::remove_dir(path).await.map_err(|e| {
            error!(mount_point = %mount_point, error = %e, "Remove dir failed");
            AttachError::io(format!("failed to remove dir {mount_point}"), e)
        })
    }

    pub fn temporary_mount_point(staging_path: &str) -> PathBuf {
        Path::new(staging_path).join(TEMPORARY_MOUNT_DIR)
    }

    /// Remove a leftover resize mount point under `staging_path`.
    pub async fn unmount_temporary_mount_point(&self, staging_path: &str) -> Result<()> {
        let tmp = Self::temporary_mount_point(staging_path);
        match tokio::fs::metadata(&tmp).await {
            Ok(_) => self.remove_mount_point(&tmp).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!(path = %tmp.display(), error = %e, "Can't determine if temporary dir path exists");
                Err(AttachError::io(
                    format!("can't determine if temporary dir path {} exists", tmp.display()),
                    e,
                ))
            }
        }
    }

    /// `df` target/source listing; a failing `df` that printed output is tolerated.
    pub async fn df_entries(&self) -> Result<Vec<DfInfo>> {
        let out = match self.exec.exec("df", &["--output=target,source"]).await {
            Ok(out) => out,
            Err(e) if !e.output().is_empty() => {
                warn!(error = %e, "df reported an error, using its output");
                e.output().to_vec()
            }
            Err(e) => {
                error!(error = %e, "Error encountered gathering df output");
                return Err(e.into());
            }
        };
        Ok(parse_df_output(&String::from_utf8_lossy(&out)))
    }

    /// Remove a file or empty directory, retrying until it is gone.
    #[instrument(skip(self))]
    pub async fn delete_resource(&self, path: &Path) -> Result<()> {
        let probe = probe_fn(move || async move {
            match tokio::fs::metadata(path).await {
                Ok(meta) => {
                    let removed = if meta.is_dir() {
                        tokio::fs::remove_dir(path).await
                    } else {
                        tokio::fs::remove_file(path).await
                    };
                    match removed {
                        Ok(()) => ProbeOutcome::Ready(()),
                        Err(e) => ProbeOutcome::Retry(format!("failed to remove resource: {e}")),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => ProbeOutcome::Ready(()),
                Err(e) => ProbeOutcome::Retry(format!("can't determine if resource exists: {e}")),
            }
        });

        let policy = RetryPolicy::polling(self.config.resource_deletion_timeout);
        retry(&policy, "delete_resource", probe).await?;
        debug!(resource = %path.display(), "Resource deleted");
        Ok(())
    }
}
