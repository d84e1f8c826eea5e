//! Attach, detach and resize workflows.
//!
//! [`AttachEngine`] strings the components together. Every step re-checks
//! kernel state before changing it, so an interrupted workflow can simply be
//! run again:
//!
//! ```text
//! attach:  session -> scan -> multipath -> device node -> [format] -> [mount]
//! detach:  [unmount] -> flush multipath -> flush buffers -> delete paths
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{AttachError, Result};
use crate::exec::Executor;
use crate::filesystem::{FS_RAW, FilesystemExpansion, FilesystemManager, FilesystemType};
use crate::iscsi::{Inventory, ScanOrchestrator, SessionManager};
use crate::metrics::OperationTimer;
use crate::mount::MountManager;
use crate::multipath::MultipathCoordinator;
use crate::sysfs::Sysfs;
use crate::types::{Portal, PublishInfo, ScsiDeviceInfo, is_ipv6};

/// Host-side volume attachment engine.
#[derive(Debug, Clone)]
pub struct AttachEngine {
    config: Arc<EngineConfig>,
    sysfs: Sysfs,
    inventory: Inventory,
    sessions: SessionManager,
    scanner: ScanOrchestrator,
    multipath: MultipathCoordinator,
    filesystems: FilesystemManager,
    mounts: MountManager,
}

impl AttachEngine {
    pub fn new(config: EngineConfig, exec: Executor) -> Self {
        let config = Arc::new(config);
        let sysfs = Sysfs::from_config(&config);
        let inventory = Inventory::new(exec.clone(), sysfs.clone());

        Self {
            sessions: SessionManager::new(exec.clone(), config.clone(), inventory.clone()),
            scanner: ScanOrchestrator::new(
                exec.clone(),
                sysfs.clone(),
                config.clone(),
                inventory.clone(),
            ),
            multipath: MultipathCoordinator::new(exec.clone(), sysfs.clone(), config.clone()),
            filesystems: FilesystemManager::new(
                exec.clone(),
                sysfs.clone(),
                config.clone(),
                inventory.clone(),
            ),
            mounts: MountManager::new(exec, sysfs.clone(), config.clone()),
            config,
            sysfs,
            inventory,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn mounts(&self) -> &MountManager {
        &self.mounts
    }

    // ========================================================================
    // Attach
    // ========================================================================

    /// Attach the LUN described by `publish_info`, format it if blank and
    /// optionally mount it.
    ///
    /// The resolved `/dev` path is stored in `publish_info.device_path` as
    /// soon as it is known so a later mount can use it.
    #[instrument(skip(self, publish_info), fields(target_iqn = %publish_info.target_iqn, lun = publish_info.lun))]
    pub async fn attach(
        &self,
        publish_info: &mut PublishInfo,
        mount_point: Option<&str>,
    ) -> Result<String> {
        let timer = OperationTimer::new("attach");
        let result = self.attach_inner(publish_info, mount_point).await;
        timer.finish(&result);
        result
    }

    async fn attach_inner(
        &self,
        publish_info: &mut PublishInfo,
        mount_point: Option<&str>,
    ) -> Result<String> {
        let lun = publish_info.lun;
        let target_iqn = publish_info.target_iqn.clone();
        let fs_type = publish_info.filesystem_type.clone();
        let iface = if publish_info.iscsi_interface.is_empty() {
            self.config.iscsi_interface.clone()
        } else {
            publish_info.iscsi_interface.clone()
        };

        debug!(
            portals = ?publish_info.all_portals().collect::<Vec<_>>(),
            iscsi_interface = %iface,
            fs_type = %fs_type,
            "Attaching iSCSI volume"
        );

        if !self.sessions.supported().await {
            error!("Unable to attach volume: open-iscsi utils not found");
            return Err(AttachError::Session(
                "unable to attach: open-iscsi tools not found on host".to_string(),
            ));
        }

        if !self.sessions.session_exists_to_target(&target_iqn).await? {
            self.login(publish_info, &iface).await?;
        }

        let should_scan = !self.scanner.is_already_attached(lun, &target_iqn).await;
        self.scanner
            .ensure_lun_visible(lun, &target_iqn, should_scan)
            .await
            .inspect_err(|e| error!(error = %e, "Could not find iSCSI device"))?;

        let device_info = self.resolve_lun_device(lun, &target_iqn).await?;
        let device = device_info
            .device_to_use()
            .ok_or_else(|| AttachError::NoDevice(format!("LUN {lun} of {target_iqn}")))?
            .to_string();
        let device_path = format!("/dev/{device}");
        self.filesystems.wait_for_device(&device_path).await?;

        publish_info.device_path = device_path.clone();

        if fs_type == FS_RAW {
            info!(device = %device_path, "Raw block volume attached");
            return Ok(device_path);
        }

        match self.filesystems.get_fs_type(&device_path).await? {
            None => {
                debug!(device = %device_path, fs_type = %fs_type, "Formatting LUN");
                self.filesystems.format(&device_path, &fs_type).await?;
            }
            Some(existing) if existing != fs_type => {
                error!(
                    device = %device_path,
                    existing_fs_type = %existing,
                    requested_fs_type = %fs_type,
                    "LUN already formatted with a different file system type"
                );
                return Err(AttachError::FilesystemMismatch {
                    device,
                    existing,
                    requested: fs_type,
                });
            }
            Some(_) => debug!(device = %device_path, fs_type = %fs_type, "LUN already formatted"),
        }

        if let Some(mount_point) = mount_point {
            self.mounts
                .mount_device(&device_path, mount_point, &publish_info.mount_options, false)
                .await?;
        }

        info!(device = %device_path, mount_point = ?mount_point, "iSCSI volume attached");
        Ok(device_path)
    }

    /// Log in to every portal of the volume.
    async fn login(&self, publish_info: &PublishInfo, iface: &str) -> Result<()> {
        let target_iqn = &publish_info.target_iqn;
        if !publish_info.use_chap {
            return self
                .sessions
                .ensure_sessions(publish_info.all_portals())
                .await
                .inspect_err(|e| error!(error = %e, "Failed to establish iSCSI session"));
        }

        let creds = publish_info.chap_credentials();
        for portal in publish_info.all_portals() {
            let portal = Portal::parse(portal, self.config.iscsi_port)
                .map_err(|e| AttachError::InvalidArgument(e.to_string()))?;
            self.sessions
                .login_with_chap(target_iqn, &portal, &creds, iface)
                .await
                .inspect_err(|e| error!(error = %e, "Failed to login with CHAP credentials"))?;
        }
        Ok(())
    }

    /// Device info for a visible LUN, waiting for multipath to bind its paths.
    async fn resolve_lun_device(&self, lun: u32, target_iqn: &str) -> Result<ScsiDeviceInfo> {
        let mut device_info = self.scanner.device_info_for_lun(lun, target_iqn).await?;
        if device_info.multipath_device.is_none() {
            device_info.multipath_device = self
                .multipath
                .wait_for_multipath_device(&device_info.devices)
                .await;
        }
        debug!(
            lun = %device_info.lun,
            multipath_device = ?device_info.multipath_device,
            devices = ?device_info.devices,
            iqn = %device_info.iqn,
            "Found device"
        );
        Ok(device_info)
    }

    /// Mount the NFS export named by `publish_info`.
    #[instrument(skip(self, publish_info))]
    pub async fn attach_nfs(&self, publish_info: &PublishInfo, mount_point: &str) -> Result<()> {
        let timer = OperationTimer::new("attach_nfs");
        let server = if is_ipv6(&publish_info.nfs_server_ip)
            && !publish_info.nfs_server_ip.starts_with('[')
        {
            format!("[{}]", publish_info.nfs_server_ip)
        } else {
            publish_info.nfs_server_ip.clone()
        };
        let export_path = format!("{server}:{}", publish_info.nfs_path);
        debug!(export_path = %export_path, mount_point, "Publishing NFS volume");

        let result = self
            .mounts
            .mount_nfs(&export_path, mount_point, &publish_info.mount_options)
            .await;
        timer.finish(&result);
        result
    }

    // ========================================================================
    // Detach
    // ========================================================================

    /// Remove the LUN's paths from the host.
    ///
    /// A LUN that cannot be found is treated as already detached.
    #[instrument(skip(self))]
    pub async fn detach_lun(&self, lun: u32, target_iqn: &str) -> Result<()> {
        let timer = OperationTimer::new("detach");
        let device_info = match self.scanner.device_info_for_lun(lun, target_iqn).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Could not get device info for removal, skipping host removal steps");
                timer.success();
                return Ok(());
            }
        };
        self.remove_scsi_device(&device_info).await;
        timer.success();
        Ok(())
    }

    /// Remove the device mounted at `mount_path`, unmounting it first if asked.
    #[instrument(skip(self))]
    pub async fn detach_mount_path(&self, mount_path: &str, unmount: bool) -> Result<()> {
        let timer = OperationTimer::new("detach");
        let result: Result<()> = async {
            let device_info = self.device_info_for_mount_path(mount_path).await?;
            if unmount {
                self.mounts.umount(mount_path).await?;
            }
            self.remove_scsi_device(&device_info).await;
            Ok(())
        }
        .await;
        timer.finish(&result);
        result
    }

    /// Devices behind whatever is mounted at `mount_path`.
    pub async fn device_info_for_mount_path(&self, mount_path: &str) -> Result<ScsiDeviceInfo> {
        let source = self.mounts.device_for_mount_path(mount_path).await?;
        let resolved = self.mounts.resolve_device_path(&source).await?;
        let device = resolved.trim_start_matches("/dev/").to_string();

        let device_info = if Sysfs::is_multipath_device(&device) {
            ScsiDeviceInfo {
                devices: self.sysfs.list_slaves(&device).await,
                multipath_device: Some(device),
                ..Default::default()
            }
        } else {
            ScsiDeviceInfo {
                devices: vec![device],
                ..Default::default()
            }
        };

        debug!(
            multipath_device = ?device_info.multipath_device,
            devices = ?device_info.devices,
            "Found SCSI device"
        );
        Ok(device_info)
    }

    /// Flush and delete a device's paths. Only `devices` and
    /// `multipath_device` are used.
    async fn remove_scsi_device(&self, device_info: &ScsiDeviceInfo) {
        self.inventory.log_snapshot("before removal").await;

        if let Some(dm) = &device_info.multipath_device {
            self.multipath.flush(dm).await;
        }
        self.multipath.flush_buffers(&device_info.devices).await;

        for device in &device_info.devices {
            match self.sysfs.delete_device(device).await {
                Ok(()) => debug!(device = %device, "Invoked device delete"),
                Err(e) => warn!(device = %device, error = %e, "Could not delete device"),
            }
        }

        tokio::time::sleep(self.config.removal_settle).await;
        self.inventory.log_snapshot("after removal").await;
    }

    // ========================================================================
    // Resize
    // ========================================================================

    /// Grow the filesystem on an attached device to fill its LUN.
    ///
    /// The device is mounted at a temporary directory under `staging_path`
    /// which is always unmounted and removed afterwards. A directory left
    /// behind by an interrupted expansion is cleaned up first.
    #[instrument(skip(self, publish_info), fields(device = %publish_info.device_path))]
    pub async fn expand_filesystem(
        &self,
        publish_info: &PublishInfo,
        staging_path: &str,
    ) -> Result<FilesystemExpansion> {
        let timer = OperationTimer::new("expand_filesystem");
        let result = self.expand_inner(publish_info, staging_path).await;
        timer.finish(&result);
        result
    }

    async fn expand_inner(
        &self,
        publish_info: &PublishInfo,
        staging_path: &str,
    ) -> Result<FilesystemExpansion> {
        let fs_type: FilesystemType = publish_info.filesystem_type.parse()?;
        let device_path = &publish_info.device_path;

        self.mounts.unmount_temporary_mount_point(staging_path).await?;

        let tmp_mount_point = MountManager::temporary_mount_point(staging_path);
        let tmp = tmp_mount_point.to_string_lossy().into_owned();
        self.mounts
            .mount_device(device_path, &tmp, &publish_info.mount_options, false)
            .await?;

        let result = self.filesystems.grow(fs_type, device_path, &tmp).await;

        if let Err(e) = self.mounts.remove_mount_point(Path::new(&tmp)).await {
            warn!(mount_point = %tmp, error = %e, "Could not remove temporary mount point");
        }
        result
    }

    /// Make the kernel see a grown LUN, on every path and on the multipath map.
    #[instrument(skip(self))]
    pub async fn rescan_devices(&self, target_iqn: &str, lun: u32, min_size: u64) -> Result<()> {
        let timer = OperationTimer::new("rescan_devices");
        let result = self.rescan_inner(target_iqn, lun, min_size).await;
        timer.finish(&result);
        result
    }

    async fn rescan_inner(&self, target_iqn: &str, lun: u32, min_size: u64) -> Result<()> {
        let device_info = self.scanner.device_info_for_lun(lun, target_iqn).await?;

        let mut all_large_enough = true;
        for device in &device_info.devices {
            let size = self.filesystems.disk_size(&format!("/dev/{device}")).await?;
            if size >= min_size {
                continue;
            }
            all_large_enough = false;
            self.inventory.log_snapshot("before rescan").await;
            self.sysfs.rescan_disk(device).await.inspect_err(|e| {
                error!(device = %device, error = %e, "Failed to rescan disk");
            })?;
            self.inventory.log_snapshot("after rescan").await;
        }

        if !all_large_enough {
            tokio::time::sleep(self.config.resize_grace).await;
            for device in &device_info.devices {
                let size = self.filesystems.disk_size(&format!("/dev/{device}")).await?;
                if size < min_size {
                    error!(device = %device, size, min_size, "Disk size not large enough after resize");
                    return Err(AttachError::SizeBelowMinimum {
                        device: device.clone(),
                        size,
                        min_size,
                    });
                }
            }
        }

        if let Some(dm) = &device_info.multipath_device {
            let dm_path = format!("/dev/{dm}");
            let size = self.filesystems.disk_size(&dm_path).await?;
            if size < min_size {
                debug!(size, min_size, "Reloading the multipath device");
                self.multipath.reload(dm).await?;
                tokio::time::sleep(self.config.resize_grace).await;
                let size = self.filesystems.disk_size(&dm_path).await?;
                if size < min_size {
                    error!(size, min_size, "Multipath device not large enough after resize");
                    return Err(AttachError::SizeBelowMinimum {
                        device: dm.clone(),
                        size,
                        min_size,
                    });
                }
            } else {
                debug!(size, min_size, "Multipath device already large enough");
            }
        }

        Ok(())
    }

    // ========================================================================
    // Queries and logout
    // ========================================================================

    pub async fn is_already_attached(&self, lun: u32, target_iqn: &str) -> bool {
        self.scanner.is_already_attached(lun, target_iqn).await
    }

    pub async fn iscsi_devices(&self) -> Result<Vec<ScsiDeviceInfo>> {
        self.sysfs.iscsi_devices().await
    }

    /// iSCSI devices currently backing a persistent-volume mount.
    pub async fn mounted_iscsi_devices(&self) -> Result<Vec<ScsiDeviceInfo>> {
        let mounted = self.mounts.mounted_volume_devices().await?;
        let devices = self.sysfs.iscsi_devices().await?;

        let mut result = Vec::new();
        for name in &mounted {
            let found = devices.iter().find(|d| {
                d.multipath_device.as_deref() == Some(name.as_str()) || d.devices.contains(name)
            });
            if let Some(device) = found {
                debug!(
                    host = %device.host,
                    lun = %device.lun,
                    devices = ?device.devices,
                    multipath_device = ?device.multipath_device,
                    iqn = %device.iqn,
                    "Found mounted iSCSI device"
                );
                result.push(device.clone());
            }
        }
        Ok(result)
    }

    pub async fn target_has_mounted_device(&self, target_iqn: &str) -> Result<bool> {
        Ok(self
            .mounted_iscsi_devices()
            .await?
            .iter()
            .any(|d| d.iqn == target_iqn))
    }

    /// Log out of `portal` unless a LUN is still attached through any of the
    /// target's sessions.
    #[instrument(skip(self))]
    pub async fn logout(&self, target_iqn: &str, portal: &str) -> Result<()> {
        let timer = OperationTimer::new("logout");
        for (&host, &session) in &self.sysfs.host_session_map(target_iqn).await {
            if !self.sysfs.safe_to_logout(host, session).await {
                warn!(host, session, "Devices still attached, not logging out");
                timer.failure("in_use");
                return Err(AttachError::SessionStillInUse { host, session });
            }
        }
        let result = self.sessions.logout_and_delete(target_iqn, portal).await;
        timer.finish(&result);
        result
    }
}
