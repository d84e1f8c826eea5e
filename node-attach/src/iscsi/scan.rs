//! LUN discovery: bus rescans and waiting for block devices to appear.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::Inventory;
use crate::config::EngineConfig;
use crate::error::{AttachError, Result};
use crate::exec::Executor;
use crate::retry::{ProbeOutcome, RetryPolicy, probe_fn, retry};
use crate::sysfs::Sysfs;
use crate::types::{HostSessionMap, ScsiDeviceInfo};

/// Triggers SCSI scans and waits for a LUN's paths.
#[derive(Debug, Clone)]
pub struct ScanOrchestrator {
    exec: Executor,
    sysfs: Sysfs,
    config: Arc<EngineConfig>,
    inventory: Inventory,
}

async fn block_dir_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path.join("block"))
        .await
        .unwrap_or(false)
}

impl ScanOrchestrator {
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

    async fn host_session_map(&self, target_iqn: &str) -> Result<HostSessionMap> {
        let map = self.sysfs.host_session_map(target_iqn).await;
        if map.is_empty() {
            return Err(AttachError::NoHostsForTarget(target_iqn.to_string()));
        }
        debug!(host_session_map = ?map, "Built iSCSI host/session map");
        Ok(map)
    }

    /// At least one block device for the LUN is already present.
    pub async fn is_already_attached(&self, lun: u32, target_iqn: &str) -> bool {
        let map = self.sysfs.host_session_map(target_iqn).await;
        if map.is_empty() {
            return false;
        }
        let paths = self.sysfs.block_dirs_for_lun(lun, &map);
        matches!(self.sysfs.devices_for_lun(&paths).await, Ok(devices) if !devices.is_empty())
    }

    /// Make the LUN's block devices appear, scanning first if asked.
    ///
    /// Waits a short window for every path, then the rest of the discovery
    /// budget for any single path.
    #[instrument(skip(self))]
    pub async fn ensure_lun_visible(
        &self,
        lun: u32,
        target_iqn: &str,
        should_scan: bool,
    ) -> Result<()> {
        let map = self.host_session_map(target_iqn).await?;
        let hosts: Vec<u32> = map.keys().copied().collect();

        if should_scan {
            self.inventory.log_snapshot("before scan").await;
            if let Err(e) = self.sysfs.scan_target_lun(lun, &hosts).await {
                error!(error = %e, "Could not scan for new LUN");
            }
            self.inventory.log_snapshot("after scan").await;
        }

        let paths = self.sysfs.block_dirs_for_lun(lun, &map);
        debug!(paths = ?paths, "Scanning paths");

        let all_paths = probe_fn(|| {
            let paths = &paths;
            async move {
                for path in paths {
                    if !block_dir_exists(path).await {
                        return ProbeOutcome::Retry("device not present yet".to_string());
                    }
                }
                ProbeOutcome::Ready(())
            }
        });
        let all_policy = RetryPolicy::polling(self.config.all_paths_window);
        if retry(&all_policy, "wait_for_all_paths", all_paths).await.is_ok() {
            debug!(paths = ?paths, "All paths found");
            return Ok(());
        }

        let any_path = probe_fn(|| {
            let paths = &paths;
            async move {
                let mut found = Vec::new();
                for path in paths {
                    if block_dir_exists(path).await {
                        found.push(path.clone());
                    }
                }
                if found.is_empty() {
                    ProbeOutcome::Retry("no devices present yet".to_string())
                } else {
                    ProbeOutcome::Ready(found)
                }
            }
        });
        let remaining = self
            .config
            .device_discovery_timeout
            .saturating_sub(self.config.all_paths_window);
        match retry(&RetryPolicy::polling(remaining), "wait_for_any_path", any_path).await {
            Ok(found) => {
                info!(found = ?found, expected = paths.len(), "Proceeding with available paths");
                Ok(())
            }
            Err(e) => {
                warn!(
                    timeout_secs = self.config.device_discovery_timeout.as_secs(),
                    "Could not find all devices"
                );
                self.dump_diagnostics().await;
                Err(e)
            }
        }
    }

    /// Log what the host can see; output goes to the debug log only.
    async fn dump_diagnostics(&self) {
        let dev = self.config.host_path("/dev");
        let mapper = self.config.host_path("/dev/mapper");
        let by_path = self.config.host_path("/dev/disk/by-path");
        let commands: [(&str, Vec<String>); 6] = [
            ("ls", vec!["-al".into(), dev.display().to_string()]),
            ("ls", vec!["-al".into(), mapper.display().to_string()]),
            ("ls", vec!["-al".into(), by_path.display().to_string()]),
            ("lsscsi", vec![]),
            ("lsscsi", vec!["-t".into()]),
            ("free", vec![]),
        ];
        for (program, args) in commands {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let _ = self.exec.exec(program, &args).await;
        }
    }

    /// Raw paths and multipath parent currently bound to the LUN.
    pub async fn device_info_for_lun(&self, lun: u32, target_iqn: &str) -> Result<ScsiDeviceInfo> {
        let map = self.host_session_map(target_iqn).await?;
        let paths = self.sysfs.block_dirs_for_lun(lun, &map);

        let devices = self.sysfs.devices_for_lun(&paths).await?;
        if devices.is_empty() {
            return Err(AttachError::ScanIncomplete {
                lun,
                target_iqn: target_iqn.to_string(),
            });
        }

        let mut multipath_device = None;
        for device in &devices {
            if let Some(dm) = self.sysfs.multipath_holder(device).await {
                multipath_device = Some(dm);
                break;
            }
        }

        debug!(
            lun,
            multipath_device = ?multipath_device,
            devices = ?devices,
            host_session_map = ?map,
            "Found SCSI device"
        );

        Ok(ScsiDeviceInfo {
            lun: lun.to_string(),
            devices,
            multipath_device,
            iqn: target_iqn.to_string(),
            host_session_map: map,
            ..Default::default()
        })
    }
}
