//! Typed queries over the kernel's device topology in sysfs.
//!
//! All paths are resolved under the configured host root so the engine can
//! observe the host's tree from inside a container. A missing file or
//! directory is reported as "not present yet" rather than as an error; the
//! callers decide whether that is worth waiting for.
//!
//! Naming conventions used by the kernel for iSCSI (`hostN`, `sessionN`,
//! `targetH:0:0`, `H:C:T:L`, `dm-*` holders, `sd*` slaves) are kept here and
//! nowhere else.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::error::{AttachError, Result};
use crate::types::{HostSessionMap, ScsiDeviceInfo};

const MULTIPATH_PREFIX: &str = "dm-";
const DISK_PREFIX: &str = "sd";

/// Read-only and trigger-file access to sysfs and /dev under a host root.
#[derive(Debug, Clone, Default)]
pub struct Sysfs {
    root: PathBuf,
}

/// Sorted entry names of `dir`.
async fn list_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Number following `prefix`, e.g. `host3` with prefix `host`.
fn numbered(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// True for `H:C:T:L` directory names.
fn is_hctl(name: &str) -> bool {
    let parts: Vec<&str> = name.split(':').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u32>().is_ok())
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.host_root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an absolute host path under the root.
    pub fn path(&self, path: &str) -> PathBuf {
        if self.root.as_os_str().is_empty() {
            PathBuf::from(path)
        } else {
            self.root.join(path.trim_start_matches('/'))
        }
    }

    pub async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.path(path)).await.unwrap_or(false)
    }

    /// Entry names of a host directory, empty when it cannot be read.
    pub async fn list(&self, path: &str) -> Vec<String> {
        list_names(&self.path(path)).await.unwrap_or_default()
    }

    // ========================================================================
    // Host / session topology
    // ========================================================================

    /// Host and session numbers whose session `targetname` equals `target_iqn`.
    pub async fn host_session_map(&self, target_iqn: &str) -> HostSessionMap {
        let mut map = HostSessionMap::new();

        let sys_path = self.path("/sys/class/iscsi_host");
        let hosts = match list_names(&sys_path).await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!(path = %sys_path.display(), error = %e, "Could not read iSCSI hosts");
                return map;
            }
        };

        for host_name in hosts {
            let Some(host) = numbered(&host_name, "host") else {
                continue;
            };

            let device_path = sys_path.join(&host_name).join("device");
            let sessions = match list_names(&device_path).await {
                Ok(sessions) => sessions,
                Err(e) => {
                    error!(path = %device_path.display(), error = %e, "Could not read device path");
                    continue;
                }
            };

            for session_name in sessions {
                let Some(session) = numbered(&session_name, "session") else {
                    continue;
                };

                let target_name_path = device_path
                    .join(&session_name)
                    .join("iscsi_session")
                    .join(&session_name)
                    .join("targetname");
                match tokio::fs::read_to_string(&target_name_path).await {
                    Ok(name) if name.trim() == target_iqn => {
                        debug!(host, session, "Found iSCSI host/session");
                        map.insert(host, session);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(path = %target_name_path.display(), error = %e, "Could not read targetname file");
                    }
                }
            }
        }

        map
    }

    /// Where the LUN's SCSI device directory appears for each host/session.
    ///
    /// Channel and target id are always zero for iSCSI. Block devices show
    /// up under `<dir>/block`.
    pub fn block_dirs_for_lun(&self, lun: u32, map: &HostSessionMap) -> Vec<PathBuf> {
        map.iter()
            .map(|(host, session)| {
                self.path(&format!(
                    "/sys/class/scsi_host/host{host}/device/session{session}/iscsi_session/session{session}/device/target{host}:0:0/{host}:0:0:{lun}"
                ))
            })
            .collect()
    }

    /// First block device under each LUN directory that has one.
    pub async fn devices_for_lun(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        for path in paths {
            let block = path.join("block");
            match list_names(&block).await {
                Ok(names) => {
                    if let Some(first) = names.into_iter().next() {
                        devices.push(first);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(AttachError::io(format!("reading {}", block.display()), e)),
            }
        }
        Ok(devices)
    }

    // ========================================================================
    // Multipath relations
    // ========================================================================

    /// `dm-*` entries under a device's `holders`.
    pub async fn list_holders(&self, device: &str) -> Vec<String> {
        self.list(&format!("/sys/block/{device}/holders"))
            .await
            .into_iter()
            .filter(|name| name.starts_with(MULTIPATH_PREFIX))
            .collect()
    }

    /// `sd*` entries under a multipath device's `slaves`.
    pub async fn list_slaves(&self, multipath_device: &str) -> Vec<String> {
        self.list(&format!("/sys/block/{multipath_device}/slaves"))
            .await
            .into_iter()
            .filter(|name| name.starts_with(DISK_PREFIX))
            .collect()
    }

    /// Device-mapper parent of a raw device, if one is bound.
    pub async fn multipath_holder(&self, device: &str) -> Option<String> {
        let holder = self.list_holders(device).await.into_iter().next();
        if holder.is_none() {
            debug!(device, "Could not find multipath device for device");
        }
        holder
    }

    pub fn is_multipath_device(device: &str) -> bool {
        device.starts_with(MULTIPATH_PREFIX)
    }

    // ========================================================================
    // Trigger files
    // ========================================================================

    async fn write_trigger(&self, path: &Path, contents: &str, append: bool) -> Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if append {
            options.append(true);
        }
        let mut file = options.open(path).await.map_err(|e| {
            warn!(file = %path.display(), "Could not open file for writing");
            AttachError::io(format!("opening {}", path.display()), e)
        })?;
        file.write_all(contents.as_bytes()).await.map_err(|e| {
            warn!(file = %path.display(), error = %e, "Could not write to file");
            AttachError::io(format!("writing {}", path.display()), e)
        })?;
        file.flush()
            .await
            .map_err(|e| AttachError::io(format!("writing {}", path.display()), e))?;
        Ok(())
    }

    /// Ask each SCSI host to probe a single LUN.
    pub async fn scan_target_lun(&self, lun: u32, hosts: &[u32]) -> Result<()> {
        let directive = format!("0 0 {lun}");
        for host in hosts {
            let path = self.path(&format!("/sys/class/scsi_host/host{host}/scan"));
            self.write_trigger(&path, &directive, true).await?;
            debug!(scan = %directive, file = %path.display(), "Invoked single-LUN scan");
        }
        Ok(())
    }

    /// Make the kernel re-read a disk's capacity.
    pub async fn rescan_disk(&self, device: &str) -> Result<()> {
        let path = self.path(&format!("/sys/block/{device}/device/rescan"));
        self.write_trigger(&path, "1", false).await
    }

    /// Remove a SCSI disk from the host.
    pub async fn delete_device(&self, device: &str) -> Result<()> {
        let path = self.path(&format!("/sys/block/{device}/device/delete"));
        self.write_trigger(&path, "1", false).await
    }

    /// No LUN remains under this host/session's SCSI target.
    pub async fn safe_to_logout(&self, host: u32, session: u32) -> bool {
        let target = self.path(&format!(
            "/sys/class/iscsi_host/host{host}/device/session{session}/target{host}:0:0"
        ));
        match list_names(&target).await {
            Ok(names) => !names.iter().any(|n| is_hctl(n)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Failed to read dir");
                true
            }
        }
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Every block device reachable through an iSCSI session on this host.
    pub async fn iscsi_devices(&self) -> Result<Vec<ScsiDeviceInfo>> {
        let mut devices = Vec::new();
        let mut map_cache: HashMap<String, HostSessionMap> = HashMap::new();

        let sys_path = self.path("/sys/class/iscsi_session");
        let sessions = list_names(&sys_path)
            .await
            .map_err(|e| AttachError::io(format!("reading {}", sys_path.display()), e))?;

        for session_name in sessions {
            if !session_name.starts_with("session") {
                continue;
            }
            if numbered(&session_name, "session").is_none() {
                return Err(AttachError::Parse {
                    what: "session number",
                    detail: session_name,
                });
            }

            let session_path = sys_path.join(&session_name);
            let target_name_path = session_path.join("targetname");
            let target_iqn = tokio::fs::read_to_string(&target_name_path)
                .await
                .map_err(|e| AttachError::io(format!("reading {}", target_name_path.display()), e))?
                .trim()
                .to_string();
            debug!(target_iqn = %target_iqn, session = %session_name, "Found iSCSI session");

            let session_device_path = session_path.join("device");
            let entries = list_names(&session_device_path).await.map_err(|e| {
                AttachError::io(format!("reading {}", session_device_path.display()), e)
            })?;
            let Some(target_dir) = entries.into_iter().find(|n| n.starts_with("target")) else {
                warn!(path = %session_device_path.display(), "Could not find a host:bus:device directory");
                continue;
            };
            let hbd = target_dir.trim_start_matches("target").to_string();

            let hbd_path = session_device_path.join(&target_dir);
            let luns = list_names(&hbd_path)
                .await
                .map_err(|e| AttachError::io(format!("reading {}", hbd_path.display()), e))?;

            for hbdl in luns.into_iter().filter(|n| n.starts_with(&hbd)) {
                let parts: Vec<&str> = hbdl.split(':').collect();
                let [host, channel, target, lun] = parts[..] else {
                    return Err(AttachError::Parse {
                        what: "host:bus:device:lun",
                        detail: hbdl.clone(),
                    });
                };

                let block_path = hbd_path.join(&hbdl).join("block");
                let block_devices = list_names(&block_path)
                    .await
                    .map_err(|e| AttachError::io(format!("reading {}", block_path.display()), e))?;

                for block_device in block_devices {
                    let multipath_device = self.multipath_holder(&block_device).await;
                    let slaves = match &multipath_device {
                        Some(dm) => self.list_slaves(dm).await,
                        None => vec![block_device.clone()],
                    };

                    if !map_cache.contains_key(&target_iqn) {
                        let map = self.host_session_map(&target_iqn).await;
                        map_cache.insert(target_iqn.clone(), map);
                    }
                    let host_session_map = map_cache.get(&target_iqn).cloned().unwrap_or_default();

                    debug!(
                        host,
                        lun,
                        devices = ?slaves,
                        multipath_device = ?multipath_device,
                        iqn = %target_iqn,
                        "Found iSCSI device"
                    );

                    devices.push(ScsiDeviceInfo {
                        host: host.to_string(),
                        channel: channel.to_string(),
                        target: target.to_string(),
                        lun: lun.to_string(),
                        devices: slaves,
                        multipath_device,
                        filesystem: None,
                        iqn: target_iqn.clone(),
                        host_session_map,
                    });
                }
            }
        }

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostTree;

    #[test]
    fn test_block_dirs_one_per_pair() {
        let sysfs = Sysfs::new("/host");
        let map = HostSessionMap::from([(3, 1), (4, 2)]);
        let dirs = sysfs.block_dirs_for_lun(7, &map);
        assert_eq!(dirs.len(), 2);
        assert_eq!(
            dirs[0],
            PathBuf::from(
                "/host/sys/class/scsi_host/host3/device/session1/iscsi_session/session1/device/target3:0:0/3:0:0:7"
            )
        );
        assert_eq!(
            dirs[1],
            PathBuf::from(
                "/host/sys/class/scsi_host/host4/device/session2/iscsi_session/session2/device/target4:0:0/4:0:0:7"
            )
        );
        assert!(sysfs.block_dirs_for_lun(7, &HostSessionMap::new()).is_empty());
    }

    #[test]
    fn test_path_without_root() {
        let sysfs = Sysfs::default();
        assert_eq!(sysfs.path("/sys/block"), PathBuf::from("/sys/block"));
    }

    #[test]
    fn test_is_hctl() {
        assert!(is_hctl("3:0:0:1"));
        assert!(!is_hctl("power"));
        assert!(!is_hctl("3:0:0"));
    }

    #[tokio::test]
    async fn test_host_session_map_exact_match() {
        let tree = HostTree::new();
        tree.session(3, 1, "iqn.2010-01.com.example:vol")
            .session(4, 2, "iqn.2010-01.com.example:vol")
            .session(5, 3, "iqn.2010-01.com.example:vol-other");
        tree.mkdir("sys/class/iscsi_host/host6/device/power");

        let sysfs = Sysfs::new(tree.root());
        let map = sysfs.host_session_map("iqn.2010-01.com.example:vol").await;
        assert_eq!(map, HostSessionMap::from([(3, 1), (4, 2)]));

        assert!(sysfs.host_session_map("iqn.missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_host_session_map_missing_tree() {
        let tree = HostTree::new();
        let sysfs = Sysfs::new(tree.root());
        assert!(sysfs.host_session_map("iqn.any").await.is_empty());
    }

    #[tokio::test]
    async fn test_devices_for_lun() {
        let tree = HostTree::new();
        tree.session(3, 1, "iqn.t").session(4, 2, "iqn.t");
        tree.lun_device(3, 1, 0, "sdb");

        let sysfs = Sysfs::new(tree.root());
        let map = sysfs.host_session_map("iqn.t").await;
        let paths = sysfs.block_dirs_for_lun(0, &map);
        assert_eq!(sysfs.devices_for_lun(&paths).await.unwrap(), vec!["sdb"]);

        tree.lun_device(4, 2, 0, "sdc");
        assert_eq!(
            sysfs.devices_for_lun(&paths).await.unwrap(),
            vec!["sdb", "sdc"]
        );
    }

    #[tokio::test]
    async fn test_holders_and_slaves() {
        let tree = HostTree::new();
        tree.lun_device(3, 1, 0, "sdb").lun_device(4, 2, 0, "sdc");
        let sysfs = Sysfs::new(tree.root());

        assert_eq!(sysfs.multipath_holder("sdb").await, None);

        tree.multipath("dm-0", &["sdb", "sdc"]);
        tree.mkdir("sys/block/dm-0/slaves/loop0");
        tree.mkdir("sys/block/sdb/holders/md0");

        assert_eq!(sysfs.multipath_holder("sdb").await.as_deref(), Some("dm-0"));
        assert_eq!(sysfs.list_holders("sdb").await, vec!["dm-0"]);
        assert_eq!(sysfs.list_slaves("dm-0").await, vec!["sdb", "sdc"]);
        assert!(Sysfs::is_multipath_device("dm-0"));
        assert!(!Sysfs::is_multipath_device("sdb"));
    }

    #[tokio::test]
    async fn test_scan_target_lun_writes_directive() {
        let tree = HostTree::new();
        tree.session(3, 1, "iqn.t").session(4, 2, "iqn.t");
        let sysfs = Sysfs::new(tree.root());

        sysfs.scan_target_lun(5, &[3, 4]).await.unwrap();
        for host in [3, 4] {
            let written =
                std::fs::read_to_string(tree.path(&format!("sys/class/scsi_host/host{host}/scan")))
                    .unwrap();
            assert_eq!(written, "0 0 5");
        }

        assert!(sysfs.scan_target_lun(5, &[9]).await.is_err());
    }

    #[tokio::test]
    async fn test_rescan_and_delete_triggers() {
        let tree = HostTree::new();
        tree.lun_device(3, 1, 0, "sdb");
        let sysfs = Sysfs::new(tree.root());

        sysfs.rescan_disk("sdb").await.unwrap();
        sysfs.delete_device("sdb").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tree.path("sys/block/sdb/device/rescan")).unwrap(),
            "1"
        );
        assert_eq!(
            std::fs::read_to_string(tree.path("sys/block/sdb/device/delete")).unwrap(),
            "1"
        );
        assert!(sysfs.delete_device("sdz").await.is_err());
    }

    #[tokio::test]
    async fn test_safe_to_logout() {
        let tree = HostTree::new();
        let sysfs = Sysfs::new(tree.root());
        assert!(sysfs.safe_to_logout(3, 1).await);

        tree.mkdir("sys/class/iscsi_host/host3/device/session1/target3:0:0/power");
        assert!(sysfs.safe_to_logout(3, 1).await);

        tree.mkdir("sys/class/iscsi_host/host3/device/session1/target3:0:0/3:0:0:2");
        assert!(!sysfs.safe_to_logout(3, 1).await);
    }

    #[tokio::test]
    async fn test_iscsi_devices_inventory() {
        let tree = HostTree::new();
        tree.session(3, 1, "iqn.a").session(4, 2, "iqn.a");
        tree.lun_device(3, 1, 0, "sdb").lun_device(4, 2, 0, "sdc");
        tree.multipath("dm-0", &["sdb", "sdc"]);

        let sysfs = Sysfs::new(tree.root());
        let devices = sysfs.iscsi_devices().await.unwrap();
        assert_eq!(devices.len(), 2);

        let first = &devices[0];
        assert_eq!(first.host, "3");
        assert_eq!(first.lun, "0");
        assert_eq!(first.iqn, "iqn.a");
        assert_eq!(first.multipath_device.as_deref(), Some("dm-0"));
        assert_eq!(first.devices, vec!["sdb", "sdc"]);
        assert_eq!(first.host_session_map, HostSessionMap::from([(3, 1), (4, 2)]));
    }

    #[tokio::test]
    async fn test_iscsi_devices_single_path() {
        let tree = HostTree::new();
        tree.session(5, 7, "iqn.b").lun_device(5, 7, 2, "sdd");
        let sysfs = Sysfs::new(tree.root());

        let devices = sysfs.iscsi_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].devices, vec!["sdd"]);
        assert_eq!(devices[0].multipath_device, None);
        assert_eq!(devices[0].lun, "2");
    }

    #[tokio::test]
    async fn test_iscsi_devices_requires_session_class() {
        let tree = HostTree::new();
        let sysfs = Sysfs::new(tree.root());
        assert!(sysfs.iscsi_devices().await.is_err());
    }
}
