//! iSCSI initiator control: sessions, discovery and LUN scanning.

pub mod scan;
pub mod session;

pub use scan::ScanOrchestrator;
pub use session::{SessionManager, parse_discovery, parse_sessions};

use std::time::Duration;

use tracing::{Level, debug};

use crate::exec::{Executor, sanitize_output};
use crate::sysfs::Sysfs;

/// `iscsiadm` status for "no records/sessions found".
pub const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// Debug-level snapshot of every iSCSI-related device on the host.
///
/// Costs two tool invocations, so it only runs when DEBUG is enabled.
#[derive(Debug, Clone)]
pub struct Inventory {
    exec: Executor,
    sysfs: Sysfs,
}

impl Inventory {
    pub fn new(exec: Executor, sysfs: Sysfs) -> Self {
        Self { exec, sysfs }
    }

    pub async fn log_snapshot(&self, stage: &str) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }

        let dev = self.sysfs.list("/dev").await;
        let dm: Vec<&String> = dev.iter().filter(|n| n.starts_with("dm-")).collect();
        let sd: Vec<&String> = dev.iter().filter(|n| n.starts_with("sd")).collect();
        let sys_block = self.sysfs.list("/sys/block").await;

        let multipath = self
            .exec
            .exec_with_timeout("multipath", Duration::from_secs(5), &["-ll"])
            .await
            .unwrap_or_else(|e| e.output().to_vec());
        let sessions = self
            .exec
            .exec("iscsiadm", &["-m", "session"])
            .await
            .unwrap_or_else(|e| e.output().to_vec());

        debug!(
            stage,
            dm_devices = ?dm,
            sd_devices = ?sd,
            sys_block = ?sys_block,
            multipath = %sanitize_output(&multipath),
            sessions = %sanitize_output(&sessions),
            "Listing all iSCSI devices"
        );
    }
}
