//! Data passed between the engine and its callers.
//!
//! Everything here is transient: a [`PublishInfo`] arrives with each call,
//! and device records are rebuilt from sysfs every time they are needed.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Default iSCSI portal port.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

// ============================================================================
// PublishInfo
// ============================================================================

/// Everything needed to attach one volume.
///
/// The attach workflow fills in `device_path`; all other fields are inputs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishInfo {
    /// Primary portal, `ip[:port]` or `[ipv6][:port]`
    pub target_portal: String,
    /// Additional portals of a multi-homed target
    pub portals: Vec<String>,
    pub target_iqn: String,
    pub lun: u32,
    pub use_chap: bool,
    /// Initiator CHAP user
    pub chap_username: String,
    /// Initiator CHAP secret
    pub chap_initiator_secret: String,
    /// Target user for mutual CHAP
    pub chap_target_username: String,
    /// Target secret for mutual CHAP
    pub chap_target_secret: String,
    /// Initiator interface; empty selects the configured default
    pub iscsi_interface: String,
    /// `xfs`, `ext3`, `ext4` or `raw`
    pub filesystem_type: String,
    pub mount_options: String,
    /// Resolved device, e.g. `/dev/dm-3`
    pub device_path: String,
    pub nfs_server_ip: String,
    pub nfs_path: String,
}

impl PublishInfo {
    pub fn chap_credentials(&self) -> ChapCredentials {
        let mut creds = ChapCredentials::new(&self.chap_username, &self.chap_initiator_secret);
        if !self.chap_target_username.is_empty() {
            creds.mutual_user = Some(self.chap_target_username.clone());
        }
        if !self.chap_target_secret.is_empty() {
            creds.mutual_secret = Some(self.chap_target_secret.clone());
        }
        creds
    }

    /// Primary portal followed by the secondary ones.
    pub fn all_portals(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.target_portal.as_str())
            .chain(self.portals.iter().map(String::as_str))
            .filter(|p| !p.is_empty())
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "****" }
}

impl fmt::Debug for PublishInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishInfo")
            .field("target_portal", &self.target_portal)
            .field("portals", &self.portals)
            .field("target_iqn", &self.target_iqn)
            .field("lun", &self.lun)
            .field("use_chap", &self.use_chap)
            .field("chap_username", &self.chap_username)
            .field("chap_initiator_secret", &redact(&self.chap_initiator_secret))
            .field("chap_target_username", &self.chap_target_username)
            .field("chap_target_secret", &redact(&self.chap_target_secret))
            .field("iscsi_interface", &self.iscsi_interface)
            .field("filesystem_type", &self.filesystem_type)
            .field("mount_options", &self.mount_options)
            .field("device_path", &self.device_path)
            .field("nfs_server_ip", &self.nfs_server_ip)
            .field("nfs_path", &self.nfs_path)
            .finish()
    }
}

// ============================================================================
// ChapCredentials
// ============================================================================

/// CHAP credentials for one session.
#[derive(Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    /// Initiator username (required)
    pub user: String,
    /// Initiator secret (required)
    pub secret: String,
    /// Target username for mutual CHAP (optional)
    pub mutual_user: Option<String>,
    /// Target secret for mutual CHAP (optional)
    pub mutual_secret: Option<String>,
}

impl ChapCredentials {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
            mutual_user: None,
            mutual_secret: None,
        }
    }

    /// Check if mutual CHAP is configured.
    pub fn has_mutual(&self) -> bool {
        self.mutual_user.is_some() && self.mutual_secret.is_some()
    }
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("user", &self.user)
            .field("secret", &"****")
            .field("mutual_user", &self.mutual_user)
            .field("mutual_secret", &self.mutual_secret.as_ref().map(|_| "****"))
            .finish()
    }
}

// ============================================================================
// Portal
// ============================================================================

/// Two or more colons mark an IPv6 literal.
pub fn is_ipv6(address: &str) -> bool {
    address.matches(':').count() >= 2
}

/// IP literal of a portal field as printed by iscsiadm.
///
/// IPv6 keeps its brackets: `[fd20::2]:3260,1` gives `[fd20::2]`.
pub fn portal_ip(field: &str) -> String {
    let field = field.split(',').next().unwrap_or_default();
    if is_ipv6(field) {
        let head = field.split(']').next().unwrap_or_default();
        if head.starts_with('[') {
            format!("{head}]")
        } else {
            format!("[{head}]")
        }
    } else {
        field.split(':').next().unwrap_or_default().to_string()
    }
}

/// An iSCSI portal (host:port).
///
/// The host is kept without brackets; no name resolution is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Portal {
    pub host: String,
    pub port: u16,
}

impl Portal {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
    ///
    /// A trailing `,tpgt` group tag, as printed by iscsiadm, is ignored.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, PortalParseError> {
        let trimmed = s.trim();
        let addr = trimmed.split(',').next().unwrap_or_default();
        if addr.is_empty() {
            return Err(PortalParseError(s.to_string()));
        }

        if let Some(rest) = addr.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(PortalParseError(s.to_string()));
            };
            if host.is_empty() {
                return Err(PortalParseError(s.to_string()));
            }
            if tail.is_empty() {
                return Ok(Portal::new(host, default_port));
            }
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| PortalParseError(s.to_string()))?;
            return Ok(Portal::new(host, port));
        }

        // an unbracketed IPv6 literal cannot carry a port
        if is_ipv6(addr) {
            return Ok(Portal::new(addr, default_port));
        }

        if let Some((host, port)) = addr.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| PortalParseError(s.to_string()))?;
            if host.is_empty() {
                return Err(PortalParseError(s.to_string()));
            }
            return Ok(Portal::new(host, port));
        }

        Ok(Portal::new(addr, default_port))
    }

    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// Host as it appears in iscsiadm output, bracketed for IPv6.
    pub fn ip_literal(&self) -> String {
        if self.is_ipv6() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Format as `ip:port` for iscsiadm `-p`.
    pub fn to_portal_string(&self) -> String {
        format!("{}:{}", self.ip_literal(), self.port)
    }
}

impl Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_portal_string())
    }
}

/// Error returned when parsing an invalid portal.
#[derive(Debug, Clone)]
pub struct PortalParseError(String);

impl Display for PortalParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid portal '{}': expected 'host', 'host:port' or '[ipv6]:port'",
            self.0
        )
    }
}

impl std::error::Error for PortalParseError {}

// ============================================================================
// Discovery / session listings
// ============================================================================

/// One `portal,tpgt target` line of a SendTargets discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryInfo {
    /// Raw portal field, including the group tag
    pub portal: String,
    pub portal_ip: String,
    pub target_name: String,
}

/// One line of `iscsiadm -m session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub sid: u32,
    pub portal: String,
    pub portal_ip: String,
    pub target_name: String,
}

// ============================================================================
// Devices
// ============================================================================

/// SCSI host number to iSCSI session number for one target.
pub type HostSessionMap = BTreeMap<u32, u32>;

/// Resolved view of one LUN on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScsiDeviceInfo {
    pub host: String,
    pub channel: String,
    pub target: String,
    pub lun: String,
    /// Raw paths, e.g. `sdb`
    pub devices: Vec<String>,
    /// Device-mapper parent, e.g. `dm-0`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipath_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    pub iqn: String,
    pub host_session_map: HostSessionMap,
}

impl ScsiDeviceInfo {
    /// Multipath device when bound, otherwise the first raw path.
    pub fn device_to_use(&self) -> Option<&str> {
        self.multipath_device
            .as_deref()
            .or_else(|| self.devices.first().map(String::as_str))
            .filter(|d| !d.is_empty())
    }
}

/// One `target source` row of `df`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DfInfo {
    pub target: String,
    pub source: String,
}
