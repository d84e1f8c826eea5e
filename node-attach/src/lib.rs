//! Host-side iSCSI attach engine
//!
//! Brings a remote iSCSI LUN up as a local block device (and optionally a
//! mounted filesystem), and tears it down again. The engine drives the
//! standard Linux tools (`iscsiadm`, `multipath`, `blkid`, `mkfs.*`, `mount`)
//! and reads kernel state from sysfs, optionally under a host root prefix
//! when running inside a container.
//!
//! The library is split into several modules:
//! - `attach`: attach, detach and resize workflows
//! - `iscsi`: sessions, discovery and LUN scanning
//! - `multipath`: device-mapper multipath coordination
//! - `filesystem`: filesystem probing, formatting and growth
//! - `mount`: mount table parsing and mount helpers
//! - `sysfs`: read-only and trigger access to sysfs
//! - `exec`: external command execution with timeouts
//! - `retry`: bounded exponential backoff
//! - `metrics`: Prometheus metrics collection

pub mod attach;
pub mod config;
pub mod error;
pub mod exec;
pub mod filesystem;
pub mod iscsi;
pub mod metrics;
pub mod mount;
pub mod multipath;
pub mod retry;
pub mod sysfs;
pub mod types;

#[cfg(test)]
mod testing;

pub use attach::AttachEngine;
pub use config::EngineConfig;
pub use error::{AttachError, Result};
pub use exec::{CommandRunner, ExecError, Executor, Invocation};
pub use filesystem::{FilesystemExpansion, FilesystemType};
pub use types::{ChapCredentials, Portal, PublishInfo, ScsiDeviceInfo};
