use std::time::Duration;

use thiserror::Error;

use crate::exec::ExecError;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    Command(#[from] ExecError),

    #[error("{operation} did not complete after {:.2} seconds", .elapsed.as_secs_f64())]
    DeadlineExceeded {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("no iSCSI hosts found for target {0}")]
    NoHostsForTarget(String),

    #[error("scan not completed for LUN {lun} on target {target_iqn}")]
    ScanIncomplete { lun: u32, target_iqn: String },

    #[error("could not determine device to use for {0}")]
    NoDevice(String),

    #[error("device {device} already formatted with other filesystem: {existing}")]
    FilesystemMismatch {
        device: String,
        existing: String,
        requested: String,
    },

    #[error("device {0} is not unformatted")]
    DeviceNotUnformatted(String),

    #[error("unsupported file system type: {0}")]
    UnsupportedFilesystem(String),

    #[error("iSCSI session error: {0}")]
    Session(String),

    #[error("host{host} session{session} still has attached devices, refusing logout")]
    SessionStillInUse { host: u32, session: u32 },

    #[error("{device} not large enough after resize: {size} < {min_size}")]
    SizeBelowMinimum {
        device: String,
        size: u64,
        min_size: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AttachError {
    /// Wrap an I/O error with the path or action it came from.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AttachError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the failure came from a bounded wait or a killed command.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AttachError::DeadlineExceeded { .. } | AttachError::Command(ExecError::Timeout { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, AttachError>;
