use thiserror::Error;

use crate::vmm::kvm_ctx::KvmCommand;

pub type Result<T> = std::result::Result<T, VMError>;

/// Every variant is terminal for the bring-up sequence; nothing here is retried.
#[derive(Error, Debug)]
pub enum VMError {
    #[error("KVM device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("{command} failed: {source}")]
    CreationFailed {
        command: KvmCommand,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("{command} failed for slot {slot}: {source}")]
    InstallFailed {
        command: KvmCommand,
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("{command} failed: {source}")]
    RegisterIOFailed {
        command: KvmCommand,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("{command} failed: {source}")]
    ResumeFailed {
        command: KvmCommand,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("fatal vCPU exit: {0}")]
    FatalExit(String),

    #[error("port I/O servicing failed on port {port:#x}: {source}")]
    IoService {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VMError {
    /// Short name of the taxonomy bucket, used for the process diagnostic.
    pub fn kind(&self) -> &'static str {
        match self {
            VMError::DeviceUnavailable(_) => "DeviceUnavailable",
            VMError::CreationFailed { .. } => "CreationFailed",
            VMError::AllocationFailed(_) => "AllocationFailed",
            VMError::InstallFailed { .. } => "InstallFailed",
            VMError::RegisterIOFailed { .. } => "RegisterIOFailed",
            VMError::ResumeFailed { .. } => "ResumeFailed",
            VMError::FatalExit(_) => "FatalExit",
            VMError::IoService { .. } => "IoService",
            VMError::Config(_) => "Config",
            VMError::Io(_) => "Io",
        }
    }
}
