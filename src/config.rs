use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VMError};
use crate::types::GeneralRegisters;

pub const PAGE_SIZE: u64 = 0x1000;

/// COM1 data register.
pub const COM1_PORT: u16 = 0x3f8;

/// Launch configuration for a single-vCPU, single-slot VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Memory slot id for the one guest region
    pub slot: u32,
    /// Guest physical base of the region (page 0 holds the real-mode IVT)
    pub guest_base: u64,
    /// Region size in bytes
    pub memory_size: u64,
    /// vCPU index within the VM
    pub vcpu_slot: u64,
    /// Launch inputs the payload depends on. `rip` and `rflags` are derived at boot.
    pub registers: GeneralRegisters,
    /// Base port of the serial console
    pub console_port: u16,
    /// Raw payload file; None = built-in payload
    pub payload: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            slot: 0,
            guest_base: 0x1000,
            memory_size: 0x1000,
            vcpu_slot: 0,
            registers: GeneralRegisters { rax: 2, rbx: 2, ..Default::default() },
            console_port: COM1_PORT,
            payload: None,
        }
    }
}

impl LaunchConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| VMError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_size == 0 {
            return Err(VMError::Config("memory_size must be non-zero".to_string()));
        }
        if self.guest_base % PAGE_SIZE != 0 || self.memory_size % PAGE_SIZE != 0 {
            return Err(VMError::Config(format!(
                "region {:#x}+{:#x} is not page-aligned",
                self.guest_base, self.memory_size
            )));
        }
        if self.guest_base < PAGE_SIZE {
            return Err(VMError::Config(
                "guest_base overlaps the real-mode interrupt vector table".to_string(),
            ));
        }
        if self.guest_base.checked_add(self.memory_size).is_none() {
            return Err(VMError::Config("region wraps the guest address space".to_string()));
        }
        if self.vcpu_slot > u64::from(u32::MAX) {
            return Err(VMError::Config(format!("vcpu_slot {} out of range", self.vcpu_slot)));
        }
        Ok(())
    }
}
