//! Minimal KVM bring-up: one vCPU, one guest memory slot, a raw real-mode
//! payload, and a run loop that services port I/O until the guest halts.

#[macro_use]
extern crate vmm_sys_util;

pub mod config;
pub mod error;
pub mod types;
pub mod vmm;


pub use config::LaunchConfig;
pub use error::{Result, VMError};
pub use types::{GeneralRegisters, MemoryRegion, RunResult, SegmentDescriptor};
pub use vmm::devices::{IoHandler, SerialConsole};
pub use vmm::run::{run_vm, Vmm};
