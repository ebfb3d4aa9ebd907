//! Typed gateway onto the KVM ioctl interface.
//!
//! One trait method per command code, so each call site is checked against
//! the argument structure that command expects. `KvmContext` and friends are
//! the `/dev/kvm` implementation; the test suite swaps in an in-process fake.

use std::fmt;

use kvm_bindings::{kvm_regs, kvm_sregs, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, info};

use crate::error::{Result, VMError};
use crate::types::MemoryRegion;

/// The only API revision this VMM speaks. There is no negotiation.
pub const KVM_API_VERSION: i32 = 12;

mod codes {
    use kvm_bindings::{kvm_regs, kvm_sregs, kvm_userspace_memory_region, KVMIO};

    ioctl_io_nr!(KVM_GET_API_VERSION, KVMIO, 0x00);
    ioctl_io_nr!(KVM_CREATE_VM, KVMIO, 0x01);
    ioctl_io_nr!(KVM_GET_VCPU_MMAP_SIZE, KVMIO, 0x04);
    ioctl_io_nr!(KVM_CREATE_VCPU, KVMIO, 0x41);
    ioctl_iow_nr!(KVM_SET_USER_MEMORY_REGION, KVMIO, 0x46, kvm_userspace_memory_region);
    ioctl_io_nr!(KVM_RUN, KVMIO, 0x80);
    ioctl_ior_nr!(KVM_GET_REGS, KVMIO, 0x81, kvm_regs);
    ioctl_iow_nr!(KVM_SET_REGS, KVMIO, 0x82, kvm_regs);
    ioctl_ior_nr!(KVM_GET_SREGS, KVMIO, 0x83, kvm_sregs);
    ioctl_iow_nr!(KVM_SET_SREGS, KVMIO, 0x84, kvm_sregs);
}

/// Command codes issued by this VMM, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvmCommand {
    GetApiVersion,
    CreateVm,
    GetVcpuMmapSize,
    CreateVcpu,
    SetUserMemoryRegion,
    Run,
    GetRegs,
    SetRegs,
    GetSregs,
    SetSregs,
}

impl KvmCommand {
    pub fn name(self) -> &'static str {
        match self {
            KvmCommand::GetApiVersion => "KVM_GET_API_VERSION",
            KvmCommand::CreateVm => "KVM_CREATE_VM",
            KvmCommand::GetVcpuMmapSize => "KVM_GET_VCPU_MMAP_SIZE",
            KvmCommand::CreateVcpu => "KVM_CREATE_VCPU",
            KvmCommand::SetUserMemoryRegion => "KVM_SET_USER_MEMORY_REGION",
            KvmCommand::Run => "KVM_RUN",
            KvmCommand::GetRegs => "KVM_GET_REGS",
            KvmCommand::SetRegs => "KVM_SET_REGS",
            KvmCommand::GetSregs => "KVM_GET_SREGS",
            KvmCommand::SetSregs => "KVM_SET_SREGS",
        }
    }

    /// The ioctl request number as the kernel ABI defines it.
    pub fn code(self) -> u64 {
        let code = match self {
            KvmCommand::GetApiVersion => codes::KVM_GET_API_VERSION(),
            KvmCommand::CreateVm => codes::KVM_CREATE_VM(),
            KvmCommand::GetVcpuMmapSize => codes::KVM_GET_VCPU_MMAP_SIZE(),
            KvmCommand::CreateVcpu => codes::KVM_CREATE_VCPU(),
            KvmCommand::SetUserMemoryRegion => codes::KVM_SET_USER_MEMORY_REGION(),
            KvmCommand::Run => codes::KVM_RUN(),
            KvmCommand::GetRegs => codes::KVM_GET_REGS(),
            KvmCommand::SetRegs => codes::KVM_SET_REGS(),
            KvmCommand::GetSregs => codes::KVM_GET_SREGS(),
            KvmCommand::SetSregs => codes::KVM_SET_SREGS(),
        };
        code as u64
    }
}

impl fmt::Display for KvmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.name(), self.code())
    }
}

/// Why `resume` handed control back. Borrows the vCPU's run-state buffer, so
/// the borrow must end before the next resume lets the kernel write it again.
#[derive(Debug)]
pub enum VmExit<'a> {
    Hlt,
    IoOut { port: u16, data: &'a [u8] },
    IoIn { port: u16, data: &'a mut [u8] },
    Shutdown,
    FailEntry { reason: u64, cpu: u32 },
    InternalError,
    /// Any exit reason this VMM does not service, described for the diagnostic.
    Unhandled(String),
}

/// System-level handle (`/dev/kvm`).
pub trait Hypervisor {
    type Vm: VirtualMachine;

    fn api_version(&self) -> i32;

    /// Size of the per-vCPU run-state mapping.
    fn run_state_size(&self) -> Result<usize>;

    fn create_vm(&self) -> Result<Self::Vm>;
}

/// VM-level handle. Dropping it releases every vCPU and slot created from it.
pub trait VirtualMachine {
    type Vcpu: VirtualCpu;

    /// # Safety
    ///
    /// `region.userspace_addr` must point at a mapping of at least
    /// `region.memory_size` bytes that stays mapped for the life of this VM.
    unsafe fn install_memory_region(&self, region: &MemoryRegion) -> Result<()>;

    fn create_vcpu(&self, slot: u64) -> Result<Self::Vcpu>;
}

/// vCPU-level handle with its mapped run-state buffer.
pub trait VirtualCpu {
    fn get_regs(&self) -> Result<kvm_regs>;
    fn set_regs(&self, regs: &kvm_regs) -> Result<()>;
    fn get_sregs(&self) -> Result<kvm_sregs>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()>;

    /// Blocks until the guest exits back to the host.
    fn resume(&mut self) -> Result<VmExit<'_>>;
}

pub fn check_api_version<H: Hypervisor>(hv: &H) -> Result<()> {
    let version = hv.api_version();
    if version != KVM_API_VERSION {
        return Err(VMError::DeviceUnavailable(format!(
            "{} returned {}, expected {}",
            KvmCommand::GetApiVersion,
            version,
            KVM_API_VERSION
        )));
    }
    Ok(())
}

pub struct KvmContext {
    kvm: Kvm,
}

impl KvmContext {
    /// Open `/dev/kvm` (O_RDWR | O_CLOEXEC) and validate the API version.
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new()
            .map_err(|e| VMError::DeviceUnavailable(format!("cannot open /dev/kvm: {}", e)))?;
        let ctx = Self { kvm };
        check_api_version(&ctx)?;
        info!("/dev/kvm opened, API version {}", KVM_API_VERSION);
        Ok(ctx)
    }
}

impl Hypervisor for KvmContext {
    type Vm = KvmVm;

    fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    fn run_state_size(&self) -> Result<usize> {
        self.kvm.get_vcpu_mmap_size().map_err(|e| {
            VMError::AllocationFailed(format!("{} failed: {}", KvmCommand::GetVcpuMmapSize, e))
        })
    }

    fn create_vm(&self) -> Result<KvmVm> {
        let fd = self
            .kvm
            .create_vm()
            .map_err(|source| VMError::CreationFailed { command: KvmCommand::CreateVm, source })?;
        Ok(KvmVm { fd })
    }
}

pub struct KvmVm {
    fd: VmFd,
}

impl VirtualMachine for KvmVm {
    type Vcpu = KvmVcpu;

    unsafe fn install_memory_region(&self, region: &MemoryRegion) -> Result<()> {
        let raw = kvm_userspace_memory_region::from(*region);
        // SAFETY: forwarded from the caller's contract on `region`.
        unsafe { self.fd.set_user_memory_region(raw) }.map_err(|source| VMError::InstallFailed {
            command: KvmCommand::SetUserMemoryRegion,
            slot: region.slot,
            source,
        })
    }

    fn create_vcpu(&self, slot: u64) -> Result<KvmVcpu> {
        let fd = self
            .fd
            .create_vcpu(slot)
            .map_err(|source| VMError::CreationFailed { command: KvmCommand::CreateVcpu, source })?;
        Ok(KvmVcpu { fd })
    }
}

pub struct KvmVcpu {
    fd: VcpuFd,
}

impl VirtualCpu for KvmVcpu {
    fn get_regs(&self) -> Result<kvm_regs> {
        self.fd
            .get_regs()
            .map_err(|source| VMError::RegisterIOFailed { command: KvmCommand::GetRegs, source })
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.fd
            .set_regs(regs)
            .map_err(|source| VMError::RegisterIOFailed { command: KvmCommand::SetRegs, source })
    }

    fn get_sregs(&self) -> Result<kvm_sregs> {
        self.fd
            .get_sregs()
            .map_err(|source| VMError::RegisterIOFailed { command: KvmCommand::GetSregs, source })
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        self.fd
            .set_sregs(sregs)
            .map_err(|source| VMError::RegisterIOFailed { command: KvmCommand::SetSregs, source })
    }

    fn resume(&mut self) -> Result<VmExit<'_>> {
        let exit = self
            .fd
            .run()
            .map_err(|source| VMError::ResumeFailed { command: KvmCommand::Run, source })?;
        debug!("KVM_RUN returned {:?}", exit);
        Ok(match exit {
            VcpuExit::Hlt => VmExit::Hlt,
            VcpuExit::IoOut(port, data) => VmExit::IoOut { port, data },
            VcpuExit::IoIn(port, data) => VmExit::IoIn { port, data },
            VcpuExit::Shutdown => VmExit::Shutdown,
            VcpuExit::FailEntry(reason, cpu) => VmExit::FailEntry { reason, cpu },
            VcpuExit::InternalError => VmExit::InternalError,
            other => VmExit::Unhandled(format!("{:?}", other)),
        })
    }
}
