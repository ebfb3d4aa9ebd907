use kvm_bindings::kvm_run;
use log::info;

use crate::error::{Result, VMError};
use crate::types::GeneralRegisters;
use super::boot::BootInfo;
use super::kvm_ctx::{KvmCommand, VirtualCpu, VirtualMachine};
use super::regs;


/// Smallest run-state mapping that can hold a `kvm_run` header and its exit payload.
pub const MIN_RUN_STATE_SIZE: usize = std::mem::size_of::<kvm_run>();


/// Owns the single vCPU and drives its one-time setup.
pub struct VcpuController<V: VirtualCpu> {
    vcpu: V,
    slot: u64,
    run_state_size: usize,
}


impl<V: VirtualCpu> VcpuController<V> {
    /// `run_state_size` comes from `KVM_GET_VCPU_MMAP_SIZE`; it is checked
    /// before the vCPU (and its mapping) is created.
    pub fn create<M>(vm: &M, slot: u64, run_state_size: usize) -> Result<Self>
    where
        M: VirtualMachine<Vcpu = V>,
    {
        if run_state_size < MIN_RUN_STATE_SIZE {
            return Err(VMError::AllocationFailed(format!(
                "{} reported {} bytes, need at least {}",
                KvmCommand::GetVcpuMmapSize,
                run_state_size,
                MIN_RUN_STATE_SIZE
            )));
        }
        let vcpu = vm.create_vcpu(slot)?;
        info!("vCPU {} created, run-state mapping {} bytes", slot, run_state_size);
        Ok(Self { vcpu, slot, run_state_size })
    }

    pub fn slot(&self) -> u64 { self.slot }

    pub fn run_state_size(&self) -> usize { self.run_state_size }

    /// Read-modify-write of the special registers: keep the kernel's real-mode
    /// reset state, only flatten CS.
    pub fn init_segments(&self) -> Result<()> {
        let mut sregs = self.vcpu.get_sregs()?;
        regs::flatten_code_segment(&mut sregs);
        self.vcpu.set_sregs(&sregs)
    }

    pub fn init_registers(&self, boot: &BootInfo, launch: &GeneralRegisters) -> Result<()> {
        let kregs = regs::boot_registers(launch, boot.entry.0);
        self.vcpu.set_regs(&kregs)?;
        info!("vCPU {} entry {:#x}", self.slot, kregs.rip);
        Ok(())
    }

    /// Segment setup, then the general registers. Both must precede the first resume.
    pub fn setup(&self, boot: &BootInfo, launch: &GeneralRegisters) -> Result<()> {
        self.init_segments()?;
        self.init_registers(boot, launch)
    }

    pub fn registers(&self) -> Result<GeneralRegisters> {
        self.vcpu.get_regs().map(GeneralRegisters::from)
    }

    pub fn vcpu_mut(&mut self) -> &mut V { &mut self.vcpu }
}
