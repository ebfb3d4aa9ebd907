use log::info;

use crate::config::LaunchConfig;
use crate::error::Result;
use crate::types::RunResult;
use super::boot::{self, BootInfo};
use super::devices::IoHandler;
use super::event_loop::VmLoop;
use super::kvm_ctx::{check_api_version, Hypervisor, KvmContext, VirtualMachine};
use super::memory::GuestMem;
use super::vcpu::VcpuController;


/// A fully set-up VM: one slot, one vCPU, registers initialized.
///
/// Fields drop in declaration order, so guest memory is unmapped only after
/// the vCPU and VM handles are closed.
pub struct Vmm<M: VirtualMachine> {
    vcpu: VcpuController<M::Vcpu>,
    vm: M,
    memory: GuestMem,
    boot: BootInfo,
}


impl<M: VirtualMachine> Vmm<M> {
    /// Every step is fatal on failure; nothing is retried or rolled back beyond drop.
    pub fn new<H>(hv: &H, cfg: &LaunchConfig, payload: &[u8]) -> Result<Self>
    where
        H: Hypervisor<Vm = M>,
    {
        // 1) API version + layout, before any VM exists
        check_api_version(hv)?;
        cfg.validate()?;
        let run_state_size = hv.run_state_size()?;

        // 2) guest memory + payload
        let memory = GuestMem::create(cfg.slot, cfg.guest_base, cfg.memory_size)?;
        let boot = boot::load_payload(&memory, payload)?;

        // 3) VM + slot
        let vm = hv.create_vm()?;
        memory.install(&vm)?;

        // 4) vCPU + registers
        let vcpu = VcpuController::create(&vm, cfg.vcpu_slot, run_state_size)?;
        vcpu.setup(&boot, &cfg.registers)?;

        Ok(Self { vcpu, vm, memory, boot })
    }

    /// Drive the exit loop until halt, servicing port I/O through `io`.
    pub fn run<I: IoHandler + ?Sized>(&mut self, io: &mut I) -> Result<RunResult> {
        let mut vml = VmLoop::new();
        let summary = vml.run_until_exit(self.vcpu.vcpu_mut(), io)?;
        let registers = self.vcpu.registers()?;
        info!(
            "vCPU {} done: rip={:#x} after {} bytes of payload",
            self.vcpu.slot(),
            registers.rip,
            self.boot.payload_len
        );
        Ok(RunResult { exit_status: 0, io_exits: summary.io_exits, registers })
    }

    pub fn memory(&self) -> &GuestMem { &self.memory }

    pub fn vm(&self) -> &M { &self.vm }
}


/// Boot `payload` on `/dev/kvm` and run it to halt.
pub fn run_vm(cfg: &LaunchConfig, payload: &[u8], io: &mut dyn IoHandler) -> Result<RunResult> {
    let kvm = KvmContext::open()?;
    let mut vmm = Vmm::new(&kvm, cfg, payload)?;
    vmm.run(io)
}
