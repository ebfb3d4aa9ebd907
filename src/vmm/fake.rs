//! In-process stand-in for `/dev/kvm`.
//!
//! With an empty script the vCPU executes guest memory itself, understanding
//! just the real-mode opcodes the test payloads use. With a script it replays
//! the listed exits in order and ignores memory.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

use crate::error::{Result, VMError};
use crate::types::MemoryRegion;
use super::kvm_ctx::{Hypervisor, KvmCommand, VirtualCpu, VirtualMachine, VmExit, KVM_API_VERSION};
use super::vcpu::MIN_RUN_STATE_SIZE;

#[derive(Clone, Debug)]
pub enum Scripted {
    Out(u16, Vec<u8>),
    In(u16, usize),
    Hlt,
    Shutdown,
    Unhandled(&'static str),
    RunError(i32),
}

pub struct FakeHypervisor {
    api_version: i32,
    run_state_size: usize,
    fail_register_io: bool,
    fail_install: bool,
    script: Vec<Scripted>,
    vms_created: Rc<Cell<usize>>,
    vcpus_created: Rc<Cell<usize>>,
}

impl FakeHypervisor {
    pub fn new(script: &[Scripted]) -> Self {
        Self {
            api_version: KVM_API_VERSION,
            run_state_size: MIN_RUN_STATE_SIZE + 0x1000,
            fail_register_io: false,
            fail_install: false,
            script: script.to_vec(),
            vms_created: Rc::new(Cell::new(0)),
            vcpus_created: Rc::new(Cell::new(0)),
        }
    }

    pub fn with_api_version(mut self, version: i32) -> Self {
        self.api_version = version;
        self
    }

    pub fn with_run_state_size(mut self, size: usize) -> Self {
        self.run_state_size = size;
        self
    }

    pub fn failing_register_io(mut self) -> Self {
        self.fail_register_io = true;
        self
    }

    pub fn failing_install(mut self) -> Self {
        self.fail_install = true;
        self
    }

    pub fn vms_created(&self) -> usize {
        self.vms_created.get()
    }

    pub fn vcpus_created(&self) -> usize {
        self.vcpus_created.get()
    }
}

impl Hypervisor for FakeHypervisor {
    type Vm = FakeVm;

    fn api_version(&self) -> i32 {
        self.api_version
    }

    fn run_state_size(&self) -> Result<usize> {
        Ok(self.run_state_size)
    }

    fn create_vm(&self) -> Result<FakeVm> {
        self.vms_created.set(self.vms_created.get() + 1);
        Ok(FakeVm {
            regions: Rc::new(RefCell::new(Vec::new())),
            vcpus_created: Rc::clone(&self.vcpus_created),
            fail_register_io: self.fail_register_io,
            fail_install: self.fail_install,
            script: self.script.clone(),
        })
    }
}

pub struct FakeVm {
    regions: Rc<RefCell<Vec<MemoryRegion>>>,
    vcpus_created: Rc<Cell<usize>>,
    fail_register_io: bool,
    fail_install: bool,
    script: Vec<Scripted>,
}

impl FakeVm {
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.regions.borrow().clone()
    }
}

impl VirtualMachine for FakeVm {
    type Vcpu = FakeVcpu;

    unsafe fn install_memory_region(&self, region: &MemoryRegion) -> Result<()> {
        if self.fail_install {
            return Err(VMError::InstallFailed {
                command: KvmCommand::SetUserMemoryRegion,
                slot: region.slot,
                source: kvm_ioctls::Error::new(libc::EEXIST),
            });
        }
        self.regions.borrow_mut().push(*region);
        Ok(())
    }

    fn create_vcpu(&self, _slot: u64) -> Result<FakeVcpu> {
        self.vcpus_created.set(self.vcpus_created.get() + 1);
        Ok(FakeVcpu {
            regs: RefCell::new(kvm_regs { rip: 0xfff0, rflags: 0x2, ..Default::default() }),
            sregs: RefCell::new(reset_sregs()),
            regions: Rc::clone(&self.regions),
            fail_register_io: self.fail_register_io,
            script: self.script.iter().cloned().collect(),
            io_buf: Vec::new(),
            pending_in: false,
        })
    }
}

/// Roughly what KVM reports for a freshly created x86 vCPU.
fn reset_sregs() -> kvm_sregs {
    let data = kvm_segment {
        base: 0,
        limit: 0xffff,
        selector: 0,
        type_: 3,
        present: 1,
        s: 1,
        ..Default::default()
    };
    kvm_sregs {
        cs: kvm_segment { base: 0xffff_0000, selector: 0xf000, type_: 11, ..data },
        ds: data,
        es: data,
        fs: data,
        gs: data,
        ss: data,
        tr: kvm_segment { type_: 11, s: 0, ..data },
        ldt: kvm_segment { type_: 2, s: 0, ..data },
        cr0: 0x6000_0010,
        ..Default::default()
    }
}

enum Step {
    Continue,
    Out(u16),
    In(u16),
    Hlt,
    Fault(String),
}

pub struct FakeVcpu {
    regs: RefCell<kvm_regs>,
    sregs: RefCell<kvm_sregs>,
    regions: Rc<RefCell<Vec<MemoryRegion>>>,
    fail_register_io: bool,
    script: VecDeque<Scripted>,
    io_buf: Vec<u8>,
    pending_in: bool,
}

impl FakeVcpu {
    fn check(&self, command: KvmCommand) -> Result<()> {
        if self.fail_register_io {
            return Err(VMError::RegisterIOFailed { command, source: kvm_ioctls::Error::new(libc::EIO) });
        }
        Ok(())
    }

    fn fetch(&self, addr: u64) -> Option<u8> {
        self.regions.borrow().iter().find_map(|r| {
            let off = addr.checked_sub(r.guest_phys_addr)?;
            if off >= r.memory_size {
                return None;
            }
            // SAFETY: installed regions point at live mappings for as long as the VM exists.
            Some(unsafe { *((r.userspace_addr + off) as *const u8) })
        })
    }

    fn step(&mut self) -> Step {
        let cs_base = self.sregs.borrow().cs.base;
        let rip = self.regs.borrow().rip;
        let ip = cs_base + rip;
        let Some(op) = self.fetch(ip) else {
            return Step::Fault(format!("Mmio fetch at {:#x}", ip));
        };
        let imm8 = self.fetch(ip + 1).unwrap_or(0);
        let hi = self.fetch(ip + 2).unwrap_or(0);
        let regs = self.regs.get_mut();
        let (al, bl) = (regs.rax as u8, regs.rbx as u8);
        let set_al = |regs: &mut kvm_regs, v: u8| regs.rax = (regs.rax & !0xff) | u64::from(v);
        match op {
            0xba => {
                regs.rdx = (regs.rdx & !0xffff) | u64::from(u16::from_le_bytes([imm8, hi]));
                regs.rip += 3;
                Step::Continue
            }
            0x00 if imm8 == 0xd8 => {
                set_al(regs, al.wrapping_add(bl));
                regs.rip += 2;
                Step::Continue
            }
            0x04 => {
                set_al(regs, al.wrapping_add(imm8));
                regs.rip += 2;
                Step::Continue
            }
            0xb0 => {
                set_al(regs, imm8);
                regs.rip += 2;
                Step::Continue
            }
            0xee => {
                regs.rip += 1;
                self.io_buf = vec![al];
                Step::Out(regs.rdx as u16)
            }
            0xec => {
                regs.rip += 1;
                self.io_buf = vec![0];
                Step::In(regs.rdx as u16)
            }
            0xf4 => {
                regs.rip += 1;
                Step::Hlt
            }
            0xeb => {
                regs.rip = regs.rip.wrapping_add(2).wrapping_add(imm8 as i8 as u64);
                std::thread::yield_now();
                Step::Continue
            }
            other => Step::Fault(format!("opcode {:#04x} at {:#x}", other, ip)),
        }
    }

    fn replay(&mut self, next: Scripted) -> Result<VmExit<'_>> {
        Ok(match next {
            Scripted::Out(port, data) => {
                self.io_buf = data;
                VmExit::IoOut { port, data: &self.io_buf }
            }
            Scripted::In(port, len) => {
                self.io_buf = vec![0; len];
                VmExit::IoIn { port, data: &mut self.io_buf }
            }
            Scripted::Hlt => VmExit::Hlt,
            Scripted::Shutdown => VmExit::Shutdown,
            Scripted::Unhandled(what) => VmExit::Unhandled(what.to_string()),
            Scripted::RunError(errno) => {
                return Err(VMError::ResumeFailed {
                    command: KvmCommand::Run,
                    source: kvm_ioctls::Error::new(errno),
                })
            }
        })
    }
}

impl VirtualCpu for FakeVcpu {
    fn get_regs(&self) -> Result<kvm_regs> {
        self.check(KvmCommand::GetRegs)?;
        Ok(*self.regs.borrow())
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.check(KvmCommand::SetRegs)?;
        *self.regs.borrow_mut() = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<kvm_sregs> {
        self.check(KvmCommand::GetSregs)?;
        Ok(*self.sregs.borrow())
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        self.check(KvmCommand::SetSregs)?;
        *self.sregs.borrow_mut() = *sregs;
        Ok(())
    }

    fn resume(&mut self) -> Result<VmExit<'_>> {
        if let Some(next) = self.script.pop_front() {
            return self.replay(next);
        }
        if std::mem::take(&mut self.pending_in) {
            let value = self.io_buf.first().copied().unwrap_or(0);
            let regs = self.regs.get_mut();
            regs.rax = (regs.rax & !0xff) | u64::from(value);
        }
        let step = loop {
            match self.step() {
                Step::Continue => continue,
                other => break other,
            }
        };
        Ok(match step {
            Step::Out(port) => VmExit::IoOut { port, data: &self.io_buf },
            Step::In(port) => {
                self.pending_in = true;
                VmExit::IoIn { port, data: &mut self.io_buf }
            }
            Step::Hlt => VmExit::Hlt,
            Step::Fault(what) => VmExit::Unhandled(what),
            Step::Continue => unreachable!(),
        })
    }
}
