use log::{debug, info};

use crate::error::{Result, VMError};
use super::devices::IoHandler;
use super::kvm_ctx::{VirtualCpu, VmExit};


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    Running,
    ExitIo,
    ExitHalt,
    ExitFatal,
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitSummary {
    pub state: VcpuState,
    pub io_exits: u64,
}


/// Exit dispatcher for one vCPU: resume, classify, service, repeat.
///
/// There is no timeout. A guest that neither halts nor exits keeps the
/// thread blocked in `resume`.
pub struct VmLoop {
    state: VcpuState,
    io_exits: u64,
}


impl Default for VmLoop {
    fn default() -> Self { Self::new() }
}


impl VmLoop {
    pub fn new() -> Self { Self { state: VcpuState::Running, io_exits: 0 } }

    pub fn state(&self) -> VcpuState { self.state }

    pub fn io_exits(&self) -> u64 { self.io_exits }

    /// Runs until the guest halts (`Ok`) or anything else ends the loop (`Err`).
    pub fn run_until_exit<V, H>(&mut self, vcpu: &mut V, io: &mut H) -> Result<ExitSummary>
    where
        V: VirtualCpu,
        H: IoHandler + ?Sized,
    {
        loop {
            self.transition(VcpuState::Running);
            let exit = match vcpu.resume() {
                Ok(exit) => exit,
                Err(e) => return Err(self.fatal(e)),
            };
            match exit {
                VmExit::Hlt => {
                    self.transition(VcpuState::ExitHalt);
                    info!("guest halted after {} I/O exits", self.io_exits);
                    return Ok(ExitSummary { state: self.state, io_exits: self.io_exits });
                }
                VmExit::IoOut { port, data } => {
                    self.transition(VcpuState::ExitIo);
                    self.io_exits += 1;
                    if let Err(source) = io.io_out(port, data) {
                        return Err(self.fatal(VMError::IoService { port, source }));
                    }
                }
                VmExit::IoIn { port, data } => {
                    self.transition(VcpuState::ExitIo);
                    self.io_exits += 1;
                    if let Err(source) = io.io_in(port, data) {
                        return Err(self.fatal(VMError::IoService { port, source }));
                    }
                }
                other => {
                    let reason = describe(&other);
                    return Err(self.fatal(VMError::FatalExit(reason)));
                }
            }
        }
    }

    fn transition(&mut self, next: VcpuState) {
        debug!("vcpu {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fatal(&mut self, err: VMError) -> VMError {
        self.transition(VcpuState::ExitFatal);
        err
    }
}


fn describe(exit: &VmExit<'_>) -> String {
    match exit {
        VmExit::Shutdown => "guest shutdown (triple fault)".to_string(),
        VmExit::FailEntry { reason, cpu } => {
            format!("VM entry failed on cpu {}, hardware reason {:#x}", cpu, reason)
        }
        VmExit::InternalError => "KVM internal error".to_string(),
        VmExit::Unhandled(what) => format!("unhandled exit {}", what),
        VmExit::Hlt | VmExit::IoOut { .. } | VmExit::IoIn { .. } => format!("{:?}", exit),
    }
}
