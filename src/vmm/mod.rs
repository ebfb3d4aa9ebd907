pub mod kvm_ctx;
pub mod memory;
pub mod regs;
pub mod boot;
pub mod vcpu;
pub mod devices;
pub mod event_loop;
pub mod run;
#[cfg(test)] pub(crate) mod fake;
