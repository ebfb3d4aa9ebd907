//! Conversions between the decoded register/segment types and the fixed
//! `kvm-bindings` structures the ioctls consume.
//!
//! The bindings are `#[repr(C)]` with their reserved padding spelled out as
//! fields, so every transfer goes through them and nothing here repacks.

use kvm_bindings::{kvm_dtable, kvm_regs, kvm_segment, kvm_sregs, kvm_userspace_memory_region};

use crate::types::{DescriptorTable, GeneralRegisters, MemoryRegion, SegmentDescriptor};

/// Bit 1 of RFLAGS is reserved and reads as one.
pub const RFLAGS_RESERVED: u64 = 0x2;

impl From<kvm_segment> for SegmentDescriptor {
    fn from(s: kvm_segment) -> Self {
        Self {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present != 0,
            dpl: s.dpl,
            db: s.db != 0,
            s: s.s != 0,
            l: s.l != 0,
            g: s.g != 0,
            avl: s.avl != 0,
            unusable: s.unusable != 0,
        }
    }
}

impl From<SegmentDescriptor> for kvm_segment {
    fn from(s: SegmentDescriptor) -> Self {
        kvm_segment {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present as u8,
            dpl: s.dpl,
            db: s.db as u8,
            s: s.s as u8,
            l: s.l as u8,
            g: s.g as u8,
            avl: s.avl as u8,
            unusable: s.unusable as u8,
            padding: 0,
        }
    }
}

impl From<kvm_dtable> for DescriptorTable {
    fn from(t: kvm_dtable) -> Self {
        Self { base: t.base, limit: t.limit }
    }
}

impl From<DescriptorTable> for kvm_dtable {
    fn from(t: DescriptorTable) -> Self {
        kvm_dtable { base: t.base, limit: t.limit, padding: [0; 3] }
    }
}

impl From<kvm_regs> for GeneralRegisters {
    fn from(r: kvm_regs) -> Self {
        Self {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }
}

impl From<GeneralRegisters> for kvm_regs {
    fn from(r: GeneralRegisters) -> Self {
        kvm_regs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }
}

impl From<MemoryRegion> for kvm_userspace_memory_region {
    fn from(r: MemoryRegion) -> Self {
        kvm_userspace_memory_region {
            slot: r.slot,
            flags: r.flags,
            guest_phys_addr: r.guest_phys_addr,
            memory_size: r.memory_size,
            userspace_addr: r.userspace_addr,
        }
    }
}

impl From<kvm_userspace_memory_region> for MemoryRegion {
    fn from(r: kvm_userspace_memory_region) -> Self {
        Self {
            slot: r.slot,
            flags: r.flags,
            guest_phys_addr: r.guest_phys_addr,
            memory_size: r.memory_size,
            userspace_addr: r.userspace_addr,
        }
    }
}

/// Point CS at linear address 0 so that RIP is the absolute guest address.
///
/// Operates on sregs previously read from the vCPU; every other field keeps
/// the kernel's real-mode reset value.
pub fn flatten_code_segment(sregs: &mut kvm_sregs) {
    let mut cs = SegmentDescriptor::from(sregs.cs);
    cs.base = 0;
    cs.selector = 0;
    sregs.cs = cs.into();
}

/// Initial register file for a real-mode entry at `entry`.
pub fn boot_registers(launch: &GeneralRegisters, entry: u64) -> kvm_regs {
    let mut regs = *launch;
    regs.rip = entry;
    regs.rflags = RFLAGS_RESERVED;
    regs.into()
}
