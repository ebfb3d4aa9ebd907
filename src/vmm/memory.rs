use log::info;
use vm_memory::{GuestAddress, MmapRegion, VolatileMemory};

use crate::config::PAGE_SIZE;
use crate::error::{Result, VMError};
use crate::types::MemoryRegion;
use super::kvm_ctx::VirtualMachine;


/// Host-owned, page-aligned anonymous shared mapping backing one guest slot.
///
/// The guest writes it through KVM only while a resume is outstanding, so the
/// host accessors below are only sound between resumes.
pub struct GuestMem {
    mapping: MmapRegion<()>,
    base: GuestAddress,
    slot: u32,
}


impl GuestMem {
    pub fn create(slot: u32, base: u64, size: u64) -> Result<Self> {
        if size == 0 || size % PAGE_SIZE != 0 || base % PAGE_SIZE != 0 {
            return Err(VMError::AllocationFailed(format!(
                "guest region {:#x}+{:#x} must be non-empty and page-aligned",
                base, size
            )));
        }
        let len: usize = size
            .try_into()
            .map_err(|_| VMError::AllocationFailed(format!("region size {:#x} too big", size)))?;
        let mapping = MmapRegion::<()>::build(
            None,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_NORESERVE,
        )
        .map_err(|e| VMError::AllocationFailed(format!("mmap of {:#x} bytes: {}", size, e)))?;
        Ok(Self { mapping, base: GuestAddress(base), slot })
    }

    pub fn base(&self) -> GuestAddress { self.base }

    pub fn size(&self) -> usize { self.mapping.size() }

    /// Copy `bytes` to offset 0 of the region.
    pub fn load_payload(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.size() {
            return Err(VMError::AllocationFailed(format!(
                "payload of {} bytes does not fit in {:#x}-byte region",
                bytes.len(),
                self.size()
            )));
        }
        self.mapping
            .get_slice(0, bytes.len())
            .map_err(|e| VMError::AllocationFailed(e.to_string()))?
            .copy_from(bytes);
        Ok(())
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let copied = self
            .mapping
            .get_slice(offset, buf.len())
            .map_err(|e| VMError::AllocationFailed(e.to_string()))?
            .copy_to(buf);
        debug_assert_eq!(copied, buf.len());
        Ok(())
    }

    /// Descriptor for `KVM_SET_USER_MEMORY_REGION`.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion {
            slot: self.slot,
            flags: 0,
            guest_phys_addr: self.base.0,
            memory_size: self.size() as u64,
            userspace_addr: self.mapping.as_ptr() as u64,
        }
    }

    /// Map the region into `vm`. The caller keeps `self` alive at least as long as `vm`.
    pub fn install<V: VirtualMachine>(&self, vm: &V) -> Result<()> {
        let region = self.region();
        // SAFETY: the descriptor covers exactly `self.mapping`, and the owner
        // (`run::Vmm`) drops the VM before this mapping.
        unsafe { vm.install_memory_region(&region)? };
        info!(
            "slot {} installed: guest {:#x}..{:#x} -> host {:#x}",
            region.slot,
            region.guest_phys_addr,
            region.guest_phys_addr + region.memory_size,
            region.userspace_addr
        );
        Ok(())
    }
}
