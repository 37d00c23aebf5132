//! Address-space constants shared by the physical and virtual memory
//! modules.
//!
//! Grounded on the teacher's `memory/paging.rs` physical-memory-offset
//! idiom and `memory/virt.rs`'s self-reference/KERNEL_BASE constants,
//! trimmed to the single flat direct-map scheme this kernel actually
//! uses (no KASLR, no self-referencing PML4 slot).

pub const PAGE_SIZE: usize = 4096;
pub const HUGE_2M: usize = 2 * 1024 * 1024;

use core::sync::atomic::{AtomicU64, Ordering};

/// Virtual base of the direct physical-memory map the bootloader installs
/// (requested as `Mapping::Dynamic` in `boot::entry::BOOTLOADER_CONFIG`
/// and read back from `BootInfo::physical_memory_offset` at boot). Every
/// physical frame is reachable at `PHYS_MEM_OFFSET + pa` without a
/// dedicated mapping. Set once by `set_phys_mem_offset` before any other
/// memory-subsystem init step runs.
static PHYS_MEM_OFFSET_CELL: AtomicU64 = AtomicU64::new(0);

pub fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET_CELL.store(offset, Ordering::Release);
}

#[inline]
pub fn phys_mem_offset() -> u64 {
    PHYS_MEM_OFFSET_CELL.load(Ordering::Acquire)
}

/// Start of the kernel's own higher-half code/data region, used only to
/// decide whether a faulting address belongs to the kernel half of the
/// address space. The bootloader always places the kernel and its direct
/// physical map above this canonical boundary.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Top of the user address range a process's stack grows down from.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Stack growth stops once the stack has reached this size (§4.3.2).
pub const USER_STACK_LIMIT: u64 = 1024 * 1024;

#[inline]
pub fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

#[inline]
pub fn align_up(addr: u64, align: u64) -> u64 {
    align_down(addr + align - 1, align)
}

#[inline]
pub fn is_kernel_va(va: u64) -> bool {
    va >= KERNEL_BASE
}

#[inline]
pub fn phys_to_kva(pa: u64) -> u64 {
    phys_mem_offset() + pa
}

#[inline]
pub fn kva_to_phys(kva: u64) -> u64 {
    kva - phys_mem_offset()
}
