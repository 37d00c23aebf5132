//! Kernel heap, physical frame pool, and per-process virtual memory.
//!
//! Grounded on the teacher's `memory/` tree; `init_from_bootinfo` is the
//! `kernel_main` entry point's normalized boot handoff step (§4.5/§4.6).

pub mod fault;
pub mod heap;
pub mod layout;
pub mod phys;
pub mod virt;

use crate::error::{KernelError, KResult};
use bootloader_api::BootInfo;

/// Brings up the physical frame pool, per-process page table machinery,
/// and the kernel heap from the bootloader's handoff struct. Must run
/// before any allocation or user-page mapping.
pub fn init_from_bootinfo(boot_info: &'static mut BootInfo) -> KResult<()> {
    let offset = boot_info.physical_memory_offset.into_option().ok_or(KernelError::BadBootInfo)?;
    layout::set_phys_mem_offset(offset);

    phys::init(&boot_info.memory_regions);
    virt::init();
    heap::init_kernel_heap().map_err(|_| KernelError::HeapInitFailed)
}
