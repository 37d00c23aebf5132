//! Physical frame allocator: a free-list over frames reported usable by
//! the boot memory map, split into a kernel pool (heap, page tables,
//! kernel stacks) and a user pool (the one `vm::frame::get_frame` draws
//! from).
//!
//! Grounded on the teacher's `memory/frame_alloc.rs` (`FrameAllocator`,
//! `add_region`/`alloc` shape), reworked from a UEFI memory-descriptor
//! bump allocator into a `bootloader_api` free-list split across two
//! pools, since the VM subsystem needs frames it can individually
//! free and reuse rather than a one-way bump.

use crate::memory::layout::{align_up, phys_to_kva, PAGE_SIZE};
use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use spin::Mutex;

/// Frames reserved for the kernel pool up front, in pages. Covers the
/// heap, per-process page tables, and kernel thread stacks.
const KERNEL_POOL_FRAMES: usize = 2048; // 8 MiB

struct Pool {
    free: Vec<u64>, // physical addresses
}

impl Pool {
    const fn new() -> Pool {
        Pool { free: Vec::new() }
    }

    fn alloc(&mut self) -> Option<u64> {
        self.free.pop()
    }

    fn free(&mut self, pa: u64) {
        self.free.push(pa);
    }
}

static KERNEL_POOL: Mutex<Pool> = Mutex::new(Pool::new());
static USER_POOL: Mutex<Pool> = Mutex::new(Pool::new());

/// Walks the bootloader's memory map and seeds both pools. Must run
/// once, before the heap or any page table is built.
pub fn init(regions: &MemoryRegions) {
    let mut kernel_pool = KERNEL_POOL.lock();
    let mut user_pool = USER_POOL.lock();

    for region in regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        let start = align_up(region.start, PAGE_SIZE as u64);
        let mut pa = start;
        while pa + PAGE_SIZE as u64 <= region.end {
            if kernel_pool.free.len() < KERNEL_POOL_FRAMES {
                kernel_pool.free.push(pa);
            } else {
                user_pool.free.push(pa);
            }
            pa += PAGE_SIZE as u64;
        }
    }
}

/// Allocates a frame for kernel-internal use (page tables, heap
/// extension) and returns its kernel-virtual address.
pub fn alloc_kernel_frame() -> Option<u64> {
    KERNEL_POOL.lock().alloc().map(phys_to_kva)
}

pub fn free_kernel_frame(kva: u64) {
    KERNEL_POOL.lock().free(crate::memory::layout::kva_to_phys(kva));
}

/// Allocates a frame from the user pool the VM subsystem manages.
/// Returns its kernel-virtual address (the frame table stores frames by
/// KVA, not PA, since every physical frame is always reachable there).
pub fn alloc_user_frame() -> Option<u64> {
    USER_POOL.lock().alloc().map(phys_to_kva)
}

pub fn free_user_frame(kva: u64) {
    USER_POOL.lock().free(crate::memory::layout::kva_to_phys(kva));
}

pub fn user_frames_free() -> usize {
    USER_POOL.lock().free.len()
}

pub fn kernel_frames_free() -> usize {
    KERNEL_POOL.lock().free.len()
}
