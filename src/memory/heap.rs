//! Kernel heap initialization.
//!
//! Grounded on the teacher's `memory/heap.rs`: a `linked_list_allocator`
//! `LockedHeap` as the `#[global_allocator]`, trimmed of the unused
//! early-boot `DummyAllocator` fallback now that `memory::phys` brings
//! up a real frame pool before the heap is touched.
//!
//! The heap arena is carved out of the kernel pool's direct-map window
//! rather than a separately mapped VA range: since nothing else draws
//! from the kernel pool before `init_kernel_heap` runs, the frames it
//! pops are contiguous within the boot memory map's first usable
//! region. A gap (multiple regions stitched together) is treated as a
//! boot-time failure rather than silently handing out a non-contiguous
//! arena to the allocator.

use core::alloc::Layout;
use linked_list_allocator::LockedHeap;

pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Reserves `HEAP_SIZE` contiguous bytes from the kernel frame pool and
/// hands them to the global allocator.
pub fn init_kernel_heap() -> Result<(), ()> {
    let page_count = HEAP_SIZE / crate::memory::layout::PAGE_SIZE;
    let first_kva = crate::memory::phys::alloc_kernel_frame().ok_or(())?;
    for i in 1..page_count {
        let kva = crate::memory::phys::alloc_kernel_frame().ok_or(())?;
        let expected = first_kva + (i * crate::memory::layout::PAGE_SIZE) as u64;
        if kva != expected {
            return Err(());
        }
    }
    unsafe {
        KERNEL_HEAP.lock().init(first_kva as *mut u8, HEAP_SIZE);
    }
    Ok(())
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    crate::log::logger::log_err("heap", format_args!("allocation failure: {:?}", layout));
    panic!("out of kernel heap memory: {:?}", layout);
}
