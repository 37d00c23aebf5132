//! GDT/TSS bring-up: kernel code/data segments and one IST slot for the
//! double-fault handler.
//!
//! Grounded on the teacher's `arch/x86_64/gdt.rs` almost verbatim; kept
//! to a single IST slot (double fault) since the rest of the teacher's
//! per-vector IST policy was never wired to anything real.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// Interrupt-stack-table slot indices. Only `Df` is populated; other
/// vectors run on the current kernel stack.
#[repr(u16)]
pub enum IstSlot {
    Df = 0,
}

pub const IST_STACK_SIZE: usize = 4096 * 5;

static mut IST_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        let stack_start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(IST_STACK) });
        let stack_end = stack_start + IST_STACK_SIZE as u64;
        tss.interrupt_stack_table[IstSlot::Df as usize] = stack_end;
        tss
    };

    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
        let data_selector = gdt.add_entry(Descriptor::kernel_data_segment());
        let tss_selector = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (gdt, Selectors { code_selector, data_selector, tss_selector })
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

pub fn init() {
    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    crate::log::logger::log_info("gdt", format_args!("loaded kernel CS/DS/TSS with IST0 (double fault)"));
}
