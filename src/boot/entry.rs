//! Bootloader handoff: `bootloader_api::entry_point!` into `kernel_main`.
//!
//! Grounded on the teacher's `boot::entry` (the `BootloaderConfig` direct
//! physical-memory-map request and `entry_point!` wiring), with init
//! order reconciled to the modules this crate actually builds: serial
//! first for early log output, then memory, then GDT/IDT/PIC/timer/
//! keyboard, then the scheduler.

use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.kernel_stack_size = 512 * 1024;
    config.mappings.physical_memory = Some(bootloader_api::config::Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    crate::arch::x86_64::serial::init();
    crate::log::init_logger();

    crate::memory::init_from_bootinfo(boot_info).expect("boot-time memory init failed");

    crate::arch::x86_64::gdt::init();
    crate::arch::x86_64::idt::init(0);
    crate::arch::x86_64::interrupt::pic::init();
    crate::arch::x86_64::time::timer::init();
    crate::arch::x86_64::keyboard::init();

    crate::sched::init();

    x86_64::instructions::interrupts::enable();

    crate::sched::enter();
}
