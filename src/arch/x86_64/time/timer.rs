//! PIT (8253/8254) tick source.
//!
//! Grounded on the teacher's `time::timer` module shape (a programmed
//! clock-event source whose IRQ handler is kept tiny and forwards to the
//! scheduler) but replacing its TSC-deadline/HPET machinery with the
//! legacy PIT channel 0, per SPEC_FULL.md §4.5's "programs the PIT (or
//! APIC timer) at a fixed `TIMER_FREQ`".

use crate::arch::x86_64::port::outb;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_FREQ_HZ: u32 = 1_193_182;

/// Fixed scheduler tick rate (§8 scenario 4).
pub const TIMER_FREQ_HZ: u32 = 100;

/// Programs PIT channel 0 for periodic mode at `TIMER_FREQ_HZ`.
pub fn init() {
    let divisor = (PIT_BASE_FREQ_HZ / TIMER_FREQ_HZ) as u16;
    unsafe {
        outb(PIT_COMMAND, 0x36); // channel 0, lobyte/hibyte, mode 3 (square wave)
        outb(PIT_CHANNEL0, (divisor & 0xff) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
    crate::log::logger::log_info("timer", format_args!("PIT programmed at {} Hz", TIMER_FREQ_HZ));
}

/// Called from the timer IRQ handler (vector `pic::TIMER_VECTOR`). Kept
/// tiny: just forwards to the scheduler's tick accounting.
pub fn on_tick() {
    crate::sched::tick();
}
