//! Interrupt Descriptor Table.
//!
//! Grounded on the teacher's `idt` module shape (a `lazy_static` IDT
//! installing every CPU exception plus the timer/keyboard IRQ gates)
//! trimmed of its per-vector IST policy table, GS-base fault counters
//! and stack-canary verification, none of which were backed by real
//! per-CPU/per-thread state; `#PF` now delegates to
//! `memory::fault::handle_page_fault` and terminates the faulting
//! thread via `sched::exit_current` on an unresolved fault.

use crate::arch::x86_64::gdt::IstSlot;
use crate::arch::x86_64::interrupt::pic;
use crate::arch::x86_64::{keyboard, vga};
use crate::memory::fault::{handle_page_fault, FaultOutcome};
use lazy_static::lazy_static;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error);
        idt.breakpoint.set_handler_fn(breakpoint);
        idt.invalid_opcode.set_handler_fn(invalid_opcode);
        idt.general_protection_fault.set_handler_fn(general_protection_fault);
        idt.page_fault.set_handler_fn(page_fault);
        unsafe {
            idt.double_fault.set_handler_fn(double_fault).set_stack_index(IstSlot::Df as u16);
        }
        idt[pic::TIMER_VECTOR as usize].set_handler_fn(timer_interrupt);
        idt[pic::KEYBOARD_VECTOR as usize].set_handler_fn(keyboard_interrupt);
        idt
    };
}

pub fn init(cpu_id: usize) {
    assert_eq!(cpu_id, 0, "only a single CPU is supported");
    IDT.load();
    crate::log::logger::log_info("idt", format_args!("IDT installed"));
}

extern "x86-interrupt" fn divide_error(stack: InterruptStackFrame) {
    kill_current("#DE divide error", &stack);
}

extern "x86-interrupt" fn breakpoint(stack: InterruptStackFrame) {
    crate::log::logger::log_warn("idt", format_args!("breakpoint at {:#x}", stack.instruction_pointer.as_u64()));
}

extern "x86-interrupt" fn invalid_opcode(stack: InterruptStackFrame) {
    kill_current("#UD invalid opcode", &stack);
}

extern "x86-interrupt" fn general_protection_fault(stack: InterruptStackFrame, code: u64) {
    crate::log::logger::log_err("idt", format_args!("#GP code={:#x} rip={:#x}", code, stack.instruction_pointer.as_u64()));
    kill_current("#GP", &stack);
}

extern "x86-interrupt" fn double_fault(stack: InterruptStackFrame, _code: u64) -> ! {
    vga::print_critical("double fault\n");
    crate::log::logger::log_err("idt", format_args!("#DF rip={:#x}", stack.instruction_pointer.as_u64()));
    loop {
        x86_64::instructions::hlt();
    }
}

extern "x86-interrupt" fn page_fault(stack: InterruptStackFrame, code: PageFaultErrorCode) {
    let addr = Cr2::read().as_u64();
    let present = code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let write = code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let tid = crate::sched::current_tid();
    match handle_page_fault(tid, addr, present, write) {
        FaultOutcome::Resolved => {}
        FaultOutcome::Kill(status) => {
            crate::log::logger::log_err(
                "idt",
                format_args!("unresolved #PF addr={:#x} rip={:#x}, killing tid {}", addr, stack.instruction_pointer.as_u64(), tid),
            );
            crate::sched::exit_current(status);
        }
    }
}

extern "x86-interrupt" fn timer_interrupt(_stack: InterruptStackFrame) {
    crate::arch::x86_64::time::timer::on_tick();
    pic::eoi(0);
    crate::sched::yield_on_return();
}

extern "x86-interrupt" fn keyboard_interrupt(_stack: InterruptStackFrame) {
    keyboard::kbd_irq();
    pic::eoi(1);
    crate::sched::yield_on_return();
}

fn kill_current(reason: &str, stack: &InterruptStackFrame) {
    crate::log::logger::log_err("idt", format_args!("{} rip={:#x}", reason, stack.instruction_pointer.as_u64()));
    crate::sched::exit_current(-1);
}
