//! Page-fault handler: SPT lookup, the stack-growth heuristic, and
//! termination for anything else.
//!
//! Grounded on `examples/original_source/userprog/exception.c`'s
//! `page_fault` (kernel-VA/NULL/not-present triage, delegating to the
//! VM subsystem's claim path before falling back to process kill) and
//! `vm/vm.c`'s stack-growth check.

use crate::memory::layout::{is_kernel_va, USER_STACK_LIMIT, USER_STACK_TOP};
use crate::sched::thread::{self, Tid};
use crate::vm::page::{PageDescriptor, PageKind, PageOrigin, PageVariant};
use crate::vm::spt::SupplementalPageTable;
use crate::vm::{page_round_down, spt, PAGE_SIZE};

/// Outcome the architecture layer's `#PF` handler acts on: either the
/// fault was resolved and the faulting instruction may retry, or the
/// owning process must be terminated with the given status.
pub enum FaultOutcome {
    Resolved,
    Kill(i32),
}

/// Handles a page fault in `tid` at address `addr` (§4.3.2). `present`
/// is the hardware error code's P bit (set ⇒ protection violation
/// rather than not-present); `write` is the W bit.
///
/// A write fault on a file-backed page marks its `FileBacking` dirty
/// (mirroring `file_backed_swap_out`'s `pml4_is_dirty` check): since a
/// page only ever takes one fault — once mapped, a writable page never
/// faults again, and a second fault on a non-writable one is a
/// protection violation caught by the `present` check above — the flag
/// set here at first touch already records everything eviction's and
/// `kill`'s write-back gate need to know.
pub fn handle_page_fault(tid: Tid, addr: u64, present: bool, write: bool) -> FaultOutcome {
    if is_kernel_va(addr) || addr == 0 || present {
        return FaultOutcome::Kill(-1);
    }

    let Some(thread) = thread::get(tid) else {
        return FaultOutcome::Kill(-1);
    };

    {
        let mut guard = thread.spt.lock();
        if guard.find(addr).is_some() {
            return match spt::claim(tid, &mut guard, addr) {
                Ok(()) => {
                    mark_dirty_on_write(&mut guard, addr, write);
                    FaultOutcome::Resolved
                }
                Err(_) => FaultOutcome::Kill(-1),
            };
        }
    }

    if let Some(new_bottom) = stack_growth_target(thread, addr) {
        let mut guard = thread.spt.lock();
        let desc = PageDescriptor::new_uninit(
            new_bottom,
            true,
            PageKind::Anon,
            crate::vm::page::Aux::None,
            PageOrigin::Stack,
        );
        if !guard.insert(desc) {
            return FaultOutcome::Kill(-1);
        }
        thread.user_stack_bottom.store(new_bottom, core::sync::atomic::Ordering::Relaxed);
        return match spt::claim(tid, &mut guard, new_bottom) {
            Ok(()) => {
                mark_dirty_on_write(&mut guard, new_bottom, write);
                FaultOutcome::Resolved
            }
            Err(_) => FaultOutcome::Kill(-1),
        };
    }

    FaultOutcome::Kill(-1)
}

/// Marks `addr`'s descriptor dirty if it resolved to a file-backed page
/// and the fault was a write. A no-op for anonymous pages, which have
/// no backing file to write back to.
fn mark_dirty_on_write(spt: &mut SupplementalPageTable, addr: u64, write: bool) {
    if !write {
        return;
    }
    if let Some(desc) = spt.find_mut(addr) {
        if let PageVariant::File(ref mut backing) = desc.variant {
            backing.dirty = true;
        }
    }
}

/// Returns the new stack-bottom page to allocate if `addr` is a
/// plausible stack-growth fault, per §4.3.2: within 8 bytes below the
/// saved user `rsp` and within 1 MiB of `USER_STACK_TOP`.
fn stack_growth_target(thread: &'static crate::sched::thread::Thread, addr: u64) -> Option<u64> {
    let rsp = thread.saved_user_rsp.load(core::sync::atomic::Ordering::Relaxed);
    if rsp == 0 {
        return None;
    }
    if addr < rsp.saturating_sub(8) || addr > USER_STACK_TOP {
        return None;
    }
    let current_bottom = {
        let bottom = thread.user_stack_bottom.load(core::sync::atomic::Ordering::Relaxed);
        if bottom == 0 {
            USER_STACK_TOP
        } else {
            bottom
        }
    };
    if USER_STACK_TOP - page_round_down(addr) > USER_STACK_LIMIT {
        return None;
    }
    let new_bottom = current_bottom.saturating_sub(PAGE_SIZE as u64);
    Some(page_round_down(new_bottom))
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use core::sync::atomic::Ordering;

    /// Scenario 6 (stack growth, §8): a user program recursing 8 bytes at
    /// a time must keep faulting the stack downward until it has grown by
    /// 1 MiB, after which a fault further out must not be treated as
    /// stack growth (the architecture layer kills the process instead).
    #[test]
    fn stack_growth_extends_to_the_limit_then_refuses() {
        let t = thread::create("scenario-stack", 31, None);
        t.saved_user_rsp.store(USER_STACK_TOP, Ordering::Relaxed);

        let mut rsp = USER_STACK_TOP;
        let mut grown_pages = 0u64;
        while USER_STACK_TOP - rsp < USER_STACK_LIMIT {
            t.saved_user_rsp.store(rsp, Ordering::Relaxed);
            let fault_addr = rsp.saturating_sub(8);
            let target = stack_growth_target(t, fault_addr).expect("fault within 8 bytes of rsp must grow the stack");
            t.user_stack_bottom.store(target, Ordering::Relaxed);
            grown_pages += 1;
            rsp = rsp.saturating_sub(PAGE_SIZE as u64);
        }
        assert!(grown_pages > 0, "recursing 8 bytes at a time must have triggered at least one growth fault");

        // One more page beyond the 1 MiB limit: no longer a growth fault.
        t.saved_user_rsp.store(rsp, Ordering::Relaxed);
        assert!(
            stack_growth_target(t, rsp.saturating_sub(8)).is_none(),
            "a fault beyond the 1 MiB stack limit must not extend the stack"
        );
    }
}
