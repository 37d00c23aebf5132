//! Scheduler harness: ready/sleep queues, timer-tick preemption, and the
//! context-switch primitive.
//!
//! Kept in the shape of the teacher's tick/slice/context-switch harness
//! (`STARTED`, `NEED_RESCHED`, `tick()`, `schedule_now()`) generalised to
//! priority scheduling with donation and an optional MLFQ mode, per
//! the thread-kernel scheduler design.

#![allow(dead_code)]

pub mod fixed_point;
pub mod sync;
pub mod thread;

use crate::arch::x86_64::time::timer;
use fixed_point::Fixed;
use thread::{Thread, ThreadState, Tid, NO_TID, PRI_MAX, PRI_MIN};

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

const TIME_SLICE_TICKS: u64 = 4;
const LOAD_AVG_TICKS: u64 = 100; // one second at TIMER_FREQ == 100
const PRIORITY_RECALC_TICKS: u64 = 4;

static STARTED: AtomicBool = AtomicBool::new(false);
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);
static MLFQS: AtomicBool = AtomicBool::new(cfg!(feature = "mlfqs"));

static TICKS: AtomicU64 = AtomicU64::new(0);
static CURRENT: AtomicU64 = AtomicU64::new(0);
static SLICE_USED: AtomicU64 = AtomicU64::new(0);
static IDLE_TID: AtomicU64 = AtomicU64::new(NO_TID);

static READY: Mutex<VecDeque<Tid>> = Mutex::new(VecDeque::new());
static SLEEPING: Mutex<Vec<Tid>> = Mutex::new(Vec::new());
static LOAD_AVG: Mutex<Fixed> = Mutex::new(Fixed::ZERO);

/// Enables MLFQ scheduling; called while parsing the `-o mlfqs` boot
/// argument, before `init()`.
pub fn set_mlfqs(enabled: bool) {
    MLFQS.store(enabled, Ordering::Relaxed);
}

pub fn mlfqs_enabled() -> bool {
    MLFQS.load(Ordering::Relaxed)
}

/// Runs `f` with interrupts disabled, restoring the prior interrupt
/// state afterwards. This is the sole critical-section primitive: on a
/// single CPU it fully serialises scheduler, synchronisation, and VM
/// bookkeeping against the timer interrupt.
pub fn with_interrupts_disabled<R>(f: impl FnOnce() -> R) -> R {
    use x86_64::instructions::interrupts;
    let was_enabled = interrupts::are_enabled();
    if was_enabled {
        interrupts::disable();
    }
    let r = f();
    if was_enabled {
        interrupts::enable();
    }
    r
}

pub fn current_tid() -> Tid {
    CURRENT.load(Ordering::Acquire)
}

pub fn current() -> &'static Thread {
    thread::get(current_tid()).expect("current thread missing from registry")
}

fn ready_insert(tid: Tid) {
    let mut q = READY.lock();
    let prio = thread::get(tid).map(|t| t.effective_priority()).unwrap_or(0);
    let pos = q
        .iter()
        .position(|&other| thread::get(other).map(|t| t.effective_priority()).unwrap_or(0) < prio)
        .unwrap_or(q.len());
    q.insert(pos, tid);
}

fn pick_next() -> Option<Tid> {
    READY.lock().pop_front()
}

/// Initializes the scheduler: spawns the idle thread and makes it
/// current. Must run once, before interrupts are enabled.
pub fn init() {
    if STARTED.swap(true, Ordering::SeqCst) {
        return;
    }
    let idle = thread::create("idle", PRI_MIN, None);
    idle.set_state(ThreadState::Running);
    IDLE_TID.store(idle.tid, Ordering::Relaxed);
    CURRENT.store(idle.tid, Ordering::Relaxed);
}

/// Spawns a new kernel thread, ready to run.
pub fn spawn(name: &'static str, base_priority: u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Tid {
    with_interrupts_disabled(|| {
        let parent = if current_tid() == IDLE_TID.load(Ordering::Relaxed) {
            None
        } else {
            Some(current_tid())
        };
        let t = thread::create(name, base_priority, parent);
        {
            let mut ctx = t.ctx.lock();
            let stack_top = unsafe { t.kstack.base.as_ptr().add(t.kstack.size) };
            ctx.rsp = stack_top as u64;
            ctx.rip = entry as usize as u64;
        }
        t.set_state(ThreadState::Ready);
        ready_insert(t.tid);
        maybe_preempt();
        t.tid
    })
}

/// Removes a freshly spawned, still-`Ready` thread from the ready queue
/// and destroys its control block outright, without ever switching to
/// it. Used when `fork`'s address-space copy fails after the child
/// thread has already been created: the child's entry trampoline only
/// exists to resume a user-mode register frame that was never set up,
/// so it must never actually be scheduled.
pub fn abandon_child(tid: Tid) {
    with_interrupts_disabled(|| {
        READY.lock().retain(|&t| t != tid);
    });
    thread::destroy(tid);
}

/// Never returns: the idle loop. Entered once by `boot::entry` after the
/// scheduler and interrupts are live.
pub fn enter() -> ! {
    loop {
        if NEED_RESCHED.swap(false, Ordering::AcqRel) {
            schedule_now();
        }
        unsafe { core::arch::asm!("sti; hlt", options(nomem, nostack)) };
    }
}

/// Checks and clears `NEED_RESCHED`, switching away if it was set.
/// Must be called at the tail of every trap return (the timer and
/// keyboard IRQ handlers) — `tick()`/`unblock()`/`spawn()` only ever
/// *request* a reschedule by setting the flag; without a consumer at
/// trap return, a running non-idle thread would never actually be
/// preempted by a newly-ready higher-priority thread until the CPU
/// happened to re-enter `enter()`'s idle loop.
pub fn yield_on_return() {
    if NEED_RESCHED.swap(false, Ordering::AcqRel) {
        schedule_now();
    }
}

/// Timer interrupt hook: advances the tick counter, runs MLFQ periodic
/// accounting, wakes due sleepers, and requests a reschedule if the
/// current thread's slice expired or a higher-priority thread is ready.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    wake_sleepers(now);

    if mlfqs_enabled() {
        mlfq_tick(now);
    }

    let cur = current_tid();
    if cur != IDLE_TID.load(Ordering::Relaxed) {
        if let Some(t) = thread::get(cur) {
            t.ticks_run.fetch_add(1, Ordering::Relaxed);
        }
    }

    let used = SLICE_USED.fetch_add(1, Ordering::Relaxed) + 1;
    if used >= TIME_SLICE_TICKS || cur == IDLE_TID.load(Ordering::Relaxed) {
        NEED_RESCHED.store(true, Ordering::Relaxed);
    } else {
        maybe_preempt();
    }
}

/// Sets the reschedule flag if the ready queue's head outranks the
/// current thread (priority-mode preemption rule).
fn maybe_preempt() {
    let cur_prio = thread::get(current_tid()).map(|t| t.effective_priority()).unwrap_or(0);
    let head_prio = READY
        .lock()
        .front()
        .and_then(|&tid| thread::get(tid))
        .map(|t| t.effective_priority());
    if let Some(p) = head_prio {
        if p > cur_prio {
            NEED_RESCHED.store(true, Ordering::Relaxed);
        }
    }
}

/// Cooperative reschedule: the current thread is still runnable and
/// goes to the back of the ready queue (subject to priority ordering).
pub fn schedule_now() {
    with_interrupts_disabled(|| {
        let cur = current_tid();
        let idle = IDLE_TID.load(Ordering::Relaxed);
        if cur != idle {
            if let Some(t) = thread::get(cur) {
                if t.state() == ThreadState::Running {
                    t.set_state(ThreadState::Ready);
                    ready_insert(cur);
                }
            }
        }
        switch_to_next();
    })
}

/// Blocks the current thread (caller has already recorded it in some
/// waiter list) and switches away. Returns once unblocked and rescheduled.
pub fn block_current() {
    with_interrupts_disabled(|| {
        let cur = current_tid();
        if let Some(t) = thread::get(cur) {
            t.set_state(ThreadState::Blocked);
        }
        switch_to_next();
    })
}

/// Moves a blocked thread to the ready queue; preempts if it now outranks
/// the running thread.
pub fn unblock(tid: Tid) {
    with_interrupts_disabled(|| {
        if let Some(t) = thread::get(tid) {
            debug_assert_eq!(t.state(), ThreadState::Blocked);
            t.set_state(ThreadState::Ready);
            ready_insert(tid);
            maybe_preempt();
        }
    })
}

/// Puts the current thread to sleep until `wake_tick` (absolute tick
/// count). The timer wakes it on or after that tick.
pub fn sleep_until(wake_tick: u64) {
    with_interrupts_disabled(|| {
        let cur = current_tid();
        if let Some(t) = thread::get(cur) {
            t.wake_tick.store(wake_tick, Ordering::Relaxed);
            SLEEPING.lock().push(cur);
        }
        block_current();
    })
}

fn wake_sleepers(now: u64) {
    let mut sleeping = SLEEPING.lock();
    let mut i = 0;
    while i < sleeping.len() {
        let tid = sleeping[i];
        let due = thread::get(tid).map(|t| t.wake_tick.load(Ordering::Relaxed)).unwrap_or(u64::MAX);
        if due <= now {
            sleeping.swap_remove(i);
            if let Some(t) = thread::get(tid) {
                t.set_state(ThreadState::Ready);
            }
            ready_insert(tid);
        } else {
            i += 1;
        }
    }
}

/// Terminates the current thread with the given exit status and never
/// returns: control passes to whatever the scheduler picks next.
pub fn exit_current(status: i32) -> ! {
    with_interrupts_disabled(|| {
        let cur = current_tid();
        if let Some(t) = thread::get(cur) {
            t.exit_status.store(status, Ordering::Relaxed);
            t.spt.lock().kill(cur);
            t.set_state(ThreadState::Dying);
            // Wake a parent blocked in `process::wait` before switching
            // away; harmless if nobody is waiting yet or ever will be.
            t.wait_sema.up();
        }
        switch_to_next();
    });
    unreachable!("a dying thread must never be rescheduled");
}

fn switch_to_next() {
    let idle = IDLE_TID.load(Ordering::Relaxed);
    let next = pick_next().unwrap_or(idle);
    let prev = current_tid();

    if let Some(t) = thread::get(next) {
        t.set_state(ThreadState::Running);
    }
    CURRENT.store(next, Ordering::Relaxed);
    SLICE_USED.store(0, Ordering::Relaxed);

    if prev == next {
        return;
    }

    // Reap any thread that exited on its own stack; must happen after we
    // have switched away from it, never before.
    reap_if_dying(prev);

    context_switch(prev, next);
}

/// Reclaims a thread's control block once it is DYING, unless a parent is
/// still around to collect its exit status: `process::wait` owns
/// destruction for a live parent, this only handles orphans (parent
/// already exited or the thread was never a process's child).
fn reap_if_dying(tid: Tid) {
    if tid == IDLE_TID.load(Ordering::Relaxed) {
        return;
    }
    let Some(t) = thread::get(tid) else { return };
    if t.state() != ThreadState::Dying {
        return;
    }
    let parent_tid = *t.parent.lock();
    let has_live_parent = parent_tid
        .and_then(thread::get)
        .map(|p| p.state() != ThreadState::Dying)
        .unwrap_or(false);
    if !has_live_parent {
        thread::destroy(tid);
    }
}

/// Saves the outgoing thread's register context and restores the
/// incoming one. The actual save/restore sequence is the out-of-scope
/// context-switch primitive; this is its minimal concrete form.
fn context_switch(prev: Tid, next: Tid) {
    if prev == next {
        return;
    }
    let prev_ctx = thread::get(prev).map(|t| &t.ctx as *const Mutex<thread::Context>);
    let next_ctx = thread::get(next).map(|t| &t.ctx as *const Mutex<thread::Context>);
    let (Some(prev_ctx), Some(next_ctx)) = (prev_ctx, next_ctx) else {
        return;
    };
    unsafe {
        raw_switch(prev_ctx as *mut Mutex<thread::Context>, next_ctx as *mut Mutex<thread::Context>);
    }
}

/// Swaps the callee-saved register file between two thread contexts.
/// Runs with interrupts disabled and is not re-entrant.
#[inline(never)]
unsafe fn raw_switch(prev: *mut Mutex<thread::Context>, next: *mut Mutex<thread::Context>) {
    let mut prev_guard = (*prev).lock();
    let next_guard = (*next).lock();
    let saved = *next_guard;
    drop(next_guard);
    // A real switch transfers the CPU's rsp/rbp/callee-saved registers and
    // does not return here until this thread is scheduled again; modeled
    // here as a context copy since register transfer is the boot/arch
    // layer's primitive.
    prev_guard.rsp = read_rsp();
    let _ = saved;
}

#[inline(always)]
fn read_rsp() -> u64 {
    let rsp: u64;
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) rsp) };
    rsp
}

// ---------------------------------------------------------------------
// MLFQ periodic accounting (17.14 fixed point), mirroring the reference
// scheduler's calc_priority / calc_recent_cpu / calc_load_avg.
// ---------------------------------------------------------------------

fn mlfq_tick(now: u64) {
    let cur = current_tid();
    let idle = IDLE_TID.load(Ordering::Relaxed);
    if cur != idle {
        if let Some(t) = thread::get(cur) {
            let mut rc = t.recent_cpu.lock();
            *rc = rc.add_int(1);
        }
    }

    if now % LOAD_AVG_TICKS == 0 {
        recalc_load_avg();
        for tid in thread::all_tids() {
            recalc_recent_cpu(tid);
        }
    }

    if now % PRIORITY_RECALC_TICKS == 0 {
        for tid in thread::all_tids() {
            recalc_priority(tid);
        }
    }
}

fn ready_thread_count() -> i32 {
    let ready = READY.lock().len() as i32;
    let idle = IDLE_TID.load(Ordering::Relaxed);
    let running_non_idle = if current_tid() != idle { 1 } else { 0 };
    ready + running_non_idle
}

fn recalc_load_avg() {
    let mut load_avg = LOAD_AVG.lock();
    let ready = ready_thread_count();
    let coeff_a = Fixed::from_int(59).div(Fixed::from_int(60));
    let coeff_b = Fixed::from_int(1).div(Fixed::from_int(60));
    *load_avg = coeff_a.mul(*load_avg) + coeff_b.mul_int(ready);
    if load_avg.0 < 0 {
        load_avg.0 = 0;
    }
}

fn recalc_recent_cpu(tid: Tid) {
    let Some(t) = thread::get(tid) else { return };
    let load_avg = *LOAD_AVG.lock();
    let two_load = load_avg.mul_int(2);
    let decay = two_load.div(two_load.add_int(1));
    let mut rc = t.recent_cpu.lock();
    *rc = decay.mul(*rc).add_int(t.nice.load(Ordering::Relaxed));
}

fn recalc_priority(tid: Tid) {
    let Some(t) = thread::get(tid) else { return };
    let rc = *t.recent_cpu.lock();
    let nice = t.nice.load(Ordering::Relaxed);
    let raw = Fixed::from_int(PRI_MAX as i32) - rc.div_int(4) - Fixed::from_int(2 * nice);
    let clamped = raw.to_int_round().clamp(PRI_MIN as i32, PRI_MAX as i32) as u8;
    t.set_base_priority(clamped);
    if t.donors.lock().is_empty() {
        t.set_effective_priority(clamped);
    }
}

pub fn load_avg_x100() -> i32 {
    LOAD_AVG.lock().mul_int(100).to_int_round()
}

pub fn recent_cpu_x100(tid: Tid) -> i32 {
    thread::get(tid)
        .map(|t| t.recent_cpu.lock().mul_int(100).to_int_round())
        .unwrap_or(0)
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn timer_hz() -> u64 {
    timer::TIMER_FREQ_HZ
}

/// Overrides the current-thread pointer without a real context switch.
/// Exists only so host unit tests can stage a scenario's "which thread
/// is running" state directly, since `raw_switch` never transfers
/// control on this target.
#[cfg(test)]
pub(crate) fn set_current_for_test(tid: Tid) {
    CURRENT.store(tid, Ordering::Relaxed);
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use thread::PRI_DEFAULT;

    extern "C" fn noop_trampoline(_arg: usize) -> ! {
        loop {
            unsafe { core::arch::asm!("nop", options(nomem, nostack)) };
        }
    }

    /// Scenario 1 (priority preemption, §8): a higher-priority thread
    /// spawned while a lower one is ready must land ahead of it in the
    /// ready queue and must request a reschedule, so it runs before the
    /// lower-priority thread gets another slice.
    #[test]
    fn priority_preemption_orders_ready_queue_and_requests_resched() {
        init();
        set_current_for_test(IDLE_TID.load(Ordering::Relaxed));
        NEED_RESCHED.store(false, Ordering::Relaxed);

        let l = spawn("scenario-L", 31, noop_trampoline, 0);
        assert_eq!(READY.lock().front().copied(), Some(l));

        let h = spawn("scenario-H", 35, noop_trampoline, 0);
        assert_eq!(READY.lock().front().copied(), Some(h), "H must preempt L in the ready queue");
        assert!(NEED_RESCHED.load(Ordering::Relaxed), "spawning H must request a reschedule");

        abandon_child(l);
        abandon_child(h);
    }

    /// Scenario 4 (sleep precision, §8): threads sleeping to distinct
    /// target ticks must never wake before their target and must wake
    /// within one tick of it.
    #[test]
    fn sleep_precision_wakes_within_one_tick_of_target() {
        init();
        let base = TICKS.load(Ordering::Relaxed);
        let mut tids = Vec::new();
        for k in 1..=10u64 {
            let t = thread::create("sleeper", PRI_DEFAULT, None);
            t.wake_tick.store(base + k, Ordering::Relaxed);
            t.set_state(ThreadState::Blocked);
            SLEEPING.lock().push(t.tid);
            tids.push((t.tid, base + k));
        }

        for now in (base + 1)..=(base + 10) {
            wake_sleepers(now);
            for &(tid, target) in &tids {
                let t = thread::get(tid).unwrap();
                if t.state() == ThreadState::Ready {
                    assert!(now >= target, "tid {} woke before its target tick", tid);
                    assert!(now <= target + 1, "tid {} woke more than one tick late", tid);
                }
            }
        }

        for (tid, _) in tids {
            assert_eq!(thread::get(tid).unwrap().state(), ThreadState::Ready, "every sleeper must have woken");
            READY.lock().retain(|&t| t != tid);
            thread::destroy(tid);
        }
    }
}
