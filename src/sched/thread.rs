//! Thread control block and the global thread registry.
//!
//! Mirrors the shape of the teacher's `sched::task::Task` (a registry of
//! leaked, pointer-addressed control blocks keyed by id) generalised to
//! carry the donation, MLFQ, VM and process-glue fields a thread needs.

use crate::process::FdTable;
use crate::sched::fixed_point::Fixed;
use crate::sched::sync::Semaphore;
use crate::vm::spt::SupplementalPageTable;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

pub type Tid = u64;
pub const NO_TID: Tid = u64::MAX;

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;

pub const NICE_MIN: i32 = -20;
pub const NICE_DEFAULT: i32 = 0;
pub const NICE_MAX: i32 = 20;

const STACK_MAGIC: u64 = 0x5441_4c55_5354_4b21; // "TALUSTK!" truncated

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    Dying = 3,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Running,
            1 => ThreadState::Ready,
            2 => ThreadState::Blocked,
            _ => ThreadState::Dying,
        }
    }
}

/// Saved callee-and-volatile register file for a suspended thread. The
/// actual assembly save/restore sequence is the out-of-scope context
/// switch primitive; this struct is its ABI.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

pub struct Thread {
    pub tid: Tid,
    pub name: &'static str,
    state: AtomicU8,

    base_priority: AtomicU8,
    effective_priority: AtomicU8,

    pub nice: AtomicI32,
    pub recent_cpu: Mutex<Fixed>,

    /// Raw address of the `sched::sync::Lock` this thread is blocked
    /// acquiring, or 0. Valid to dereference while non-zero: a lock is
    /// never dropped while a thread is parked in `acquire` on it.
    waiting_on_lock: AtomicUsize,
    /// Threads donating to this thread, most recent donation last.
    pub donors: Mutex<Vec<Tid>>,

    pub wake_tick: AtomicU64,

    pub parent: Mutex<Option<Tid>>,
    pub children: Mutex<Vec<Tid>>,
    pub exit_status: AtomicI32,

    /// Downed by the parent inside `process::fork` until the child has
    /// either finished duplicating its address space or reported failure.
    pub load_sema: Semaphore,
    /// Upped by this thread on exit; downed by a parent inside
    /// `process::wait`.
    pub wait_sema: Semaphore,

    pub spt: Mutex<SupplementalPageTable>,
    pub page_table_root: AtomicU64,
    pub fd_table: Mutex<FdTable>,
    pub user_stack_bottom: AtomicU64,
    pub saved_user_rsp: AtomicU64,

    pub ctx: Mutex<Context>,
    pub kstack: Stack,

    pub ticks_run: AtomicU64,
    magic: u64,
}

impl Thread {
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority.load(Ordering::Relaxed)
    }

    pub fn effective_priority(&self) -> u8 {
        self.effective_priority.load(Ordering::Relaxed)
    }

    pub fn set_base_priority(&self, p: u8) {
        self.base_priority.store(p, Ordering::Relaxed);
    }

    pub fn set_effective_priority(&self, p: u8) {
        self.effective_priority.store(p, Ordering::Relaxed);
    }

    pub fn waiting_on_lock_addr(&self) -> usize {
        self.waiting_on_lock.load(Ordering::Acquire)
    }

    pub fn set_waiting_on_lock_addr(&self, addr: usize) {
        self.waiting_on_lock.store(addr, Ordering::Release);
    }

    pub fn exit_status_value(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub fn assert_not_corrupted(&self) {
        assert_eq!(self.magic, STACK_MAGIC, "thread {} stack canary corrupted", self.tid);
    }

    /// Recomputes effective priority as max(base, highest current donor).
    /// Called after a donor set changes (donation or release-side pruning).
    pub fn refresh_effective_priority(&self) {
        let base = self.base_priority();
        let mut top = base;
        for tid in self.donors.lock().iter() {
            if let Some(donor) = get(*tid) {
                if donor.effective_priority() > top {
                    top = donor.effective_priority();
                }
            }
        }
        self.set_effective_priority(top);
    }
}

/// A kernel stack with a guard page conceptually below it (the actual
/// unmapping of a guard page is the memory subsystem's job; here the
/// stack is a boxed byte array carrying the thread header at its base,
/// matching the teacher's `sched::task::Stack` allocation shape).
pub struct Stack {
    pub base: NonNull<u8>,
    pub size: usize,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

const KERNEL_STACK_SIZE: usize = 16 * 1024;

fn alloc_kernel_stack() -> Stack {
    let mem = Box::leak(Box::new([0u8; KERNEL_STACK_SIZE]));
    Stack {
        base: NonNull::new(mem.as_mut_ptr()).expect("stack allocation"),
        size: KERNEL_STACK_SIZE,
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Option<HashMap<Tid, NonNull<Thread>>>> = Mutex::new(None);

fn registry() -> spin::MutexGuard<'static, Option<HashMap<Tid, NonNull<Thread>>>> {
    let mut guard = REGISTRY.lock();
    if guard.is_none() {
        *guard = Some(HashMap::new());
    }
    guard
}

/// Creates a new thread control block and registers it. Does not enqueue
/// it on any ready queue — callers (`sched::spawn`) do that after wiring
/// up the entry trampoline.
pub fn create(name: &'static str, base_priority: u8, parent: Option<Tid>) -> &'static Thread {
    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let thread = Box::leak(Box::new(Thread {
        tid,
        name,
        state: AtomicU8::new(ThreadState::Blocked as u8),
        base_priority: AtomicU8::new(base_priority),
        effective_priority: AtomicU8::new(base_priority),
        nice: AtomicI32::new(NICE_DEFAULT),
        recent_cpu: Mutex::new(Fixed::ZERO),
        waiting_on_lock: AtomicUsize::new(0),
        donors: Mutex::new(Vec::new()),
        wake_tick: AtomicU64::new(0),
        parent: Mutex::new(parent),
        children: Mutex::new(Vec::new()),
        exit_status: AtomicI32::new(0),
        load_sema: Semaphore::new(0),
        wait_sema: Semaphore::new(0),
        spt: Mutex::new(SupplementalPageTable::new()),
        page_table_root: AtomicU64::new(0),
        fd_table: Mutex::new(FdTable::new()),
        user_stack_bottom: AtomicU64::new(0),
        saved_user_rsp: AtomicU64::new(0),
        ctx: Mutex::new(Context::default()),
        kstack: alloc_kernel_stack(),
        ticks_run: AtomicU64::new(0),
        magic: STACK_MAGIC,
    }));
    if let Some(parent_tid) = parent {
        if let Some(p) = get(parent_tid) {
            p.children.lock().push(tid);
        }
    }
    registry()
        .as_mut()
        .unwrap()
        .insert(tid, NonNull::from(&*thread));
    thread
}

pub fn get(tid: Tid) -> Option<&'static Thread> {
    registry()
        .as_ref()
        .unwrap()
        .get(&tid)
        .map(|p| unsafe { p.as_ref() })
}

/// Removes and frees a thread's control block. Only safe once the thread
/// is fully DYING and no longer referenced by any queue, donor list, or
/// the scheduler's current-thread pointer.
pub fn destroy(tid: Tid) {
    crate::memory::virt::destroy_table(tid);
    if let Some(ptr) = registry().as_mut().unwrap().remove(&tid) {
        unsafe {
            let thread = Box::from_raw(ptr.as_ptr());
            let stack_ptr = thread.kstack.base.as_ptr() as *mut [u8; KERNEL_STACK_SIZE];
            drop(thread);
            let _ = Box::from_raw(stack_ptr);
        }
    }
}

pub fn all_tids() -> Vec<Tid> {
    registry().as_ref().unwrap().keys().copied().collect()
}
