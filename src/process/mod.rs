//! Process-level glue over the thread kernel and VM subsystem: the
//! file-descriptor table and `fork`/`exec`/`wait`.
//!
//! Grounded on `spec.md` §4.4 and the teacher's `sched::task::Task`
//! parent/child bookkeeping, reworked to use `vm::spt::copy` for the
//! fork duplication step and the scheduler's own thread registry instead
//! of a second process table.

use crate::error::{KernelError, KResult};
use crate::sched::{self, thread};
use crate::vm::file::FileId;
use alloc::vec::Vec;

pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;
const MAX_OPEN_FILES: usize = 128;

/// An open file's `FileId` and its per-fd seek cursor.
#[derive(Clone, Copy)]
struct OpenFile {
    file: FileId,
    pos: u64,
}

/// A thread's open-file table. Slots 0 and 1 are reserved for the
/// console/keyboard and never hold a real `FileId`.
pub struct FdTable {
    slots: Vec<Option<OpenFile>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable { slots: alloc::vec![None, None] }
    }

    /// Installs `file` at the smallest fd ≥ 2 and returns it.
    pub fn insert(&mut self, file: FileId) -> KResult<i32> {
        for (i, slot) in self.slots.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(OpenFile { file, pos: 0 });
                return Ok(i as i32);
            }
        }
        if self.slots.len() >= MAX_OPEN_FILES {
            return Err(KernelError::OutOfFileDescriptors);
        }
        self.slots.push(Some(OpenFile { file, pos: 0 }));
        Ok((self.slots.len() - 1) as i32)
    }

    pub fn get(&self, fd: i32) -> Option<FileId> {
        if fd < 2 {
            return None;
        }
        self.slots.get(fd as usize).copied().flatten().map(|o| o.file)
    }

    pub fn pos(&self, fd: i32) -> Option<u64> {
        if fd < 2 {
            return None;
        }
        self.slots.get(fd as usize).copied().flatten().map(|o| o.pos)
    }

    pub fn set_pos(&mut self, fd: i32, pos: u64) {
        if fd < 2 {
            return;
        }
        if let Some(Some(o)) = self.slots.get_mut(fd as usize) {
            o.pos = pos;
        }
    }

    /// Removes and returns the fd's file, if any held a real file (not a
    /// standard stream).
    pub fn remove(&mut self, fd: i32) -> Option<FileId> {
        if fd < 2 {
            return None;
        }
        self.slots.get_mut(fd as usize).and_then(|s| s.take()).map(|o| o.file)
    }

    /// Duplicates every open fd (used by `fork`); `FileId`s are shared,
    /// not re-opened, matching a `dup`-style fd table copy.
    pub fn fork_copy(&self) -> FdTable {
        FdTable { slots: self.slots.clone() }
    }
}

/// Creates a child thread that independently re-executes the parent's
/// current control flow, duplicates its fd table and address space, and
/// returns the child's tid to the parent (0 is returned to the child by
/// convention at the syscall boundary, not by this function).
///
/// `trampoline`/`trampoline_arg` is the entry point the child thread
/// starts at — the loader/syscall layer is responsible for arranging for
/// that entry point to resume the parent's user-mode register frame with
/// a zero return value, a detail this crate does not redesign (see
/// `spec.md` §1's loader/dispatcher non-goal).
pub fn fork(name: &'static str, trampoline: extern "C" fn(usize) -> !, trampoline_arg: usize) -> KResult<thread::Tid> {
    let parent_tid = sched::current_tid();
    let parent = thread::get(parent_tid).expect("fork called with no current thread");

    let child_tid = sched::spawn(name, parent.base_priority(), trampoline, trampoline_arg);
    let child = thread::get(child_tid).expect("just-spawned child missing from registry");

    {
        let parent_fds = parent.fd_table.lock();
        *child.fd_table.lock() = parent_fds.fork_copy();
    }

    let copy_result = {
        let parent_spt = parent.spt.lock();
        let mut child_spt = child.spt.lock();
        child_spt.copy(child_tid, &parent_spt)
    };

    match copy_result {
        Ok(()) => {
            child.load_sema.up();
            parent.load_sema.down();
            Ok(child_tid)
        }
        Err(_) => {
            child.load_sema.up();
            parent.load_sema.down();
            parent.children.lock().retain(|&c| c != child_tid);
            sched::abandon_child(child_tid);
            Err(KernelError::OutOfPhysicalFrames)
        }
    }
}

/// Replaces the current thread's address space: tears down its SPT and
/// hands back control for the loader to populate a fresh one. The ELF
/// parsing and argument push themselves are the loader's job (out of
/// scope per `spec.md` §1); this function only performs the concurrency
/// and VM side of `exec`'s contract.
pub fn exec_prepare() {
    let tid = sched::current_tid();
    let me = thread::get(tid).expect("exec called with no current thread");
    me.spt.lock().kill(tid);
}

/// Blocks until child `tid` exits, then reclaims its control block and
/// returns its exit status. Returns `Err` if `tid` is not one of the
/// caller's children (already waited on, or never a child).
pub fn wait(tid: thread::Tid) -> KResult<i32> {
    let me_tid = sched::current_tid();
    let me = thread::get(me_tid).expect("wait called with no current thread");

    let is_child = me.children.lock().iter().any(|&c| c == tid);
    if !is_child {
        return Err(KernelError::AddressNotMapped);
    }

    let child = thread::get(tid).expect("waited-on tid missing from registry");
    child.wait_sema.down();

    let status = child.exit_status_value();
    me.children.lock().retain(|&c| c != tid);
    thread::destroy(tid);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_table_reserves_stdio_and_reuses_smallest_free_slot() {
        let mut fds = FdTable::new();
        assert!(fds.get(0).is_none());
        assert!(fds.get(1).is_none());
        let a = fds.insert(10).unwrap();
        let b = fds.insert(11).unwrap();
        assert_eq!(a, 2);
        assert_eq!(b, 3);
        fds.remove(a);
        let c = fds.insert(12).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn seek_and_tell_track_a_per_fd_cursor() {
        let mut fds = FdTable::new();
        let fd = fds.insert(20).unwrap();
        assert_eq!(fds.pos(fd), Some(0));
        fds.set_pos(fd, 42);
        assert_eq!(fds.pos(fd), Some(42));
        fds.remove(fd);
        assert_eq!(fds.pos(fd), None);
    }

    #[test]
    fn stdio_fds_reject_seek_and_pos_queries() {
        let mut fds = FdTable::new();
        assert_eq!(fds.pos(STDIN_FD), None);
        assert_eq!(fds.pos(STDOUT_FD), None);
        fds.set_pos(STDIN_FD, 5);
        assert_eq!(fds.pos(STDIN_FD), None);
    }
}
