//! Syscall dispatch table (§6.1): register-based argument passing,
//! pointer/fd validation, and the halt/exit/fork/exec/wait/filesystem/
//! mmap family.
//!
//! Grounded on the teacher's `syscall` module shape (a single dispatch
//! function mapping a call number to a handler) and
//! `examples/original_source/userprog/syscall.c`'s validate-then-dispatch
//! structure, replacing the teacher's capability-token model (never
//! named by the spec) with the pointer/fd validation contract §6.1
//! actually specifies.

use crate::memory::layout::is_kernel_va;
use crate::memory::virt;
use crate::process;
use crate::sched::sync::Lock;
use crate::sched::{self, thread};
use crate::vm::file;

/// Serialises every syscall's access to the shared file-object/directory
/// tables, matching `examples/original_source/userprog/syscall.c`'s
/// `filesys_lock`: acquired around the actual file operation only, never
/// around the stdin/stdout fast paths or pointer validation (per
/// `SPEC_FULL.md` §5's "a process-wide lock is acquired around every
/// `read`/`write` issued by a system call").
static FS_LOCK: Lock = Lock::new();

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
pub enum Syscall {
    Halt = 0,
    Exit = 1,
    Fork = 2,
    Exec = 3,
    Wait = 4,
    Create = 5,
    Remove = 6,
    Open = 7,
    Filesize = 8,
    Read = 9,
    Write = 10,
    Seek = 11,
    Tell = 12,
    Close = 13,
    Mmap = 14,
    Munmap = 15,
}

impl Syscall {
    fn from_raw(v: u64) -> Option<Syscall> {
        use Syscall::*;
        match v {
            0 => Some(Halt),
            1 => Some(Exit),
            2 => Some(Fork),
            3 => Some(Exec),
            4 => Some(Wait),
            5 => Some(Create),
            6 => Some(Remove),
            7 => Some(Open),
            8 => Some(Filesize),
            9 => Some(Read),
            10 => Some(Write),
            11 => Some(Seek),
            12 => Some(Tell),
            13 => Some(Close),
            14 => Some(Mmap),
            15 => Some(Munmap),
            _ => None,
        }
    }
}

/// Entry point from the `syscall`/`int 0x80` trampoline: `rdi, rsi, rdx,
/// r10, r8` carry up to five arguments; the call number arrives
/// separately (the result register, per the teacher's convention, is
/// whatever this function returns). Returns `-1` cast to `u64` for every
/// user-visible failure named in the table, matching the ABI's "returns"
/// column.
pub fn dispatch(number: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> u64 {
    let Some(call) = Syscall::from_raw(number) else {
        crate::log::logger::log_warn("syscall", format_args!("unknown syscall number {}", number));
        sched::exit_current(-1);
    };
    crate::log::logger::log_dbg("syscall", format_args!("{:?}({:#x},{:#x},{:#x},{:#x},{:#x})", call, a0, a1, a2, a3, a4));

    match call {
        Syscall::Halt => sys_halt(),
        Syscall::Exit => sys_exit(a0 as i32),
        Syscall::Fork => sys_fork(a0),
        Syscall::Exec => sys_exec(a0),
        Syscall::Wait => sys_wait(a0),
        Syscall::Create => sys_create(a0, a1),
        Syscall::Remove => sys_remove(a0),
        Syscall::Open => sys_open(a0),
        Syscall::Filesize => sys_filesize(a0 as i32),
        Syscall::Read => sys_read(a0 as i32, a1, a2),
        Syscall::Write => sys_write(a0 as i32, a1, a2),
        Syscall::Seek => sys_seek(a0 as i32, a1),
        Syscall::Tell => sys_tell(a0 as i32),
        Syscall::Close => sys_close(a0 as i32),
        Syscall::Mmap => sys_mmap(a0, a1, a2 != 0, a3 as i32, a4),
        Syscall::Munmap => sys_munmap(a0),
    }
}

const FAIL: u64 = u64::MAX; // reinterpreted as -1 at the result register

/// Validates that `[va, va+len)` is entirely non-NULL, in user space,
/// and already resolves in the calling thread's page table (§6.1).
/// Kills the calling process on violation, matching "the process is
/// terminated with status −1".
fn check_user_range(tid: thread::Tid, va: u64, len: usize) -> bool {
    if va == 0 || is_kernel_va(va) || len == 0 {
        return false;
    }
    let Some(end) = va.checked_add(len as u64) else {
        return false;
    };
    if is_kernel_va(end - 1) {
        return false;
    }
    let first_page = crate::vm::page_round_down(va);
    let last_page = crate::vm::page_round_down(end - 1);
    let mut page = first_page;
    loop {
        if !virt::is_mapped(tid, page) {
            return false;
        }
        if page == last_page {
            break;
        }
        page += crate::vm::PAGE_SIZE as u64;
    }
    true
}

/// Validates a NUL-terminated path/cmdline pointer by scanning byte by
/// byte, copying at most `MAX_PATH` bytes out of user memory.
const MAX_PATH: usize = 256;

fn copy_user_cstr(tid: thread::Tid, va: u64) -> Option<alloc::vec::Vec<u8>> {
    if va == 0 || is_kernel_va(va) {
        return None;
    }
    let mut out = alloc::vec::Vec::new();
    let mut cur = va;
    for _ in 0..MAX_PATH {
        if !virt::is_mapped(tid, crate::vm::page_round_down(cur)) {
            return None;
        }
        let byte: u8 = unsafe { *(cur as *const u8) };
        if byte == 0 {
            return Some(out);
        }
        out.push(byte);
        cur += 1;
    }
    None
}

fn sys_halt() -> ! {
    crate::log::logger::log_info("syscall", format_args!("halt"));
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

fn sys_exit(status: i32) -> u64 {
    let tid = sched::current_tid();
    let name = thread::get(tid).map(|t| t.name).unwrap_or("?");
    crate::log::logger::log_info("syscall", format_args!("{}: exit({})", name, status));
    sched::exit_current(status);
}

fn sys_fork(a0: u64) -> u64 {
    let _ = a0; // name hint, cosmetic only
    match process::fork("user", user_fork_trampoline, 0) {
        Ok(tid) => tid,
        Err(_) => FAIL,
    }
}

extern "C" fn user_fork_trampoline(_arg: usize) -> ! {
    unreachable!("the loader installs the real child entry point; see spec.md §1's loader non-goal");
}

fn sys_exec(cmdline_va: u64) -> u64 {
    let tid = sched::current_tid();
    if copy_user_cstr(tid, cmdline_va).is_none() {
        sched::exit_current(-1);
    }
    process::exec_prepare();
    // The ELF loader that would populate the fresh address space and
    // never return on success is out of scope (spec.md §1); a kernel
    // whose exec reaches here without a loader has nothing left to run.
    sched::exit_current(-1);
}

fn sys_wait(tid_raw: u64) -> u64 {
    match process::wait(tid_raw as thread::Tid) {
        Ok(status) => status as i64 as u64,
        Err(_) => FAIL,
    }
}

fn sys_create(path_va: u64, size: u64) -> u64 {
    let tid = sched::current_tid();
    let Some(path) = copy_user_cstr(tid, path_va) else {
        sched::exit_current(-1);
    };
    FS_LOCK.acquire();
    let ok = file::create_named(&path, size);
    FS_LOCK.release();
    ok as u64
}

fn sys_remove(path_va: u64) -> u64 {
    let tid = sched::current_tid();
    let Some(path) = copy_user_cstr(tid, path_va) else {
        sched::exit_current(-1);
    };
    FS_LOCK.acquire();
    let ok = file::remove_named(&path);
    FS_LOCK.release();
    ok as u64
}

fn sys_open(path_va: u64) -> u64 {
    let tid = sched::current_tid();
    let Some(path) = copy_user_cstr(tid, path_va) else {
        sched::exit_current(-1);
    };
    FS_LOCK.acquire();
    let opened = file::open_named(&path);
    FS_LOCK.release();
    let Some(file_id) = opened else {
        return FAIL;
    };
    let me = thread::get(tid).unwrap();
    match me.fd_table.lock().insert(file_id) {
        Ok(fd) => fd as u64,
        Err(_) => FAIL,
    }
}

fn sys_filesize(fd: i32) -> u64 {
    let tid = sched::current_tid();
    let me = thread::get(tid).unwrap();
    let Some(file_id) = me.fd_table.lock().get(fd) else {
        return FAIL;
    };
    FS_LOCK.acquire();
    let size = file::filesize(file_id);
    FS_LOCK.release();
    size.unwrap_or(0)
}

fn sys_read(fd: i32, buf_va: u64, n: u64) -> u64 {
    let tid = sched::current_tid();
    if n > 0 && !check_user_range(tid, buf_va, n as usize) {
        sched::exit_current(-1);
    }
    if fd == process::STDIN_FD {
        let out = unsafe { core::slice::from_raw_parts_mut(buf_va as *mut u8, n as usize) };
        let mut i = 0;
        while i < out.len() {
            match crate::arch::x86_64::keyboard::poll_byte() {
                Some(b) => {
                    out[i] = b;
                    i += 1;
                }
                None => break,
            }
        }
        return i as u64;
    }
    let me = thread::get(tid).unwrap();
    let Some(file_id) = me.fd_table.lock().get(fd) else {
        return FAIL;
    };
    let Some(obj) = file::get(file_id) else {
        return FAIL;
    };
    let pos = me.fd_table.lock().pos(fd).unwrap_or(0);
    let out = unsafe { core::slice::from_raw_parts_mut(buf_va as *mut u8, n as usize) };
    FS_LOCK.acquire();
    let read = obj.read_at(pos, out);
    FS_LOCK.release();
    me.fd_table.lock().set_pos(fd, pos + read as u64);
    read as u64
}

fn sys_write(fd: i32, buf_va: u64, n: u64) -> u64 {
    let tid = sched::current_tid();
    if n > 0 && !check_user_range(tid, buf_va, n as usize) {
        sched::exit_current(-1);
    }
    let data = unsafe { core::slice::from_raw_parts(buf_va as *const u8, n as usize) };
    if fd == process::STDOUT_FD {
        if let Ok(s) = core::str::from_utf8(data) {
            crate::arch::x86_64::vga::print(s);
        }
        return n;
    }
    let me = thread::get(tid).unwrap();
    let Some(file_id) = me.fd_table.lock().get(fd) else {
        return FAIL;
    };
    let Some(obj) = file::get(file_id) else {
        return FAIL;
    };
    let pos = me.fd_table.lock().pos(fd).unwrap_or(0);
    FS_LOCK.acquire();
    let written = obj.write_at(pos, data);
    FS_LOCK.release();
    me.fd_table.lock().set_pos(fd, pos + written as u64);
    written as u64
}

fn sys_seek(fd: i32, pos: u64) -> u64 {
    let tid = sched::current_tid();
    let me = thread::get(tid).unwrap();
    me.fd_table.lock().set_pos(fd, pos);
    0
}

fn sys_tell(fd: i32) -> u64 {
    let tid = sched::current_tid();
    let me = thread::get(tid).unwrap();
    me.fd_table.lock().pos(fd).unwrap_or(0)
}

fn sys_close(fd: i32) -> u64 {
    let tid = sched::current_tid();
    let me = thread::get(tid).unwrap();
    if let Some(file_id) = me.fd_table.lock().remove(fd) {
        FS_LOCK.acquire();
        file::close(file_id);
        FS_LOCK.release();
    }
    0
}

fn sys_mmap(addr: u64, len: u64, writable: bool, fd: i32, offset: u64) -> u64 {
    let tid = sched::current_tid();
    let me = thread::get(tid).unwrap();
    let Some(file_id) = me.fd_table.lock().get(fd) else {
        return 0;
    };
    let mut spt = me.spt.lock();
    crate::vm::spt::mmap(tid, &mut spt, addr, len as usize, writable, file_id, offset).unwrap_or(0)
}

fn sys_munmap(addr: u64) -> u64 {
    let tid = sched::current_tid();
    let me = thread::get(tid).unwrap();
    crate::vm::spt::munmap(tid, &mut me.spt.lock(), addr);
    0
}
