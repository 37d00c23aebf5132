//! Per-process page tables: map/unmap a single user page and read/clear
//! the hardware accessed bit the clock algorithm depends on.
//!
//! Grounded on the teacher's `memory/virt.rs` (the L4/L3/L2/L1 walking
//! helpers, `table_mut` via the physical-memory offset, the self-ref-free
//! direct-map style of address translation) and `memory/paging.rs`
//! (`active_level_4_table`). Reworked from one shared kernel page table
//! into one page table per thread, because the frame table's clock sweep
//! (`vm::frame::select_victim`) must read the accessed bit of whichever
//! thread owns a frame, not only the currently running one — which
//! requires every thread's page table to be walkable without switching
//! CR3 into it, hence indexing every table through the direct physical
//! map rather than only the active one.

use crate::error::{KernelError, KResult};
use crate::memory::layout::{kva_to_phys, phys_to_kva, PAGE_SIZE};
use crate::memory::phys;
use crate::sched::thread::Tid;
use hashbrown::HashMap;
use spin::Mutex;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags as Ptf, PhysFrame};
use x86_64::PhysAddr;

/// Index a canonical 48-bit VA into its four page-table levels.
#[inline]
fn l4_idx(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}
#[inline]
fn l3_idx(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}
#[inline]
fn l2_idx(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}
#[inline]
fn l1_idx(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

unsafe fn table_at(pa: u64) -> &'static mut PageTable {
    &mut *(phys_to_kva(pa) as *mut PageTable)
}

/// Physical address of the PML4 the bootloader handed control to.
/// Every process's own PML4 copies its upper half (canonical indices
/// 256..512) from this template, since that is where the direct
/// physical map and the kernel image itself live.
static KERNEL_TEMPLATE_PML4: Mutex<Option<u64>> = Mutex::new(None);

/// Tid -> physical address of that thread's PML4. Populated lazily on
/// first `map_user_page`.
static PROCESS_TABLES: Mutex<Option<HashMap<Tid, u64>>> = Mutex::new(None);

fn process_tables() -> spin::MutexGuard<'static, Option<HashMap<Tid, u64>>> {
    let mut guard = PROCESS_TABLES.lock();
    if guard.is_none() {
        *guard = Some(HashMap::new());
    }
    guard
}

/// Records the bootloader's root table as the kernel-half template.
/// Called once from `memory::init_from_bootinfo`.
pub fn init() {
    let (frame, _) = Cr3::read();
    *KERNEL_TEMPLATE_PML4.lock() = Some(frame.start_address().as_u64());
}

/// Returns `tid`'s PML4 physical address, allocating and seeding a fresh
/// one with the kernel half on first use.
fn ensure_table(tid: Tid) -> KResult<u64> {
    if let Some(&pa) = process_tables().as_ref().unwrap().get(&tid) {
        return Ok(pa);
    }
    let kva = phys::alloc_kernel_frame().ok_or(KernelError::OutOfPhysicalFrames)?;
    unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
    let pa = kva_to_phys(kva);

    let template_pa = KERNEL_TEMPLATE_PML4.lock().ok_or(KernelError::BadBootInfo)?;
    let template = unsafe { table_at(template_pa) };
    let table = unsafe { table_at(pa) };
    for i in 256..512 {
        table[i] = template[i].clone();
    }

    process_tables().as_mut().unwrap().insert(tid, pa);
    if let Some(t) = crate::sched::thread::get(tid) {
        t.page_table_root.store(pa, core::sync::atomic::Ordering::Release);
    }
    Ok(pa)
}

/// Walks (creating intermediate tables as needed) to the L1 entry for
/// `va` in `tid`'s page table.
fn walk_create(tid: Tid, va: u64) -> KResult<(&'static mut PageTable, usize)> {
    let pml4_pa = ensure_table(tid)?;
    let l4 = unsafe { table_at(pml4_pa) };

    let l3_pa = next_level(l4, l4_idx(va))?;
    let l3 = unsafe { table_at(l3_pa) };
    let l2_pa = next_level(l3, l3_idx(va))?;
    let l2 = unsafe { table_at(l2_pa) };
    let l1_pa = next_level(l2, l2_idx(va))?;
    let l1 = unsafe { table_at(l1_pa) };
    Ok((l1, l1_idx(va)))
}

/// Returns the physical address of the child table at `table[idx]`,
/// allocating and zeroing a fresh one if the entry is unused.
fn next_level(table: &mut PageTable, idx: usize) -> KResult<u64> {
    if table[idx].is_unused() {
        let kva = phys::alloc_kernel_frame().ok_or(KernelError::OutOfPhysicalFrames)?;
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
        let pa = kva_to_phys(kva);
        table[idx].set_addr(
            PhysAddr::new(pa),
            Ptf::PRESENT | Ptf::WRITABLE | Ptf::USER_ACCESSIBLE,
        );
        Ok(pa)
    } else {
        Ok(table[idx].addr().as_u64())
    }
}

/// Walks without creating; returns `None` if any level is absent.
fn walk_existing(tid: Tid, va: u64) -> Option<(&'static mut PageTable, usize)> {
    let pml4_pa = *process_tables().as_ref().unwrap().get(&tid)?;
    unsafe {
        let l4 = table_at(pml4_pa);
        if l4[l4_idx(va)].is_unused() {
            return None;
        }
        let l3 = table_at(l4[l4_idx(va)].addr().as_u64());
        if l3[l3_idx(va)].is_unused() {
            return None;
        }
        let l2 = table_at(l3[l3_idx(va)].addr().as_u64());
        if l2[l2_idx(va)].is_unused() {
            return None;
        }
        let l1 = table_at(l2[l2_idx(va)].addr().as_u64());
        if l1[l1_idx(va)].is_unused() {
            return None;
        }
        Some((l1, l1_idx(va)))
    }
}

/// Installs a present mapping for `va` in `tid`'s address space pointing
/// at the physical page backing `kva`.
pub fn map_user_page(tid: Tid, va: u64, kva: u64, writable: bool) -> KResult<()> {
    let (l1, i1) = walk_create(tid, va)?;
    if !l1[i1].is_unused() {
        return Err(KernelError::AddressAlreadyMapped);
    }
    let mut flags = Ptf::PRESENT | Ptf::USER_ACCESSIBLE | Ptf::NO_EXECUTE;
    if writable {
        flags |= Ptf::WRITABLE;
    }
    l1[i1].set_addr(PhysAddr::new(kva_to_phys(kva)), flags);
    invalidate(tid, va);
    Ok(())
}

/// Clears the hardware mapping for `va`, if any.
pub fn unmap_user_page(tid: Tid, va: u64) {
    if let Some((l1, i1)) = walk_existing(tid, va) {
        l1[i1].set_unused();
        invalidate(tid, va);
    }
}

/// True if `va` currently has a present hardware mapping in `tid`'s page
/// table. Used by the syscall dispatcher's pointer-validation contract
/// (§6.1), which requires an already-resolvable mapping rather than
/// merely an SPT descriptor that would page it in lazily.
pub fn is_mapped(tid: Tid, va: u64) -> bool {
    walk_existing(tid, va).is_some()
}

pub fn is_accessed(tid: Tid, va: u64) -> bool {
    walk_existing(tid, va)
        .map(|(l1, i1)| l1[i1].flags().contains(Ptf::ACCESSED))
        .unwrap_or(false)
}

pub fn clear_accessed(tid: Tid, va: u64) {
    if let Some((l1, i1)) = walk_existing(tid, va) {
        let addr = l1[i1].addr();
        let flags = l1[i1].flags() & !Ptf::ACCESSED;
        l1[i1].set_addr(addr, flags);
        invalidate(tid, va);
    }
}

fn invalidate(tid: Tid, va: u64) {
    if tid == crate::sched::current_tid() {
        unsafe { core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags)) };
    }
}

/// Installs `tid`'s page table as the active one. The out-of-scope
/// context-switch primitive calls this as part of transferring control;
/// a thread with no page table yet (kernel-only threads, including
/// idle) keeps whatever CR3 is already loaded.
pub fn activate(tid: Tid) {
    if let Some(&pa) = process_tables().as_ref().unwrap().get(&tid) {
        let frame = PhysFrame::containing_address(PhysAddr::new(pa));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

/// Drops a thread's page table record (the intermediate/leaf frames
/// themselves are released as their descriptors are torn down by
/// `SupplementalPageTable::kill`; this only frees the PML4 itself).
pub fn destroy_table(tid: Tid) {
    if let Some(pa) = process_tables().as_mut().unwrap().remove(&tid) {
        phys::free_kernel_frame(phys_to_kva(pa));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_helpers_split_a_canonical_address() {
        let va = 0x0000_1234_5678_9000u64;
        assert!(l4_idx(va) < 512);
        assert!(l3_idx(va) < 512);
        assert!(l2_idx(va) < 512);
        assert!(l1_idx(va) < 512);
    }
}
