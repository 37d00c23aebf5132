//! Supplemental page table: per-thread map from user virtual address to
//! page descriptor, plus the fault-claim glue that ties it to the frame
//! table and the anon/file backings.
//!
//! Grounded on `examples/original_source/vm/vm.c`: `spt_find_page`,
//! `spt_insert_page`, `spt_remove_page`, `vm_alloc_page_with_initializer`,
//! `supplemental_page_table_copy`, `supplemental_page_table_kill`.

use crate::error::{KernelError, KResult};
use crate::memory::virt;
use crate::sched::thread::Tid;
use crate::vm::file::{self, FileId};
use crate::vm::frame::{self, FrameId};
use crate::vm::page::{
    Aux, FileBacking, PageDescriptor, PageKind, PageOrigin, PageVariant, UninitState,
};
use crate::vm::{page_round_down, PAGE_SIZE};
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Per-thread supplemental page table. Owns every descriptor for that
/// thread's user address space; frames are borrowed through `FrameId`.
pub struct SupplementalPageTable {
    pages: HashMap<u64, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        SupplementalPageTable { pages: HashMap::new() }
    }

    pub fn find(&self, va: u64) -> Option<&PageDescriptor> {
        self.pages.get(&page_round_down(va))
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&page_round_down(va))
    }

    /// Inserts a descriptor; fails if its VA already has one.
    pub fn insert(&mut self, desc: PageDescriptor) -> bool {
        let va = page_round_down(desc.va);
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, desc);
        true
    }

    /// Tears down the hardware mapping (if any) and drops the descriptor.
    pub fn remove(&mut self, tid: Tid, va: u64) {
        let va = page_round_down(va);
        if let Some(desc) = self.pages.remove(&va) {
            if let Some(frame_id) = desc.frame {
                virt::unmap_user_page(tid, va);
                frame::free_frame(frame_id);
            }
        }
    }

    /// Registers a lazily-initialized page. `target` names what it will
    /// become on first touch; `aux` carries the initializer's payload.
    pub fn alloc_with_initializer(
        &mut self,
        va: u64,
        writable: bool,
        target: PageKind,
        aux: Aux,
        origin: PageOrigin,
    ) -> bool {
        self.insert(PageDescriptor::new_uninit(
            page_round_down(va),
            writable,
            target,
            aux,
            origin,
        ))
    }

    /// Duplicates every descriptor of `src` into `self` for a fork child:
    /// UNINIT pages are re-registered with the same lazy initializer so
    /// the child loads independently; resident pages get a fresh frame
    /// with the parent's bytes copied in immediately.
    pub fn copy(&mut self, child_tid: Tid, src: &SupplementalPageTable) -> KResult<()> {
        for desc in src.pages.values() {
            match &desc.variant {
                PageVariant::Uninit(UninitState { target, aux }) => {
                    self.alloc_with_initializer(desc.va, desc.writable, *target, *aux, desc.origin);
                }
                PageVariant::Anon(_) | PageVariant::File(_) => {
                    let new_frame = frame::get_frame(child_tid, desc.va)?;
                    if desc.is_resident() {
                        if let Some(src_frame) = desc.frame {
                            let src_kva = frame::kva_of(src_frame);
                            let dst_kva = frame::kva_of(new_frame);
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    src_kva as *const u8,
                                    dst_kva as *mut u8,
                                    PAGE_SIZE,
                                );
                            }
                        }
                    }
                    virt::map_user_page(child_tid, desc.va, frame::kva_of(new_frame), desc.writable)?;
                    let mut cloned = desc.clone();
                    cloned.frame = Some(new_frame);
                    self.insert(cloned);
                }
            }
        }
        Ok(())
    }

    /// Tears down every descriptor, writing back dirty file-backed pages
    /// exactly as `munmap` would. Called on process exit.
    pub fn kill(&mut self, tid: Tid) {
        let vas: Vec<u64> = self.pages.keys().copied().collect();
        for va in vas {
            if let Some(desc) = self.pages.get(&va) {
                if let (true, PageVariant::File(backing)) = (desc.is_resident(), &desc.variant) {
                    if backing.dirty {
                        if let Some(frame_id) = desc.frame {
                            file::write_back(backing, frame::kva_of(frame_id));
                        }
                    }
                }
            }
            self.remove(tid, va);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.values()
    }
}

/// Materialises a physical page for `desc`'s descriptor and installs its
/// hardware mapping. Called from the page-fault handler once a
/// descriptor has been found (or synthesised by the stack-growth rule).
pub fn claim(tid: Tid, spt: &mut SupplementalPageTable, va: u64) -> KResult<()> {
    let va = page_round_down(va);
    let writable = spt.find(va).ok_or(KernelError::AddressNotMapped)?.writable;

    let frame_id = frame::get_frame(tid, va)?;
    {
        let desc = spt.find_mut(va).ok_or(KernelError::AddressNotMapped)?;
        desc.frame = Some(frame_id);
    }

    let kva = frame::kva_of(frame_id);
    if let Err(e) = virt::map_user_page(tid, va, kva, writable) {
        frame::free_frame(frame_id);
        if let Some(desc) = spt.find_mut(va) {
            desc.frame = None;
        }
        return Err(e);
    }

    swap_in(spt, va, kva)
}

/// Populates a freshly claimed frame's contents: runs the lazy
/// initializer for an UNINIT page, re-reads a swapped-out ANON page, or
/// re-reads a FILE page from its backing file.
fn swap_in(spt: &mut SupplementalPageTable, va: u64, kva: u64) -> KResult<()> {
    let desc = spt.find_mut(va).ok_or(KernelError::AddressNotMapped)?;
    match desc.variant.clone() {
        PageVariant::Uninit(UninitState { target, aux }) => match target {
            PageKind::Anon => {
                zero_page(kva);
                desc.variant = PageVariant::Anon(Default::default());
            }
            PageKind::File => match aux {
                Aux::File(backing) => {
                    file::load(&backing, kva)?;
                    desc.variant = PageVariant::File(backing);
                }
                Aux::None => return Err(KernelError::AddressNotMapped),
            },
        },
        PageVariant::Anon(state) => {
            if let Some(slot) = state.swap_index {
                crate::vm::anon::swap_in(slot, kva)?;
                if let PageVariant::Anon(s) = &mut desc.variant {
                    s.swap_index = None;
                }
            }
        }
        PageVariant::File(backing) => {
            file::load(&backing, kva)?;
        }
    }
    Ok(())
}

fn zero_page(kva: u64) {
    unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
}

/// Registers one `mmap`'d file's worth of UNINIT descriptors and returns
/// the requested base address on success.
pub fn mmap(
    tid: Tid,
    spt: &mut SupplementalPageTable,
    addr: u64,
    length: usize,
    writable: bool,
    file_id: FileId,
    offset: u64,
) -> KResult<u64> {
    let page_count = (length + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..page_count {
        if spt.find(addr + (i * PAGE_SIZE) as u64).is_some() {
            return Err(KernelError::AddressAlreadyMapped);
        }
    }
    let descs = file::mmap_descriptors(tid, addr, length, writable, file_id, offset)?;
    for desc in descs {
        if !spt.insert(desc) {
            return Err(KernelError::AddressAlreadyMapped);
        }
    }
    Ok(addr)
}

/// Tears down an `mmap` region starting at `addr`: walks pages while the
/// SPT keeps resolving them, writing back dirty file contents.
pub fn munmap(tid: Tid, spt: &mut SupplementalPageTable, addr: u64) {
    let mut va = page_round_down(addr);
    loop {
        let Some(desc) = spt.find(va) else { break };
        if !matches!(desc.variant, PageVariant::File(_) | PageVariant::Uninit(UninitState { target: PageKind::File, .. }))
        {
            break;
        }
        if let (true, PageVariant::File(backing)) = (desc.is_resident(), &desc.variant) {
            if let Some(frame_id) = desc.frame {
                file::write_back(backing, frame::kva_of(frame_id));
            }
        }
        spt.remove(tid, va);
        va += PAGE_SIZE as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicate_va() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.alloc_with_initializer(0x1000, true, PageKind::Anon, Aux::None, PageOrigin::Normal));
        assert!(!spt.alloc_with_initializer(0x1000, true, PageKind::Anon, Aux::None, PageOrigin::Normal));
    }

    #[test]
    fn find_rounds_to_page_boundary() {
        let mut spt = SupplementalPageTable::new();
        spt.alloc_with_initializer(0x2000, true, PageKind::Anon, Aux::None, PageOrigin::Normal);
        assert!(spt.find(0x2123).is_some());
        assert!(spt.find(0x3000).is_none());
    }
}
