//! Frame table and clock-algorithm eviction.
//!
//! Grounded on `examples/original_source/vm/vm.c`: a single global list of
//! resident frames (`frame_list`), `vm_get_victim` sweeping it for an
//! unaccessed page (clearing the accessed bit as it passes), and
//! `vm_evict_frame`/`vm_get_frame` wrapping swap-out and allocation.

use crate::error::{KernelError, KResult};
use crate::memory::phys;
use crate::memory::virt;
use crate::sched::thread::{self, Tid};
use crate::vm::anon;
use crate::vm::page::PageVariant;
use alloc::vec::Vec;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

struct FrameRecord {
    kva: u64,
    owner_tid: Tid,
    owner_va: u64,
}

static FRAMES: Mutex<Vec<FrameRecord>> = Mutex::new(Vec::new());
static CLOCK_HAND: Mutex<usize> = Mutex::new(0);

pub fn kva_of(id: FrameId) -> u64 {
    FRAMES.lock()[id.0].kva
}

/// Allocates a physical frame from the user pool, evicting a resident
/// page if the pool is exhausted. Registers the new frame under
/// `(owner_tid, owner_va)` so a later eviction sweep can find its
/// descriptor.
pub fn get_frame(owner_tid: Tid, owner_va: u64) -> KResult<FrameId> {
    match phys::alloc_user_frame() {
        Some(kva) => Ok(push_frame(kva, owner_tid, owner_va)),
        None => {
            evict_one()?;
            match phys::alloc_user_frame() {
                Some(kva) => Ok(push_frame(kva, owner_tid, owner_va)),
                None => Err(KernelError::OutOfPhysicalFrames),
            }
        }
    }
}

fn push_frame(kva: u64, owner_tid: Tid, owner_va: u64) -> FrameId {
    let mut frames = FRAMES.lock();
    frames.push(FrameRecord { kva, owner_tid, owner_va });
    FrameId(frames.len() - 1)
}

/// Releases a frame without writing its contents anywhere (used when the
/// owning descriptor is being torn down outright, e.g. on process exit).
pub fn free_frame(id: FrameId) {
    let mut frames = FRAMES.lock();
    if id.0 >= frames.len() {
        return;
    }
    let kva = frames[id.0].kva;
    frames.swap_remove(id.0);
    // swap_remove moved the last element into `id.0`; nothing else
    // references frames by index across calls, so this is safe here.
    phys::free_user_frame(kva);
}

/// Clock sweep: returns the index of a frame whose backing page has not
/// been accessed since the last pass, clearing the accessed bit of every
/// frame it skips. At most two full laps.
fn select_victim() -> Option<usize> {
    let len = FRAMES.lock().len();
    if len == 0 {
        return None;
    }
    let mut hand = CLOCK_HAND.lock();
    for _ in 0..(2 * len) {
        let idx = *hand % len;
        *hand = (idx + 1) % len;
        let (owner_tid, owner_va) = {
            let frames = FRAMES.lock();
            (frames[idx].owner_tid, frames[idx].owner_va)
        };
        let accessed = virt::is_accessed(owner_tid, owner_va);
        if accessed {
            virt::clear_accessed(owner_tid, owner_va);
            continue;
        }
        return Some(idx);
    }
    Some(*hand % len)
}

fn evict_one() -> KResult<()> {
    let idx = select_victim().ok_or(KernelError::OutOfPhysicalFrames)?;
    let (owner_tid, owner_va, kva) = {
        let frames = FRAMES.lock();
        (frames[idx].owner_tid, frames[idx].owner_va, frames[idx].kva)
    };
    let Some(owner) = thread::get(owner_tid) else {
        // Owning thread is gone; reclaim the frame outright.
        FRAMES.lock().swap_remove(idx);
        phys::free_user_frame(kva);
        return Ok(());
    };
    let mut spt = owner.spt.lock();
    let Some(desc) = spt.find_mut(owner_va) else {
        FRAMES.lock().swap_remove(idx);
        phys::free_user_frame(kva);
        return Ok(());
    };
    match &mut desc.variant {
        PageVariant::Anon(state) => {
            let slot = anon::swap_out(kva)?;
            state.swap_index = Some(slot);
        }
        PageVariant::File(backing) => {
            if backing.dirty {
                crate::vm::file::write_back(backing, kva);
                backing.dirty = false;
            }
        }
        PageVariant::Uninit(_) => {}
    }
    virt::unmap_user_page(owner_tid, owner_va);
    desc.frame = None;
    FRAMES.lock().swap_remove(idx);
    phys::free_user_frame(kva);
    Ok(())
}

pub fn frame_count() -> usize {
    FRAMES.lock().len()
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use crate::vm::anon::{self, MemSwapDisk, SECTORS_PER_PAGE};
    use crate::vm::page::{AnonState, PageDescriptor, PageOrigin, PageVariant};
    use crate::vm::PAGE_SIZE;
    use alloc::boxed::Box;

    /// Scenario 5 (demand paging + eviction, §8): touching more resident
    /// pages than available frames must evict the oldest ones to swap;
    /// faulting them back in must read the original bytes, and the swap
    /// bitmap must return to its starting population once everyone is
    /// resident again. `virt::map_user_page`'s real hardware page tables
    /// are out of reach on a host test target, so each "frame" here is a
    /// plain boxed page standing in for the physical frame a real build
    /// draws from `memory::phys`, registered directly with the frame
    /// table instead of through `get_frame`.
    #[test]
    fn eviction_round_trips_original_bytes_and_drains_swap() {
        anon::init(Box::new(MemSwapDisk::new(SECTORS_PER_PAGE * 4)));
        let owner = thread::create("scenario-evict", 31, None);

        let mut pages: Vec<Box<[u8; PAGE_SIZE]>> = Vec::new();
        let mut vas = Vec::new();
        for i in 0..3u64 {
            let mut buf = Box::new([0u8; PAGE_SIZE]);
            for b in buf.iter_mut() {
                *b = i as u8 + 1;
            }
            let kva = buf.as_mut_ptr() as u64;
            let va = 0x4000_0000 + i * PAGE_SIZE as u64;
            let frame_id = push_frame(kva, owner.tid, va);
            owner.spt.lock().insert(PageDescriptor {
                va,
                writable: true,
                origin: PageOrigin::Normal,
                frame: Some(frame_id),
                variant: PageVariant::Anon(AnonState::default()),
            });
            pages.push(buf);
            vas.push(va);
        }
        assert_eq!(frame_count(), 3);

        // 1.5x pressure: evict two of the three.
        evict_one().unwrap();
        evict_one().unwrap();
        assert_eq!(frame_count(), 1, "two of three pages must have been evicted to swap");
        assert_eq!(anon::slots_in_use(), 2);

        let mut restored = 0;
        for va in &vas {
            let Some(desc) = owner.spt.lock().find(*va).cloned() else { continue };
            let PageVariant::Anon(state) = desc.variant else { continue };
            let Some(slot) = state.swap_index else { continue };
            let mut back = Box::new([0u8; PAGE_SIZE]);
            anon::swap_in(slot, back.as_mut_ptr() as u64).unwrap();
            let expected = ((*va - 0x4000_0000) / PAGE_SIZE as u64) as u8 + 1;
            assert!(back.iter().all(|&b| b == expected), "swapped-in page must match its original bytes");
            restored += 1;
        }
        assert_eq!(restored, 2, "exactly the two evicted pages must have been found on swap");
        assert_eq!(anon::slots_in_use(), 0, "swap bitmap must return to its original population");
    }
}
