//! File-backed demand paging and `mmap`/`munmap`.
//!
//! Grounded on `examples/original_source/vm/file.c`: `file_backed_swap_in`
//! (read from `file` at `offset`, zero-fill the remainder) and
//! `file_backed_swap_out`/`do_munmap`'s dirty check before write-back
//! (`FileBacking.dirty`, set by `memory::fault::handle_page_fault` on a
//! write fault and consumed by `vm::frame`'s eviction and `vm::spt::kill`/
//! `munmap`), plus the fault/claim shape of `vm/vm.c` and the vtable
//! symmetry of `anon.rs`'s swap-in/out pair.

use crate::error::{KernelError, KResult};
use crate::sched::thread::Tid;
use crate::vm::page::{Aux, FileBacking, PageDescriptor, PageKind, PageOrigin, PageVariant, UninitState};
use crate::vm::PAGE_SIZE;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

pub type FileId = usize;

/// Byte-addressable file object. The filesystem implementation behind it
/// is out of scope; only this contract is specified.
pub trait FileObject: Send + Sync {
    fn len(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;
    fn write_at(&self, offset: u64, buf: &[u8]) -> usize;
}

/// A simple in-memory file used by boot self-tests and host unit tests.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(initial: Vec<u8>) -> MemFile {
        MemFile { data: Mutex::new(initial) }
    }
}

impl FileObject for MemFile {
    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

static NEXT_FILE_ID: Mutex<FileId> = Mutex::new(1);
static OPEN_FILES: Mutex<Option<HashMap<FileId, Arc<dyn FileObject>>>> = Mutex::new(None);
static DIRECTORY: Mutex<Option<HashMap<Vec<u8>, Arc<dyn FileObject>>>> = Mutex::new(None);

fn files() -> spin::MutexGuard<'static, Option<HashMap<FileId, Arc<dyn FileObject>>>> {
    let mut guard = OPEN_FILES.lock();
    if guard.is_none() {
        *guard = Some(HashMap::new());
    }
    guard
}

fn directory() -> spin::MutexGuard<'static, Option<HashMap<Vec<u8>, Arc<dyn FileObject>>>> {
    let mut guard = DIRECTORY.lock();
    if guard.is_none() {
        *guard = Some(HashMap::new());
    }
    guard
}

/// `create(path, size)` (§6.1): registers a zero-filled in-memory file
/// under `path`. No on-disk filesystem format is specified; this is the
/// in-memory `FileObject` table the spec names as the filesystem's
/// replacement.
pub fn create_named(path: &[u8], size: u64) -> bool {
    let mut dir = directory();
    let dir = dir.as_mut().unwrap();
    if dir.contains_key(path) {
        return false;
    }
    dir.insert(path.to_vec(), Arc::new(MemFile::new(alloc::vec![0u8; size as usize])));
    true
}

pub fn remove_named(path: &[u8]) -> bool {
    directory().as_mut().unwrap().remove(path).is_some()
}

/// `open(path)` (§6.1): hands back a fresh, independent `FileId` for the
/// named file's shared backing, matching "re-open the file" semantics.
pub fn open_named(path: &[u8]) -> Option<FileId> {
    let obj = directory().as_ref().unwrap().get(path).cloned()?;
    Some(register(obj))
}

pub fn filesize(id: FileId) -> Option<u64> {
    get(id).map(|f| f.len())
}

/// Registers a file object and returns a fresh, independent handle to
/// it, mirroring "re-open the file" for an `mmap`'s own seek/close
/// lifecycle.
pub fn register(obj: Arc<dyn FileObject>) -> FileId {
    let id = {
        let mut n = NEXT_FILE_ID.lock();
        let id = *n;
        *n += 1;
        id
    };
    files().as_mut().unwrap().insert(id, obj);
    id
}

pub fn get(id: FileId) -> Option<Arc<dyn FileObject>> {
    files().as_ref().unwrap().get(&id).cloned()
}

pub fn close(id: FileId) {
    files().as_mut().unwrap().remove(&id);
}

/// Loads a file-backed page's contents into `kva`: reads `read_bytes`
/// from the file at `offset`, zero-fills the remainder of the page.
pub fn load(backing: &FileBacking, kva: u64) -> KResult<()> {
    let file = get(backing.file).ok_or(KernelError::AddressNotMapped)?;
    let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };
    let n = file.read_at(backing.offset, &mut buf[..backing.read_bytes as usize]);
    for b in &mut buf[n..] {
        *b = 0;
    }
    Ok(())
}

/// Writes the dirty portion of a resident file-backed page back to its
/// file. Called by eviction and by `munmap`.
pub fn write_back(backing: &FileBacking, kva: u64) {
    if let Some(file) = get(backing.file) {
        let buf = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE) };
        file.write_at(backing.offset, &buf[..backing.read_bytes as usize]);
    }
}

/// Registers one `Uninit` descriptor per page spanning `length` bytes of
/// `file` starting at `offset`, mapped starting at `addr`. Returns the
/// number of pages registered.
pub fn mmap_descriptors(
    thread: Tid,
    addr: u64,
    length: usize,
    writable: bool,
    file: FileId,
    offset: u64,
) -> KResult<Vec<PageDescriptor>> {
    if addr % PAGE_SIZE as u64 != 0 || offset % PAGE_SIZE as u64 != 0 || length == 0 {
        return Err(KernelError::Misaligned);
    }
    let file_obj = get(file).ok_or(KernelError::AddressNotMapped)?;
    let file_len = file_obj.len();
    let page_count = (length + PAGE_SIZE - 1) / PAGE_SIZE;
    let mut out = Vec::with_capacity(page_count);
    for i in 0..page_count {
        let page_va = addr + (i * PAGE_SIZE) as u64;
        let page_off = offset + (i * PAGE_SIZE) as u64;
        let remaining_in_file = file_len.saturating_sub(page_off);
        let read_bytes = remaining_in_file.min(PAGE_SIZE as u64) as u32;
        let backing = FileBacking {
            file,
            offset: page_off,
            read_bytes,
            dirty: false,
        };
        out.push(PageDescriptor::new_uninit(
            page_va,
            writable,
            PageKind::File,
            Aux::File(backing),
            PageOrigin::Normal,
        ));
    }
    let _ = thread;
    Ok(out)
}

/// Runs the lazy initializer for a page whose target is `File`: loads
/// its contents and transitions the descriptor's variant.
pub fn initialize(desc: &mut PageDescriptor, kva: u64) -> KResult<()> {
    let backing = match desc.variant {
        PageVariant::Uninit(UninitState { aux: Aux::File(b), .. }) => b,
        _ => return Err(KernelError::AddressNotMapped),
    };
    load(&backing, kva)?;
    desc.variant = PageVariant::File(backing);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_named_rejects_duplicate_path_and_remove_allows_recreate() {
        assert!(create_named(b"/a.txt", 16));
        assert!(!create_named(b"/a.txt", 32));
        assert!(remove_named(b"/a.txt"));
        assert!(create_named(b"/a.txt", 32));
        assert!(remove_named(b"/a.txt"));
        assert!(!remove_named(b"/a.txt"));
    }

    #[test]
    fn open_named_hands_back_independent_fresh_handles() {
        assert!(create_named(b"/shared.bin", 8));
        let fd1 = open_named(b"/shared.bin").unwrap();
        let fd2 = open_named(b"/shared.bin").unwrap();
        assert_ne!(fd1, fd2);
        assert_eq!(filesize(fd1), Some(8));
        assert_eq!(filesize(fd2), Some(8));

        let file1 = get(fd1).unwrap();
        file1.write_at(0, b"hello");
        let file2 = get(fd2).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file2.read_at(0, &mut buf), 5);
        assert_eq!(&buf, b"hello");

        close(fd1);
        close(fd2);
        remove_named(b"/shared.bin");
    }

    #[test]
    fn open_named_missing_path_returns_none() {
        assert!(open_named(b"/does-not-exist").is_none());
        assert!(filesize(99_999).is_none());
    }
}
