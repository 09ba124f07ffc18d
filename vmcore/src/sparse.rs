//! Sparse, lazily-backed device memory with optional copy-on-write
//! against a shared read-only "ghost" base image.
//!
//! Grounded on `dev_sparse_init` / `dev_sparse_get_host_addr` in
//! `examples/original_source/device.c` (spec.md §4.3). The per-VM page
//! arena (spec.md §9, "Sparse page table... Page ownership follows the
//! arena pattern") replaces the original's bare `vm_alloc_host_page`.

use std::sync::Mutex;

use crate::device::{AccessOp, VM_PAGE_SHIFT, VM_PAGE_SIZE};

/// Low bit of a sparse page-table slot: page has been privately written
/// (`VDEVICE_PTE_DIRTY` in the original).
const PTE_DIRTY: usize = 1;
const PTE_PTR_MASK: usize = !PTE_DIRTY;

/// One slot of a device's sparse page table: either empty, a read-only
/// reference into a ghost image, or a privately-owned dirty page.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SparseSlot(usize);

impl SparseSlot {
    const EMPTY: SparseSlot = SparseSlot(0);

    fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn is_dirty(self) -> bool {
        self.0 & PTE_DIRTY != 0
    }

    fn ptr(self) -> *mut u8 {
        (self.0 & PTE_PTR_MASK) as *mut u8
    }

    fn dirty(ptr: *mut u8) -> SparseSlot {
        SparseSlot(ptr as usize | PTE_DIRTY)
    }

    fn ghost(ptr: *mut u8) -> SparseSlot {
        SparseSlot(ptr as usize & PTE_PTR_MASK)
    }
}

/// Per-device sparse page table: one slot per `VM_PAGE_SIZE` of the
/// device's physical range (spec.md §3, "Sparse page-table").
pub struct SparsePageTable {
    slots: Vec<SparseSlot>,
}

impl SparsePageTable {
    /// Allocate an all-empty table for a device with no ghost base
    /// (`dev_sparse_init` with `dev->host_addr == NULL`).
    pub fn new_empty(phys_len: u64) -> Self {
        let nr_pages = ((phys_len + VM_PAGE_SIZE - 1) >> VM_PAGE_SHIFT) as usize;
        SparsePageTable {
            slots: vec![SparseSlot::EMPTY; nr_pages],
        }
    }

    /// Allocate a table whose slots are pre-populated with read-only
    /// pointers into a ghost image (`dev_sparse_init` with a shared
    /// `host_addr`): realises the ghost-image layout of spec.md §4.3.
    pub fn new_ghosted(ghost_base: *mut u8, phys_len: u64) -> Self {
        let nr_pages = ((phys_len + VM_PAGE_SIZE - 1) >> VM_PAGE_SHIFT) as usize;
        let mut slots = Vec::with_capacity(nr_pages);
        for i in 0..nr_pages {
            let page_ptr = unsafe { ghost_base.add(i * VM_PAGE_SIZE as usize) };
            slots.push(SparseSlot::ghost(page_ptr));
        }
        SparsePageTable { slots }
    }

    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_dirty()).count()
    }
}

/// Per-VM arena handing out zero-filled host pages for sparse devices, so
/// teardown can reclaim them in bulk (spec.md §5, "Sparse pages are
/// owned by the VM").
pub struct SparsePageArena {
    pages: Mutex<Vec<*mut u8>>,
}

// Safety: raw pointers are page-aligned anonymous mmap allocations owned
// exclusively by this arena; access is serialized by the inner Mutex.
unsafe impl Send for SparsePageArena {}
unsafe impl Sync for SparsePageArena {}

impl SparsePageArena {
    pub fn new() -> Self {
        SparsePageArena {
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a fresh, zero-filled, page-aligned host page
    /// (`vm_alloc_host_page`).
    pub fn alloc_page(&self) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                VM_PAGE_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "sparse page allocation failed");
        let ptr = ptr as *mut u8;
        self.pages.lock().unwrap().push(ptr);
        ptr
    }
}

impl Drop for SparsePageArena {
    fn drop(&mut self) {
        for ptr in self.pages.get_mut().unwrap().drain(..) {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, VM_PAGE_SIZE as usize);
            }
        }
    }
}

/// Result of a sparse lookup: the host pointer to the page plus whether
/// it is a read-only ghost reference (the `cow` out-parameter of
/// `dev_sparse_get_host_addr`).
pub struct SparseLookup {
    pub host_ptr: *mut u8,
    pub cow: bool,
}

/// `dev_sparse_get_host_addr` (spec.md §4.3).
///
/// `has_ghost_base` distinguishes the two top-level cases the original
/// keys off `dev->host_addr`: a device with no ghost base allocates
/// fresh pages from the arena on first touch; a ghosted device applies
/// COW against the pre-populated read-only slots.
pub fn sparse_get_host_addr(
    table: &mut SparsePageTable,
    arena: &SparsePageArena,
    has_ghost_base: bool,
    paddr_offset: u64,
    op: AccessOp,
) -> SparseLookup {
    let index = (paddr_offset >> VM_PAGE_SHIFT) as usize;
    let slot = table.slots[index];

    if !has_ghost_base {
        if !slot.is_dirty() {
            let ptr = arena.alloc_page();
            table.slots[index] = SparseSlot::dirty(ptr);
            return SparseLookup {
                host_ptr: ptr,
                cow: false,
            };
        }
        return SparseLookup {
            host_ptr: slot.ptr(),
            cow: false,
        };
    }

    if slot.is_dirty() {
        return SparseLookup {
            host_ptr: slot.ptr(),
            cow: false,
        };
    }

    if op == AccessOp::Read {
        return SparseLookup {
            host_ptr: slot.ptr(),
            cow: true,
        };
    }

    // Write attempt on a ghost page: duplicate it.
    let new_ptr = arena.alloc_page();
    unsafe {
        std::ptr::copy_nonoverlapping(slot.ptr(), new_ptr, VM_PAGE_SIZE as usize);
    }
    table.slots[index] = SparseSlot::dirty(new_ptr);
    SparseLookup {
        host_ptr: new_ptr,
        cow: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_page_allocated_on_first_touch() {
        let arena = SparsePageArena::new();
        let mut table = SparsePageTable::new_empty(3 * VM_PAGE_SIZE);
        assert_eq!(table.dirty_page_count(), 0);

        let lookup = sparse_get_host_addr(&mut table, &arena, false, 0, AccessOp::Write);
        assert!(!lookup.cow);
        assert_eq!(table.dirty_page_count(), 1);

        // Second access to the same page returns the same pointer.
        let lookup2 = sparse_get_host_addr(&mut table, &arena, false, 0, AccessOp::Read);
        assert_eq!(lookup.host_ptr, lookup2.host_ptr);
    }

    #[test]
    fn ghost_read_is_cow_write_duplicates() {
        let arena = SparsePageArena::new();
        let ghost_page = arena.alloc_page();
        unsafe {
            *ghost_page = 0x42;
        }
        let mut table = SparsePageTable::new_ghosted(ghost_page, VM_PAGE_SIZE);

        let read = sparse_get_host_addr(&mut table, &arena, true, 0, AccessOp::Read);
        assert!(read.cow);
        assert_eq!(read.host_ptr, ghost_page);

        let write = sparse_get_host_addr(&mut table, &arena, true, 0, AccessOp::Write);
        assert!(!write.cow);
        assert_ne!(write.host_ptr, ghost_page);
        unsafe {
            assert_eq!(*write.host_ptr, 0x42); // copied from the ghost page
        }

        // Subsequent access (even a read) now sees the private dirty page.
        let after = sparse_get_host_addr(&mut table, &arena, true, 0, AccessOp::Read);
        assert_eq!(after.host_ptr, write.host_ptr);
        assert!(!after.cow);
    }
}
