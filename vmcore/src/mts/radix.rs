//! Radix MTS variant: 32-bit MIPS (spec.md §4.6).
//!
//! Unlike the hash variant, the radix MTS does not translate lazily: it
//! keeps a complete map of the 4 GiB virtual space reflecting the
//! current privilege mode and TLB contents, rebuilt wholesale whenever
//! either changes (spec.md §4.6, "Whenever the architectural TLB or the
//! privilege mode changes, the caller invokes `rebuild`"). Per spec.md
//! §9 this is the historical variant; it is implemented in full but
//! carries a smaller test set than [`crate::mts::hash`].

use crate::device::{AccessOp, VM_PAGE_SHIFT};
use crate::error::{AccessDirection, Fault, FaultResult};
use crate::mts::MtsEntry;
use crate::registry::VmDeviceSpace;

/// 2^10 entries per level, 4 MiB stride at L1, 4 KiB leaves at L2
/// (spec.md §3, "the 32-bit MIPS variant uses a two-level radix with 4
/// MiB stride at L1 and 4 KiB leaves").
const L1_BITS: u32 = 10;
const L2_BITS: u32 = 10;
const L1_SIZE: usize = 1 << L1_BITS;
const L2_SIZE: usize = 1 << L2_BITS;
const L1_STRIDE_SHIFT: u32 = VM_PAGE_SHIFT + L2_BITS; // 4 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// `rebuild` has not yet unmasked this window.
    AddressError,
    /// This slot is a leaf: direct entry valid for the whole 4 MiB window
    /// (identity-mapped unmapped zones) or — once forked — unused.
    Ok,
    /// A guest access here must first resolve a TLB miss.
    TlbMiss,
}

#[derive(Clone, Copy)]
enum L1Slot {
    /// No mapping installed yet at this 4 MiB window.
    Unmapped(Status),
    /// A single 4 MiB-aligned, fully-mapped window (whole range shares
    /// one physical base, cached flag, and device).
    Leaf {
        ppage_base: u64,
        cached: bool,
    },
    /// Forked into a 1024-entry L2 array of 4 KiB leaves.
    Chain(usize),
}

#[derive(Clone, Copy, Default)]
struct L2Leaf {
    status: Option<Status>,
    ppage: u64,
    cached: bool,
}

/// The 32-bit MIPS radix MTS: one complete L1 table plus a pool of L2
/// arrays allocated on first fork (spec.md §3, "L2 arrays are allocated
/// from a per-CPU free list").
pub struct RadixMts {
    l1: Vec<L1Slot>,
    l2_pool: Vec<[L2Leaf; L2_SIZE]>,
    l2_free: Vec<usize>,
}

impl RadixMts {
    pub fn new() -> Self {
        RadixMts {
            l1: vec![L1Slot::Unmapped(Status::AddressError); L1_SIZE],
            l2_pool: Vec::new(),
            l2_free: Vec::new(),
        }
    }

    fn l1_index(vaddr: u64) -> usize {
        ((vaddr >> L1_STRIDE_SHIFT) & ((1u64 << L1_BITS) - 1)) as usize
    }

    fn l2_index(vaddr: u64) -> usize {
        ((vaddr >> VM_PAGE_SHIFT) & ((1u64 << L2_BITS) - 1)) as usize
    }

    fn alloc_l2(&mut self) -> usize {
        if let Some(idx) = self.l2_free.pop() {
            return idx;
        }
        self.l2_pool.push([L2Leaf::default(); L2_SIZE]);
        self.l2_pool.len() - 1
    }

    /// Step 1 of `rebuild`: mark every L1 slot as an address error.
    pub fn reset(&mut self) {
        for slot in self.l1.iter_mut() {
            *slot = L1Slot::Unmapped(Status::AddressError);
        }
        // L2 arrays are left in the free-list pool across a rebuild —
        // only the L1 fan-out is torn down, matching the "cheap
        // rebuilds" framing of spec.md §4.6's rationale... except this
        // *is* the radix (expensive-rebuild) variant: unlike the hash
        // cache, nothing here is reused implicitly. Recycle eagerly so
        // repeated rebuilds don't leak L2 arrays.
        self.l2_free = (0..self.l2_pool.len()).collect();
    }

    /// Step 2: unmask an unmapped window as identity-mapped OK, or leave
    /// it to be populated TLB-entry by TLB-entry (`map`, below).
    pub fn unmask_unmapped(&mut self, vaddr_base: u64, ppage_base: u64, cached: bool) {
        let idx = Self::l1_index(vaddr_base);
        self.l1[idx] = L1Slot::Leaf { ppage_base, cached };
    }

    pub fn mark_tlb_mapped_window(&mut self, vaddr_base: u64) {
        let idx = Self::l1_index(vaddr_base);
        self.l1[idx] = L1Slot::Unmapped(Status::TlbMiss);
    }

    /// `map`: install a mapping for `[vaddr, vaddr+len)` -> physical
    /// `[paddr, paddr+len)`, forking an L2 array when the window is not
    /// 4 MiB-aligned (spec.md §4.6).
    pub fn map(&mut self, vaddr: u64, paddr: u64, len: u64, cached: bool) {
        let mut v = vaddr & !((1u64 << VM_PAGE_SHIFT) - 1);
        let mut p = paddr & !((1u64 << VM_PAGE_SHIFT) - 1);
        let end = v + len;

        while v < end {
            let l1_idx = Self::l1_index(v);
            let window_base = (v >> L1_STRIDE_SHIFT) << L1_STRIDE_SHIFT;
            let window_end = window_base + (1u64 << L1_STRIDE_SHIFT);
            let aligned_whole_window = v == window_base && end >= window_end;

            if aligned_whole_window {
                self.l1[l1_idx] = L1Slot::Leaf {
                    ppage_base: p,
                    cached,
                };
                v = window_end;
                p += window_end - window_base;
                continue;
            }

            let l2_idx = match self.l1[l1_idx] {
                L1Slot::Chain(idx) => idx,
                _ => {
                    let idx = self.alloc_l2();
                    self.l1[l1_idx] = L1Slot::Chain(idx);
                    idx
                }
            };

            let leaf_idx = Self::l2_index(v);
            self.l2_pool[l2_idx][leaf_idx] = L2Leaf {
                status: Some(Status::Ok),
                ppage: p,
                cached,
            };

            v += 1 << VM_PAGE_SHIFT;
            p += 1 << VM_PAGE_SHIFT;
        }
    }

    /// `unmap`: the symmetric removal (spec.md §4.6).
    pub fn unmap(&mut self, vaddr: u64, len: u64) {
        let mut v = vaddr & !((1u64 << VM_PAGE_SHIFT) - 1);
        let end = v + len;
        while v < end {
            let l1_idx = Self::l1_index(v);
            match self.l1[l1_idx] {
                L1Slot::Chain(l2_idx) => {
                    let leaf_idx = Self::l2_index(v);
                    self.l2_pool[l2_idx][leaf_idx] = L2Leaf::default();
                }
                _ => {
                    self.l1[l1_idx] = L1Slot::Unmapped(Status::TlbMiss);
                }
            }
            v += 1 << VM_PAGE_SHIFT;
        }
    }

    /// Resolve `vaddr` to a physical page, honoring the per-slot status
    /// (spec.md §4.6, "applies `flags` (OK/address-error/TLB-miss/
    /// undefined) by calling the common `access_special`").
    pub fn resolve(&self, vaddr: u64, direction: AccessDirection) -> FaultResult<(u64, bool)> {
        let l1_idx = Self::l1_index(vaddr);
        match self.l1[l1_idx] {
            L1Slot::Leaf { ppage_base, cached } => {
                let window_base = (vaddr >> L1_STRIDE_SHIFT) << L1_STRIDE_SHIFT;
                Ok((ppage_base + (vaddr - window_base), cached))
            }
            L1Slot::Chain(l2_idx) => {
                let leaf = self.l2_pool[l2_idx][Self::l2_index(vaddr)];
                match leaf.status {
                    Some(Status::Ok) => Ok((leaf.ppage, leaf.cached)),
                    _ => Err(Fault::TlbMiss { vaddr, direction }),
                }
            }
            L1Slot::Unmapped(Status::TlbMiss) => Err(Fault::TlbMiss { vaddr, direction }),
            L1Slot::Unmapped(_) => Err(Fault::AddressError {
                vaddr,
                kind: crate::error::AddressErrorKind::OutOfZone,
            }),
        }
    }
}

impl Default for RadixMts {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the radix MTS's view of KSEG0/KSEG1 plus the device registry,
/// called once per `rebuild` (spec.md §4.6 step 2). The whole 512 MiB
/// identity zone is unmasked per kernel segment regardless of installed
/// RAM size; a page beyond the installed RAM/device span still falls
/// through the device registry lookup in [`access`] and lands on the
/// `UndefinedMemory` path instead of reading garbage through a stale
/// leaf.
pub fn rebuild_unmapped_windows(mts: &mut RadixMts, _devices: &VmDeviceSpace) {
    mts.reset();
    // KSEG0 (0x8000_0000, cached) and KSEG1 (0xA0000000, uncached) both
    // identity-map the full 512 MiB zone to physical address 0 upward,
    // per spec.md §4.5 step 1's zone classification, shared with the
    // hash-variant's MIPS glue in `crate::mmu::mips`. Each zone spans
    // 128 4 MiB L1 windows; a page beyond the installed RAM/device span
    // still resolves through the device registry and lands on the
    // `UndefinedMemory` path rather than a stale leaf, so mapping the
    // whole zone up front is safe even when less RAM is installed.
    // 512 MiB / 4 MiB stride = 128 L1 windows per zone.
    const ZONE_WINDOWS: u64 = 0x2000_0000 >> L1_STRIDE_SHIFT;
    for i in 0..ZONE_WINDOWS {
        let offset = i << L1_STRIDE_SHIFT;
        mts.unmask_unmapped(0x8000_0000 + offset, offset, true);
        mts.unmask_unmapped(0xA000_0000 + offset, offset, false);
    }
    // KUSEG (2 GiB) and KSEG2/KSEG3 (1 GiB combined) are TLB-mapped;
    // leave every window as `TlbMiss` until `map` installs entries
    // sourced from the architectural TLB walk.
    const KUSEG_WINDOWS: u64 = 0x8000_0000 >> L1_STRIDE_SHIFT;
    for i in 0..KUSEG_WINDOWS {
        mts.mark_tlb_mapped_window(i << L1_STRIDE_SHIFT);
    }
    const KSEG23_WINDOWS: u64 = 0x4000_0000 >> L1_STRIDE_SHIFT;
    for i in 0..KSEG23_WINDOWS {
        mts.mark_tlb_mapped_window(0xC000_0000 + (i << L1_STRIDE_SHIFT));
    }
}

/// One memop against the radix cache: resolve, then dispatch the same
/// fast path the hash variant uses via [`resolve_physical_page`] +
/// [`crate::mts::run_fast_path`] (spec.md §4.4 is shared across both
/// variants; only the slow lookup in §4.5/§4.6 differs).
#[allow(clippy::too_many_arguments)]
pub fn access(
    mts: &RadixMts,
    devices: &VmDeviceSpace,
    arena: &crate::sparse::SparsePageArena,
    jit_hook: &dyn crate::jit::CodeCacheHook,
    vaddr: u64,
    size: crate::device::AccessSize,
    op: AccessOp,
    ext: crate::mts::LoadExtend,
    endian: crate::mts::GuestEndian,
    cpu_id: u32,
    store_val: u64,
    undef_hook: Option<crate::physmem::UndefinedMemoryHook<'_>>,
) -> FaultResult<crate::mts::AccessOutcome> {
    let direction = match op {
        AccessOp::Read => AccessDirection::Load,
        AccessOp::Write => AccessDirection::Store,
    };
    let (ppage, _cached) = mts.resolve(vaddr, direction)?;
    let vpage = vaddr & crate::device::VM_PAGE_MASK;
    let ppage = ppage & crate::device::VM_PAGE_MASK;

    // No device claims this physical page: spec.md §4.5 step 3's
    // `UndefinedMemory` case, not a `Fault` (see `crate::mts::hash` for
    // the identical reasoning — both variants share this step).
    let Some(entry): Option<MtsEntry> =
        crate::mts::resolve_physical_page(devices, arena, vpage, ppage, op, jit_hook)
    else {
        return Ok(crate::mts::undefined_access(undef_hook, ppage, op));
    };

    Ok(crate::mts::run_fast_path(
        &entry, devices, vaddr, size, op, ext, endian, cpu_id, store_val,
    ))
}
