//! Memory Translation System: the software TLB cache in front of the
//! architectural MMU glue in [`crate::mmu`].
//!
//! This is the largest single component of the guest memory subsystem
//! (spec.md §2, component E). A guest CPU never walks the architectural
//! TLB/BAT/segment state directly on every access: it calls one typed
//! memop here, which consults a per-CPU cache keyed by virtual page and
//! only falls through to [`crate::mmu`] on a miss.
//!
//! Two cache implementations share the types in this module:
//! [`hash`] (64-bit MIPS, 32-bit PPC — the fully-specified default, per
//! spec.md §9's framing of the radix form as historical) and [`radix`]
//! (32-bit MIPS).

pub mod hash;
pub mod radix;

use crate::device::{flags, AccessOp, AccessSize};
use crate::error::Fault;
use crate::registry::VmDeviceSpace;

/// Flags carried by one MTS cache entry (spec.md §3, "MTS cache entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheFlags(pub u8);

impl CacheFlags {
    pub const DEV: u8 = 1 << 0;
    pub const COW: u8 = 1 << 1;
    pub const EXEC: u8 = 1 << 2;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }
}

/// What a cache entry's `action` resolves to (spec.md §3: "a host pointer
/// to the page, or... an encoded `(device_id, offset_within_device)`").
///
/// The REDESIGN FLAGS note suggests a tagged-pointer word so the low
/// flag bits never collide with a real host address; an enum gives the
/// same information with no unsafe bit-packing, at the cost of the
/// entry being a few bytes larger — a fine trade here since the cache
/// holds thousands of entries, not millions.
#[derive(Debug, Clone, Copy)]
pub enum MtsAction {
    /// Dereference `ptr + (vaddr & VM_PAGE_IMASK)` directly.
    Host(*mut u8),
    /// Dispatch through `Device::id == device_id`, at `base_offset +
    /// (vaddr & VM_PAGE_IMASK)`.
    Device { device_id: u32, base_offset: u64 },
}

// Safety: `Host` pointers are page-aligned host backings owned by a
// `Device` for its lifetime (spec.md §3 invariant); the cache itself
// never dereferences them outside the fast path, which runs on the
// owning CPU's thread.
unsafe impl Send for MtsAction {}

/// One MTS cache entry (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct MtsEntry {
    /// Page-aligned guest virtual address this entry covers.
    pub vpage: u64,
    /// Page-aligned guest physical address this entry was filled from
    /// (used to tag `EXEC`/COW bookkeeping and by invalidation).
    pub ppage: u64,
    pub action: MtsAction,
    pub flags: CacheFlags,
    /// Reverse-map key: the architectural TLB index that produced this
    /// entry, if any (unmapped/direct zones have none). Consulted by
    /// selective invalidation (spec.md §4.5, "Selective invalidation").
    pub tlb_index: Option<usize>,
}

/// Sign/zero-extension rule a load op applies to the raw bytes it reads
/// (spec.md §4.4, "for loads apply the op's sign/zero-extension rule").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadExtend {
    Zero,
    Sign,
}

/// Guest byte order. Dynamips-family routers run big-endian MIPS/PPC in
/// the overwhelming majority of configured images, but the core does not
/// assume this: `vmtoh*`/`htovm*` (spec.md §4.2, "word helpers return
/// host byte order; ... the caller's responsibility") are modeled
/// explicitly per CPU/VM rather than hardwired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEndian {
    Big,
    Little,
}

impl GuestEndian {
    pub fn to_host_u16(self, raw: [u8; 2]) -> u16 {
        match self {
            GuestEndian::Big => u16::from_be_bytes(raw),
            GuestEndian::Little => u16::from_le_bytes(raw),
        }
    }
    pub fn to_host_u32(self, raw: [u8; 4]) -> u32 {
        match self {
            GuestEndian::Big => u32::from_be_bytes(raw),
            GuestEndian::Little => u32::from_le_bytes(raw),
        }
    }
    pub fn to_host_u64(self, raw: [u8; 8]) -> u64 {
        match self {
            GuestEndian::Big => u64::from_be_bytes(raw),
            GuestEndian::Little => u64::from_le_bytes(raw),
        }
    }
    pub fn from_host_u16(self, v: u16) -> [u8; 2] {
        match self {
            GuestEndian::Big => v.to_be_bytes(),
            GuestEndian::Little => v.to_le_bytes(),
        }
    }
    pub fn from_host_u32(self, v: u32) -> [u8; 4] {
        match self {
            GuestEndian::Big => v.to_be_bytes(),
            GuestEndian::Little => v.to_le_bytes(),
        }
    }
    pub fn from_host_u64(self, v: u64) -> [u8; 8] {
        match self {
            GuestEndian::Big => v.to_be_bytes(),
            GuestEndian::Little => v.to_le_bytes(),
        }
    }
}

/// Implemented by the per-CPU cache structures ([`hash::HashMts`],
/// [`radix::RadixMts`]) so the generic fast-path/dispatch helpers below
/// work across both variants.
pub trait MtsCache {
    /// Look up the entry covering `vpage` (already page-aligned),
    /// without side effects.
    fn lookup(&self, vpage: u64) -> Option<MtsEntry>;

    /// Install (or overwrite) the entry for `entry.vpage`.
    fn install(&mut self, entry: MtsEntry);

    /// Evict every entry whose `tlb_index == Some(index)`. Returns the
    /// number of entries evicted (spec.md §8, "Selective invalidation").
    fn invalidate_tlb_index(&mut self, index: usize) -> usize;
}

/// Outcome of running one memop's fast or slow path to completion.
#[derive(Debug, Clone, Copy)]
pub struct AccessOutcome {
    /// Raw value in host byte order, as returned by the access (for a
    /// load) or echoed back (for a store, where it is unused).
    pub data: u64,
    /// Set when the fast path observed the `EXEC` flag on a *write*, so
    /// the caller should invoke [`crate::jit::CodeCacheHook::invalidate_page`].
    pub invalidate_exec_page: Option<u64>,
}

/// Read `size` raw bytes at `haddr` and convert to host byte order
/// (spec.md §4.4, "Fast path for host-backed entries").
fn read_raw(haddr: *const u8, size: AccessSize, endian: GuestEndian) -> u64 {
    unsafe {
        match size {
            AccessSize::Byte => *haddr as u64,
            AccessSize::Half => {
                let raw = [*haddr, *haddr.add(1)];
                endian.to_host_u16(raw) as u64
            }
            AccessSize::Word => {
                let mut raw = [0u8; 4];
                std::ptr::copy_nonoverlapping(haddr, raw.as_mut_ptr(), 4);
                endian.to_host_u32(raw) as u64
            }
            AccessSize::Dword => {
                let mut raw = [0u8; 8];
                std::ptr::copy_nonoverlapping(haddr, raw.as_mut_ptr(), 8);
                endian.to_host_u64(raw)
            }
        }
    }
}

fn write_raw(haddr: *mut u8, size: AccessSize, endian: GuestEndian, val: u64) {
    unsafe {
        match size {
            AccessSize::Byte => *haddr = val as u8,
            AccessSize::Half => {
                let raw = endian.from_host_u16(val as u16);
                *haddr = raw[0];
                *haddr.add(1) = raw[1];
            }
            AccessSize::Word => {
                let raw = endian.from_host_u32(val as u32);
                std::ptr::copy_nonoverlapping(raw.as_ptr(), haddr, 4);
            }
            AccessSize::Dword => {
                let raw = endian.from_host_u64(val);
                std::ptr::copy_nonoverlapping(raw.as_ptr(), haddr, 8);
            }
        }
    }
}

fn extend(raw: u64, size: AccessSize, ext: LoadExtend) -> u64 {
    match ext {
        LoadExtend::Zero => raw,
        LoadExtend::Sign => match size {
            AccessSize::Byte => raw as i8 as i64 as u64,
            AccessSize::Half => raw as i16 as i64 as u64,
            AccessSize::Word => raw as i32 as i64 as u64,
            AccessSize::Dword => raw,
        },
    }
}

/// Run the fast path for an already-resolved entry (spec.md §4.4,
/// "Fast path for host-backed entries" / "Fast path for device
/// entries"). `cpu_id` is passed through to a device handler for
/// diagnostics only.
pub fn run_fast_path(
    entry: &MtsEntry,
    devices: &VmDeviceSpace,
    vaddr: u64,
    size: AccessSize,
    op: AccessOp,
    ext: LoadExtend,
    endian: GuestEndian,
    cpu_id: u32,
    store_val: u64,
) -> AccessOutcome {
    let page_off = vaddr & crate::device::VM_PAGE_IMASK;

    let data = match entry.action {
        MtsAction::Host(ptr) => {
            let haddr = unsafe { ptr.add(page_off as usize) };
            match op {
                AccessOp::Read => extend(read_raw(haddr, size, endian), size, ext),
                AccessOp::Write => {
                    write_raw(haddr, size, endian, store_val);
                    store_val
                }
            }
        }
        MtsAction::Device {
            device_id,
            base_offset,
        } => devices.lookup_by_id(device_id, |maybe_dev| {
            let dev = maybe_dev.expect("device entry must still be bound");
            let offset = base_offset + page_off;
            let mut data = store_val;
            let result = dev
                .handler
                .as_ref()
                .expect("device cache entries always carry a handler")
                .lock()
                .unwrap()
                .access(cpu_id, offset, size, op, &mut data);
            match result {
                crate::device::HandlerResult::HostPtr(ptr) => match op {
                    AccessOp::Read => extend(read_raw(ptr, size, endian), size, ext),
                    AccessOp::Write => {
                        write_raw(ptr, size, endian, store_val);
                        store_val
                    }
                },
                crate::device::HandlerResult::Handled { data } => match op {
                    AccessOp::Read => extend(data, size, ext),
                    AccessOp::Write => data,
                },
            }
        }),
    };

    let invalidate_exec_page = if op == AccessOp::Write && entry.flags.contains(CacheFlags::EXEC) {
        Some(entry.ppage)
    } else {
        None
    };

    AccessOutcome {
        data,
        invalidate_exec_page,
    }
}

/// Build the cache entry for a physical page that the slow path just
/// resolved (spec.md §4.5 step 4 / §4.6): consults the device registry
/// and honors `NO_MTS_MMAP`/`SPARSE`. The `MtsEntry` itself is cached
/// either way; a `MtsAction::Device` entry just means the fast path
/// re-invokes the device's handler on every hit instead of touching a
/// host pointer directly, so the handler still sees every access.
pub fn resolve_physical_page(
    devices: &VmDeviceSpace,
    arena: &crate::sparse::SparsePageArena,
    vpage: u64,
    ppage: u64,
    op: AccessOp,
    jit_hook: &dyn crate::jit::CodeCacheHook,
) -> Option<MtsEntry> {
    devices.lookup_by_phys(ppage, false, |maybe_dev| {
        let dev = maybe_dev?;
        let offset = ppage - dev.phys_addr;

        let (action, cow) = if dev.flags.contains(flags::SPARSE) {
            let mut table = dev.sparse.as_ref().unwrap().lock().unwrap();
            let has_ghost = dev.flags.contains(flags::GHOST);
            let lookup =
                crate::sparse::sparse_get_host_addr(&mut table, arena, has_ghost, offset, op);
            (MtsAction::Host(lookup.host_ptr), lookup.cow)
        } else if let Some(ptr) = dev.direct_host_ptr(ppage) {
            (MtsAction::Host(ptr), false)
        } else if dev.handler.is_some() {
            (
                MtsAction::Device {
                    device_id: dev.id,
                    base_offset: offset & crate::device::VM_PAGE_MASK,
                },
                false,
            )
        } else {
            return None;
        };

        let mut cache_flags = CacheFlags::default();
        if matches!(action, MtsAction::Device { .. }) {
            cache_flags.insert(CacheFlags::DEV);
        }
        if cow {
            cache_flags.insert(CacheFlags::COW);
        }
        if jit_hook.has_code_for_page(ppage & crate::device::VM_PAGE_MASK) {
            cache_flags.insert(CacheFlags::EXEC);
        }

        Some(MtsEntry {
            vpage,
            ppage: ppage & crate::device::VM_PAGE_MASK,
            action,
            flags: cache_flags,
            tlb_index: None,
        })
    })
}

/// The "no device claims this physical page" outcome (spec.md §4.5 step
/// 3, §7 `UndefinedMemory`): unlike every other entry in this module,
/// this is *not* a [`Fault`] — the guest CPU takes no exception, reads
/// return zero, and writes are silently dropped. The optional hook gets
/// the final say (used by debug builds to escalate it instead), matching
/// `crate::physmem`'s identical "no device owns this address" handling.
/// Per spec.md §4.5 step 3, this result is never installed into the
/// persistent cache.
pub fn undefined_access(
    hook: Option<crate::physmem::UndefinedMemoryHook<'_>>,
    paddr: u64,
    op: AccessOp,
) -> AccessOutcome {
    let is_write = op == AccessOp::Write;
    let handled = hook.map(|h| h(paddr, is_write)).unwrap_or(false);
    if !handled {
        log::warn!(
            "mts: no device owns {:#x} ({})",
            paddr,
            if is_write { "write" } else { "read" }
        );
    }
    AccessOutcome {
        data: 0,
        invalidate_exec_page: None,
    }
}

/// Translate a [`Fault`] from the architectural MMU glue into the
/// non-zero "fault code" the MTS-to-CPU ABI returns (spec.md §6).
/// `0` always means success; the concrete non-zero encoding is left to
/// the CPU dispatch loop (out of scope here), so this just signals
/// "take the exception".
pub fn fault_code(fault: &Fault) -> u32 {
    match fault {
        Fault::AddressError { .. } => 1,
        Fault::TlbMiss { .. } => 2,
        Fault::BatMiss { .. } => 3,
        Fault::SegmentMiss { .. } => 4,
        Fault::BusFault { .. } => 5,
    }
}
