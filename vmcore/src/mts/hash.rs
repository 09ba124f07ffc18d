//! Hash-cache MTS variant: 64-bit MIPS and 32-bit PPC (spec.md §4.5).
//!
//! A direct-mapped cache of fixed size keyed by a hash of the guest
//! virtual page. Lazy: nothing is precomputed, every miss walks the
//! architectural MMU glue and the device registry once, then installs
//! one entry. Eviction is implicit (direct-mapped: a colliding install
//! simply overwrites); *selective* eviction on TLB invalidation is
//! tracked separately via `reverse_map`.

use std::collections::HashMap;

use crate::device::{AccessOp, VM_PAGE_MASK};
use crate::error::FaultResult;
use crate::jit::CodeCacheHook;
use crate::mts::{resolve_physical_page, MtsCache, MtsEntry};
use crate::registry::VmDeviceSpace;
use crate::sparse::SparsePageArena;

/// One direct-mapped slot: `None` until first fill, then holds the last
/// entry installed at this bucket (which may not be the entry currently
/// requested — a tag mismatch on lookup is a miss, same as a TLB-cache
/// design).
struct Slot {
    entry: Option<MtsEntry>,
}

/// The hash-cache MTS (spec.md §3, "Hash... Each entry carries its
/// virtual-page tag so collisions are detected on lookup").
///
/// `reverse_map` replaces the intrusive, index-linked list the REDESIGN
/// FLAGS note suggests (spec.md §9) with a `HashMap<tlb_index,
/// Vec<bucket>>`: functionally the same selective-invalidation contract
/// (spec.md §8, "Selective invalidation") without hand-rolled arena
/// bookkeeping, which buys nothing in safe Rust over a standard
/// collection at this entry count (4K-16K).
pub struct HashMts {
    slots: Vec<Slot>,
    mask: u64,
    reverse_map: HashMap<usize, Vec<usize>>,
}

fn hash_vpage(vpage: u64, mask: u64) -> usize {
    // Fibonacci-style multiplicative hash, spreading the low page-index
    // bits (which are far more likely to collide than high ones on a
    // typical guest's working set) across the full bucket range.
    let h = vpage.wrapping_mul(0x9E3779B97F4A7C15);
    ((h >> 20) & mask) as usize
}

impl HashMts {
    /// `size` must be a power of two (spec.md §3, "power of two,
    /// typically 4K-16K entries").
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "hash cache size must be a power of two");
        HashMts {
            slots: (0..size).map(|_| Slot { entry: None }).collect(),
            mask: (size - 1) as u64,
            reverse_map: HashMap::new(),
        }
    }

    fn bucket_of(&self, vpage: u64) -> usize {
        hash_vpage(vpage, self.mask)
    }

    fn unlink_reverse(&mut self, bucket: usize, tlb_index: Option<usize>) {
        if let Some(idx) = tlb_index {
            if let Some(list) = self.reverse_map.get_mut(&idx) {
                list.retain(|&b| b != bucket);
                if list.is_empty() {
                    self.reverse_map.remove(&idx);
                }
            }
        }
    }

    /// Run one memop end to end: fast path on a tag hit, otherwise
    /// resolve through `translate` (the architectural MMU glue) and the
    /// device registry, install, then run the fast path on the freshly
    /// filled entry (spec.md §4.4/§4.5).
    #[allow(clippy::too_many_arguments)]
    pub fn access(
        &mut self,
        devices: &VmDeviceSpace,
        arena: &SparsePageArena,
        jit_hook: &dyn CodeCacheHook,
        vaddr: u64,
        size: crate::device::AccessSize,
        op: AccessOp,
        ext: crate::mts::LoadExtend,
        endian: crate::mts::GuestEndian,
        cpu_id: u32,
        store_val: u64,
        undef_hook: Option<crate::physmem::UndefinedMemoryHook<'_>>,
        translate: impl FnOnce(u64, AccessOp) -> FaultResult<(u64, Option<usize>)>,
    ) -> FaultResult<crate::mts::AccessOutcome> {
        let vpage = vaddr & VM_PAGE_MASK;

        if let Some(entry) = self.lookup(vpage) {
            return Ok(crate::mts::run_fast_path(
                &entry, devices, vaddr, size, op, ext, endian, cpu_id, store_val,
            ));
        }

        let (ppage, tlb_index) = translate(vaddr, op)?;
        let ppage = ppage & VM_PAGE_MASK;

        // No device claims this physical page: spec.md §4.5 step 3's
        // `UndefinedMemory` case, not a `Fault` — the guest takes no
        // exception, and (per the same step) nothing is installed into
        // the persistent cache.
        let Some(mut entry) = resolve_physical_page(devices, arena, vpage, ppage, op, jit_hook)
        else {
            return Ok(crate::mts::undefined_access(undef_hook, ppage, op));
        };
        entry.tlb_index = tlb_index;
        self.install(entry);

        Ok(crate::mts::run_fast_path(
            &entry, devices, vaddr, size, op, ext, endian, cpu_id, store_val,
        ))
    }
}

impl MtsCache for HashMts {
    fn lookup(&self, vpage: u64) -> Option<MtsEntry> {
        let bucket = self.bucket_of(vpage);
        self.slots[bucket]
            .entry
            .filter(|e| e.vpage == vpage)
    }

    fn install(&mut self, entry: MtsEntry) {
        let bucket = self.bucket_of(entry.vpage);
        if let Some(old) = self.slots[bucket].entry {
            self.unlink_reverse(bucket, old.tlb_index);
        }
        if let Some(idx) = entry.tlb_index {
            self.reverse_map.entry(idx).or_default().push(bucket);
        }
        self.slots[bucket].entry = Some(entry);
    }

    fn invalidate_tlb_index(&mut self, index: usize) -> usize {
        let Some(buckets) = self.reverse_map.remove(&index) else {
            return 0;
        };
        let mut evicted = 0;
        for bucket in buckets {
            if let Some(entry) = self.slots[bucket].entry {
                if entry.tlb_index == Some(index) {
                    self.slots[bucket].entry = None;
                    evicted += 1;
                }
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{flags, AccessSize, Device, DeviceFlags, HostBacking};
    use crate::jit::NullCodeCacheHook;
    use crate::mts::GuestEndian;
    use crate::mts::LoadExtend;
    use crate::registry::VmDeviceSpace;

    fn ram_device(phys_addr: u64, phys_len: u64) -> Device {
        let len = phys_len as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            ) as *mut u8
        };
        Device {
            name: "ram".into(),
            id: 0,
            phys_addr,
            phys_len,
            flags: DeviceFlags::new(flags::CACHING),
            backing: Some(HostBacking {
                ptr,
                len,
                fd: None,
                sync_on_drop: false,
                borrowed: false,
            }),
            sparse: None,
            handler: None,
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let space = VmDeviceSpace::new();
        space.bind(ram_device(0, 0x10000)).unwrap();
        let arena = SparsePageArena::new();
        let hook = NullCodeCacheHook;
        let mut mts = HashMts::new(1024);

        let identity = |vaddr: u64, _op: AccessOp| -> FaultResult<(u64, Option<usize>)> {
            Ok((vaddr, Some(7)))
        };

        mts.access(
            &space,
            &arena,
            &hook,
            0x1000,
            AccessSize::Word,
            AccessOp::Write,
            LoadExtend::Zero,
            GuestEndian::Big,
            0,
            0xCAFEBABE,
            None,
            identity,
        )
        .unwrap();

        let out = mts
            .access(
                &space,
                &arena,
                &hook,
                0x1000,
                AccessSize::Word,
                AccessOp::Read,
                LoadExtend::Zero,
                GuestEndian::Big,
                0,
                0,
                None,
                identity,
            )
            .unwrap();
        assert_eq!(out.data, 0xCAFEBABE);
    }

    #[test]
    fn rebuild_without_architectural_change_is_observationally_equivalent() {
        // "Idempotence" property (spec.md §8): repeating the same reads
        // after a no-op cache clear yields the same values, since nothing
        // architectural changed in between.
        let space = VmDeviceSpace::new();
        space.bind(ram_device(0, 0x10000)).unwrap();
        let arena = SparsePageArena::new();
        let hook = NullCodeCacheHook;
        let mut mts = HashMts::new(1024);
        let identity = |vaddr: u64, _op: AccessOp| -> FaultResult<(u64, Option<usize>)> {
            Ok((vaddr, Some(3)))
        };

        mts.access(
            &space, &arena, &hook, 0x2000, AccessSize::Byte, AccessOp::Write,
            LoadExtend::Zero, GuestEndian::Big, 0, 0xAB, None, identity,
        )
        .unwrap();
        let before = mts
            .access(
                &space, &arena, &hook, 0x2000, AccessSize::Byte, AccessOp::Read,
                LoadExtend::Zero, GuestEndian::Big, 0, 0, None, identity,
            )
            .unwrap()
            .data;

        // Evict everything (as `rebuild` conceptually would for a hash
        // cache: drop all entries) and repeat.
        for idx in 0..8 {
            mts.invalidate_tlb_index(idx);
        }
        let after = mts
            .access(
                &space, &arena, &hook, 0x2000, AccessSize::Byte, AccessOp::Read,
                LoadExtend::Zero, GuestEndian::Big, 0, 0, None, identity,
            )
            .unwrap()
            .data;
        assert_eq!(before, after);
    }

    #[test]
    fn selective_invalidation_evicts_only_linked_entries() {
        let space = VmDeviceSpace::new();
        space.bind(ram_device(0, 0x10000)).unwrap();
        let arena = SparsePageArena::new();
        let hook = NullCodeCacheHook;
        let mut mts = HashMts::new(1024);

        mts.install(MtsEntry {
            vpage: 0x1000,
            ppage: 0x1000,
            action: crate::mts::MtsAction::Host(std::ptr::null_mut()),
            flags: Default::default(),
            tlb_index: Some(5),
        });
        mts.install(MtsEntry {
            vpage: 0x2000,
            ppage: 0x2000,
            action: crate::mts::MtsAction::Host(std::ptr::null_mut()),
            flags: Default::default(),
            tlb_index: Some(9),
        });

        let evicted = mts.invalidate_tlb_index(5);
        assert_eq!(evicted, 1);
        assert!(mts.lookup(0x1000).is_none());
        assert!(mts.lookup(0x2000).is_some());
        let _ = (devices_unused(&space), arena_unused(&arena), hook_unused(&hook));
    }

    // Silence "unused" lints in the minimal-entry test above without
    // pulling extra scaffolding into the assertions themselves.
    fn devices_unused(_: &VmDeviceSpace) {}
    fn arena_unused(_: &SparsePageArena) {}
    fn hook_unused(_: &dyn CodeCacheHook) {}
}
