//! MIPS architectural zone classification and software TLB.
//!
//! Grounded on the zone split described in spec.md §4.5 step 1
//! (xkuseg/xksseg/xkseg, ckseg0/1, xkphys) and the R4000-family TLB entry
//! layout (`EntryHi`/`EntryLo0`/`EntryLo1`/`PageMask`) that both the
//! 32-bit (radix) and 64-bit (hash) MTS variants consult. Re-expressed in
//! the struct-of-registers style `libcorevm::memory::paging` uses for x86
//! page tables (`examples/brianmayclone-anyos/libs/libcorevm/src/memory/paging.rs`),
//! substituting a TLB array walk for a page-table walk since MIPS has no
//! guest-resident page tables of its own.

use crate::error::{AccessDirection, AddressErrorKind, Fault, FaultResult};

/// The architectural zone a virtual address falls into (spec.md §4.5
/// step 1). `Kseg23` stands in for `xkseg`/`ksseg`/`kseg2`/`kseg3`: all
/// are TLB-mapped kernel windows and are treated identically by the
/// classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipsZone {
    /// `(x)kuseg`: TLB-mapped, user-accessible.
    Useg,
    /// `(c)kseg0`: unmapped, cached, kernel-only.
    Kseg0,
    /// `(c)kseg1`: unmapped, uncached, kernel-only.
    Kseg1,
    /// `xkseg`/`ksseg`/`kseg2`/`kseg3`: TLB-mapped, kernel-only.
    Kseg23,
    /// `xkphys`: unmapped, kernel-only, cache attribute in address bits
    /// (64-bit guests only).
    Xkphys,
}

/// Classify a virtual address. `is_64bit` selects between the R4000-style
/// 64-bit zone boundaries and the classic 32-bit ones; both share the
/// same `Kseg0`/`Kseg1` unmapped windows at `0x8000_0000`/`0xA000_0000`.
pub fn classify_zone(vaddr: u64, is_64bit: bool) -> MipsZone {
    if is_64bit && (vaddr >> 62) == 0b10 {
        return MipsZone::Xkphys;
    }
    let low32 = vaddr as u32;
    match low32 {
        0x0000_0000..=0x7FFF_FFFF => MipsZone::Useg,
        0x8000_0000..=0x9FFF_FFFF => MipsZone::Kseg0,
        0xA000_0000..=0xBFFF_FFFF => MipsZone::Kseg1,
        _ => MipsZone::Kseg23,
    }
}

/// One software TLB entry: a page-pair mapping (`EntryHi`/`EntryLo0`/
/// `EntryLo1`/`PageMask` folded into one struct).
#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    /// Selects the page size: a run of 1 bits above bit 12 widens the
    /// comparison mask (`PageMask`). `0` means the minimum 4 KiB page.
    pub page_mask: u64,
    /// Virtual page number of the *pair* (bit 0 of the actual page
    /// selects lo0 vs. lo1), already masked to exclude the offset bits.
    pub vpn2: u64,
    pub asid: u8,
    pub global: bool,
    pub v0: bool,
    pub d0: bool,
    pub pfn0: u64,
    pub v1: bool,
    pub d1: bool,
    pub pfn1: u64,
}

impl TlbEntry {
    const INVALID: TlbEntry = TlbEntry {
        page_mask: 0,
        vpn2: 0,
        asid: 0,
        global: false,
        v0: false,
        d0: false,
        pfn0: 0,
        v1: false,
        d1: false,
        pfn1: 0,
    };
}

/// The MIPS software TLB: a fixed-size array of entries written by guest
/// `TLBWI`/`TLBWR` and consulted on every MTS cache miss that falls in a
/// TLB-mapped zone.
pub struct MipsTlb {
    entries: Vec<TlbEntry>,
}

impl MipsTlb {
    pub fn new(nr_entries: usize) -> Self {
        MipsTlb {
            entries: vec![TlbEntry::INVALID; nr_entries],
        }
    }

    pub fn write(&mut self, index: usize, entry: TlbEntry) {
        self.entries[index] = entry;
    }

    pub fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry (and its index, for the MTS reverse-map link)
    /// covering `vaddr`, honouring page size and global/ASID matching.
    fn find(&self, vaddr: u64, asid: u8) -> Option<(usize, &TlbEntry)> {
        self.entries.iter().enumerate().find(|(_, e)| {
            let page_size = (e.page_mask | 0xFFF) + 1; // min 4 KiB (mask=0)
            // vpn2 covers the even/odd page *pair*, so the match mask
            // spans twice the page size (13 bits for a 4 KiB page).
            let vpn2_mask = !((page_size << 1) - 1);
            let addr_vpn2 = vaddr & vpn2_mask;
            let vpn2_match = e.vpn2 & vpn2_mask == addr_vpn2;
            vpn2_match && (e.global || e.asid == asid)
        })
    }

    /// `tlb_lookup`: translate `vaddr` under `asid`, synthesising
    /// `Fault::TlbMiss` on a miss or an invalid/dirty-bit violation
    /// (spec.md §4.5 step 2; §8 scenario 3).
    pub fn lookup(&self, vaddr: u64, asid: u8, direction: AccessDirection) -> FaultResult<u64> {
        let Some((index, entry)) = self.find(vaddr, asid) else {
            return Err(Fault::TlbMiss { vaddr, direction });
        };

        let page_size = (entry.page_mask | 0xFFF) + 1;
        let odd_page = vaddr & page_size != 0;
        let (valid, dirty, pfn) = if odd_page {
            (entry.v1, entry.d1, entry.pfn1)
        } else {
            (entry.v0, entry.d0, entry.pfn0)
        };

        if !valid {
            return Err(Fault::TlbMiss { vaddr, direction });
        }
        if direction == AccessDirection::Store && !dirty {
            // TLB-Modified exception; this core does not distinguish it
            // from a plain store miss at the `Fault` level.
            return Err(Fault::TlbMiss { vaddr, direction });
        }

        let _ = index; // reverse-map linking is the caller's (mts::hash) job
        let page_offset = vaddr & (page_size - 1);
        Ok((pfn << 12) | page_offset)
    }

    /// The TLB index that would service `vaddr`, for reverse-map linking
    /// by the MTS cache after a successful [`MipsTlb::lookup`].
    pub fn index_for(&self, vaddr: u64, asid: u8) -> Option<usize> {
        self.find(vaddr, asid).map(|(i, _)| i)
    }
}

/// `mmu_translate`: the single entry point the MTS slow path calls
/// (spec.md §4.5 step 1-2). Unmapped kernel zones translate directly;
/// everything else goes through the software TLB. A user-mode access to a
/// kernel-only zone raises `AddressError`.
pub fn translate(
    vaddr: u64,
    asid: u8,
    direction: AccessDirection,
    user_mode: bool,
    is_64bit: bool,
    tlb: &MipsTlb,
) -> FaultResult<u64> {
    match classify_zone(vaddr, is_64bit) {
        MipsZone::Kseg0 if !user_mode => Ok(vaddr - 0x8000_0000),
        MipsZone::Kseg1 if !user_mode => Ok(vaddr - 0xA000_0000),
        MipsZone::Xkphys if !user_mode => Ok(vaddr & 0x0000_00FF_FFFF_FFFF),
        MipsZone::Kseg0 | MipsZone::Kseg1 | MipsZone::Xkphys => Err(Fault::AddressError {
            vaddr,
            kind: AddressErrorKind::OutOfZone,
        }),
        MipsZone::Useg | MipsZone::Kseg23 => tlb.lookup(vaddr, asid, direction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kseg1_is_unmapped_uncached_identity() {
        let tlb = MipsTlb::new(16);
        let paddr = translate(0xA000_1234, 0, AccessDirection::Load, false, false, &tlb).unwrap();
        assert_eq!(paddr, 0x0000_1234);
    }

    #[test]
    fn user_mode_access_to_kseg1_is_address_error() {
        let tlb = MipsTlb::new(16);
        let err = translate(0xA000_1234, 0, AccessDirection::Load, true, false, &tlb).unwrap_err();
        assert!(matches!(
            err,
            Fault::AddressError {
                kind: AddressErrorKind::OutOfZone,
                ..
            }
        ));
    }

    #[test]
    fn empty_tlb_misses_with_bad_vaddr() {
        // spec.md §8 scenario 3.
        let tlb = MipsTlb::new(16);
        let err =
            translate(0x0000_1000, 0, AccessDirection::Load, true, false, &tlb).unwrap_err();
        match err {
            Fault::TlbMiss { vaddr, direction } => {
                assert_eq!(vaddr, 0x0000_1000);
                assert_eq!(direction, AccessDirection::Load);
            }
            other => panic!("expected TlbMiss, got {other:?}"),
        }
    }

    #[test]
    fn tlb_hit_translates_through_installed_entry() {
        // One page-pair entry covering vaddr [0, 0x2000): even page (vaddr
        // < 0x1000) maps through pfn0, odd page through pfn1.
        let mut tlb = MipsTlb::new(16);
        tlb.write(
            0,
            TlbEntry {
                page_mask: 0,
                vpn2: 0,
                asid: 7,
                global: false,
                v0: true,
                d0: true,
                pfn0: 0x2,
                v1: true,
                d1: true,
                pfn1: 0x3,
            },
        );
        let paddr = tlb.lookup(0x0000_0000, 7, AccessDirection::Load).unwrap();
        assert_eq!(paddr, 0x2000);
        let paddr_odd = tlb.lookup(0x0000_1000, 7, AccessDirection::Load).unwrap();
        assert_eq!(paddr_odd, 0x3000);
    }
}
