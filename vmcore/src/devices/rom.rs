//! Read-only ROM backing (spec.md §4.8, "The ROM device is a simple
//! read-only backing with a fixed base image; writes are logged and
//! ignored").
//!
//! Grounded on `dev_rom_access`/`dev_rom_init` in
//! `examples/original_source/common/dev_rom.c`, which exposes the ROM
//! image through a bare host pointer whenever the offset is fully in
//! range. This device keeps that shape (`HandlerResult::HostPtr` so the
//! MTS fast path applies the same guest-endian conversion a direct
//! host-backed page would — spec.md §4.4's "Fast path for host-backed
//! entries" — rather than the handler guessing byte order itself) and
//! only falls back to a synthesized zero read past the image's real
//! length, where the original's `if (offset >= d->rom_size) { *data = 0;
//! ... }` applies (the device's bound range may be rounded up to a page
//! multiple while the image itself is shorter).

use crate::device::{AccessOp, AccessSize, DeviceOps, HandlerResult};

/// A fixed, read-only image mounted at a guest physical range. Reads past
/// `image.len()` but still inside the device's `phys_len` return zero.
pub struct Rom {
    image: Vec<u8>,
}

impl Rom {
    pub fn new(image: Vec<u8>) -> Self {
        Rom { image }
    }
}

impl DeviceOps for Rom {
    fn access(
        &mut self,
        _cpu_id: u32,
        offset: u64,
        size: AccessSize,
        op: AccessOp,
        data: &mut u64,
    ) -> HandlerResult {
        if op == AccessOp::Write {
            log::warn!("ROM: write attempt at offset {:#x} (data={:#x})", offset, data);
            return HandlerResult::Handled { data: 0 };
        }

        let off = offset as usize;
        let n = size.bytes() as usize;
        // Only hand back a raw pointer when the whole access fits inside
        // the image; a read straddling the image's real end still needs
        // the zero-padding `Handled` path below since there is no backing
        // byte for it to point at.
        if let Some(end) = off.checked_add(n) {
            if end <= self.image.len() {
                return HandlerResult::HostPtr(unsafe { self.image.as_mut_ptr().add(off) });
            }
        }
        HandlerResult::Handled { data: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_in_range_bytes_from_image() {
        let mut rom = Rom::new(vec![0x3C, 0x00, 0x00, 0x08]);
        let mut data = 0u64;
        let result = rom.access(0, 0, AccessSize::Word, AccessOp::Read, &mut data);
        match result {
            HandlerResult::HostPtr(ptr) => unsafe {
                assert_eq!(std::slice::from_raw_parts(ptr, 4), &[0x3C, 0x00, 0x00, 0x08]);
            },
            _ => panic!("expected HostPtr"),
        }
    }

    #[test]
    fn reads_past_image_end_return_zero() {
        let mut rom = Rom::new(vec![0xAB]);
        let mut data = 0u64;
        let result = rom.access(0, 0x100, AccessSize::Byte, AccessOp::Read, &mut data);
        match result {
            HandlerResult::Handled { data } => assert_eq!(data, 0),
            _ => panic!("expected Handled"),
        }
    }

    #[test]
    fn partial_overrun_at_image_end_falls_back_to_zero_fill() {
        // A 4-byte word read starting 1 byte before a 2-byte image ends:
        // not fully in range, so it must not hand back a raw pointer.
        let mut rom = Rom::new(vec![0xAB, 0xCD]);
        let mut data = 0u64;
        let result = rom.access(0, 1, AccessSize::Word, AccessOp::Read, &mut data);
        assert!(matches!(result, HandlerResult::Handled { data: 0 }));
    }

    #[test]
    fn writes_are_dropped() {
        let mut rom = Rom::new(vec![0x11; 16]);
        let mut data = 0xFFu64;
        rom.access(0, 0, AccessSize::Byte, AccessOp::Write, &mut data);
        let mut readback = 0u64;
        let result = rom.access(0, 0, AccessSize::Byte, AccessOp::Read, &mut readback);
        match result {
            HandlerResult::HostPtr(ptr) => unsafe {
                assert_eq!(*ptr, 0x11);
            },
            _ => panic!("expected HostPtr"),
        }
    }
}
