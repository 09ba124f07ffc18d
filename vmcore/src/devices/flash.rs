//! Intel 28Fxxx-style command-sequence flash (spec.md §4.8, §6).
//!
//! Grounded on the flash state-machine shape of `flash_access`/`flash_cmd`
//! in `examples/original_source/dev_bootflash.c` (unlock-cycle decode
//! driving a small enum of pending-command states), but the exact cycle
//! opcodes implemented here follow spec.md §6's table verbatim — the
//! original's `flash_cmd` uses a different, simpler single-cycle command
//! set (`0x20` erase, `0x90` read-ID, no `0xAA`/`0x55` unlock pair). The
//! two-cycle AMD/Intel-style unlock sequence spec.md §6 specifies is
//! followed exactly here; see DESIGN.md for why this departs from the
//! original source's opcode table instead of porting it literally.

use crate::device::{AccessOp, AccessSize, DeviceOps, HandlerResult};

const UNLOCK_ADDR1: u64 = 0xAAA;
const UNLOCK_ADDR2: u64 = 0x555;
const UNLOCK_BYTE1: u64 = 0xAA;
const UNLOCK_BYTE2: u64 = 0x55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reads return the backing array directly; writes are interpreted
    /// as the first unlock cycle.
    ReadArray,
    /// Saw `0xAA@0xAAA`; waiting for `0x55@0x555`.
    Unlock1,
    /// Saw the full unlock pair; waiting for the command byte at `0xAAA`.
    Unlock2,
    /// Saw `0x80@0xAAA` after an unlock pair; waiting for a second
    /// `0xAA@0xAAA`.
    EraseUnlock1,
    /// Waiting for the second unlock's `0x55@0x555`.
    EraseUnlock2,
    /// Waiting for the erase-confirm byte (`0x10` chip, `0x30` sector).
    EraseUnlock3,
    /// Saw `0xA0@0xAAA`; the next write programs a byte/word.
    Program,
    /// Saw `0x90@0xAAA`; reads return manufacturer/device ID.
    ReadId,
}

/// Manufacturer/device identifier pair returned while in [`State::ReadId`]
/// (spec.md §6, "Read manufacturer/device ID").
#[derive(Debug, Clone, Copy)]
pub struct FlashId {
    pub manufacturer: u8,
    pub device: u8,
}

/// An Intel 28Fxxx-style flash SIMM: a byte array plus the command state
/// machine of spec.md §4.8/§6.
pub struct Flash {
    data: Vec<u8>,
    sector_size: usize,
    id: FlashId,
    state: State,
}

impl Flash {
    /// `data` seeds the initial contents (e.g. a loaded bootflash image);
    /// its length also bounds erase/program offsets.
    pub fn new(data: Vec<u8>, sector_size: usize, id: FlashId) -> Self {
        Flash {
            data,
            sector_size,
            id,
            state: State::ReadArray,
        }
    }

    fn sector_bounds(&self, addr: usize) -> (usize, usize) {
        let start = (addr / self.sector_size) * self.sector_size;
        let end = (start + self.sector_size).min(self.data.len());
        (start, end)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl DeviceOps for Flash {
    fn access(
        &mut self,
        _cpu_id: u32,
        offset: u64,
        size: AccessSize,
        op: AccessOp,
        data: &mut u64,
    ) -> HandlerResult {
        if op == AccessOp::Read {
            // `ReadArray` hands back a raw pointer into the backing array
            // (when the access fits fully inside it) rather than
            // assembling a `Handled` value itself, so the MTS fast path
            // applies the same guest-endian conversion a direct
            // host-backed page would (spec.md §4.4) — a hand-assembled
            // value here would have to guess the guest's byte order,
            // which the `DeviceOps` handler ABI does not carry.
            if self.state == State::ReadArray {
                let off = offset as usize;
                let n = size.bytes() as usize;
                if let Some(end) = off.checked_add(n) {
                    if end <= self.data.len() {
                        return HandlerResult::HostPtr(unsafe { self.data.as_mut_ptr().add(off) });
                    }
                }
                return HandlerResult::Handled { data: 0 };
            }

            let value = match self.state {
                State::ReadId => match offset {
                    0x00 => self.id.manufacturer as u64,
                    0x01 => self.id.device as u64,
                    _ => 0x00,
                },
                // Status register read: bit 7 set means "ready" (no
                // program/erase in progress, since this model completes
                // them synchronously within the triggering write).
                _ => 0x80,
            };
            return HandlerResult::Handled { data: value };
        }

        let byte = (*data & 0xFF) as u64;

        self.state = match self.state {
            State::ReadArray => {
                if offset == UNLOCK_ADDR1 && byte == UNLOCK_BYTE1 {
                    State::Unlock1
                } else {
                    State::ReadArray
                }
            }
            State::Unlock1 => {
                if offset == UNLOCK_ADDR2 && byte == UNLOCK_BYTE2 {
                    State::Unlock2
                } else {
                    State::ReadArray
                }
            }
            State::Unlock2 => {
                if offset != UNLOCK_ADDR1 {
                    State::ReadArray
                } else {
                    match byte {
                        0x80 => State::EraseUnlock1,
                        0xA0 => State::Program,
                        0x90 => State::ReadId,
                        _ => State::ReadArray,
                    }
                }
            }
            State::EraseUnlock1 => {
                if offset == UNLOCK_ADDR1 && byte == UNLOCK_BYTE1 {
                    State::EraseUnlock2
                } else {
                    State::ReadArray
                }
            }
            State::EraseUnlock2 => {
                if offset == UNLOCK_ADDR2 && byte == UNLOCK_BYTE2 {
                    State::EraseUnlock3
                } else {
                    State::ReadArray
                }
            }
            State::EraseUnlock3 => {
                match byte {
                    0x10 => {
                        log::info!("flash: chip erase ({} bytes)", self.data.len());
                        self.data.iter_mut().for_each(|b| *b = 0x00);
                    }
                    0x30 => {
                        let (start, end) = self.sector_bounds(offset as usize);
                        log::info!("flash: sector erase [{:#x}, {:#x})", start, end);
                        self.data[start..end].iter_mut().for_each(|b| *b = 0x00);
                    }
                    _ => {}
                }
                State::ReadArray
            }
            State::Program => {
                self.state = State::ReadArray;
                // Same reasoning as the `ReadArray` read path: hand back
                // a raw pointer so the MTS fast path lays the bytes down
                // with the guest's own endian conversion
                // (`crate::mts::write_raw`) instead of this handler
                // guessing a byte order it is never told.
                let off = offset as usize;
                let n = size.bytes() as usize;
                if let Some(end) = off.checked_add(n) {
                    if end <= self.data.len() {
                        return HandlerResult::HostPtr(unsafe {
                            self.data.as_mut_ptr().add(off)
                        });
                    }
                }
                return HandlerResult::Handled { data: *data };
            }
            State::ReadId => State::ReadArray,
        };

        HandlerResult::Handled { data: *data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlock_cmd(flash: &mut Flash, cmd: u8) {
        let mut d1 = UNLOCK_BYTE1;
        flash.access(0, UNLOCK_ADDR1, AccessSize::Byte, AccessOp::Write, &mut d1);
        let mut d2 = UNLOCK_BYTE2;
        flash.access(0, UNLOCK_ADDR2, AccessSize::Byte, AccessOp::Write, &mut d2);
        let mut d3 = cmd as u64;
        flash.access(0, UNLOCK_ADDR1, AccessSize::Byte, AccessOp::Write, &mut d3);
    }

    #[test]
    fn sector_erase_clears_sector_leaves_rest() {
        // spec.md §8 scenario 6.
        let sector_size = 0x4000;
        let mut image = vec![0u8; 0x10000];
        image[0x4000] = 0x42;
        let mut flash = Flash::new(
            image,
            sector_size,
            FlashId {
                manufacturer: 0x89,
                device: 0xA2,
            },
        );

        unlock_cmd(&mut flash, 0x80);
        let mut d1 = UNLOCK_BYTE1;
        flash.access(0, UNLOCK_ADDR1, AccessSize::Byte, AccessOp::Write, &mut d1);
        let mut d2 = UNLOCK_BYTE2;
        flash.access(0, UNLOCK_ADDR2, AccessSize::Byte, AccessOp::Write, &mut d2);
        let mut confirm = 0x30u64;
        flash.access(0, 0x4000, AccessSize::Byte, AccessOp::Write, &mut confirm);

        for off in 0x4000u64..0x8000 {
            let mut v = 0u64;
            let r = flash.access(0, off, AccessSize::Byte, AccessOp::Read, &mut v);
            match r {
                HandlerResult::HostPtr(ptr) => assert_eq!(unsafe { *ptr }, 0),
                _ => panic!("expected HostPtr"),
            }
        }
        let mut v0 = 0u64;
        let r0 = flash.access(0, 0x0000, AccessSize::Byte, AccessOp::Read, &mut v0);
        match r0 {
            HandlerResult::HostPtr(ptr) => assert_eq!(unsafe { *ptr }, 0),
            _ => panic!("expected HostPtr"),
        }
    }

    #[test]
    fn read_id_returns_manufacturer_and_device() {
        let mut flash = Flash::new(
            vec![0u8; 0x1000],
            0x1000,
            FlashId {
                manufacturer: 0x89,
                device: 0xA2,
            },
        );
        unlock_cmd(&mut flash, 0x90);

        let mut man = 0u64;
        let r = flash.access(0, 0x00, AccessSize::Byte, AccessOp::Read, &mut man);
        assert!(matches!(r, HandlerResult::Handled { data: 0x89 }));

        let mut dev = 0u64;
        let r = flash.access(0, 0x01, AccessSize::Byte, AccessOp::Read, &mut dev);
        assert!(matches!(r, HandlerResult::Handled { data: 0xA2 }));
    }

    #[test]
    fn byte_program_writes_through_after_unlock() {
        let mut flash = Flash::new(
            vec![0u8; 0x1000],
            0x1000,
            FlashId {
                manufacturer: 0x89,
                device: 0xA2,
            },
        );
        unlock_cmd(&mut flash, 0xA0);
        let mut v = 0x77u64;
        let program_result = flash.access(0, 0x10, AccessSize::Byte, AccessOp::Write, &mut v);
        // `Program` hands back a raw pointer rather than writing `v`
        // itself (see the module doc comment); the caller — here, the
        // test standing in for the MTS fast path — completes the store.
        match program_result {
            HandlerResult::HostPtr(ptr) => unsafe { *ptr = 0x77 },
            _ => panic!("expected HostPtr"),
        }

        let mut out = 0u64;
        let r = flash.access(0, 0x10, AccessSize::Byte, AccessOp::Read, &mut out);
        match r {
            HandlerResult::HostPtr(ptr) => assert_eq!(unsafe { *ptr }, 0x77),
            _ => panic!("expected HostPtr"),
        }
    }

    #[test]
    fn unrelated_write_outside_unlock_sequence_is_ignored() {
        let mut flash = Flash::new(vec![0xAB; 0x10], 0x10, FlashId { manufacturer: 0, device: 0 });
        let mut v = 0x99u64;
        flash.access(0, 0x5, AccessSize::Byte, AccessOp::Write, &mut v);
        let mut out = 0u64;
        let r = flash.access(0, 0x5, AccessSize::Byte, AccessOp::Read, &mut out);
        match r {
            HandlerResult::HostPtr(ptr) => assert_eq!(unsafe { *ptr }, 0xAB),
            _ => panic!("expected HostPtr"),
        }
    }
}
