//! MMIO wiring for one [`EepromGroup`](crate::eeprom::EepromGroup): the
//! single bit-bang register described in spec.md §4.7/§6.
//!
//! The group's protocol state machine lives in [`crate::eeprom`] and is
//! chassis-agnostic; this module is the thin `DeviceOps` adapter that
//! exposes it at a physical offset the way an I/O-FPGA's EEPROM-control
//! register would (the chassis-specific register layout around it —
//! which other bits of the I/O-FPGA word mean what — is out of scope per
//! spec.md §1, "the per-peripheral wire-level semantics... is out of
//! scope except where the memory core exposes interfaces to them").

use crate::device::{AccessOp, AccessSize, DeviceOps, HandlerResult};
use crate::eeprom::EepromGroup;

/// A single-register MMIO device backed by an [`EepromGroup`].
pub struct EepromRegister {
    group: EepromGroup,
}

impl EepromRegister {
    pub fn new(group: EepromGroup) -> Self {
        EepromRegister { group }
    }

    pub fn group(&self) -> &EepromGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut EepromGroup {
        &mut self.group
    }
}

impl DeviceOps for EepromRegister {
    fn access(
        &mut self,
        _cpu_id: u32,
        _offset: u64,
        _size: AccessSize,
        op: AccessOp,
        data: &mut u64,
    ) -> HandlerResult {
        match op {
            AccessOp::Read => HandlerResult::Handled {
                data: self.group.read() as u64,
            },
            AccessOp::Write => {
                self.group.write(*data as u32);
                HandlerResult::Handled { data: *data }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eeprom::{DoutDefault, EepromKind, EepromPins};

    #[test]
    fn register_write_then_read_round_trips_through_group() {
        let pins = EepromPins {
            clock_bit: 1,
            select_bit: 0,
            din_bit: 2,
            dout_bit: 3,
        };
        let mut group = EepromGroup::new(EepromKind::Nmc93C46, false, DoutDefault::High);
        group.add_chip(pins, Some(vec![0xDE, 0xAD]));
        let mut dev = EepromRegister::new(group);

        let mut data = 1u64; // select line high
        let result = dev.access(0, 0, AccessSize::Word, AccessOp::Write, &mut data);
        assert!(matches!(result, HandlerResult::Handled { .. }));

        let mut readback = 0u64;
        let result = dev.access(0, 0, AccessSize::Word, AccessOp::Read, &mut readback);
        match result {
            HandlerResult::Handled { data } => assert_eq!(data & 1, 1),
            _ => panic!("expected Handled"),
        }
    }
}
