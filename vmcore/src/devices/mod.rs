//! Concrete `DeviceOps` device models mounted onto a [`crate::registry::VmDeviceSpace`].
//!
//! These are the MMIO-contract surfaces spec.md §2 names as components
//! G/H/I: the EEPROM bit-bang register, the byte-swap alias, and the
//! ROM/flash backings. Per-chassis wiring of *which* devices live at
//! *which* address for a given router model is out of scope (spec.md
//! §1); only the device models themselves are.

pub mod bswap;
pub mod eeprom_io;
pub mod flash;
pub mod rom;
