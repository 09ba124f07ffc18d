//! Guest memory subsystem for the emulated router core: device registry,
//! physical memory access, sparse/ghosted RAM, the MTS software TLB
//! cache (radix and hash variants), architectural MMU glue for MIPS and
//! PowerPC, and the handful of concrete device models (ROM/flash,
//! byte-swap alias, NMC93C46/56 EEPROM) whose wiring the memory core
//! itself mediates.
//!
//! Module layout mirrors the component table of SPEC_FULL.md §2; see
//! DESIGN.md for what each module is grounded on.

pub mod config;
pub mod device;
pub mod devices;
pub mod eeprom;
pub mod error;
pub mod ghost;
pub mod jit;
pub mod mmu;
pub mod mts;
pub mod physmem;
pub mod registry;
pub mod sparse;
pub mod vm;

pub use config::{BackingKind, CpuArch, CpuMtsConfig, DeviceConfig, MtsKind, VmConfig};
pub use device::{
    flags, AccessOp, AccessSize, Device, DeviceFlags, DeviceOps, HandlerResult, HostBacking,
};
pub use error::{
    AccessDirection, AddressErrorKind, BusError, BusResult, Fault, FaultResult, SetupError,
    SetupResult,
};
pub use jit::{CodeCacheHook, NullCodeCacheHook};
pub use registry::{DeviceSummary, VmDeviceSpace};
pub use sparse::{SparsePageArena, SparsePageTable};
pub use vm::{Vm, VmState, VmStateCell};
