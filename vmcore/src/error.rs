//! Error taxonomy for the guest memory subsystem.
//!
//! Three enums, one per propagation channel described in the design:
//! bind-time failures ([`SetupError`]) abort VM bring-up and are reported
//! to the caller of the construction API; translation exceptions
//! ([`Fault`]) are synthesised by the MTS slow path and returned as a
//! non-zero fault code to the CPU dispatch loop; device-handler failures
//! that cannot be represented architecturally ([`BusError`]) are logged
//! and either silently dropped (read/write) or escalated by the caller.
//!
//! None of these ever unwind across a component boundary — see spec.md
//! §7/§9, "the core never longjumps".

use thiserror::Error;

/// Failures that can occur while binding, unbinding, or wiring up devices.
///
/// These abort VM bring-up; there is no recovery path for them short of
/// fixing the chassis wiring code that produced them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("no free device ID slots (VM_DEVICE_MAX exceeded)")]
    OutOfDeviceSlots,

    #[error(
        "device '{new_name}' at [{new_addr:#x}, {new_end:#x}) overlaps caching device \
         '{existing_name}' at [{existing_addr:#x}, {existing_end:#x})"
    )]
    OverlappingCachedRange {
        new_name: String,
        new_addr: u64,
        new_end: u64,
        existing_name: String,
        existing_addr: u64,
        existing_end: u64,
    },

    #[error("failed to map file backing for device '{name}' at '{path}': {reason}")]
    FileBackingFailed {
        name: String,
        path: String,
        reason: String,
    },

    #[error("ghost image '{path}' is unavailable: {reason}")]
    GhostImageUnavailable { path: String, reason: String },

    #[error("device '{name}' has zero-length physical range")]
    ZeroLengthDevice { name: String },
}

/// An architectural translation exception synthesised by the MTS slow path.
///
/// Each variant carries enough information for the CPU dispatch loop to
/// set the architectural registers the guest ISA expects (`BadVAddr`,
/// `DSISR`, `DAR`, the MIPS `Cause` exception code, …) before taking the
/// exception at the instruction boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Misaligned or out-of-zone virtual access.
    #[error("address error at {vaddr:#x} ({kind:?})")]
    AddressError { vaddr: u64, kind: AddressErrorKind },

    /// MIPS TLB miss (load or store side).
    #[error("TLB miss at {vaddr:#x} ({direction:?})")]
    TlbMiss {
        vaddr: u64,
        direction: AccessDirection,
    },

    /// PPC BAT miss — falls through to segment/page translation.
    #[error("BAT miss at {vaddr:#x}")]
    BatMiss { vaddr: u64 },

    /// PPC segment-register miss (DSI/ISI with `DSISR.NOTRANS`).
    #[error("segment miss at {vaddr:#x} ({direction:?})")]
    SegmentMiss {
        vaddr: u64,
        direction: AccessDirection,
    },

    /// A device handler signalled a fatal condition.
    #[error("bus fault from device '{device}' at offset {offset:#x}: {reason}")]
    BusFault {
        device: String,
        offset: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressErrorKind {
    Misaligned,
    OutOfZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Load,
    Store,
}

/// Non-fatal bus-level errors raised by the physical-memory access API.
///
/// Per spec.md §4.2, most conditions (unmapped reads/writes, DMA across a
/// pure-MMIO region) are *not* errors — they are defined, silent
/// behaviour. `BusError` exists for the remaining cases that callers need
/// to observe explicitly (device handler panics are not among them; those
/// are programming bugs, not `BusError`s).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("DMA transfer requires both endpoints to be host-backed RAM; {detail}")]
    DmaRequiresHostBacked { detail: String },
}

pub type SetupResult<T> = Result<T, SetupError>;
pub type FaultResult<T> = Result<T, Fault>;
pub type BusResult<T> = Result<T, BusError>;
