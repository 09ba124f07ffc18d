//! The Device abstraction: a named, addressed region of guest physical
//! memory with an access handler and optional host-memory backing.
//!
//! Grounded on `dev_create`/`dev_init`/`struct vdevice` in
//! `examples/original_source/device.c` and `memory.h`, re-expressed in the
//! trait-object style `libcorevm::memory::mmio::MmioHandler` uses for its
//! device models (`examples/brianmayclone-anyos/libs/libcorevm/src/memory/mmio.rs`).

use std::fmt;
use std::sync::Mutex;

/// Width in bytes of a single guest memory access.
///
/// The dynamips original represents this as a plain `u_int op_size`
/// (1/2/4/8); modeling it as an enum makes illegal sizes unrepresentable
/// at the device-handler boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte = 1,
    Half = 2,
    Word = 4,
    Dword = 8,
}

impl AccessSize {
    pub fn bytes(self) -> u64 {
        self as u64
    }

    pub fn from_bytes(n: u64) -> Option<Self> {
        match n {
            1 => Some(AccessSize::Byte),
            2 => Some(AccessSize::Half),
            4 => Some(AccessSize::Word),
            8 => Some(AccessSize::Dword),
            _ => None,
        }
    }
}

/// Direction of a device access: `MTS_READ` / `MTS_WRITE` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    Read,
    Write,
}

/// The standard page size of the MMU this core serves: 4 KiB on both
/// MIPS and PPC guests (spec.md §3, "Page size is the MMU's minimum page
/// size").
pub const VM_PAGE_SIZE: u64 = 4096;
pub const VM_PAGE_SHIFT: u32 = 12;
pub const VM_PAGE_IMASK: u64 = VM_PAGE_SIZE - 1;
pub const VM_PAGE_MASK: u64 = !VM_PAGE_IMASK;

/// Upper bound on the number of devices a single VM may bind
/// (`VM_DEVICE_MAX` in spec.md §3/§4.1).
pub const VM_DEVICE_MAX: usize = 1000;

/// Device attribute flags (spec.md §3, `Device.flags`).
///
/// Kept as plain bit constants on a `u32`, matching the style the teacher
/// crate uses for CPU control-register flags (`registers::CR0_PG` and
/// friends) rather than pulling in the `bitflags` crate, which nothing
/// else in the reference pack's systems-VMM corner depends on for this
/// kind of small, fixed flag set.
pub mod flags {
    /// Device is eligible for MTS caching; no two `CACHING` devices may
    /// overlap in the guest physical address space.
    pub const CACHING: u32 = 1 << 0;
    /// Force handler dispatch even though the device is host-backed.
    pub const NO_MTS_MMAP: u32 = 1 << 1;
    /// Device backing is lazily allocated per guest page.
    pub const SPARSE: u32 = 1 << 2;
    /// Device shares a read-only base image; writes copy-on-write.
    pub const GHOST: u32 = 1 << 3;
    /// A second window onto an existing device's backing/handler/sparse map.
    pub const REMAP: u32 = 1 << 4;
    /// msync the backing on teardown.
    pub const SYNC: u32 = 1 << 5;
}

/// Thin bitset wrapper over [`flags`] so callers write
/// `DeviceFlags::new(flags::CACHING | flags::SPARSE)` instead of bare u32
/// arithmetic at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFlags(pub u32);

impl DeviceFlags {
    pub const fn new(bits: u32) -> Self {
        DeviceFlags(bits)
    }

    pub const fn empty() -> Self {
        DeviceFlags(0)
    }

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u32) {
        self.0 &= !bit;
    }
}

/// Result of a device-handler access (spec.md §4, "Device-handler ABI").
///
/// A handler either hands back a host pointer the caller may complete the
/// access with directly (`HostPtr`), or has already performed the access
/// itself, leaving the authoritative value in `data` for loads (`Handled`).
pub enum HandlerResult {
    /// Caller should dereference `host_addr + (offset & VM_PAGE_IMASK)`
    /// directly. Used by devices whose handler exists only to decide
    /// *which* backing byte range to expose (e.g. the byte-swap alias).
    HostPtr(*mut u8),
    /// The handler has already performed the access; for a read, `data`
    /// carries the authoritative result in host byte order.
    Handled { data: u64 },
}

/// A raw, page-aligned host-memory backing for a [`Device`].
///
/// Owns the allocation for the device's lifetime (spec.md §3 invariants:
/// "A Device's `host_addr` ... remain[s] valid for the Device's
/// lifetime"). Two origins are supported: anonymous pages (pure RAM, no
/// persistence) and file-backed `mmap` (NVRAM/flash/ghost images,
/// spec.md §6 "Persisted state layout").
pub struct HostBacking {
    pub ptr: *mut u8,
    pub len: usize,
    /// File descriptor backing this mapping, if any (closed on drop along
    /// with the mapping, per spec.md §4.1 `unbind`).
    pub fd: Option<std::fs::File>,
    /// `msync` on drop (the `SYNC` flag).
    pub sync_on_drop: bool,
    /// Whether this is a shared read-only mapping we must not munmap
    /// ourselves (owned instead by the process-wide ghost-image cache).
    pub borrowed: bool,
}

// Safety: the pointer is a page-aligned mmap/malloc allocation; all
// mutation through it is serialized by the owning Device's handler
// discipline (spec.md §5, "device state is protected by the device's own
// mutex").
unsafe impl Send for HostBacking {}
unsafe impl Sync for HostBacking {}

impl HostBacking {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for HostBacking {
    fn drop(&mut self) {
        if self.borrowed || self.ptr.is_null() {
            return;
        }
        if self.sync_on_drop {
            unsafe {
                libc::msync(self.ptr as *mut libc::c_void, self.len, libc::MS_SYNC);
            }
        }
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// The callback contract a device model implements to answer MMIO
/// accesses (spec.md §4, "handler").
///
/// `cpu_id` stands in for the `cpu_gen_t *cpu` parameter of the original:
/// the core does not know or care about CPU internals beyond an opaque
/// identifier a handler may use for diagnostics (e.g. to log which CPU
/// triggered a bus fault).
pub trait DeviceOps: Send {
    /// Service one access. `offset` is relative to the device's
    /// `phys_addr`. `data` is the value to write (ignored for reads) and,
    /// for `Handled` results on a read, receives the authoritative value.
    fn access(
        &mut self,
        cpu_id: u32,
        offset: u64,
        size: AccessSize,
        op: AccessOp,
        data: &mut u64,
    ) -> HandlerResult;

    /// Optional teardown hook invoked by `unbind` before the device's
    /// host backing is released (e.g. to flush internal buffers).
    fn shutdown(&mut self) {}
}

/// A bound device instance (spec.md §3, "Device").
pub struct Device {
    pub name: String,
    /// Dense small integer assigned at bind time (spec.md §3 `id`).
    pub id: u32,
    pub phys_addr: u64,
    pub phys_len: u64,
    pub flags: DeviceFlags,
    /// Host-memory backing, if any (`None` for pure MMIO devices).
    pub backing: Option<HostBacking>,
    /// Sparse page table, if `SPARSE` is set.
    pub sparse: Option<Mutex<crate::sparse::SparsePageTable>>,
    /// The device-specific handler. Pure-MMIO and command-sequence
    /// devices (ROM, flash, byte-swap, EEPROM-backed I/O-FPGA regions)
    /// set this; plain RAM devices served entirely by host-pointer
    /// dereference leave it `None`.
    pub handler: Option<Mutex<Box<dyn DeviceOps>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .field("phys_len", &format_args!("{:#x}", self.phys_len))
            .field("flags", &self.flags.0)
            .finish()
    }
}

impl Device {
    pub fn phys_end(&self) -> u64 {
        self.phys_addr + self.phys_len
    }

    pub fn contains(&self, paddr: u64) -> bool {
        paddr >= self.phys_addr && (paddr - self.phys_addr) < self.phys_len
    }

    pub fn host_addr(&self) -> Option<*mut u8> {
        self.backing.as_ref().map(|b| b.ptr)
    }

    /// Host pointer for `paddr`, honoring the `NO_MTS_MMAP` flag — used by
    /// both the physical-memory access API and the MTS slow-lookup path.
    /// Returns `None` for sparse or pure-MMIO devices.
    pub fn direct_host_ptr(&self, paddr: u64) -> Option<*mut u8> {
        if self.flags.contains(flags::SPARSE) || self.flags.contains(flags::NO_MTS_MMAP) {
            return None;
        }
        let backing = self.backing.as_ref()?;
        let off = (paddr - self.phys_addr) as usize;
        Some(unsafe { backing.ptr.add(off) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_size_roundtrip() {
        for (n, sz) in [
            (1u64, AccessSize::Byte),
            (2, AccessSize::Half),
            (4, AccessSize::Word),
            (8, AccessSize::Dword),
        ] {
            assert_eq!(AccessSize::from_bytes(n), Some(sz));
            assert_eq!(sz.bytes(), n);
        }
        assert_eq!(AccessSize::from_bytes(3), None);
    }

    #[test]
    fn device_contains_is_half_open() {
        let dev = Device {
            name: "test".into(),
            id: 0,
            phys_addr: 0x1000,
            phys_len: 0x100,
            flags: DeviceFlags::empty(),
            backing: None,
            sparse: None,
            handler: None,
        };
        assert!(!dev.contains(0x0FFF));
        assert!(dev.contains(0x1000));
        assert!(dev.contains(0x10FF));
        assert!(!dev.contains(0x1100));
    }
}
