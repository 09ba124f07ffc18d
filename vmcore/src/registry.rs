//! The VM device registry: an ordered set of bound [`Device`]s plus a
//! dense ID-indexed table for O(1) dispatch.
//!
//! Grounded on `dev_get_by_id` / `dev_lookup` / `dev_lookup_next` /
//! `vm_bind_device` / `vm_unbind_device` in `examples/original_source/
//! device.c` (spec.md §4.1).

use std::sync::RwLock;

use crate::device::{flags, Device, VM_DEVICE_MAX};
use crate::error::{SetupError, SetupResult};

/// A diagnostic summary of a bound device, used by [`VmDeviceSpace::dump`]
/// (grounded on `dev_show`/`dev_show_list` in `device.c`).
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub name: String,
    pub id: u32,
    pub phys_addr: u64,
    pub phys_len: u64,
    pub flags: u32,
}

/// The VM's address space: the ordered device list plus the dense ID
/// table (spec.md §3, "VM address space").
///
/// Registry mutation (`bind`/`unbind`) takes the write side of an
/// `RwLock`; the hot MTS slow-lookup path takes the read side, matching
/// spec.md §5's "Address-space registry mutations... take a VM-wide
/// write lock; readers on the hot path do not take the lock [beyond a
/// shared read] and instead rely on a rebuild of the MTS cache after any
/// mutation."
pub struct VmDeviceSpace {
    inner: RwLock<Inner>,
}

struct Inner {
    /// Ordered by ascending `phys_addr`, as `vm_bind_device` maintains.
    ordered: Vec<u32>,
    /// Dense id -> Device. `None` marks a free slot.
    by_id: Vec<Option<Device>>,
    free_ids: Vec<u32>,
}

impl VmDeviceSpace {
    pub fn new() -> Self {
        VmDeviceSpace {
            inner: RwLock::new(Inner {
                ordered: Vec::new(),
                by_id: Vec::new(),
                free_ids: Vec::new(),
            }),
        }
    }

    /// Bind a device, assigning it the next free ID and inserting it into
    /// the ordered-by-address list. Fails if a `CACHING` device would
    /// overlap another `CACHING` device (spec.md §3 invariant), if the
    /// device has zero length, or if the VM is out of device slots.
    pub fn bind(&self, mut dev: Device) -> SetupResult<u32> {
        let mut inner = self.inner.write().unwrap();

        if dev.phys_len == 0 {
            return Err(SetupError::ZeroLengthDevice { name: dev.name });
        }

        if dev.flags.contains(flags::CACHING) {
            for &id in &inner.ordered {
                let existing = inner.by_id[id as usize].as_ref().unwrap();
                if !existing.flags.contains(flags::CACHING) {
                    continue;
                }
                let overlaps = dev.phys_addr < existing.phys_end()
                    && existing.phys_addr < dev.phys_end();
                if overlaps {
                    return Err(SetupError::OverlappingCachedRange {
                        new_name: dev.name.clone(),
                        new_addr: dev.phys_addr,
                        new_end: dev.phys_end(),
                        existing_name: existing.name.clone(),
                        existing_addr: existing.phys_addr,
                        existing_end: existing.phys_end(),
                    });
                }
            }
        }

        let id = if let Some(id) = inner.free_ids.pop() {
            id
        } else {
            let id = inner.by_id.len();
            if id >= VM_DEVICE_MAX {
                return Err(SetupError::OutOfDeviceSlots);
            }
            inner.by_id.push(None);
            id as u32
        };

        dev.id = id;
        let phys_addr = dev.phys_addr;
        inner.by_id[id as usize] = Some(dev);

        let insert_at = inner
            .ordered
            .iter()
            .position(|&existing_id| {
                inner.by_id[existing_id as usize].as_ref().unwrap().phys_addr > phys_addr
            })
            .unwrap_or(inner.ordered.len());
        inner.ordered.insert(insert_at, id);

        log::debug!("bound device id={} at {:#x}", id, phys_addr);
        Ok(id)
    }

    /// Remove a device by ID, releasing its host backing per its flags
    /// (the backing's `Drop` impl performs the msync/munmap/close).
    pub fn unbind(&self, id: u32) -> Option<Device> {
        let mut inner = self.inner.write().unwrap();
        let dev = inner.by_id.get_mut(id as usize)?.take()?;
        inner.ordered.retain(|&existing| existing != id);
        inner.free_ids.push(id);
        log::debug!("unbound device id={} ({})", id, dev.name);
        Some(dev)
    }

    pub fn lookup_by_id<R>(&self, id: u32, f: impl FnOnce(Option<&Device>) -> R) -> R {
        let inner = self.inner.read().unwrap();
        f(inner.by_id.get(id as usize).and_then(|d| d.as_ref()))
    }

    pub fn lookup_by_id_mut<R>(&self, id: u32, f: impl FnOnce(Option<&mut Device>) -> R) -> R {
        let mut inner = self.inner.write().unwrap();
        f(inner.by_id.get_mut(id as usize).and_then(|d| d.as_mut()))
    }

    /// `dev_lookup`: the unique device containing `paddr`.
    pub fn lookup_by_phys<R>(
        &self,
        paddr: u64,
        cached_only: bool,
        f: impl FnOnce(Option<&Device>) -> R,
    ) -> R {
        let inner = self.inner.read().unwrap();
        for &id in &inner.ordered {
            let dev = inner.by_id[id as usize].as_ref().unwrap();
            if cached_only && !dev.flags.contains(flags::CACHING) {
                continue;
            }
            if dev.contains(paddr) {
                return f(Some(dev));
            }
        }
        f(None)
    }

    /// `dev_lookup_next`: smallest `phys_addr > paddr` matching the filter.
    pub fn lookup_next<R>(
        &self,
        paddr: u64,
        cached_only: bool,
        f: impl FnOnce(Option<&Device>) -> R,
    ) -> R {
        let inner = self.inner.read().unwrap();
        for &id in &inner.ordered {
            let dev = inner.by_id[id as usize].as_ref().unwrap();
            if cached_only && !dev.flags.contains(flags::CACHING) {
                continue;
            }
            if dev.phys_addr > paddr {
                return f(Some(dev));
            }
        }
        f(None)
    }

    /// `dev_get_by_name`: O(n), diagnostic use only.
    pub fn lookup_by_name<R>(&self, name: &str, f: impl FnOnce(Option<&Device>) -> R) -> R {
        let inner = self.inner.read().unwrap();
        for &id in &inner.ordered {
            let dev = inner.by_id[id as usize].as_ref().unwrap();
            if dev.name == name {
                return f(Some(dev));
            }
        }
        f(None)
    }

    /// `dev_show_list`: ordered diagnostic snapshot of all bound devices.
    pub fn dump(&self) -> Vec<DeviceSummary> {
        let inner = self.inner.read().unwrap();
        inner
            .ordered
            .iter()
            .map(|&id| {
                let dev = inner.by_id[id as usize].as_ref().unwrap();
                DeviceSummary {
                    name: dev.name.clone(),
                    id: dev.id,
                    phys_addr: dev.phys_addr,
                    phys_len: dev.phys_len,
                    flags: dev.flags.0,
                }
            })
            .collect()
    }

    /// Ordered IDs, LIFO-reversed, for VM teardown (spec.md §4.1,
    /// "removed at VM teardown in LIFO order").
    pub fn teardown_order(&self) -> Vec<u32> {
        let inner = self.inner.read().unwrap();
        let mut ids = inner.ordered.clone();
        ids.reverse();
        ids
    }
}

impl Default for VmDeviceSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFlags;

    fn dummy(name: &str, phys_addr: u64, phys_len: u64, caching: bool) -> Device {
        Device {
            name: name.to_string(),
            id: 0,
            phys_addr,
            phys_len,
            flags: DeviceFlags::new(if caching { flags::CACHING } else { 0 }),
            backing: None,
            sparse: None,
            handler: None,
        }
    }

    #[test]
    fn lookup_by_phys_finds_unique_owner() {
        let space = VmDeviceSpace::new();
        space.bind(dummy("ram", 0x0, 0x1000, true)).unwrap();
        space.bind(dummy("rom", 0x1000, 0x100, true)).unwrap();

        space.lookup_by_phys(0x50, false, |d| assert_eq!(d.unwrap().name, "ram"));
        space.lookup_by_phys(0x1050, false, |d| assert_eq!(d.unwrap().name, "rom"));
        space.lookup_by_phys(0x2000, false, |d| assert!(d.is_none()));
    }

    #[test]
    fn overlapping_caching_devices_rejected() {
        let space = VmDeviceSpace::new();
        space.bind(dummy("a", 0x1000, 0x1000, true)).unwrap();
        let err = space.bind(dummy("b", 0x1800, 0x1000, true)).unwrap_err();
        assert!(matches!(err, SetupError::OverlappingCachedRange { .. }));
    }

    #[test]
    fn non_caching_devices_may_overlap() {
        let space = VmDeviceSpace::new();
        space.bind(dummy("a", 0x1000, 0x1000, false)).unwrap();
        space.bind(dummy("b", 0x1800, 0x1000, false)).unwrap();
    }

    #[test]
    fn lookup_next_returns_smallest_greater_addr() {
        let space = VmDeviceSpace::new();
        space.bind(dummy("a", 0x1000, 0x100, true)).unwrap();
        space.bind(dummy("b", 0x5000, 0x100, true)).unwrap();
        space.lookup_next(0x1000, false, |d| assert_eq!(d.unwrap().name, "b"));
        space.lookup_next(0x5000, false, |d| assert!(d.is_none()));
    }

    #[test]
    fn unbind_frees_id_for_reuse() {
        let space = VmDeviceSpace::new();
        let id = space.bind(dummy("a", 0x0, 0x100, false)).unwrap();
        space.unbind(id).unwrap();
        let id2 = space.bind(dummy("b", 0x100, 0x100, false)).unwrap();
        assert_eq!(id, id2);
    }
}
