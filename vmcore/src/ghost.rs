//! Process-wide, reference-counted cache of read-only "ghost" base images.
//!
//! Grounded on `vm_ghost_image_get` / `vm_ghost_image_release` (referenced
//! from `dev_create_ghost_ram` in `examples/original_source/device.c`) and
//! specified concretely in SPEC_FULL.md §4: "a process-wide map from
//! filename to `Arc<MappedPages>`... protected by a mutex only at
//! get/release time; steady-state reads are lock-free" (spec.md §9).

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex, OnceLock};

/// A read-only `mmap` of a ghost base image, shared by every sparse
/// device across every VM that opens the same path.
pub struct GhostImage {
    ptr: *mut u8,
    len: usize,
    path: String,
}

// Safety: the mapping is PROT_READ only and never mutated after creation.
unsafe impl Send for GhostImage {}
unsafe impl Sync for GhostImage {}

impl GhostImage {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for GhostImage {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Process-wide singleton registry of open ghost images, keyed by path.
///
/// `get_or_open` mmaps the file once no matter how many VMs/devices
/// request it; the `Arc` keeps the mapping alive until the last
/// reference (sparse device) drops it. This is the one piece of
/// process-wide mutable state outside the log sink (spec.md §9, "Global
/// mutable state").
pub struct GhostImageCache {
    images: Mutex<HashMap<String, Arc<GhostImage>>>,
}

static INSTANCE: OnceLock<GhostImageCache> = OnceLock::new();

impl GhostImageCache {
    fn new() -> Self {
        GhostImageCache {
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Borrow the single process-wide instance.
    pub fn global() -> &'static GhostImageCache {
        INSTANCE.get_or_init(GhostImageCache::new)
    }

    /// Open (or reuse) the ghost image at `path`, read-only mmap'd.
    pub fn get_or_open(&self, path: &str) -> io::Result<Arc<GhostImage>> {
        let mut images = self.images.lock().unwrap();
        if let Some(existing) = images.get(path) {
            return Ok(existing.clone());
        }

        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let ptr = if len == 0 {
            std::ptr::NonNull::dangling().as_ptr()
        } else {
            use std::os::unix::io::AsRawFd;
            let p = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE,
                    file.as_raw_fd(),
                    0,
                )
            };
            if p == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            p as *mut u8
        };

        let image = Arc::new(GhostImage {
            ptr,
            len,
            path: path.to_string(),
        });
        images.insert(path.to_string(), image.clone());
        log::debug!("ghost image '{}' opened ({} bytes)", path, len);
        Ok(image)
    }

    /// Drop our reference-count hint; images are actually freed when the
    /// last `Arc<GhostImage>` held by a device is dropped. This removes
    /// the cache's own bookkeeping entry once no device references remain,
    /// matching `vm_ghost_image_release`'s "last closer wins" semantics.
    pub fn release(&self, path: &str) {
        let mut images = self.images.lock().unwrap();
        if let Some(entry) = images.get(path) {
            if Arc::strong_count(entry) <= 1 {
                images.remove(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reopening_same_path_shares_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.img");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&[0xAB; 4096]).unwrap();
        }
        let path_str = path.to_str().unwrap();

        let cache = GhostImageCache::global();
        let a = cache.get_or_open(path_str).unwrap();
        let b = cache.get_or_open(path_str).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.len(), 4096);
        unsafe {
            assert_eq!(*a.as_ptr(), 0xAB);
        }
    }
}
