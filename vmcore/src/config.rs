//! VM-level configuration surface.
//!
//! Grounded on the constructor-driven style of `libcorevm::VmEngine::new`
//! (`examples/brianmayclone-anyos/libs/libcorevm/src/lib.rs`) and the
//! `MachineConfig` builder pattern seen elsewhere in the reference pack
//! (`aero_machine::MachineConfig`). SPEC_FULL.md §1 calls for this as
//! ambient scope the distilled spec left implicit: RAM size, the working
//! directory persisted NVRAM/flash files are rooted under (spec.md §6),
//! and per-CPU MTS cache sizing (spec.md §3, "MTS cache structure").

use std::path::PathBuf;

/// The guest CPU architecture a given [`crate::mts`] translator instance
/// serves — selects which variant (radix vs. hash) and which
/// architectural MMU glue a CPU uses (spec.md §2, component E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    /// 32-bit MIPS: radix-table MTS (spec.md §4.6).
    Mips32,
    /// 64-bit MIPS: hash-cache MTS (spec.md §4.5).
    Mips64,
    /// 32-bit PowerPC: hash-cache MTS (spec.md §4.5).
    Ppc32,
}

/// Which MTS implementation a CPU should use. Mirrors `CpuArch` 1:1
/// today; kept distinct because SPEC_FULL.md §4 records the radix MTS as
/// the historical variant for 64-bit MIPS, reachable only by explicit
/// override in code that constructs a [`CpuMtsConfig`] directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtsKind {
    Radix,
    Hash,
}

impl CpuArch {
    pub fn default_mts_kind(self) -> MtsKind {
        match self {
            CpuArch::Mips32 => MtsKind::Radix,
            CpuArch::Mips64 | CpuArch::Ppc32 => MtsKind::Hash,
        }
    }
}

/// Per-CPU MTS cache sizing and architecture selection.
#[derive(Debug, Clone, Copy)]
pub struct CpuMtsConfig {
    pub arch: CpuArch,
    pub kind: MtsKind,
    /// Number of entries in the hash cache. Must be a power of two;
    /// spec.md §3 suggests "4K-16K entries" as the typical range.
    /// Ignored by the radix variant.
    pub hash_cache_size: usize,
}

impl CpuMtsConfig {
    pub fn new(arch: CpuArch) -> Self {
        CpuMtsConfig {
            arch,
            kind: arch.default_mts_kind(),
            hash_cache_size: 8192,
        }
    }

    pub fn with_hash_cache_size(mut self, size: usize) -> Self {
        assert!(size.is_power_of_two(), "MTS hash cache size must be a power of two");
        self.hash_cache_size = size;
        self
    }
}

/// Top-level VM construction parameters.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub name: String,
    pub ram_size: u64,
    /// Directory persisted NVRAM/flash files are rooted under
    /// (spec.md §6, "`<VM>_<device>` under the VM's working directory").
    pub working_dir: PathBuf,
    pub cpus: Vec<CpuMtsConfig>,
}

impl VmConfig {
    pub fn new(name: impl Into<String>, ram_size: u64, working_dir: impl Into<PathBuf>) -> Self {
        VmConfig {
            name: name.into(),
            ram_size,
            working_dir: working_dir.into(),
            cpus: Vec::new(),
        }
    }

    pub fn with_cpu(mut self, cfg: CpuMtsConfig) -> Self {
        self.cpus.push(cfg);
        self
    }

    /// Path a persisted device's backing file should live at, per
    /// spec.md §6's `<VM>_<device>` naming convention.
    pub fn device_file_path(&self, device_name: &str) -> PathBuf {
        self.working_dir.join(format!("{}_{}", self.name, device_name))
    }
}

/// Per-device configuration passed to the binder that constructs and
/// binds a concrete [`crate::device::Device`] (SPEC_FULL.md component K).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub phys_addr: u64,
    pub phys_len: u64,
    pub backing: BackingKind,
}

/// The kind of backing a device should be constructed with.
#[derive(Debug, Clone)]
pub enum BackingKind {
    /// Pure MMIO, no host-memory backing.
    Mmio,
    /// Anonymous host RAM, not persisted.
    AnonRam,
    /// File-backed RAM, persisted at `path`.
    FileRam { path: PathBuf },
    /// Sparse RAM, optionally ghosted from `ghost_path`.
    Sparse { ghost_path: Option<PathBuf> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_file_path_matches_spec_naming() {
        let cfg = VmConfig::new("router1", 128 << 20, "/tmp/vms/router1");
        let path = cfg.device_file_path("nvram");
        assert_eq!(path, PathBuf::from("/tmp/vms/router1/router1_nvram"));
    }

    #[test]
    fn default_mts_kind_matches_spec_architecture_split() {
        assert_eq!(CpuArch::Mips32.default_mts_kind(), MtsKind::Radix);
        assert_eq!(CpuArch::Mips64.default_mts_kind(), MtsKind::Hash);
        assert_eq!(CpuArch::Ppc32.default_mts_kind(), MtsKind::Hash);
    }
}
