//! The seam between the guest memory subsystem and the (out-of-scope)
//! JIT code cache.
//!
//! spec.md §9: "The MTS does not know JIT internals; expose a
//! `CodeCacheHook` capability with `invalidate_page(phys_page)` and have
//! MTS call it whenever it observes a write into an `EXEC`-tagged entry
//! or processes `CACHE`/`ICBI`." This is the one interface the memory
//! core exposes to the JIT subsystem named out-of-scope in spec.md §1.

/// Implemented by the (external) JIT code cache. The guest memory core
/// never constructs compiled blocks or knows their internal
/// representation; it only signals which physical page must be
/// invalidated.
pub trait CodeCacheHook: Send + Sync {
    /// A write landed on `phys_page` (or a `CACHE`/`ICBI` targeted it)
    /// and the page was flagged `EXEC` in the MTS cache. Evict any
    /// compiled block covering this page whose start address lies
    /// outside the victim page (spec.md §4.4).
    fn invalidate_page(&self, phys_page: u64);

    /// Whether a compiled block currently exists for `phys_page`, used by
    /// the MTS slow lookup to decide whether to set the `EXEC` flag on a
    /// freshly-installed cache entry (spec.md §4.5 step 5).
    fn has_code_for_page(&self, phys_page: u64) -> bool {
        let _ = phys_page;
        false
    }
}

/// A hook that does nothing — the default when no JIT subsystem is
/// wired up (e.g. a pure interpreter, or this crate's own test suite).
pub struct NullCodeCacheHook;

impl CodeCacheHook for NullCodeCacheHook {
    fn invalidate_page(&self, _phys_page: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingHook(AtomicU64);

    impl CodeCacheHook for CountingHook {
        fn invalidate_page(&self, _phys_page: u64) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn null_hook_is_a_no_op() {
        let hook = NullCodeCacheHook;
        hook.invalidate_page(0x1000);
        assert!(!hook.has_code_for_page(0x1000));
    }

    #[test]
    fn custom_hook_observes_invalidation() {
        let hook = CountingHook(AtomicU64::new(0));
        hook.invalidate_page(0x2000);
        assert_eq!(hook.0.load(Ordering::Relaxed), 1);
    }
}
