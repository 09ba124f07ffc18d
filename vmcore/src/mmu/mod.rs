//! Architectural MMU glue: the TLB/BAT/segment-register lookups the MTS
//! slow path consults on a cache miss (spec.md §4.5 step 2, component F).
//!
//! This module only decides *whether* a guest-virtual address translates
//! and to *what* guest-physical address, synthesising the architectural
//! exception when it doesn't; it never touches the Device registry or
//! the MTS cache itself — those stay in [`crate::mts`].

pub mod mips;
pub mod ppc;
