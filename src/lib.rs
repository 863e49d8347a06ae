//! `zone_shim` routes every heap allocation of a process through one
//! extensible dispatch chain, so that profilers, samplers and sanitizers can
//! observe or modify allocations without each of them patching the allocator
//! separately.
//!
//! Allocators are organized into *zones*: a record holding a table of
//! function pointers (`malloc`, `free`, `realloc`, `memalign`, batch variants,
//! ...) plus the zone's state.  Intercepting a zone means capturing its native
//! table into the process-wide [`ZoneRegistry`] and then pointing the table at
//! the shim.  From then on, every call enters the head of the
//! [`DispatchChain`]; each [`AllocatorDispatch`] node either serves the call
//! or forwards it, and the chain always ends in [`DEFAULT_DISPATCH`], which
//! looks up the zone's captured table and calls the native function with the
//! zone as its context.
//!
//! Misuse is fatal: registering a zone twice, dispatching for a zone that was
//! never registered, or forwarding past the last node abort the process with
//! a diagnostic and a backtrace.  Allocation failures are not misuse; the
//! native result (typically null) is returned unchanged.
//!
//! ## Routing Rust allocations through the chain
//!
//! Configure [`ShimAllocator`] as the global allocator instead of
//! [`std::alloc::System`]:
//!
//! ```
//! use zone_shim::ShimAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: ShimAllocator = ShimAllocator;
//!
//! fn main() {}
//! ```
//!
//! Allocations then use the [`system_zone`], a zone over the C heap that is
//! registered on first use.
//!
//! ## Using `zone_shim` via `LD_PRELOAD`
//!
//! For programs in other languages, use the companion `lib_zone_shim` crate.
//! It builds a dynamic library exporting the C heap API and sends each call
//! through the chain:
//!
//! ```bash
//! LD_PRELOAD=libzone_shim_preload.so ./my_program
//! ```
//!
//! ## Checking an allocation path
//!
//! The `zs_probe` tool from this crate registers (or intercepts) a zone and
//! runs the allocator contract against it:
//!
//! ```bash
//! zs_probe --intercept --threads 8 --format yaml
//! ```
//!
//! Set `RUST_LOG=debug` to see zones being captured.

mod dispatch;
mod error;
mod fatal;
mod global;
mod intercept;
pub mod native;
pub mod probe;
mod registry;
mod terminal;
mod zone;

pub use dispatch::{
    chain, AlignedFreeFn, AlignedMallocFn, AlignedReallocFn, AllocAlignedFn, AllocFn,
    AllocZeroInitializedFn, AllocatorDispatch, BatchFreeFn, BatchMallocFn, DispatchChain,
    FreeDefiniteSizeFn, FreeFn, GetSizeEstimateFn, Layers, ReallocFn, MAX_CHAIN_DEPTH,
};
pub use error::ShimError;
pub use fatal::fatal;
pub use global::{ShimAllocator, MIN_ALIGN};
pub use intercept::{intercept_zone, is_intercepted, restore_zone};
pub use native::{system_zone, HeapZone, NativeHeap, StaticZone};
pub use registry::{registry, ZoneRegistry, MAX_ZONE_COUNT};
pub use terminal::DEFAULT_DISPATCH;
pub use zone::{
    MallocZone, Zone, ZoneBatchFreeFn, ZoneBatchMallocFn, ZoneCallocFn, ZoneDestroyFn,
    ZoneFreeDefiniteSizeFn, ZoneFreeFn, ZoneFunctions, ZoneMallocFn, ZoneMemalignFn,
    ZonePressureReliefFn, ZoneReallocFn, ZoneSizeFn, ZoneVallocFn, VERSION_FREE_DEFINITE_SIZE,
    VERSION_MEMALIGN, VERSION_PRESSURE_RELIEF,
};
