//! The allocator dispatch chain.
//!
//! Every intercepted allocation enters at the chain's head.  A node either
//! serves the call itself or forwards it to `next`; the last node is always
//! [`DEFAULT_DISPATCH`], which resolves the call against the zone's captured
//! native functions.
//!
//! A layer is a `static` node that overrides some entries and forwards the
//! rest:
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use libc::c_void;
//! use zone_shim::{AllocatorDispatch, Zone, DEFAULT_DISPATCH};
//!
//! static CALLS: AtomicUsize = AtomicUsize::new(0);
//!
//! unsafe fn counting_alloc(this: &AllocatorDispatch, size: usize, zone: Zone) -> *mut c_void {
//!     CALLS.fetch_add(1, Ordering::Relaxed);
//!     this.next_layer().alloc(size, zone)
//! }
//!
//! static COUNTING: AllocatorDispatch = AllocatorDispatch {
//!     alloc_fn: counting_alloc,
//!     ..AllocatorDispatch::forwarding(&DEFAULT_DISPATCH)
//! };
//! ```

use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use libc::c_void;
use log::info;

use crate::{error::ShimError, fatal::fatal, terminal::DEFAULT_DISPATCH, zone::Zone};

pub type AllocFn = unsafe fn(this: &AllocatorDispatch, size: usize, zone: Zone) -> *mut c_void;
pub type AllocZeroInitializedFn =
    unsafe fn(this: &AllocatorDispatch, n: usize, size: usize, zone: Zone) -> *mut c_void;
pub type AllocAlignedFn =
    unsafe fn(this: &AllocatorDispatch, alignment: usize, size: usize, zone: Zone) -> *mut c_void;
pub type ReallocFn =
    unsafe fn(this: &AllocatorDispatch, ptr: *mut c_void, size: usize, zone: Zone) -> *mut c_void;
pub type FreeFn = unsafe fn(this: &AllocatorDispatch, ptr: *mut c_void, zone: Zone);
pub type GetSizeEstimateFn =
    unsafe fn(this: &AllocatorDispatch, ptr: *mut c_void, zone: Zone) -> usize;
pub type BatchMallocFn = unsafe fn(
    this: &AllocatorDispatch,
    size: usize,
    results: &mut [*mut c_void],
    zone: Zone,
) -> usize;
pub type BatchFreeFn = unsafe fn(this: &AllocatorDispatch, to_be_freed: &[*mut c_void], zone: Zone);
pub type FreeDefiniteSizeFn =
    unsafe fn(this: &AllocatorDispatch, ptr: *mut c_void, size: usize, zone: Zone);
pub type AlignedMallocFn =
    unsafe fn(this: &AllocatorDispatch, size: usize, alignment: usize, zone: Zone) -> *mut c_void;
pub type AlignedReallocFn = unsafe fn(
    this: &AllocatorDispatch,
    ptr: *mut c_void,
    size: usize,
    alignment: usize,
    zone: Zone,
) -> *mut c_void;
pub type AlignedFreeFn = unsafe fn(this: &AllocatorDispatch, ptr: *mut c_void, zone: Zone);

/// One link of the chain.  Immutable once built.
pub struct AllocatorDispatch {
    pub alloc_fn: AllocFn,
    /// Allocation whose failure the caller handles itself.
    pub alloc_unchecked_fn: AllocFn,
    pub alloc_zero_initialized_fn: AllocZeroInitializedFn,
    pub alloc_aligned_fn: AllocAlignedFn,
    pub realloc_fn: ReallocFn,
    pub free_fn: FreeFn,
    pub get_size_estimate_fn: GetSizeEstimateFn,
    pub batch_malloc_fn: BatchMallocFn,
    pub batch_free_fn: BatchFreeFn,
    pub free_definite_size_fn: FreeDefiniteSizeFn,
    pub aligned_malloc_fn: Option<AlignedMallocFn>,
    pub aligned_realloc_fn: Option<AlignedReallocFn>,
    pub aligned_free_fn: Option<AlignedFreeFn>,
    /// `None` only for the terminal node.
    pub next: Option<&'static AllocatorDispatch>,
}

impl AllocatorDispatch {
    /// A node that forwards every call to `next`.
    pub const fn forwarding(next: &'static AllocatorDispatch) -> AllocatorDispatch {
        AllocatorDispatch {
            alloc_fn: forward_alloc,
            alloc_unchecked_fn: forward_alloc_unchecked,
            alloc_zero_initialized_fn: forward_alloc_zero_initialized,
            alloc_aligned_fn: forward_alloc_aligned,
            realloc_fn: forward_realloc,
            free_fn: forward_free,
            get_size_estimate_fn: forward_get_size_estimate,
            batch_malloc_fn: forward_batch_malloc,
            batch_free_fn: forward_batch_free,
            free_definite_size_fn: forward_free_definite_size,
            aligned_malloc_fn: None,
            aligned_realloc_fn: None,
            aligned_free_fn: None,
            next: Some(next),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }

    /// The node this one forwards to.  Reaching the end of the chain from a
    /// node that forwards is fatal.
    #[inline]
    pub fn next_layer(&self) -> &'static AllocatorDispatch {
        match self.next {
            Some(next) => next,
            None => fatal(ShimError::MissingSuccessor),
        }
    }

    /// # Safety
    ///
    /// `zone` must be registered with the registry the terminal node uses.
    #[inline]
    pub unsafe fn alloc(&self, size: usize, zone: Zone) -> *mut c_void {
        (self.alloc_fn)(self, size, zone)
    }

    /// # Safety
    ///
    /// See [`AllocatorDispatch::alloc`].
    #[inline]
    pub unsafe fn alloc_unchecked(&self, size: usize, zone: Zone) -> *mut c_void {
        (self.alloc_unchecked_fn)(self, size, zone)
    }

    /// # Safety
    ///
    /// See [`AllocatorDispatch::alloc`].
    #[inline]
    pub unsafe fn alloc_zero_initialized(&self, n: usize, size: usize, zone: Zone) -> *mut c_void {
        (self.alloc_zero_initialized_fn)(self, n, size, zone)
    }

    /// # Safety
    ///
    /// See [`AllocatorDispatch::alloc`].
    #[inline]
    pub unsafe fn alloc_aligned(&self, alignment: usize, size: usize, zone: Zone) -> *mut c_void {
        (self.alloc_aligned_fn)(self, alignment, size, zone)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of `zone`.
    #[inline]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize, zone: Zone) -> *mut c_void {
        (self.realloc_fn)(self, ptr, size, zone)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of `zone`.
    #[inline]
    pub unsafe fn free(&self, ptr: *mut c_void, zone: Zone) {
        (self.free_fn)(self, ptr, zone)
    }

    /// # Safety
    ///
    /// See [`AllocatorDispatch::alloc`].
    #[inline]
    pub unsafe fn get_size_estimate(&self, ptr: *mut c_void, zone: Zone) -> usize {
        (self.get_size_estimate_fn)(self, ptr, zone)
    }

    /// Fills a prefix of `results` and returns its length.
    ///
    /// # Safety
    ///
    /// See [`AllocatorDispatch::alloc`].
    #[inline]
    pub unsafe fn batch_malloc(&self, size: usize, results: &mut [*mut c_void], zone: Zone) -> usize {
        (self.batch_malloc_fn)(self, size, results, zone)
    }

    /// # Safety
    ///
    /// Every pointer must be a live allocation of `zone`.
    #[inline]
    pub unsafe fn batch_free(&self, to_be_freed: &[*mut c_void], zone: Zone) {
        (self.batch_free_fn)(self, to_be_freed, zone)
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation of `zone` of `size` bytes.
    #[inline]
    pub unsafe fn free_definite_size(&self, ptr: *mut c_void, size: usize, zone: Zone) {
        (self.free_definite_size_fn)(self, ptr, size, zone)
    }

    /// Served by the first node down the chain that implements it, otherwise
    /// by [`AllocatorDispatch::alloc_aligned`] at this node.
    ///
    /// # Safety
    ///
    /// See [`AllocatorDispatch::alloc`].
    pub unsafe fn aligned_malloc(&self, size: usize, alignment: usize, zone: Zone) -> *mut c_void {
        let mut node = self;
        loop {
            if let Some(f) = node.aligned_malloc_fn {
                return f(node, size, alignment, zone);
            }
            match node.next {
                Some(next) => node = next,
                None => return self.alloc_aligned(alignment, size, zone),
            }
        }
    }

    /// Without an implementation down the chain the contents move to a fresh
    /// aligned block.  On failure `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of `zone`.
    pub unsafe fn aligned_realloc(
        &self,
        ptr: *mut c_void,
        size: usize,
        alignment: usize,
        zone: Zone,
    ) -> *mut c_void {
        let mut node = self;
        loop {
            if let Some(f) = node.aligned_realloc_fn {
                return f(node, ptr, size, alignment, zone);
            }
            match node.next {
                Some(next) => node = next,
                None => break,
            }
        }

        let aligned = self.alloc_aligned(alignment, size, zone);
        if aligned.is_null() || ptr.is_null() {
            return aligned;
        }
        let old_size = self.get_size_estimate(ptr, zone);
        ptr::copy_nonoverlapping(ptr as *const u8, aligned as *mut u8, old_size.min(size));
        self.free(ptr, zone);
        aligned
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of `zone`.
    pub unsafe fn aligned_free(&self, ptr: *mut c_void, zone: Zone) {
        let mut node = self;
        loop {
            if let Some(f) = node.aligned_free_fn {
                return f(node, ptr, zone);
            }
            match node.next {
                Some(next) => node = next,
                None => return self.free(ptr, zone),
            }
        }
    }
}

unsafe fn forward_alloc(this: &AllocatorDispatch, size: usize, zone: Zone) -> *mut c_void {
    this.next_layer().alloc(size, zone)
}

unsafe fn forward_alloc_unchecked(this: &AllocatorDispatch, size: usize, zone: Zone) -> *mut c_void {
    this.next_layer().alloc_unchecked(size, zone)
}

unsafe fn forward_alloc_zero_initialized(
    this: &AllocatorDispatch,
    n: usize,
    size: usize,
    zone: Zone,
) -> *mut c_void {
    this.next_layer().alloc_zero_initialized(n, size, zone)
}

unsafe fn forward_alloc_aligned(
    this: &AllocatorDispatch,
    alignment: usize,
    size: usize,
    zone: Zone,
) -> *mut c_void {
    this.next_layer().alloc_aligned(alignment, size, zone)
}

unsafe fn forward_realloc(
    this: &AllocatorDispatch,
    ptr: *mut c_void,
    size: usize,
    zone: Zone,
) -> *mut c_void {
    this.next_layer().realloc(ptr, size, zone)
}

unsafe fn forward_free(this: &AllocatorDispatch, ptr: *mut c_void, zone: Zone) {
    this.next_layer().free(ptr, zone)
}

unsafe fn forward_get_size_estimate(this: &AllocatorDispatch, ptr: *mut c_void, zone: Zone) -> usize {
    this.next_layer().get_size_estimate(ptr, zone)
}

unsafe fn forward_batch_malloc(
    this: &AllocatorDispatch,
    size: usize,
    results: &mut [*mut c_void],
    zone: Zone,
) -> usize {
    this.next_layer().batch_malloc(size, results, zone)
}

unsafe fn forward_batch_free(this: &AllocatorDispatch, to_be_freed: &[*mut c_void], zone: Zone) {
    this.next_layer().batch_free(to_be_freed, zone)
}

unsafe fn forward_free_definite_size(
    this: &AllocatorDispatch,
    ptr: *mut c_void,
    size: usize,
    zone: Zone,
) {
    this.next_layer().free_definite_size(ptr, size, zone)
}

/// Longest chain [`DispatchChain::install`] accepts, terminal node included.
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Holds the head of the active chain.
///
/// Until a chain is installed the head is [`DEFAULT_DISPATCH`] alone.  A chain
/// is installed at most once, before other threads allocate through it, and is
/// only read afterwards.
pub struct DispatchChain {
    head: AtomicPtr<AllocatorDispatch>,
}

impl Default for DispatchChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchChain {
    pub const fn new() -> Self {
        DispatchChain {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn head(&self) -> &'static AllocatorDispatch {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            &DEFAULT_DISPATCH
        } else {
            unsafe { &*head }
        }
    }

    pub fn is_installed(&self) -> bool {
        !self.head.load(Ordering::Acquire).is_null()
    }

    /// Makes `head` the entry point of every dispatch through this chain.
    pub fn install(&self, head: &'static AllocatorDispatch) -> Result<(), ShimError> {
        let depth = validate(head)?;
        self.head
            .compare_exchange(
                ptr::null_mut(),
                head as *const AllocatorDispatch as *mut AllocatorDispatch,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ShimError::ChainAlreadyInstalled)?;
        info!("installed allocator dispatch chain of {} nodes", depth);
        Ok(())
    }

    /// The nodes of the chain, head first.
    pub fn layers(&self) -> Layers {
        Layers {
            next: Some(self.head()),
        }
    }

    /// Puts the bare terminal dispatch back at the head.
    ///
    /// # Safety
    ///
    /// Test-only.  No other thread may be dispatching through this chain.
    #[doc(hidden)]
    pub unsafe fn reset_for_testing(&self) {
        self.head.store(ptr::null_mut(), Ordering::Release);
    }
}

/// Returns the number of nodes from `head` to the terminal dispatch.
fn validate(head: &'static AllocatorDispatch) -> Result<usize, ShimError> {
    let mut node = head;
    for depth in 1..=MAX_CHAIN_DEPTH {
        match node.next {
            Some(next) => node = next,
            None if ptr::eq(node, &DEFAULT_DISPATCH) => return Ok(depth),
            None => return Err(ShimError::ChainNotTerminated),
        }
    }
    Err(ShimError::ChainTooLong {
        limit: MAX_CHAIN_DEPTH,
    })
}

pub struct Layers {
    next: Option<&'static AllocatorDispatch>,
}

impl Iterator for Layers {
    type Item = &'static AllocatorDispatch;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next;
        Some(node)
    }
}

static CHAIN: DispatchChain = DispatchChain::new();

/// The process-wide chain every intercepted zone and [`crate::ShimAllocator`]
/// dispatch through.
#[inline]
pub fn chain() -> &'static DispatchChain {
    &CHAIN
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        native::{HeapZone, NativeHeap},
        registry::registry,
    };

    static ALLOCS: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_alloc(this: &AllocatorDispatch, size: usize, zone: Zone) -> *mut c_void {
        ALLOCS.fetch_add(1, Ordering::Relaxed);
        this.next_layer().alloc(size, zone)
    }

    unsafe fn counting_free(this: &AllocatorDispatch, ptr: *mut c_void, zone: Zone) {
        FREES.fetch_add(1, Ordering::Relaxed);
        this.next_layer().free(ptr, zone)
    }

    static COUNTING: AllocatorDispatch = AllocatorDispatch {
        alloc_fn: counting_alloc,
        free_fn: counting_free,
        ..AllocatorDispatch::forwarding(&DEFAULT_DISPATCH)
    };

    static OUTER: AllocatorDispatch = AllocatorDispatch::forwarding(&COUNTING);

    static DANGLING: AllocatorDispatch = AllocatorDispatch {
        next: None,
        ..AllocatorDispatch::forwarding(&DEFAULT_DISPATCH)
    };

    static LOOP_A: AllocatorDispatch = AllocatorDispatch::forwarding(&LOOP_B);
    static LOOP_B: AllocatorDispatch = AllocatorDispatch::forwarding(&LOOP_A);

    static UNCHECKED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_alloc_unchecked(
        this: &AllocatorDispatch,
        size: usize,
        zone: Zone,
    ) -> *mut c_void {
        UNCHECKED.fetch_add(1, Ordering::Relaxed);
        this.next_layer().alloc_unchecked(size, zone)
    }

    static UNCHECKED_COUNTING: AllocatorDispatch = AllocatorDispatch {
        alloc_unchecked_fn: counting_alloc_unchecked,
        ..AllocatorDispatch::forwarding(&DEFAULT_DISPATCH)
    };

    static UNCHECKED_OUTER: AllocatorDispatch = AllocatorDispatch::forwarding(&UNCHECKED_COUNTING);

    static ROUND_UP: AllocatorDispatch = AllocatorDispatch {
        aligned_malloc_fn: Some(round_up_aligned_malloc),
        ..AllocatorDispatch::forwarding(&DEFAULT_DISPATCH)
    };

    unsafe fn round_up_aligned_malloc(
        this: &AllocatorDispatch,
        size: usize,
        alignment: usize,
        zone: Zone,
    ) -> *mut c_void {
        this.next_layer()
            .alloc_aligned(alignment, (size + alignment - 1) & !(alignment - 1), zone)
    }

    fn registered_zone(name: &'static [u8]) -> Zone {
        let zone = HeapZone::new(name, NativeHeap::LINKED).leak();
        registry().register_zone(zone);
        zone
    }

    #[test]
    fn head_defaults_to_terminal() {
        let chain = DispatchChain::new();
        assert!(!chain.is_installed());
        assert!(ptr::eq(chain.head(), &DEFAULT_DISPATCH));
        assert_eq!(chain.layers().count(), 1);
        assert!(chain.head().is_terminal());
    }

    #[test]
    fn install_once() {
        let chain = DispatchChain::new();
        chain.install(&OUTER).unwrap();
        assert!(ptr::eq(chain.head(), &OUTER));
        assert_eq!(chain.layers().count(), 3);
        assert_eq!(
            chain.install(&COUNTING).unwrap_err(),
            ShimError::ChainAlreadyInstalled
        );

        unsafe { chain.reset_for_testing() };
        assert!(ptr::eq(chain.head(), &DEFAULT_DISPATCH));
        chain.install(&COUNTING).unwrap();
    }

    #[test]
    fn install_rejects_unterminated_chain() {
        let chain = DispatchChain::new();
        assert_eq!(
            chain.install(&DANGLING).unwrap_err(),
            ShimError::ChainNotTerminated
        );
        assert!(!chain.is_installed());
    }

    #[test]
    fn install_rejects_cycles() {
        let chain = DispatchChain::new();
        assert_eq!(
            chain.install(&LOOP_A).unwrap_err(),
            ShimError::ChainTooLong {
                limit: MAX_CHAIN_DEPTH
            }
        );
        assert!(!chain.is_installed());
    }

    #[test]
    fn unchecked_alloc_is_forwarded() {
        let zone = registered_zone(b"unchecked\0");
        unsafe {
            let ptr = UNCHECKED_OUTER.alloc_unchecked(72, zone);
            assert!(!ptr.is_null());
            assert!(UNCHECKED_OUTER.get_size_estimate(ptr, zone) >= 72);
            UNCHECKED_OUTER.free(ptr, zone);

            assert!(UNCHECKED_OUTER.alloc_unchecked(usize::MAX, zone).is_null());
        }
        assert_eq!(UNCHECKED.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn layers_forward_to_terminal() {
        let zone = registered_zone(b"forwarding\0");
        let chain = DispatchChain::new();
        chain.install(&OUTER).unwrap();

        let allocs = ALLOCS.load(Ordering::Relaxed);
        let frees = FREES.load(Ordering::Relaxed);
        unsafe {
            let head = chain.head();
            let ptr = head.alloc(48, zone);
            assert!(!ptr.is_null());
            assert!(head.get_size_estimate(ptr, zone) >= 48);
            head.free(ptr, zone);

            let zeroed = head.alloc_zero_initialized(4, 8, zone) as *const u8;
            assert!((0..32).all(|i| *zeroed.add(i) == 0));
            head.free_definite_size(zeroed as *mut c_void, 32, zone);
        }
        // Other tests share the counters; only growth is meaningful.
        assert!(ALLOCS.load(Ordering::Relaxed) > allocs);
        assert!(FREES.load(Ordering::Relaxed) > frees);
    }

    #[test]
    fn aligned_variants_fall_back_along_the_chain() {
        let zone = registered_zone(b"aligned\0");
        unsafe {
            let ptr = ROUND_UP.aligned_malloc(10, 64, zone);
            assert_eq!(ptr as usize % 64, 0);
            assert!(ROUND_UP.get_size_estimate(ptr, zone) >= 64);
            ROUND_UP.aligned_free(ptr, zone);

            let ptr = COUNTING.aligned_malloc(100, 128, zone) as *mut u8;
            assert_eq!(ptr as usize % 128, 0);
            for i in 0..100 {
                *ptr.add(i) = i as u8;
            }
            let grown = COUNTING.aligned_realloc(ptr as *mut c_void, 5000, 128, zone) as *const u8;
            assert!(!grown.is_null());
            assert_eq!(grown as usize % 128, 0);
            assert!((0..100).all(|i| *grown.add(i) == i as u8));
            COUNTING.aligned_free(grown as *mut c_void, zone);
        }
    }
}
