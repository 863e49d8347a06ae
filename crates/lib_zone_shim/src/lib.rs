//! Companion crate to [`zone_shim`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the C heap API of the program and send every call
//! through the `zone_shim` dispatch chain.
//!
//! The calls run against a zone wrapping the next definition of each heap function in symbol
//! search order, normally the C library's.  Resolving those definitions may itself allocate, so
//! until the zone is ready allocations are served from a small static arena.

use std::{
    cell::UnsafeCell,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use libc::{c_int, c_void, size_t};
use once_cell::sync::OnceCell;
use zone_shim::{chain, fatal, registry, HeapZone, NativeHeap, Zone};

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static NEXT_ZONE: OnceCell<HeapZone> = OnceCell::new();

const BOOTSTRAP_SIZE: usize = 64 * 1024;
// Each block is preceded by a header holding its size.
const BOOTSTRAP_HEADER: usize = 16;

#[repr(C, align(16))]
struct Bootstrap(UnsafeCell<[u8; BOOTSTRAP_SIZE]>);

unsafe impl Sync for Bootstrap {}

static BOOTSTRAP: Bootstrap = Bootstrap(UnsafeCell::new([0; BOOTSTRAP_SIZE]));
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);

fn bootstrap_alloc(size: usize, alignment: usize) -> *mut c_void {
    let alignment = alignment.max(BOOTSTRAP_HEADER);
    let base = BOOTSTRAP.0.get() as usize;
    let mut used = BOOTSTRAP_USED.load(Ordering::Relaxed);
    loop {
        let start = (base + used + BOOTSTRAP_HEADER + alignment - 1) & !(alignment - 1);
        let end = match start.checked_add(size) {
            Some(end) if end <= base + BOOTSTRAP_SIZE => end,
            _ => return ptr::null_mut(),
        };
        match BOOTSTRAP_USED.compare_exchange_weak(
            used,
            end - base,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => unsafe {
                *((start - BOOTSTRAP_HEADER) as *mut usize) = size;
                // Static memory starts zeroed but blocks are never reused.
                return start as *mut c_void;
            },
            Err(current) => used = current,
        }
    }
}

fn is_bootstrap(ptr: *mut c_void) -> bool {
    let base = BOOTSTRAP.0.get() as usize;
    (base..base + BOOTSTRAP_SIZE).contains(&(ptr as usize))
}

unsafe fn bootstrap_size(ptr: *mut c_void) -> usize {
    *((ptr as usize - BOOTSTRAP_HEADER) as *const usize)
}

/// The zone over the next heap, or `None` while it is being resolved.
#[inline]
fn next_zone() -> Option<Zone> {
    if STATE.load(Ordering::Acquire) == READY {
        return NEXT_ZONE.get().map(|zone| Zone::from(NonNull::from(zone)));
    }
    resolve_next_zone()
}

#[cold]
fn resolve_next_zone() -> Option<Zone> {
    if STATE
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Either this thread is resolving and re-entered, or another thread
        // is about to finish.
        return match STATE.load(Ordering::Acquire) {
            READY => NEXT_ZONE.get().map(|zone| Zone::from(NonNull::from(zone))),
            _ => None,
        };
    }
    let heap = NativeHeap::resolve_next().unwrap_or_else(|e| fatal(e));
    let _ = NEXT_ZONE.set(HeapZone::new(b"PreloadZone\0", heap));
    let zone = NEXT_ZONE.get().map(|zone| Zone::from(NonNull::from(zone)))?;
    if let Err(e) = registry().ensure_registered(zone) {
        fatal(e);
    }
    STATE.store(READY, Ordering::Release);
    Some(zone)
}

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation catches `malloc`
/// calls performed by the program and sends them through the dispatch chain.
///
/// # Safety
///
/// Same contract as the C library's `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    match next_zone() {
        Some(zone) => chain().head().alloc(size, zone),
        None => bootstrap_alloc(size, BOOTSTRAP_HEADER),
    }
}

/// # Safety
///
/// Same contract as the C library's `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(n: size_t, size: size_t) -> *mut c_void {
    match next_zone() {
        Some(zone) => chain().head().alloc_zero_initialized(n, size, zone),
        None => match n.checked_mul(size) {
            Some(total) => bootstrap_alloc(total, BOOTSTRAP_HEADER),
            None => ptr::null_mut(),
        },
    }
}

/// # Safety
///
/// Same contract as the C library's `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if is_bootstrap(ptr) {
        // Move the block out of the arena.
        let new_ptr = malloc(size);
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(
                ptr as *const u8,
                new_ptr as *mut u8,
                bootstrap_size(ptr).min(size),
            );
        }
        return new_ptr;
    }
    match next_zone() {
        Some(zone) => chain().head().realloc(ptr, size, zone),
        None if ptr.is_null() => bootstrap_alloc(size, BOOTSTRAP_HEADER),
        None => ptr::null_mut(),
    }
}

/// # Safety
///
/// Same contract as the C library's `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || is_bootstrap(ptr) {
        return;
    }
    if let Some(zone) = next_zone() {
        chain().head().free(ptr, zone)
    }
}

/// # Safety
///
/// Same contract as the C library's `posix_memalign`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    let ptr = memalign(alignment, size);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    *memptr = ptr;
    0
}

/// # Safety
///
/// Same contract as the C library's `memalign`.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    match next_zone() {
        Some(zone) => chain().head().alloc_aligned(alignment, size, zone),
        None if alignment.is_power_of_two() => bootstrap_alloc(size, alignment),
        None => ptr::null_mut(),
    }
}

/// # Safety
///
/// Same contract as the C library's `aligned_alloc`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    memalign(alignment, size)
}

/// # Safety
///
/// Same contract as the C library's `valloc`.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    let page = match libc::sysconf(libc::_SC_PAGESIZE) {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    memalign(page, size)
}

/// # Safety
///
/// `ptr` must be null or a live allocation of this heap.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    if ptr.is_null() {
        return 0;
    }
    if is_bootstrap(ptr) {
        return bootstrap_size(ptr);
    }
    match next_zone() {
        Some(zone) => chain().head().get_size_estimate(ptr, zone),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_blocks_are_aligned_and_disjoint() {
        let a = bootstrap_alloc(24, 16);
        let b = bootstrap_alloc(100, 256);
        assert!(is_bootstrap(a) && is_bootstrap(b));
        assert_eq!(b as usize % 256, 0);
        assert!(a as usize + 24 <= b as usize);
        assert_eq!(unsafe { bootstrap_size(b) }, 100);
        assert!(bootstrap_alloc(BOOTSTRAP_SIZE, 16).is_null());
    }

    #[test]
    fn exported_heap_round_trip() {
        unsafe {
            let ptr = malloc(40) as *mut u8;
            assert!(!ptr.is_null());
            assert!(!is_bootstrap(ptr as *mut c_void));
            assert!(malloc_usable_size(ptr as *mut c_void) >= 40);
            *ptr.add(39) = 9;
            let grown = realloc(ptr as *mut c_void, 4000) as *mut u8;
            assert_eq!(*grown.add(39), 9);
            free(grown as *mut c_void);

            let mut aligned = ptr::null_mut();
            assert_eq!(posix_memalign(&mut aligned, 128, 10), 0);
            assert_eq!(aligned as usize % 128, 0);
            free(aligned);
            assert_eq!(posix_memalign(&mut aligned, 24, 10), libc::EINVAL);
        }
        assert!(registry().is_registered(next_zone().unwrap()));
    }
}
