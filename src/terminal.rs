//! The last node of every dispatch chain.
//!
//! Each entry looks up the zone's captured native table and calls the
//! matching function with the zone as its context.  Nothing is added, checked
//! or transformed on the way; whatever the native function returns is the
//! result.

use std::ptr;

use libc::c_void;

use crate::{
    dispatch::AllocatorDispatch,
    native::page_size,
    registry::registry,
    zone::{batch_len, free_batched, Zone},
};

unsafe fn malloc_impl(_: &AllocatorDispatch, size: usize, zone: Zone) -> *mut c_void {
    let functions = registry().lookup(zone);
    (functions.malloc)(zone.as_ptr(), size)
}

unsafe fn calloc_impl(_: &AllocatorDispatch, n: usize, size: usize, zone: Zone) -> *mut c_void {
    let functions = registry().lookup(zone);
    (functions.calloc)(zone.as_ptr(), n, size)
}

unsafe fn memalign_impl(
    _: &AllocatorDispatch,
    alignment: usize,
    size: usize,
    zone: Zone,
) -> *mut c_void {
    let functions = registry().lookup(zone);
    match functions.memalign {
        Some(memalign) => memalign(zone.as_ptr(), alignment, size),
        // Zones older than memalign still serve page-aligned requests.
        None if alignment.is_power_of_two() && alignment <= page_size() => {
            (functions.valloc)(zone.as_ptr(), size)
        }
        None => ptr::null_mut(),
    }
}

unsafe fn realloc_impl(
    _: &AllocatorDispatch,
    ptr: *mut c_void,
    size: usize,
    zone: Zone,
) -> *mut c_void {
    let functions = registry().lookup(zone);
    (functions.realloc)(zone.as_ptr(), ptr, size)
}

unsafe fn free_impl(_: &AllocatorDispatch, ptr: *mut c_void, zone: Zone) {
    let functions = registry().lookup(zone);
    (functions.free)(zone.as_ptr(), ptr)
}

unsafe fn get_size_estimate_impl(_: &AllocatorDispatch, ptr: *mut c_void, zone: Zone) -> usize {
    let functions = registry().lookup(zone);
    (functions.size)(zone.as_ptr(), ptr)
}

unsafe fn batch_malloc_impl(
    _: &AllocatorDispatch,
    size: usize,
    results: &mut [*mut c_void],
    zone: Zone,
) -> usize {
    let functions = registry().lookup(zone);
    match functions.batch_malloc {
        Some(batch_malloc) => batch_malloc(
            zone.as_ptr(),
            size,
            results.as_mut_ptr(),
            batch_len(results.len()),
        ) as usize,
        None => 0,
    }
}

unsafe fn batch_free_impl(_: &AllocatorDispatch, to_be_freed: &[*mut c_void], zone: Zone) {
    let functions = registry().lookup(zone);
    free_batched(zone, to_be_freed, functions.batch_free, |ptr| {
        (functions.free)(zone.as_ptr(), ptr)
    })
}

unsafe fn free_definite_size_impl(
    _: &AllocatorDispatch,
    ptr: *mut c_void,
    size: usize,
    zone: Zone,
) {
    let functions = registry().lookup(zone);
    match functions.free_definite_size {
        Some(free_definite_size) => free_definite_size(zone.as_ptr(), ptr, size),
        None => (functions.free)(zone.as_ptr(), ptr),
    }
}

/// The terminal dispatch.  It has no successor.
pub static DEFAULT_DISPATCH: AllocatorDispatch = AllocatorDispatch {
    alloc_fn: malloc_impl,
    alloc_unchecked_fn: malloc_impl,
    alloc_zero_initialized_fn: calloc_impl,
    alloc_aligned_fn: memalign_impl,
    realloc_fn: realloc_impl,
    free_fn: free_impl,
    get_size_estimate_fn: get_size_estimate_impl,
    batch_malloc_fn: batch_malloc_impl,
    batch_free_fn: batch_free_impl,
    free_definite_size_fn: free_definite_size_impl,
    aligned_malloc_fn: None,
    aligned_realloc_fn: None,
    aligned_free_fn: None,
    next: None,
};

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        ptr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use libc::c_uint;

    use super::*;
    use crate::{
        native::{HeapZone, NativeHeap},
        zone::MallocZone,
    };

    const SIZES: [usize; 5] = [0, 1, 64, 4096, 1 << 20];

    fn registered_zone(zone: HeapZone) -> Zone {
        let zone = zone.leak();
        registry().register_zone(zone);
        zone
    }

    fn linked_zone(name: &'static [u8]) -> Zone {
        registered_zone(HeapZone::new(name, NativeHeap::LINKED))
    }

    #[test]
    fn size_estimate_covers_request() {
        let zone = linked_zone(b"estimate\0");
        for size in SIZES {
            unsafe {
                let ptr = DEFAULT_DISPATCH.alloc(size, zone);
                assert!(!ptr.is_null());
                assert!(DEFAULT_DISPATCH.get_size_estimate(ptr, zone) >= size);
                DEFAULT_DISPATCH.free(ptr, zone);
            }
        }
    }

    #[test]
    fn round_trip_leaves_neighbors_intact() {
        let zone = linked_zone(b"round-trip\0");
        unsafe {
            let sentinel = DEFAULT_DISPATCH.alloc(256, zone) as *mut u8;
            ptr::write_bytes(sentinel, 0xA5, 256);
            for size in SIZES {
                let ptr = DEFAULT_DISPATCH.alloc(size, zone) as *mut u8;
                if size > 0 {
                    ptr::write_bytes(ptr, 0x5A, size);
                }
                DEFAULT_DISPATCH.free(ptr as *mut c_void, zone);
            }
            assert!((0..256).all(|i| *sentinel.add(i) == 0xA5));
            DEFAULT_DISPATCH.free(sentinel as *mut c_void, zone);
        }
    }

    #[test]
    fn realloc_keeps_contents() {
        let zone = linked_zone(b"realloc\0");
        unsafe {
            let ptr = DEFAULT_DISPATCH.alloc(16, zone) as *mut u8;
            for i in 0..16 {
                *ptr.add(i) = i as u8 + 1;
            }
            let grown = DEFAULT_DISPATCH.realloc(ptr as *mut c_void, 4096, zone) as *mut u8;
            assert!(!grown.is_null());
            assert!((0..16).all(|i| *grown.add(i) == i as u8 + 1));
            DEFAULT_DISPATCH.free(grown as *mut c_void, zone);

            let fresh = DEFAULT_DISPATCH.realloc(ptr::null_mut(), 32, zone);
            assert!(!fresh.is_null());
            DEFAULT_DISPATCH.free(fresh, zone);
        }
    }

    #[test]
    fn calloc_is_zeroed() {
        let zone = linked_zone(b"calloc\0");
        unsafe {
            let ptr = DEFAULT_DISPATCH.alloc_zero_initialized(16, 64, zone) as *const u8;
            assert!((0..16 * 64).all(|i| *ptr.add(i) == 0));
            DEFAULT_DISPATCH.free(ptr as *mut c_void, zone);
        }
    }

    #[test]
    fn aligned_allocation() {
        let zone = linked_zone(b"memalign\0");
        for alignment in [16, 64, 4096] {
            unsafe {
                let ptr = DEFAULT_DISPATCH.alloc_aligned(alignment, 100, zone);
                assert_eq!(ptr as usize % alignment, 0);
                DEFAULT_DISPATCH.free(ptr, zone);
            }
        }
    }

    #[test]
    fn batch_allocations_do_not_overlap() {
        let zone = linked_zone(b"batch\0");
        let mut results = [ptr::null_mut(); 32];
        unsafe {
            let count = DEFAULT_DISPATCH.batch_malloc(48, &mut results, zone);
            assert_eq!(count, results.len());

            let mut ranges: Vec<(usize, usize)> = results[..count]
                .iter()
                .map(|&p| (p as usize, DEFAULT_DISPATCH.get_size_estimate(p, zone)))
                .collect();
            ranges.sort_unstable();
            for pair in ranges.windows(2) {
                assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
            assert_eq!(
                results.iter().copied().collect::<HashSet<_>>().len(),
                results.len()
            );

            DEFAULT_DISPATCH.batch_free(&results[..count], zone);
        }
    }

    #[test]
    fn free_null_is_a_no_op() {
        let zone = linked_zone(b"free-null\0");
        unsafe {
            DEFAULT_DISPATCH.free(ptr::null_mut(), zone);
            assert_eq!(DEFAULT_DISPATCH.get_size_estimate(ptr::null_mut(), zone), 0);
        }
    }

    static PARTIAL_BATCH_FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn two_at_a_time(
        zone: *mut MallocZone,
        size: usize,
        results: *mut *mut c_void,
        num_requested: c_uint,
    ) -> c_uint {
        let granted = num_requested.min(2);
        for i in 0..granted as usize {
            *results.add(i) = Zone::from_raw_unchecked(zone).malloc(size);
        }
        granted
    }

    unsafe extern "C" fn counting_free(_zone: *mut MallocZone, ptr: *mut c_void) {
        PARTIAL_BATCH_FREES.fetch_add(1, Ordering::Relaxed);
        (NativeHeap::LINKED.free)(ptr)
    }

    #[test]
    fn partial_batch_is_passed_through() {
        let zone = HeapZone::new(b"partial\0", NativeHeap::LINKED).leak();
        unsafe {
            (*zone.as_ptr()).batch_malloc = Some(two_at_a_time);
            (*zone.as_ptr()).batch_free = None;
            (*zone.as_ptr()).free = Some(counting_free);
        }
        registry().register_zone(zone);

        let mut results = [ptr::null_mut(); 8];
        unsafe {
            let count = DEFAULT_DISPATCH.batch_malloc(24, &mut results, zone);
            assert_eq!(count, 2);
            assert!(results[2..].iter().all(|p| p.is_null()));

            // Without a native batch_free each pointer goes through free.
            DEFAULT_DISPATCH.batch_free(&results[..count], zone);
        }
        assert_eq!(PARTIAL_BATCH_FREES.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn old_zones_fall_back_to_native_defaults() {
        let zone = registered_zone(HeapZone::new(b"v4\0", NativeHeap::LINKED).with_version(4));
        unsafe {
            // Without memalign, alignments up to a page come from valloc.
            let ptr = DEFAULT_DISPATCH.alloc_aligned(64, 10, zone);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % page_size(), 0);
            DEFAULT_DISPATCH.free(ptr, zone);
            assert!(DEFAULT_DISPATCH.alloc_aligned(2 * page_size(), 10, zone).is_null());
            assert!(DEFAULT_DISPATCH.alloc_aligned(48, 10, zone).is_null());

            let ptr = DEFAULT_DISPATCH.alloc(10, zone);
            DEFAULT_DISPATCH.free_definite_size(ptr, 10, zone);
        }

        let zone = HeapZone::new(b"no-batch\0", NativeHeap::LINKED).leak();
        unsafe { (*zone.as_ptr()).batch_malloc = None };
        registry().register_zone(zone);
        let mut results = [ptr::null_mut(); 4];
        assert_eq!(unsafe { DEFAULT_DISPATCH.batch_malloc(8, &mut results, zone) }, 0);
    }

    #[test]
    fn zero_size_realloc_matches_native() {
        let zone = linked_zone(b"realloc-zero\0");
        unsafe {
            let native_ptr = zone.malloc(32);
            let native = zone.realloc(native_ptr, 0);
            let shimmed_ptr = DEFAULT_DISPATCH.alloc(32, zone);
            let shimmed = DEFAULT_DISPATCH.realloc(shimmed_ptr, 0, zone);
            assert_eq!(native.is_null(), shimmed.is_null());
            zone.free(native);
            DEFAULT_DISPATCH.free(shimmed, zone);

            let native = zone.realloc(ptr::null_mut(), 0);
            let shimmed = DEFAULT_DISPATCH.realloc(ptr::null_mut(), 0, zone);
            assert_eq!(native.is_null(), shimmed.is_null());
            zone.free(native);
            DEFAULT_DISPATCH.free(shimmed, zone);
        }
    }

    #[test]
    fn native_failure_is_returned_unchanged() {
        let zone = linked_zone(b"oom\0");
        unsafe {
            assert!(DEFAULT_DISPATCH.alloc(usize::MAX, zone).is_null());
            assert!(DEFAULT_DISPATCH.alloc_zero_initialized(usize::MAX, 2, zone).is_null());

            let ptr = DEFAULT_DISPATCH.alloc(8, zone) as *mut u8;
            *ptr = 42;
            assert!(DEFAULT_DISPATCH.realloc(ptr as *mut c_void, usize::MAX, zone).is_null());
            assert_eq!(*ptr, 42);
            DEFAULT_DISPATCH.free(ptr as *mut c_void, zone);
        }
    }
}
