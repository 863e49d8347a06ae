//! Zones backed by the process's C heap.
//!
//! Not every platform organizes its allocator into zones.  [`HeapZone`] gives
//! the C heap a zone record of its own, so the registry, the terminal layer and
//! interception behave identically everywhere.

use std::{
    cell::UnsafeCell,
    mem,
    ptr::{self, NonNull},
};

use libc::{c_char, c_int, c_uint, c_void, dlsym, RTLD_NEXT};

use crate::{
    error::ShimError,
    zone::{MallocZone, Zone},
};

type MallocFunc = unsafe extern "C" fn(size: usize) -> *mut c_void;
type CallocFunc = unsafe extern "C" fn(num_items: usize, size: usize) -> *mut c_void;
type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: usize) -> *mut c_void;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);
type PosixMemalignFunc =
    unsafe extern "C" fn(memptr: *mut *mut c_void, alignment: usize, size: usize) -> c_int;
type UsableSizeFunc = unsafe extern "C" fn(ptr: *mut c_void) -> usize;

/// The C heap's entry points.
#[derive(Clone, Copy, Debug)]
pub struct NativeHeap {
    pub malloc: MallocFunc,
    pub calloc: CallocFunc,
    pub realloc: ReallocFunc,
    pub free: FreeFunc,
    pub posix_memalign: PosixMemalignFunc,
    pub usable_size: UsableSizeFunc,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const USABLE_SIZE_SYMBOL: &[u8] = b"malloc_usable_size\0";
#[cfg(target_os = "macos")]
const USABLE_SIZE_SYMBOL: &[u8] = b"malloc_size\0";
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
const USABLE_SIZE_SYMBOL: &[u8] = b"malloc_usable_size\0";

unsafe extern "C" fn linked_usable_size(ptr: *mut c_void) -> usize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        libc::malloc_usable_size(ptr)
    }
    #[cfg(target_os = "macos")]
    {
        libc::malloc_size(ptr as *const c_void)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        let _ = ptr;
        0
    }
}

impl NativeHeap {
    /// The heap functions this crate links against.
    ///
    /// Inside a library that itself exports `malloc` these resolve back to the
    /// library; use [`NativeHeap::resolve_next`] there.
    pub const LINKED: NativeHeap = NativeHeap {
        malloc: libc::malloc,
        calloc: libc::calloc,
        realloc: libc::realloc,
        free: libc::free,
        posix_memalign: libc::posix_memalign,
        usable_size: linked_usable_size,
    };

    /// Looks up the next definition of each heap function after the calling
    /// object in symbol search order.
    pub fn resolve_next() -> Result<NativeHeap, ShimError> {
        unsafe {
            Ok(NativeHeap {
                malloc: mem::transmute::<*mut c_void, MallocFunc>(next_symbol(b"malloc\0")?),
                calloc: mem::transmute::<*mut c_void, CallocFunc>(next_symbol(b"calloc\0")?),
                realloc: mem::transmute::<*mut c_void, ReallocFunc>(next_symbol(b"realloc\0")?),
                free: mem::transmute::<*mut c_void, FreeFunc>(next_symbol(b"free\0")?),
                posix_memalign: mem::transmute::<*mut c_void, PosixMemalignFunc>(next_symbol(
                    b"posix_memalign\0",
                )?),
                usable_size: mem::transmute::<*mut c_void, UsableSizeFunc>(next_symbol(
                    USABLE_SIZE_SYMBOL,
                )?),
            })
        }
    }
}

unsafe fn next_symbol(name: &'static [u8]) -> Result<*mut c_void, ShimError> {
    let symbol = dlsym(RTLD_NEXT, name.as_ptr() as *const c_char);
    if symbol.is_null() {
        let printable = std::str::from_utf8(&name[..name.len() - 1]).unwrap_or("?");
        return Err(ShimError::SymbolNotFound(printable));
    }
    Ok(symbol)
}

pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// A zone record followed by the heap it allocates from.
///
/// `#[repr(C)]` with the record first, so the zone pointer handed to each
/// callback is also a pointer to the `HeapZone`.
///
/// The C heap cannot tell whether it owns a pointer.  `size` answers 0 for
/// null only; any other pointer goes to the heap's usable-size query, which
/// is undefined for memory the heap did not allocate.
#[repr(C)]
pub struct HeapZone {
    zone: MallocZone,
    heap: NativeHeap,
}

// The raw pointers in the record are a static name and null.
unsafe impl Send for HeapZone {}
unsafe impl Sync for HeapZone {}

impl HeapZone {
    /// `name` must be NUL-terminated.
    pub const fn new(name: &'static [u8], heap: NativeHeap) -> HeapZone {
        assert!(!name.is_empty() && name[name.len() - 1] == 0);
        HeapZone {
            zone: MallocZone {
                reserved1: ptr::null_mut(),
                reserved2: ptr::null_mut(),
                size: Some(heap_size),
                malloc: Some(heap_malloc),
                calloc: Some(heap_calloc),
                valloc: Some(heap_valloc),
                free: Some(heap_free),
                realloc: Some(heap_realloc),
                destroy: Some(heap_destroy),
                zone_name: name.as_ptr() as *const c_char,
                batch_malloc: Some(heap_batch_malloc),
                batch_free: Some(heap_batch_free),
                introspect: ptr::null_mut(),
                version: 8,
                memalign: Some(heap_memalign),
                free_definite_size: Some(heap_free_definite_size),
                pressure_relief: Some(heap_pressure_relief),
            },
            heap,
        }
    }

    /// Older versions lack `memalign` (< 5) and `free_definite_size` (< 6).
    pub fn with_version(mut self, version: c_uint) -> HeapZone {
        self.zone.version = version;
        self
    }

    /// Moves the zone to the heap for the rest of the process.
    pub fn leak(self) -> Zone {
        let zone: &'static mut HeapZone = Box::leak(Box::new(self));
        Zone::from(NonNull::from(zone))
    }
}

impl From<NonNull<HeapZone>> for Zone {
    fn from(zone: NonNull<HeapZone>) -> Zone {
        unsafe { Zone::from_raw_unchecked(zone.as_ptr() as *mut MallocZone) }
    }
}

/// Static storage for a [`HeapZone`] whose table may later be patched.
pub struct StaticZone(UnsafeCell<HeapZone>);

unsafe impl Sync for StaticZone {}

impl StaticZone {
    pub const fn new(zone: HeapZone) -> StaticZone {
        StaticZone(UnsafeCell::new(zone))
    }

    #[inline]
    pub fn zone(&'static self) -> Zone {
        unsafe { Zone::from_raw_unchecked(self.0.get() as *mut MallocZone) }
    }
}

static SYSTEM_ZONE: StaticZone = StaticZone::new(HeapZone::new(b"SystemZone\0", NativeHeap::LINKED));

/// The zone over the C heap this crate links against.
#[inline]
pub fn system_zone() -> Zone {
    SYSTEM_ZONE.zone()
}

#[inline]
unsafe fn heap<'a>(zone: *mut MallocZone) -> &'a NativeHeap {
    &(*(zone as *const HeapZone)).heap
}

unsafe extern "C" fn heap_size(zone: *mut MallocZone, ptr: *const c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    (heap(zone).usable_size)(ptr as *mut c_void)
}

unsafe extern "C" fn heap_malloc(zone: *mut MallocZone, size: usize) -> *mut c_void {
    (heap(zone).malloc)(size)
}

unsafe extern "C" fn heap_calloc(zone: *mut MallocZone, num_items: usize, size: usize) -> *mut c_void {
    (heap(zone).calloc)(num_items, size)
}

unsafe extern "C" fn heap_valloc(zone: *mut MallocZone, size: usize) -> *mut c_void {
    heap_memalign(zone, page_size(), size)
}

unsafe extern "C" fn heap_free(zone: *mut MallocZone, ptr: *mut c_void) {
    (heap(zone).free)(ptr)
}

unsafe extern "C" fn heap_realloc(zone: *mut MallocZone, ptr: *mut c_void, size: usize) -> *mut c_void {
    (heap(zone).realloc)(ptr, size)
}

unsafe extern "C" fn heap_destroy(_zone: *mut MallocZone) {}

unsafe extern "C" fn heap_batch_malloc(
    zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: c_uint,
) -> c_uint {
    let mut allocated = 0;
    while allocated < num_requested {
        let ptr = heap_malloc(zone, size);
        if ptr.is_null() {
            break;
        }
        *results.add(allocated as usize) = ptr;
        allocated += 1;
    }
    allocated
}

unsafe extern "C" fn heap_batch_free(zone: *mut MallocZone, to_be_freed: *mut *mut c_void, num: c_uint) {
    for i in 0..num as usize {
        heap_free(zone, *to_be_freed.add(i));
    }
}

unsafe extern "C" fn heap_memalign(zone: *mut MallocZone, alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        return ptr::null_mut();
    }
    // posix_memalign wants a multiple of the pointer size.
    let alignment = alignment.max(mem::size_of::<*mut c_void>());
    let mut result = ptr::null_mut();
    if (heap(zone).posix_memalign)(&mut result, alignment, size) != 0 {
        return ptr::null_mut();
    }
    result
}

unsafe extern "C" fn heap_free_definite_size(zone: *mut MallocZone, ptr: *mut c_void, _size: usize) {
    heap_free(zone, ptr)
}

unsafe extern "C" fn heap_pressure_relief(_zone: *mut MallocZone, _goal: usize) -> usize {
    0
}

#[cfg(target_os = "macos")]
pub mod darwin {
    //! The platform's own zones.

    use crate::zone::{MallocZone, Zone};

    extern "C" {
        fn malloc_default_zone() -> *mut MallocZone;
    }

    /// The zone `malloc` allocates from.
    pub fn default_zone() -> Zone {
        unsafe { Zone::from_raw_unchecked(malloc_default_zone()) }
    }
}
