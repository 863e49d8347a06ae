//! Native allocation zones.
//!
//! A zone is an independently managed heap that exposes its own table of
//! allocation callbacks.  [`MallocZone`] mirrors the layout of the platform's
//! zone record so that real platform zones and zones built by this crate
//! (see [`crate::native::HeapZone`]) can be handled the same way.

use std::{
    ffi::CStr,
    fmt,
    hash::{Hash, Hasher},
    ptr::{self, NonNull},
};

use libc::{c_char, c_uint, c_void};

use crate::error::ShimError;

pub type ZoneSizeFn = unsafe extern "C" fn(zone: *mut MallocZone, ptr: *const c_void) -> usize;
pub type ZoneMallocFn = unsafe extern "C" fn(zone: *mut MallocZone, size: usize) -> *mut c_void;
pub type ZoneCallocFn =
    unsafe extern "C" fn(zone: *mut MallocZone, num_items: usize, size: usize) -> *mut c_void;
pub type ZoneVallocFn = unsafe extern "C" fn(zone: *mut MallocZone, size: usize) -> *mut c_void;
pub type ZoneFreeFn = unsafe extern "C" fn(zone: *mut MallocZone, ptr: *mut c_void);
pub type ZoneReallocFn =
    unsafe extern "C" fn(zone: *mut MallocZone, ptr: *mut c_void, size: usize) -> *mut c_void;
pub type ZoneDestroyFn = unsafe extern "C" fn(zone: *mut MallocZone);
pub type ZoneBatchMallocFn = unsafe extern "C" fn(
    zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: c_uint,
) -> c_uint;
pub type ZoneBatchFreeFn =
    unsafe extern "C" fn(zone: *mut MallocZone, to_be_freed: *mut *mut c_void, num: c_uint);
pub type ZoneMemalignFn =
    unsafe extern "C" fn(zone: *mut MallocZone, alignment: usize, size: usize) -> *mut c_void;
pub type ZoneFreeDefiniteSizeFn =
    unsafe extern "C" fn(zone: *mut MallocZone, ptr: *mut c_void, size: usize);
pub type ZonePressureReliefFn = unsafe extern "C" fn(zone: *mut MallocZone, goal: usize) -> usize;

/// First zone version that carries `memalign`.
pub const VERSION_MEMALIGN: c_uint = 5;
/// First zone version that carries `free_definite_size`.
pub const VERSION_FREE_DEFINITE_SIZE: c_uint = 6;
/// First zone version that carries `pressure_relief`.
pub const VERSION_PRESSURE_RELIEF: c_uint = 8;

/// The zone record.  Field order and types follow the platform ABI; entries
/// past `version` are only meaningful when `version` says they exist.
#[repr(C)]
pub struct MallocZone {
    pub reserved1: *mut c_void,
    pub reserved2: *mut c_void,
    pub size: Option<ZoneSizeFn>,
    pub malloc: Option<ZoneMallocFn>,
    pub calloc: Option<ZoneCallocFn>,
    pub valloc: Option<ZoneVallocFn>,
    pub free: Option<ZoneFreeFn>,
    pub realloc: Option<ZoneReallocFn>,
    pub destroy: Option<ZoneDestroyFn>,
    pub zone_name: *const c_char,
    pub batch_malloc: Option<ZoneBatchMallocFn>,
    pub batch_free: Option<ZoneBatchFreeFn>,
    pub introspect: *mut c_void,
    pub version: c_uint,
    pub memalign: Option<ZoneMemalignFn>,
    pub free_definite_size: Option<ZoneFreeDefiniteSizeFn>,
    pub pressure_relief: Option<ZonePressureReliefFn>,
}

/// Opaque handle naming one zone.
///
/// The same value is the registry key and the context argument handed to the
/// zone's native functions.  Two handles are equal iff they point at the same
/// zone record.
#[derive(Clone, Copy)]
pub struct Zone(NonNull<MallocZone>);

// A zone is a process-wide heap; the native functions behind it are
// thread-safe.
unsafe impl Send for Zone {}
unsafe impl Sync for Zone {}

impl PartialEq for Zone {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0.as_ptr(), other.0.as_ptr())
    }
}

impl Eq for Zone {}

impl Hash for Zone {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as usize).hash(state)
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zone({:p})", self.0.as_ptr())
    }
}

impl Zone {
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// A non-null `zone` must point at a zone record that stays valid for the
    /// rest of the process.
    pub unsafe fn from_raw(zone: *mut MallocZone) -> Option<Zone> {
        NonNull::new(zone).map(Zone)
    }

    /// # Safety
    ///
    /// Same as [`Zone::from_raw`], and `zone` must not be null.
    #[inline]
    pub unsafe fn from_raw_unchecked(zone: *mut MallocZone) -> Zone {
        Zone(NonNull::new_unchecked(zone))
    }

    #[inline]
    pub fn as_ptr(self) -> *mut MallocZone {
        self.0.as_ptr()
    }

    pub fn version(self) -> c_uint {
        unsafe { (*self.as_ptr()).version }
    }

    pub fn name(self) -> Option<&'static str> {
        let name = unsafe { (*self.as_ptr()).zone_name };
        if name.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(name) }.to_str().ok()
    }

    /// Calls `malloc` through the zone's current table, which goes through
    /// the dispatch chain once the zone is intercepted.
    ///
    /// # Safety
    ///
    /// Same contract as the native zone function.
    pub unsafe fn malloc(self, size: usize) -> *mut c_void {
        match (*self.as_ptr()).malloc {
            Some(f) => f(self.as_ptr(), size),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// Same contract as the native zone function.
    pub unsafe fn calloc(self, num_items: usize, size: usize) -> *mut c_void {
        match (*self.as_ptr()).calloc {
            Some(f) => f(self.as_ptr(), num_items, size),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// Same contract as the native zone function.
    pub unsafe fn memalign(self, alignment: usize, size: usize) -> *mut c_void {
        if self.version() < VERSION_MEMALIGN {
            return ptr::null_mut();
        }
        match (*self.as_ptr()).memalign {
            Some(f) => f(self.as_ptr(), alignment, size),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this zone.
    pub unsafe fn realloc(self, ptr: *mut c_void, size: usize) -> *mut c_void {
        match (*self.as_ptr()).realloc {
            Some(f) => f(self.as_ptr(), ptr, size),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this zone.
    pub unsafe fn free(self, ptr: *mut c_void) {
        if let Some(f) = (*self.as_ptr()).free {
            f(self.as_ptr(), ptr)
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation of this zone of `size` bytes.
    pub unsafe fn free_definite_size(self, ptr: *mut c_void, size: usize) {
        let zone = &*self.as_ptr();
        match zone.free_definite_size {
            Some(f) if zone.version >= VERSION_FREE_DEFINITE_SIZE => f(self.as_ptr(), ptr, size),
            _ => self.free(ptr),
        }
    }

    /// # Safety
    ///
    /// Same contract as the native zone function.
    pub unsafe fn size(self, ptr: *const c_void) -> usize {
        match (*self.as_ptr()).size {
            Some(f) => f(self.as_ptr(), ptr),
            None => 0,
        }
    }

    /// Fills a prefix of `results` and returns its length.
    ///
    /// # Safety
    ///
    /// Same contract as the native zone function.
    pub unsafe fn batch_malloc(self, size: usize, results: &mut [*mut c_void]) -> usize {
        match (*self.as_ptr()).batch_malloc {
            Some(f) => f(self.as_ptr(), size, results.as_mut_ptr(), batch_len(results.len())) as usize,
            None => 0,
        }
    }

    /// # Safety
    ///
    /// Every pointer must be a live allocation of this zone.
    pub unsafe fn batch_free(self, pointers: &[*mut c_void]) {
        free_batched(self, pointers, (*self.as_ptr()).batch_free, |ptr| {
            self.free(ptr)
        })
    }
}

/// Native batch calls count in `unsigned`.  A batch allocation may return
/// fewer pointers than requested, so the request is clamped.
#[inline]
pub(crate) fn batch_len(len: usize) -> c_uint {
    c_uint::try_from(len).unwrap_or(c_uint::MAX)
}

/// Frees every pointer through `batch_free` in runs the native count can
/// hold, or through `free` one at a time when there is no `batch_free`.
pub(crate) unsafe fn free_batched(
    zone: Zone,
    pointers: &[*mut c_void],
    batch_free: Option<ZoneBatchFreeFn>,
    free: impl FnMut(*mut c_void),
) {
    free_in_runs(zone, pointers, batch_free, free, c_uint::MAX as usize)
}

unsafe fn free_in_runs(
    zone: Zone,
    pointers: &[*mut c_void],
    batch_free: Option<ZoneBatchFreeFn>,
    mut free: impl FnMut(*mut c_void),
    run_len: usize,
) {
    match batch_free {
        Some(batch_free) => {
            for run in pointers.chunks(run_len) {
                // The native signature is not const-correct; the array is only read.
                batch_free(zone.as_ptr(), run.as_ptr() as *mut *mut c_void, run.len() as c_uint);
            }
        }
        None => {
            for &ptr in pointers {
                free(ptr);
            }
        }
    }
}

/// The native functions of one zone, captured before interception.
#[derive(Clone, Copy, Debug)]
pub struct ZoneFunctions {
    pub size: ZoneSizeFn,
    pub malloc: ZoneMallocFn,
    pub calloc: ZoneCallocFn,
    pub valloc: ZoneVallocFn,
    pub free: ZoneFreeFn,
    pub realloc: ZoneReallocFn,
    pub batch_malloc: Option<ZoneBatchMallocFn>,
    pub batch_free: Option<ZoneBatchFreeFn>,
    pub memalign: Option<ZoneMemalignFn>,
    pub free_definite_size: Option<ZoneFreeDefiniteSizeFn>,
    /// The zone these functions were taken from.
    pub context: Zone,
}

impl ZoneFunctions {
    /// Copies the zone's current table.
    ///
    /// # Safety
    ///
    /// The zone record must be readable and not concurrently modified.
    pub unsafe fn capture(zone: Zone) -> Result<ZoneFunctions, ShimError> {
        let raw = &*zone.as_ptr();
        let missing = |name: &'static str| ShimError::IncompleteZone {
            zone,
            missing: name,
        };
        Ok(ZoneFunctions {
            size: raw.size.ok_or_else(|| missing("size"))?,
            malloc: raw.malloc.ok_or_else(|| missing("malloc"))?,
            calloc: raw.calloc.ok_or_else(|| missing("calloc"))?,
            valloc: raw.valloc.ok_or_else(|| missing("valloc"))?,
            free: raw.free.ok_or_else(|| missing("free"))?,
            realloc: raw.realloc.ok_or_else(|| missing("realloc"))?,
            batch_malloc: raw.batch_malloc,
            batch_free: raw.batch_free,
            memalign: if raw.version >= VERSION_MEMALIGN {
                raw.memalign
            } else {
                None
            },
            free_definite_size: if raw.version >= VERSION_FREE_DEFINITE_SIZE {
                raw.free_definite_size
            } else {
                None
            },
            context: zone,
        })
    }
}
