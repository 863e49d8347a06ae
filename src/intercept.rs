//! Routing a zone's own function table through the dispatch chain.
//!
//! [`intercept_zone`] captures the zone's native table into the registry and
//! then points the table at the entry points below, each of which enters
//! [`chain()`]'s head with the zone as context.  The captured copy is what the
//! terminal dispatch eventually calls.

use std::{io, mem, slice};

use libc::{c_int, c_uint, c_void};
use log::{info, warn};

use crate::{
    dispatch::chain,
    error::ShimError,
    native::page_size,
    registry::registry,
    zone::{MallocZone, Zone, ZoneFunctions, VERSION_FREE_DEFINITE_SIZE, VERSION_MEMALIGN},
};

unsafe extern "C" fn shim_size(zone: *mut MallocZone, ptr: *const c_void) -> usize {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().get_size_estimate(ptr as *mut c_void, zone)
}

unsafe extern "C" fn shim_malloc(zone: *mut MallocZone, size: usize) -> *mut c_void {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().alloc(size, zone)
}

unsafe extern "C" fn shim_calloc(zone: *mut MallocZone, n: usize, size: usize) -> *mut c_void {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().alloc_zero_initialized(n, size, zone)
}

unsafe extern "C" fn shim_valloc(zone: *mut MallocZone, size: usize) -> *mut c_void {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().alloc_aligned(page_size(), size, zone)
}

unsafe extern "C" fn shim_free(zone: *mut MallocZone, ptr: *mut c_void) {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().free(ptr, zone)
}

unsafe extern "C" fn shim_realloc(zone: *mut MallocZone, ptr: *mut c_void, size: usize) -> *mut c_void {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().realloc(ptr, size, zone)
}

unsafe extern "C" fn shim_batch_malloc(
    zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: c_uint,
) -> c_uint {
    if results.is_null() || num_requested == 0 {
        return 0;
    }
    let zone = Zone::from_raw_unchecked(zone);
    let results = slice::from_raw_parts_mut(results, num_requested as usize);
    // Never more than `num_requested`, so the cast back is lossless.
    chain().head().batch_malloc(size, results, zone) as c_uint
}

unsafe extern "C" fn shim_batch_free(zone: *mut MallocZone, to_be_freed: *mut *mut c_void, num: c_uint) {
    if to_be_freed.is_null() || num == 0 {
        return;
    }
    let zone = Zone::from_raw_unchecked(zone);
    let to_be_freed = slice::from_raw_parts(to_be_freed as *const *mut c_void, num as usize);
    chain().head().batch_free(to_be_freed, zone)
}

unsafe extern "C" fn shim_memalign(zone: *mut MallocZone, alignment: usize, size: usize) -> *mut c_void {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().alloc_aligned(alignment, size, zone)
}

unsafe extern "C" fn shim_free_definite_size(zone: *mut MallocZone, ptr: *mut c_void, size: usize) {
    let zone = Zone::from_raw_unchecked(zone);
    chain().head().free_definite_size(ptr, size, zone)
}

/// Whether the zone's table currently points at the shim.
pub fn is_intercepted(zone: Zone) -> bool {
    let malloc = unsafe { (*zone.as_ptr()).malloc };
    matches!(malloc, Some(f) if f as usize == shim_malloc as usize)
}

/// Captures `zone`'s native table and redirects the zone through the dispatch
/// chain.
///
/// # Safety
///
/// Must run before any other thread calls into `zone`, and the zone record
/// must be writable (made writable here for protected platform zones).
pub unsafe fn intercept_zone(zone: Zone) -> Result<&'static ZoneFunctions, ShimError> {
    let mut writable = WritableZone::new(zone)?;
    let functions = registry().try_register(zone)?;
    let raw = writable.record();
    raw.size = Some(shim_size);
    raw.malloc = Some(shim_malloc);
    raw.calloc = Some(shim_calloc);
    raw.valloc = Some(shim_valloc);
    raw.free = Some(shim_free);
    raw.realloc = Some(shim_realloc);
    if functions.batch_malloc.is_some() {
        raw.batch_malloc = Some(shim_batch_malloc);
    }
    if functions.batch_free.is_some() {
        raw.batch_free = Some(shim_batch_free);
    }
    if raw.version >= VERSION_MEMALIGN {
        raw.memalign = Some(shim_memalign);
    }
    if raw.version >= VERSION_FREE_DEFINITE_SIZE {
        raw.free_definite_size = Some(shim_free_definite_size);
    }
    drop(writable);
    info!(
        "intercepted zone {:p} ({})",
        zone.as_ptr(),
        zone.name().unwrap_or("unnamed")
    );
    Ok(functions)
}

/// Writes the captured native table back into the zone.
///
/// # Safety
///
/// Test-only.  No thread may be calling into `zone`.
#[doc(hidden)]
pub unsafe fn restore_zone(zone: Zone) -> Result<(), ShimError> {
    let functions = *registry()
        .try_lookup(zone)
        .ok_or(ShimError::ZoneNotRegistered(zone))?;
    let mut writable = WritableZone::new(zone)?;
    let raw = writable.record();
    raw.size = Some(functions.size);
    raw.malloc = Some(functions.malloc);
    raw.calloc = Some(functions.calloc);
    raw.valloc = Some(functions.valloc);
    raw.free = Some(functions.free);
    raw.realloc = Some(functions.realloc);
    raw.batch_malloc = functions.batch_malloc;
    raw.batch_free = functions.batch_free;
    if raw.version >= VERSION_MEMALIGN {
        raw.memalign = functions.memalign;
    }
    if raw.version >= VERSION_FREE_DEFINITE_SIZE {
        raw.free_definite_size = functions.free_definite_size;
    }
    Ok(())
}

/// The pages spanned by a zone record.
#[derive(Clone, Copy, Debug)]
struct RecordPages {
    start: usize,
    len: usize,
}

impl RecordPages {
    fn of(zone: Zone) -> RecordPages {
        let page = page_size();
        let start = (zone.as_ptr() as usize) & !(page - 1);
        let len = zone.as_ptr() as usize + mem::size_of::<MallocZone>() - start;
        RecordPages { start, len }
    }

    unsafe fn protect(self, zone: Zone, prot: c_int) -> Result<(), ShimError> {
        if libc::mprotect(self.start as *mut c_void, self.len, prot) == 0 {
            return Ok(());
        }
        Err(ShimError::ZoneProtection {
            zone,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        })
    }
}

/// Write access to a zone record while alive.  Pages that were unprotected
/// for it are made read-only again on drop.
struct WritableZone {
    zone: Zone,
    reprotect: Option<RecordPages>,
}

impl WritableZone {
    unsafe fn new(zone: Zone) -> Result<WritableZone, ShimError> {
        let reprotect = if is_write_protected(zone) {
            let pages = RecordPages::of(zone);
            pages.protect(zone, libc::PROT_READ | libc::PROT_WRITE)?;
            Some(pages)
        } else {
            None
        };
        Ok(WritableZone { zone, reprotect })
    }

    unsafe fn record(&mut self) -> &mut MallocZone {
        &mut *self.zone.as_ptr()
    }
}

impl Drop for WritableZone {
    fn drop(&mut self) {
        if let Some(pages) = self.reprotect {
            if let Err(e) = unsafe { pages.protect(self.zone, libc::PROT_READ) } {
                warn!("zone left writable: {}", e);
            }
        }
    }
}

/// Platform zones from version 8 on live in read-only memory.
#[cfg(target_os = "macos")]
fn is_write_protected(zone: Zone) -> bool {
    zone.version() >= crate::zone::VERSION_PRESSURE_RELIEF
}

#[cfg(not(target_os = "macos"))]
fn is_write_protected(_zone: Zone) -> bool {
    false
}
