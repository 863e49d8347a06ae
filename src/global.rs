use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
    thread_local,
};

use libc::c_void;

use crate::{
    dispatch::chain, fatal::fatal, native::system_zone, registry::registry, zone::Zone,
};

/// Largest alignment the C heap guarantees for plain `malloc`.
#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "powerpc64",
    target_arch = "riscv64",
    target_arch = "s390x",
))]
pub const MIN_ALIGN: usize = 16;
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "powerpc64",
    target_arch = "riscv64",
    target_arch = "s390x",
)))]
pub const MIN_ALIGN: usize = 8;

static SYSTEM_ZONE_READY: AtomicBool = AtomicBool::new(false);

thread_local! {
    // Set while this thread registers the system zone.  Registration may log,
    // and logging may allocate.
    static NESTED: Cell<bool> = const { Cell::new(false) };
}

/// Allocator that sends every Rust allocation through the dispatch chain,
/// using the system zone as context.  Use the `global_allocator` attribute to
/// enable it:
///
/// ```
/// use zone_shim::ShimAllocator;
///
/// #[global_allocator]
/// static GLOBAL: ShimAllocator = ShimAllocator;
///
/// fn main() {}
/// ```
///
pub struct ShimAllocator;

impl ShimAllocator {
    /// The system zone once it is registered, `None` while this thread is
    /// registering it or being torn down.
    #[inline]
    fn zone() -> Option<Zone> {
        if SYSTEM_ZONE_READY.load(Ordering::Acquire) {
            return Some(system_zone());
        }
        Self::register_system_zone()
    }

    #[cold]
    fn register_system_zone() -> Option<Zone> {
        let res = NESTED.try_with(|nested| {
            if nested.get() {
                return None;
            }
            nested.set(true);
            let zone = system_zone();
            if let Err(e) = registry().ensure_registered(zone) {
                fatal(e);
            }
            SYSTEM_ZONE_READY.store(true, Ordering::Release);
            nested.set(false);
            Some(zone)
        });
        // alloc called during thread destruction.
        res.unwrap_or(None)
    }

    #[inline]
    fn fits_malloc(layout: &Layout) -> bool {
        layout.align() <= MIN_ALIGN && layout.align() <= layout.size()
    }
}

unsafe impl GlobalAlloc for ShimAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let zone = match Self::zone() {
            Some(zone) => zone,
            None => return System.alloc(layout),
        };
        let head = chain().head();
        if Self::fits_malloc(&layout) {
            head.alloc(layout.size(), zone) as *mut u8
        } else {
            head.alloc_aligned(layout.align(), layout.size(), zone) as *mut u8
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let zone = match Self::zone() {
            Some(zone) => zone,
            None => return System.alloc_zeroed(layout),
        };
        let head = chain().head();
        if Self::fits_malloc(&layout) {
            return head.alloc_zero_initialized(1, layout.size(), zone) as *mut u8;
        }
        let ptr = head.alloc_aligned(layout.align(), layout.size(), zone) as *mut u8;
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match Self::zone() {
            Some(zone) => {
                chain()
                    .head()
                    .free_definite_size(ptr as *mut c_void, layout.size(), zone)
            }
            None => System.dealloc(ptr, layout),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let zone = match Self::zone() {
            Some(zone) => zone,
            None => return System.realloc(ptr, layout, new_size),
        };
        let head = chain().head();
        if layout.align() <= MIN_ALIGN && layout.align() <= new_size {
            return head.realloc(ptr as *mut c_void, new_size, zone) as *mut u8;
        }
        let new_ptr = head.alloc_aligned(layout.align(), new_size, zone) as *mut u8;
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            head.free_definite_size(ptr as *mut c_void, layout.size(), zone);
        }
        new_ptr
    }
}
