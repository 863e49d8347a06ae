//! Zone function registry.
//!
//! Each zone's native table is captured exactly once, before any intercepted
//! call can reach that zone, and is never modified afterwards.  Writers
//! serialize on a mutex.  Readers never lock: a slot's table is written before
//! the slot's zone pointer is published with release ordering, and the slot
//! count is published last, so an acquire load of the count makes every slot
//! below it fully visible.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use log::{debug, warn};

use crate::{
    error::ShimError,
    fatal::fatal,
    intercept,
    zone::{MallocZone, Zone, ZoneFunctions},
};

/// Zones a registry can hold.  Processes create a handful.
pub const MAX_ZONE_COUNT: usize = 64;

struct Slot {
    zone: AtomicPtr<MallocZone>,
    functions: UnsafeCell<MaybeUninit<ZoneFunctions>>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        zone: AtomicPtr::new(ptr::null_mut()),
        functions: UnsafeCell::new(MaybeUninit::uninit()),
    };

    /// # Safety
    ///
    /// The slot must have been published.
    #[inline]
    unsafe fn functions(&self) -> &ZoneFunctions {
        (*self.functions.get()).assume_init_ref()
    }
}

pub struct ZoneRegistry {
    slots: [Slot; MAX_ZONE_COUNT],
    count: AtomicUsize,
    write_lock: Mutex<()>,
}

// Slot tables are written once under `write_lock` before publication and only
// read afterwards.
unsafe impl Sync for ZoneRegistry {}

impl Default for ZoneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneRegistry {
    pub const fn new() -> Self {
        ZoneRegistry {
            slots: [Slot::EMPTY; MAX_ZONE_COUNT],
            count: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Captures `zone`'s current table.  Registering a zone twice is a fatal
    /// error.
    pub fn register_zone(&self, zone: Zone) -> &ZoneFunctions {
        match self.try_register(zone) {
            Ok(functions) => functions,
            Err(e) => fatal(e),
        }
    }

    /// Like [`ZoneRegistry::register_zone`], but hands misuse back to the
    /// caller.
    pub fn try_register(&self, zone: Zone) -> Result<&ZoneFunctions, ShimError> {
        let _guard = self.lock();
        let res = if self.try_lookup(zone).is_some() {
            Err(ShimError::ZoneAlreadyRegistered(zone))
        } else {
            self.capture_locked(zone)
        };
        if let Err(e) = &res {
            warn!("refused to register zone: {}", e);
        }
        res
    }

    /// Returns the zone's captured table, capturing it first if needed.
    ///
    /// Only for zones whose table is never intercepted, where any number of
    /// threads may race to be first.
    pub fn ensure_registered(&self, zone: Zone) -> Result<&ZoneFunctions, ShimError> {
        if let Some(functions) = self.try_lookup(zone) {
            return Ok(functions);
        }
        let _guard = self.lock();
        if let Some(functions) = self.try_lookup(zone) {
            return Ok(functions);
        }
        self.capture_locked(zone)
    }

    fn capture_locked(&self, zone: Zone) -> Result<&ZoneFunctions, ShimError> {
        if intercept::is_intercepted(zone) {
            return Err(ShimError::ZoneAlreadyIntercepted(zone));
        }
        let index = self.count.load(Ordering::Relaxed);
        let slot = self.slots.get(index).ok_or(ShimError::RegistryFull {
            capacity: MAX_ZONE_COUNT,
        })?;
        let functions = unsafe { ZoneFunctions::capture(zone)? };
        unsafe { (*slot.functions.get()).write(functions) };
        slot.zone.store(zone.as_ptr(), Ordering::Release);
        self.count.store(index + 1, Ordering::Release);
        debug!(
            "captured zone {:p} ({}) in slot {}",
            zone.as_ptr(),
            zone.name().unwrap_or("unnamed"),
            index
        );
        Ok(unsafe { slot.functions() })
    }

    /// The captured table for `zone`.  A zone that was never registered is a
    /// fatal error.
    #[inline]
    pub fn lookup(&self, zone: Zone) -> &ZoneFunctions {
        match self.try_lookup(zone) {
            Some(functions) => functions,
            None => fatal(ShimError::ZoneNotRegistered(zone)),
        }
    }

    #[inline]
    pub fn try_lookup(&self, zone: Zone) -> Option<&ZoneFunctions> {
        let count = self.count.load(Ordering::Acquire);
        self.slots[..count]
            .iter()
            .find(|slot| slot.zone.load(Ordering::Acquire) == zone.as_ptr())
            .map(|slot| unsafe { slot.functions() })
    }

    pub fn is_registered(&self, zone: Zone) -> bool {
        self.try_lookup(zone).is_some()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every zone.
    ///
    /// # Safety
    ///
    /// Test-only.  No thread may be inside a dispatch call for a registered
    /// zone, and no intercepted zone may be called afterwards until it is
    /// restored or registered again.
    #[doc(hidden)]
    pub unsafe fn reset_for_testing(&self) {
        let _guard = self.lock();
        self.count.store(0, Ordering::Release);
        for slot in self.slots.iter() {
            slot.zone.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

static REGISTRY: ZoneRegistry = ZoneRegistry::new();

/// The process-wide registry consulted by the terminal dispatch.
#[inline]
pub fn registry() -> &'static ZoneRegistry {
    &REGISTRY
}
